//! Build farm controller - keeps a CI server running on an elastic pool
//!
//! Runs the reconcile loop, the health monitor and the HTTP API until
//! interrupted.

use anyhow::{Context, Result};
use farm_controller::api;
use farm_controller::config::{ControllerConfig, RegistryMode};
use farm_lib::{
    cluster::SimulatedCluster,
    controller::{ControllerParts, FarmController},
    decision_log::DecisionLog,
    health::HealthRegistry,
    image::{DockerCli, HttpRegistry, ImageSource, InMemoryRegistry, RegistryApi, RegistryCredentials},
    monitor::{HealthMonitor, HealthProbe, HttpProbe, InstanceRegistry},
    observability::{FarmMetrics, StructuredLogger},
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const CONTROLLER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting farm-controller");

    let config = ControllerConfig::load()?;
    let pool_id = config.pool_id();
    info!(pool = %pool_id, workload = %config.desired.workload, "Controller configured");

    let logger = StructuredLogger::new(pool_id.to_string());
    logger.log_startup(CONTROLLER_VERSION, &config.desired.workload);
    let metrics = FarmMetrics::new();

    let cluster = Arc::new(SimulatedCluster::new(config.simulation_config()));
    cluster.seed_pool(config.simulated_pool());
    info!(pool = %pool_id, "Using simulated cluster");

    let (image_source, registry) = image_backends(&config)?;

    let prober: Arc<dyn HealthProbe> = if config.simulation.simulate_probes {
        cluster.clone()
    } else {
        Arc::new(HttpProbe::new(Duration::from_secs(config.probe.timeout_secs))?)
    };
    let instances = Arc::new(InstanceRegistry::new());
    let (monitor, health, alerts) = HealthMonitor::new(
        prober,
        instances.clone(),
        config.probe_config(),
        logger.clone(),
    );

    let decisions =
        DecisionLog::open(config.decision_log_config()).context("Failed to open decision log")?;
    let health_registry = HealthRegistry::for_controller().await;

    let controller = Arc::new(
        FarmController::new(
            config.controller_options(),
            config.desired.clone(),
            ControllerParts {
                cluster,
                image_source,
                registry,
                instances,
                health,
                alerts,
                decisions,
            },
            health_registry,
            logger.clone(),
        )
        .context("Failed to create controller")?,
    );

    let (shutdown_tx, _) = broadcast::channel(1);
    let app_state = Arc::new(api::AppState::new(controller.clone(), metrics));

    let monitor_handle = tokio::spawn(monitor.run(shutdown_tx.subscribe()));
    let controller_handle = tokio::spawn(controller.clone().run(shutdown_tx.subscribe()));
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state, shutdown_tx.subscribe()));

    tokio::signal::ctrl_c().await?;
    logger.log_shutdown("SIGINT received");
    let _ = shutdown_tx.send(());

    if let Err(e) = monitor_handle.await {
        warn!(error = %e, "Health monitor task failed");
    }
    if let Err(e) = controller_handle.await {
        warn!(error = %e, "Reconcile task failed");
    }
    match api_handle.await {
        Ok(Err(e)) => warn!(error = %e, "API server stopped with an error"),
        Err(e) => warn!(error = %e, "API server task failed"),
        Ok(Ok(())) => {}
    }

    info!("Shutdown complete");
    Ok(())
}

/// Local image source and remote registry for the configured mode
fn image_backends(
    config: &ControllerConfig,
) -> Result<(Arc<dyn ImageSource>, Arc<dyn RegistryApi>)> {
    match config.registry.mode {
        RegistryMode::Memory => {
            let images = Arc::new(InMemoryRegistry::new());
            images.add_local(&config.desired.image, config.desired.image.as_bytes());
            info!(image = %config.desired.image, "Using in-memory image registry");
            let source: Arc<dyn ImageSource> = images.clone();
            let registry: Arc<dyn RegistryApi> = images;
            Ok((source, registry))
        }
        RegistryMode::Docker => {
            let credentials = match (&config.registry.username, &config.registry.password) {
                (Some(username), Some(password)) => Some(RegistryCredentials {
                    username: username.clone(),
                    password: password.clone(),
                }),
                _ => None,
            };
            let registry = HttpRegistry::new(
                credentials,
                Duration::from_secs(config.registry.timeout_secs),
            )?;
            info!(program = %config.registry.docker_program, "Using docker CLI and registry HTTP API");
            let source: Arc<dyn ImageSource> =
                Arc::new(DockerCli::new(config.registry.docker_program.clone()));
            let registry: Arc<dyn RegistryApi> = Arc::new(registry);
            Ok((source, registry))
        }
    }
}
