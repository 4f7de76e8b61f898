//! Controller configuration
//!
//! Read from an optional file named by `FARM_CONFIG`, overridden by `FARM_*`
//! environment variables (`__` separates nested keys, e.g.
//! `FARM_DESIRED__REPLICAS=2`).

use anyhow::{bail, Context, Result};
use farm_lib::cluster::{PoolId, SimulationConfig};
use farm_lib::controller::{ControllerOptions, DesiredState};
use farm_lib::cost::CostPolicyConfig;
use farm_lib::decision_log::DecisionLogConfig;
use farm_lib::monitor::ProbeConfig;
use farm_lib::pool::ScalerConfig;
use farm_lib::retry::BackoffPolicy;
use farm_lib::storage::StorageConfig;
use farm_lib::{ClusterPool, DiskProfile, MachineProfile};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable naming the configuration file
pub const CONFIG_FILE_ENV: &str = "FARM_CONFIG";

#[derive(Debug, Clone, Deserialize)]
pub struct ControllerConfig {
    /// API server port for status, health and metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    #[serde(default = "default_pool_zone")]
    pub pool_zone: String,

    #[serde(default = "default_pool_name")]
    pub pool_name: String,

    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_secs: u64,

    /// Bound on every individual cluster call
    #[serde(default = "default_api_timeout")]
    pub api_timeout_secs: u64,

    #[serde(default = "default_bind_timeout")]
    pub bind_timeout_secs: u64,

    /// Bound on a single pool resize operation
    #[serde(default = "default_scale_timeout")]
    pub scale_timeout_secs: u64,

    #[serde(default = "default_idle_window")]
    pub idle_window_secs: u64,

    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,

    #[serde(default)]
    pub publish_retry: BackoffPolicy,

    #[serde(default)]
    pub conflict_retry: BackoffPolicy,

    /// JSON-lines file the cost decisions are appended to
    #[serde(default)]
    pub decision_log_path: Option<PathBuf>,

    #[serde(default)]
    pub probe: ProbeSettings,

    #[serde(default)]
    pub registry: RegistrySettings,

    #[serde(default)]
    pub simulation: SimulationSettings,

    #[serde(default)]
    pub desired: DesiredState,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProbeSettings {
    #[serde(default = "default_probe_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_probe_jitter")]
    pub jitter_ms: u64,
    #[serde(default = "default_probe_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_cold_start_grace")]
    pub cold_start_grace_secs: u64,
    #[serde(default = "default_warm_start_grace")]
    pub warm_start_grace_secs: u64,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_probe_interval(),
            jitter_ms: default_probe_jitter(),
            timeout_secs: default_probe_timeout(),
            cold_start_grace_secs: default_cold_start_grace(),
            warm_start_grace_secs: default_warm_start_grace(),
            failure_threshold: default_failure_threshold(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryMode {
    /// Images held in process; for dry runs
    #[default]
    Memory,
    /// Local docker CLI plus the registry's HTTP API
    Docker,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistrySettings {
    #[serde(default)]
    pub mode: RegistryMode,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_docker_program")]
    pub docker_program: String,
    #[serde(default = "default_registry_timeout")]
    pub timeout_secs: u64,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            mode: RegistryMode::default(),
            username: None,
            password: None,
            docker_program: default_docker_program(),
            timeout_secs: default_registry_timeout(),
        }
    }
}

/// Shape and timings of the in-process cluster
#[derive(Debug, Clone, Deserialize)]
pub struct SimulationSettings {
    #[serde(default)]
    pub initial_nodes: u32,
    #[serde(default)]
    pub pool_min_nodes: u32,
    #[serde(default = "default_pool_max_nodes")]
    pub pool_max_nodes: u32,
    #[serde(default = "default_machine_type")]
    pub machine_type: String,
    #[serde(default = "default_node_cpu")]
    pub node_cpu_millicores: u32,
    #[serde(default = "default_node_memory_gb")]
    pub node_memory_gb: u64,
    #[serde(default = "default_hourly_cost")]
    pub hourly_cost: f64,
    #[serde(default)]
    pub preemptible: bool,
    #[serde(default = "default_claim_bind_delay")]
    pub claim_bind_delay_secs: u64,
    #[serde(default = "default_resize_delay")]
    pub resize_delay_secs: u64,
    #[serde(default = "default_replica_ready_delay")]
    pub replica_ready_delay_secs: u64,
    /// Answer health probes from the simulation instead of over HTTP
    #[serde(default = "default_true")]
    pub simulate_probes: bool,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            initial_nodes: 0,
            pool_min_nodes: 0,
            pool_max_nodes: default_pool_max_nodes(),
            machine_type: default_machine_type(),
            node_cpu_millicores: default_node_cpu(),
            node_memory_gb: default_node_memory_gb(),
            hourly_cost: default_hourly_cost(),
            preemptible: false,
            claim_bind_delay_secs: default_claim_bind_delay(),
            resize_delay_secs: default_resize_delay(),
            replica_ready_delay_secs: default_replica_ready_delay(),
            simulate_probes: true,
        }
    }
}

fn default_api_port() -> u16 {
    8080
}

fn default_pool_zone() -> String {
    "us-central1-a".to_string()
}

fn default_pool_name() -> String {
    "ci-pool".to_string()
}

fn default_reconcile_interval() -> u64 {
    30
}

fn default_api_timeout() -> u64 {
    30
}

fn default_bind_timeout() -> u64 {
    300
}

fn default_scale_timeout() -> u64 {
    600
}

fn default_idle_window() -> u64 {
    30 * 60
}

fn default_cooldown() -> u64 {
    10 * 60
}

fn default_probe_interval() -> u64 {
    10
}

fn default_probe_jitter() -> u64 {
    2000
}

fn default_probe_timeout() -> u64 {
    5
}

fn default_cold_start_grace() -> u64 {
    300
}

fn default_warm_start_grace() -> u64 {
    90
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_docker_program() -> String {
    "docker".to_string()
}

fn default_registry_timeout() -> u64 {
    30
}

fn default_pool_max_nodes() -> u32 {
    3
}

fn default_machine_type() -> String {
    "e2-standard-2".to_string()
}

fn default_node_cpu() -> u32 {
    1930
}

fn default_node_memory_gb() -> u64 {
    6
}

fn default_hourly_cost() -> f64 {
    0.067
}

fn default_claim_bind_delay() -> u64 {
    5
}

fn default_resize_delay() -> u64 {
    90
}

fn default_replica_ready_delay() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

impl ControllerConfig {
    /// Load configuration from the optional config file and the environment
    pub fn load() -> Result<Self> {
        let file = std::env::var(CONFIG_FILE_ENV).ok();
        Self::load_from(file.as_deref(), None)
    }

    /// Load from an explicit file and environment map (the process
    /// environment when `env` is `None`)
    pub fn load_from(file: Option<&str>, env: Option<HashMap<String, String>>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(config::File::with_name(path));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix("FARM")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .source(env),
            )
            .build()
            .context("Failed to read controller configuration")?;

        let config: ControllerConfig = settings
            .try_deserialize()
            .context("Invalid controller configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.reconcile_interval_secs == 0 {
            bail!("reconcile_interval_secs must be positive");
        }
        if self.probe.failure_threshold == 0 {
            bail!("probe.failure_threshold must be at least 1");
        }
        if self.probe.cold_start_grace_secs < self.probe.warm_start_grace_secs {
            bail!("probe.cold_start_grace_secs must not be shorter than warm_start_grace_secs");
        }
        if self.simulation.pool_min_nodes > self.simulation.pool_max_nodes {
            bail!(
                "simulation pool bounds are inverted: min {} > max {}",
                self.simulation.pool_min_nodes,
                self.simulation.pool_max_nodes
            );
        }
        self.desired
            .validate()
            .context("Invalid [desired] section")?;
        Ok(())
    }

    pub fn pool_id(&self) -> PoolId {
        PoolId::new(&self.pool_zone, &self.pool_name)
    }

    pub fn controller_options(&self) -> ControllerOptions {
        let api_timeout = Duration::from_secs(self.api_timeout_secs);
        ControllerOptions {
            pool: self.pool_id(),
            reconcile_interval: Duration::from_secs(self.reconcile_interval_secs),
            api_timeout,
            storage: StorageConfig {
                bind_timeout: Duration::from_secs(self.bind_timeout_secs),
                api_timeout,
            },
            scaler: ScalerConfig {
                operation_timeout: Duration::from_secs(self.scale_timeout_secs),
                api_timeout,
                conflict_backoff: self.conflict_retry,
            },
            publish_backoff: self.publish_retry,
            cost: CostPolicyConfig {
                idle_window: Duration::from_secs(self.idle_window_secs),
                cooldown: Duration::from_secs(self.cooldown_secs),
                budget: self.desired.budget.clone(),
            },
        }
    }

    pub fn probe_config(&self) -> ProbeConfig {
        ProbeConfig {
            interval: Duration::from_secs(self.probe.interval_secs),
            jitter: Duration::from_millis(self.probe.jitter_ms),
            timeout: Duration::from_secs(self.probe.timeout_secs),
            cold_start_grace: Duration::from_secs(self.probe.cold_start_grace_secs),
            warm_start_grace: Duration::from_secs(self.probe.warm_start_grace_secs),
            failure_threshold: self.probe.failure_threshold,
            ..Default::default()
        }
    }

    pub fn decision_log_config(&self) -> DecisionLogConfig {
        DecisionLogConfig {
            path: self.decision_log_path.clone(),
            ..Default::default()
        }
    }

    pub fn simulation_config(&self) -> SimulationConfig {
        SimulationConfig {
            claim_bind_delay: Duration::from_secs(self.simulation.claim_bind_delay_secs),
            resize_delay: Duration::from_secs(self.simulation.resize_delay_secs),
            replica_ready_delay: Duration::from_secs(self.simulation.replica_ready_delay_secs),
            bind_claims: true,
        }
    }

    /// Pool record the simulated cluster starts with
    pub fn simulated_pool(&self) -> ClusterPool {
        let sim = &self.simulation;
        ClusterPool {
            name: self.pool_name.clone(),
            zone: self.pool_zone.clone(),
            node_count: sim.initial_nodes.clamp(sim.pool_min_nodes, sim.pool_max_nodes),
            min_nodes: sim.pool_min_nodes,
            max_nodes: sim.pool_max_nodes,
            machine_profile: MachineProfile {
                machine_type: sim.machine_type.clone(),
                allocatable_cpu_millicores: sim.node_cpu_millicores,
                allocatable_memory_bytes: sim.node_memory_gb.saturating_mul(1 << 30),
                preemptible: sim.preemptible,
                hourly_cost: sim.hourly_cost,
            },
            disk_profile: DiskProfile {
                disk_type: "pd-standard".to_string(),
                size_gb: 30,
            },
        }
    }
}
