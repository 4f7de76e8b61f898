//! Observability infrastructure for the build farm controller
//!
//! Provides:
//! - Prometheus metrics (reconcile latency, pool size, scaling, probes, cost decisions)
//! - Structured JSON logging of lifecycle events with tracing

use crate::models::{CostDecision, HealthPhase};
use prometheus::{
    register_gauge_vec, register_histogram, register_int_counter, register_int_counter_vec,
    register_int_gauge, GaugeVec, Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{error, info, warn};

/// Histogram buckets for reconcile cycle latency (in seconds)
const RECONCILE_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<FarmMetricsInner> = OnceLock::new();

struct FarmMetricsInner {
    reconcile_latency_seconds: Histogram,
    reconcile_errors: IntCounterVec,
    pool_node_count: IntGauge,
    pool_target_nodes: IntGauge,
    scale_operations: IntCounter,
    scale_conflicts: IntCounter,
    probe_failures: IntCounter,
    publish_retries: IntCounter,
    cost_decisions: IntCounter,
    ready_replicas: IntGauge,
    health_phase_info: GaugeVec,
}

impl FarmMetricsInner {
    fn new() -> Self {
        Self {
            reconcile_latency_seconds: register_histogram!(
                "farm_controller_reconcile_latency_seconds",
                "Time spent in one reconcile cycle",
                RECONCILE_BUCKETS.to_vec()
            )
            .expect("Failed to register reconcile_latency_seconds"),

            reconcile_errors: register_int_counter_vec!(
                "farm_controller_reconcile_errors_total",
                "Reconcile cycles that ended in a typed error",
                &["kind"]
            )
            .expect("Failed to register reconcile_errors"),

            pool_node_count: register_int_gauge!(
                "farm_controller_pool_node_count",
                "Observed node count of the managed pool"
            )
            .expect("Failed to register pool_node_count"),

            pool_target_nodes: register_int_gauge!(
                "farm_controller_pool_target_nodes",
                "Node count last requested by the cost policy"
            )
            .expect("Failed to register pool_target_nodes"),

            scale_operations: register_int_counter!(
                "farm_controller_scale_operations_total",
                "Resize operations issued against the pool"
            )
            .expect("Failed to register scale_operations"),

            scale_conflicts: register_int_counter!(
                "farm_controller_scale_conflicts_total",
                "Resize attempts rejected because another operation was in progress"
            )
            .expect("Failed to register scale_conflicts"),

            probe_failures: register_int_counter!(
                "farm_controller_probe_failures_total",
                "Failed health probes against workload instances"
            )
            .expect("Failed to register probe_failures"),

            publish_retries: register_int_counter!(
                "farm_controller_publish_retries_total",
                "Image publication attempts retried after a transient failure"
            )
            .expect("Failed to register publish_retries"),

            cost_decisions: register_int_counter!(
                "farm_controller_cost_decisions_total",
                "Cost decisions appended to the decision log"
            )
            .expect("Failed to register cost_decisions"),

            ready_replicas: register_int_gauge!(
                "farm_controller_ready_replicas",
                "Workload replicas reporting ready"
            )
            .expect("Failed to register ready_replicas"),

            health_phase_info: register_gauge_vec!(
                "farm_controller_health_phase_info",
                "Aggregate health phase of the workload",
                &["phase"]
            )
            .expect("Failed to register health_phase_info"),
        }
    }
}

/// Controller metrics for Prometheus exposition
///
/// Lightweight handle to the global metrics instance; clones share it.
#[derive(Clone)]
pub struct FarmMetrics {
    _private: (),
}

impl Default for FarmMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl FarmMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(FarmMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &FarmMetricsInner {
        GLOBAL_METRICS.get_or_init(FarmMetricsInner::new)
    }

    pub fn observe_reconcile_latency(&self, duration_secs: f64) {
        self.inner().reconcile_latency_seconds.observe(duration_secs);
    }

    pub fn inc_reconcile_errors(&self, kind: &str) {
        self.inner().reconcile_errors.with_label_values(&[kind]).inc();
    }

    pub fn set_pool_node_count(&self, count: u32) {
        self.inner().pool_node_count.set(count as i64);
    }

    pub fn set_pool_target_nodes(&self, count: u32) {
        self.inner().pool_target_nodes.set(count as i64);
    }

    pub fn inc_scale_operations(&self) {
        self.inner().scale_operations.inc();
    }

    pub fn inc_scale_conflicts(&self) {
        self.inner().scale_conflicts.inc();
    }

    pub fn inc_probe_failures(&self) {
        self.inner().probe_failures.inc();
    }

    pub fn inc_publish_retries(&self) {
        self.inner().publish_retries.inc();
    }

    pub fn inc_cost_decisions(&self) {
        self.inner().cost_decisions.inc();
    }

    pub fn set_ready_replicas(&self, count: u32) {
        self.inner().ready_replicas.set(count as i64);
    }

    /// Replace the aggregate health phase label
    pub fn set_health_phase(&self, phase: Option<HealthPhase>) {
        self.inner().health_phase_info.reset();
        let label = phase.map(|p| p.to_string()).unwrap_or_else(|| "none".to_string());
        self.inner()
            .health_phase_info
            .with_label_values(&[label.as_str()])
            .set(1.0);
    }
}

/// Structured logger for controller lifecycle events
#[derive(Clone)]
pub struct StructuredLogger {
    pool: String,
}

impl StructuredLogger {
    pub fn new(pool: impl Into<String>) -> Self {
        Self { pool: pool.into() }
    }

    pub fn log_startup(&self, version: &str, workload: &str) {
        info!(
            event = "controller_started",
            pool = %self.pool,
            controller_version = %version,
            workload = %workload,
            "Build farm controller started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "controller_shutdown",
            pool = %self.pool,
            reason = %reason,
            "Build farm controller shutting down"
        );
    }

    pub fn log_cost_decision(&self, decision: &CostDecision, current_nodes: u32) {
        info!(
            event = "cost_decision",
            pool = %self.pool,
            target_node_count = decision.target_node_count,
            current_node_count = current_nodes,
            reason = %decision.reason,
            "Cost policy decision recorded"
        );
    }

    pub fn log_scale_issued(&self, from: u32, to: u32, operation: &str) {
        info!(
            event = "pool_scale_issued",
            pool = %self.pool,
            from_nodes = from,
            to_nodes = to,
            operation = %operation,
            "Pool resize issued"
        );
    }

    pub fn log_scale_completed(&self, node_count: u32) {
        info!(
            event = "pool_scale_completed",
            pool = %self.pool,
            node_count = node_count,
            "Pool resize completed"
        );
    }

    pub fn log_volume_state(&self, claim: &str, from: &str, to: &str) {
        info!(
            event = "volume_state",
            pool = %self.pool,
            claim = %claim,
            from = %from,
            to = %to,
            "Volume claim changed state"
        );
    }

    pub fn log_image_published(&self, image: &str, digest: &str, attempts: u32) {
        info!(
            event = "image_published",
            pool = %self.pool,
            image = %image,
            digest = %digest,
            attempts = attempts,
            "Image published and verified"
        );
    }

    pub fn log_rollout_step(&self, workload: &str, action: &str, replica: &str, running: usize) {
        info!(
            event = "rollout_step",
            pool = %self.pool,
            workload = %workload,
            action = %action,
            replica = %replica,
            running = running,
            "Rollout step applied"
        );
    }

    pub fn log_health_transition(
        &self,
        instance: &str,
        epoch: u64,
        from: HealthPhase,
        to: HealthPhase,
    ) {
        match to {
            HealthPhase::Unreachable => warn!(
                event = "health_transition",
                pool = %self.pool,
                instance = %instance,
                epoch = epoch,
                from = %from,
                to = %to,
                "Workload instance unreachable"
            ),
            _ => info!(
                event = "health_transition",
                pool = %self.pool,
                instance = %instance,
                epoch = epoch,
                from = %from,
                to = %to,
                "Workload instance changed health phase"
            ),
        }
    }

    pub fn log_reconcile_error(&self, kind: &str, message: &str, retryable: bool) {
        if retryable {
            warn!(
                event = "reconcile_error",
                pool = %self.pool,
                kind = %kind,
                retryable = true,
                error = %message,
                "Reconcile cycle failed, retrying next tick"
            );
        } else {
            error!(
                event = "reconcile_error",
                pool = %self.pool,
                kind = %kind,
                retryable = false,
                error = %message,
                "Reconcile blocked until the desired state changes"
            );
        }
    }
}
