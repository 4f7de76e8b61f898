//! Periodic probe loop
//!
//! The monitor is the only writer of the health snapshot. Readers get the
//! latest timestamped snapshot from a watch channel; unreachable instances
//! are additionally pushed as alerts. The monitor never restarts anything.

use super::{
    HealthProbe, InstanceHealth, InstanceRegistry, PhaseTransition, ProbeConfig,
};
use crate::models::{HealthPhase, HealthRecord};
use crate::observability::{FarmMetrics, StructuredLogger};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Last published health of every observed instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub records: Vec<HealthRecord>,
    pub published_at: DateTime<Utc>,
}

impl Default for HealthSnapshot {
    fn default() -> Self {
        Self {
            records: Vec::new(),
            published_at: Utc::now(),
        }
    }
}

impl HealthSnapshot {
    /// Best phase across instances; `None` when nothing is observed
    pub fn aggregate_phase(&self) -> Option<HealthPhase> {
        [
            HealthPhase::Ready,
            HealthPhase::Degraded,
            HealthPhase::Starting,
            HealthPhase::Unreachable,
        ]
        .into_iter()
        .find(|phase| self.records.iter().any(|r| r.phase == *phase))
    }

    pub fn phase_of(&self, instance_id: &str) -> Option<HealthPhase> {
        self.records
            .iter()
            .find(|r| r.instance_id == instance_id)
            .map(|r| r.phase)
    }

    pub fn unreachable(&self) -> Vec<&HealthRecord> {
        self.records
            .iter()
            .filter(|r| r.phase == HealthPhase::Unreachable)
            .collect()
    }
}

/// Actionable signal that an instance stopped answering
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthAlert {
    pub workload_id: String,
    pub instance_id: String,
    pub epoch: u64,
    pub consecutive_failures: u32,
    /// False when the instance failed before its first healthy answer
    #[serde(default)]
    pub was_ready: bool,
    pub at: DateTime<Utc>,
}

impl From<&PhaseTransition> for HealthAlert {
    fn from(t: &PhaseTransition) -> Self {
        Self {
            workload_id: t.workload_id.clone(),
            instance_id: t.instance_id.clone(),
            epoch: t.epoch,
            consecutive_failures: t.consecutive_failures,
            was_ready: t.from != HealthPhase::Starting,
            at: t.at,
        }
    }
}

pub struct HealthMonitor {
    prober: Arc<dyn HealthProbe>,
    registry: Arc<InstanceRegistry>,
    config: ProbeConfig,
    instances: HashMap<String, InstanceHealth>,
    snapshot_tx: watch::Sender<HealthSnapshot>,
    alert_tx: mpsc::Sender<HealthAlert>,
    metrics: FarmMetrics,
    logger: StructuredLogger,
}

impl HealthMonitor {
    pub fn new(
        prober: Arc<dyn HealthProbe>,
        registry: Arc<InstanceRegistry>,
        config: ProbeConfig,
        logger: StructuredLogger,
    ) -> (
        Self,
        watch::Receiver<HealthSnapshot>,
        mpsc::Receiver<HealthAlert>,
    ) {
        let (snapshot_tx, snapshot_rx) = watch::channel(HealthSnapshot::default());
        let (alert_tx, alert_rx) = mpsc::channel(config.alert_buffer.max(1));

        let monitor = Self {
            prober,
            registry,
            config,
            instances: HashMap::new(),
            snapshot_tx,
            alert_tx,
            metrics: FarmMetrics::new(),
            logger,
        };

        (monitor, snapshot_rx, alert_rx)
    }

    /// Start the probe loop; returns when shutdown is signalled
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            cold_grace_secs = self.config.cold_start_grace.as_secs(),
            warm_grace_secs = self.config.warm_start_grace.as_secs(),
            "Starting health monitor"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.next_delay()) => {
                    let transitions = self.probe_once().await;
                    if !transitions.is_empty() {
                        debug!(transitions = transitions.len(), "Probe cycle complete");
                    }
                }
                _ = shutdown.recv() => {
                    info!("Shutting down health monitor");
                    break;
                }
            }
        }
    }

    /// Probe every instance that is past its grace period and publish a snapshot
    pub async fn probe_once(&mut self) -> Vec<PhaseTransition> {
        self.sync_with_registry();

        let now = Instant::now();
        let mut transitions = Vec::new();

        let due: Vec<String> = self
            .instances
            .iter()
            .filter(|(_, health)| !health.in_grace(now))
            .map(|(id, _)| id.clone())
            .collect();

        for id in due {
            let Some(target) = self.registry.get(&id).map(|m| m.target) else {
                continue;
            };
            let outcome = self.prober.probe(&target).await;
            if !outcome.is_healthy() {
                self.metrics.inc_probe_failures();
            }

            let threshold = self.config.failure_threshold;
            let Some(health) = self.instances.get_mut(&id) else {
                continue;
            };
            if let Some(transition) = health.observe(&outcome, threshold, Utc::now()) {
                self.logger.log_health_transition(
                    &transition.instance_id,
                    transition.epoch,
                    transition.from,
                    transition.to,
                );
                if transition.to == HealthPhase::Unreachable {
                    self.raise_alert(&transition);
                }
                transitions.push(transition);
            }
        }

        self.publish();
        transitions
    }

    /// Bring the local phase machines in line with the registry
    fn sync_with_registry(&mut self) {
        let monitored = self.registry.list();

        self.instances
            .retain(|id, _| monitored.iter().any(|m| &m.target.instance_id == id));

        for m in monitored {
            let stale = self
                .instances
                .get(&m.target.instance_id)
                .map(|h| h.epoch() != m.epoch)
                .unwrap_or(true);
            if stale {
                let health = InstanceHealth::new(
                    &m.target.workload_id,
                    &m.target.instance_id,
                    m.epoch,
                    m.start_kind,
                    self.config.grace_for(m.start_kind),
                    m.registered_at,
                );
                self.instances.insert(m.target.instance_id.clone(), health);
            }
        }
    }

    fn raise_alert(&self, transition: &PhaseTransition) {
        if let Err(e) = self.alert_tx.try_send(HealthAlert::from(transition)) {
            warn!(
                instance = %transition.instance_id,
                error = %e,
                "Failed to deliver health alert"
            );
        }
    }

    fn publish(&self) {
        let mut records: Vec<HealthRecord> =
            self.instances.values().map(|h| h.record().clone()).collect();
        records.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));

        let snapshot = HealthSnapshot {
            records,
            published_at: Utc::now(),
        };
        self.metrics.set_health_phase(snapshot.aggregate_phase());
        self.snapshot_tx.send_replace(snapshot);
    }

    fn next_delay(&self) -> Duration {
        self.config.interval + Duration::from_millis(rand_jitter(self.config.jitter.as_millis() as u64))
    }
}

/// Random jitter between 0 and max_ms, spreading probes against the endpoint
fn rand_jitter(max_ms: u64) -> u64 {
    if max_ms == 0 {
        return 0;
    }
    rand::rng().random_range(0..max_ms)
}
