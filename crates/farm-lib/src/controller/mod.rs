//! Reconcile cycle tying the components together
//!
//! Every tick the controller reads the operator's desired state, asks the
//! cost policy for a pool target, scales the pool, provisions storage,
//! publishes the image and finally drives the workload. Only one cycle runs
//! at a time; status readers never wait on a cycle.

mod desired;
mod status;

pub use desired::{DesiredPatch, DesiredState, VolumeDesired, MAX_REPLICAS};
pub use status::{ControllerPhase, ControllerStatus};

use crate::cluster::{ClusterApi, PoolId};
use crate::cost::{CostPolicyConfig, CostPolicyEngine, DemandSignal};
use crate::decision_log::DecisionLog;
use crate::error::{FarmError, FarmResult};
use crate::health::{components, HealthRegistry};
use crate::image::{ImagePublisher, ImageSource, RegistryApi};
use crate::models::{ClusterPool, CostDecision, HealthPhase, WorkloadSpec};
use crate::monitor::{HealthAlert, HealthSnapshot, InstanceRegistry, ProbeTarget, StartKind};
use crate::observability::{FarmMetrics, StructuredLogger};
use crate::pool::{PoolScaler, PoolState, ScalePhase, ScalerConfig};
use crate::retry::{with_deadline, BackoffPolicy};
use crate::storage::{StorageConfig, StorageProvisioner};
use crate::workload::{self, WorkloadReconciler, WorkloadState};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Mutex, RwLock};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Timing and tuning of the controller's components
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    pub pool: PoolId,
    pub reconcile_interval: Duration,
    /// Bound on every direct cluster call made by the controller
    pub api_timeout: Duration,
    pub storage: StorageConfig,
    pub scaler: ScalerConfig,
    pub publish_backoff: BackoffPolicy,
    /// Idle window and cooldown; the budget comes from the desired state
    pub cost: CostPolicyConfig,
}

impl ControllerOptions {
    pub fn new(pool: PoolId) -> Self {
        Self {
            pool,
            reconcile_interval: Duration::from_secs(30),
            api_timeout: Duration::from_secs(30),
            storage: StorageConfig::default(),
            scaler: ScalerConfig::default(),
            publish_backoff: BackoffPolicy::default(),
            cost: CostPolicyConfig::default(),
        }
    }
}

/// Collaborators the controller is wired to
pub struct ControllerParts {
    pub cluster: Arc<dyn ClusterApi>,
    pub image_source: Arc<dyn ImageSource>,
    pub registry: Arc<dyn RegistryApi>,
    /// Instances the health monitor probes
    pub instances: Arc<InstanceRegistry>,
    pub health: watch::Receiver<HealthSnapshot>,
    pub alerts: mpsc::Receiver<HealthAlert>,
    pub decisions: DecisionLog,
}

struct DesiredSlot {
    version: u64,
    state: DesiredState,
}

/// Revision the controller refuses to schedule until the desired state changes
struct Blocked {
    version: u64,
    error: FarmError,
}

/// State owned by the running cycle
struct CycleState {
    cost: CostPolicyEngine,
    alerts: mpsc::Receiver<HealthAlert>,
    blocked: Option<Blocked>,
    /// Set while the pool is coming up from zero nodes
    cold_start: bool,
    /// Instances already given a second grace period after failing to start
    startup_retries: HashSet<String>,
    /// States the scaler publishes for the managed pool
    pool_events: watch::Receiver<Option<PoolState>>,
    pool_phase: Option<ScalePhase>,
    workload_state: Option<WorkloadState>,
    decision: Option<CostDecision>,
}

pub struct FarmController {
    options: ControllerOptions,
    cluster: Arc<dyn ClusterApi>,
    storage: StorageProvisioner,
    publisher: ImagePublisher,
    scaler: PoolScaler,
    workload: WorkloadReconciler,
    instances: Arc<InstanceRegistry>,
    health: watch::Receiver<HealthSnapshot>,
    desired: RwLock<DesiredSlot>,
    activity: RwLock<Option<DateTime<Utc>>>,
    cycle: Mutex<CycleState>,
    decisions: Mutex<DecisionLog>,
    status: RwLock<ControllerStatus>,
    self_health: HealthRegistry,
    metrics: FarmMetrics,
    logger: StructuredLogger,
}

impl FarmController {
    pub fn new(
        options: ControllerOptions,
        desired: DesiredState,
        parts: ControllerParts,
        self_health: HealthRegistry,
        logger: StructuredLogger,
    ) -> FarmResult<Self> {
        desired.validate()?;

        let storage = StorageProvisioner::new(
            parts.cluster.clone(),
            options.storage.clone(),
            logger.clone(),
        );
        let publisher = ImagePublisher::new(
            parts.image_source,
            parts.registry,
            options.publish_backoff,
            logger.clone(),
        );
        let (workload, demand_rx) =
            WorkloadReconciler::new(parts.cluster.clone(), options.api_timeout, logger.clone());
        let scaler = PoolScaler::new(parts.cluster.clone(), options.scaler.clone(), logger.clone());
        scaler.track_demand(&options.pool, demand_rx);
        let pool_events = scaler.subscribe(&options.pool);

        let mut cost = CostPolicyEngine::new(CostPolicyConfig {
            budget: desired.budget.clone(),
            ..options.cost.clone()
        });
        let last = parts.decisions.last().cloned();
        if let Some(decision) = &last {
            info!(
                target_nodes = decision.target_node_count,
                reason = %decision.reason,
                "Restored last cost decision"
            );
            cost.restore(decision.clone());
        }

        let status = ControllerStatus {
            last_decision: last.clone(),
            ..ControllerStatus::initial(options.pool.to_string(), &desired.workload)
        };

        Ok(Self {
            cluster: parts.cluster,
            storage,
            publisher,
            scaler,
            workload,
            instances: parts.instances,
            health: parts.health,
            desired: RwLock::new(DesiredSlot {
                version: 0,
                state: desired,
            }),
            activity: RwLock::new(None),
            cycle: Mutex::new(CycleState {
                cost,
                alerts: parts.alerts,
                blocked: None,
                cold_start: true,
                startup_retries: HashSet::new(),
                pool_events,
                pool_phase: None,
                workload_state: None,
                decision: last,
            }),
            decisions: Mutex::new(parts.decisions),
            status: RwLock::new(status),
            self_health,
            metrics: FarmMetrics::new(),
            logger,
            options,
        })
    }

    pub fn options(&self) -> &ControllerOptions {
        &self.options
    }

    pub fn health_registry(&self) -> &HealthRegistry {
        &self.self_health
    }

    pub fn scaler(&self) -> &PoolScaler {
        &self.scaler
    }

    pub async fn desired(&self) -> DesiredState {
        self.desired.read().await.state.clone()
    }

    /// Merge a patch into the desired state
    ///
    /// The merged state is validated before it replaces the current one; a
    /// revision blocked as unschedulable is retried once this succeeds.
    pub async fn apply_desired(&self, patch: &DesiredPatch) -> FarmResult<DesiredState> {
        let mut slot = self.desired.write().await;
        let next = patch.apply(&slot.state);
        next.validate()?;
        if next != slot.state {
            slot.version += 1;
            info!(version = slot.version, image = %next.image, replicas = next.replicas, "Desired state updated");
        }
        slot.state = next.clone();
        Ok(next)
    }

    /// Record an external activity signal such as a queued build
    pub async fn record_activity(&self, at: DateTime<Utc>) {
        let mut activity = self.activity.write().await;
        if activity.map_or(true, |last| at > last) {
            *activity = Some(at);
            debug!(at = %at, "Activity signal recorded");
        }
    }

    pub async fn last_activity(&self) -> Option<DateTime<Utc>> {
        *self.activity.read().await
    }

    pub async fn status(&self) -> ControllerStatus {
        self.status.read().await.clone()
    }

    /// Most recent cost decisions, oldest first
    pub async fn decisions(&self, limit: usize) -> Vec<CostDecision> {
        self.decisions.lock().await.tail(limit)
    }

    /// Run one reconcile cycle and return the resulting status
    pub async fn reconcile_once(&self, now: DateTime<Utc>) -> FarmResult<ControllerStatus> {
        let mut cycle = self.cycle.lock().await;
        let (version, desired) = {
            let slot = self.desired.read().await;
            (slot.version, slot.state.clone())
        };

        let start = Instant::now();
        let outcome = self.run_cycle(&mut cycle, version, &desired, now).await;
        self.metrics
            .observe_reconcile_latency(start.elapsed().as_secs_f64());

        if let Err(e) = &outcome {
            self.metrics.inc_reconcile_errors(e.kind());
            self.logger
                .log_reconcile_error(e.kind(), &e.to_string(), e.is_retryable());
        }

        let status = self.build_status(&cycle, &desired, &outcome, now).await;
        *self.status.write().await = status.clone();
        self.self_health.set_ready(true).await;

        outcome.map(|_| status)
    }

    async fn run_cycle(
        &self,
        cycle: &mut CycleState,
        version: u64,
        desired: &DesiredState,
        now: DateTime<Utc>,
    ) -> FarmResult<()> {
        // Pick up states published since the last cycle
        self.observe_pool(cycle);

        while let Ok(alert) = cycle.alerts.try_recv() {
            if alert.workload_id != desired.workload {
                continue;
            }
            // One more cold grace period before replacing an instance that never came up
            if !alert.was_ready && cycle.startup_retries.insert(alert.instance_id.clone()) {
                if let Some(epoch) = self.instances.restarted(&alert.instance_id, StartKind::Cold) {
                    info!(
                        instance = %alert.instance_id,
                        epoch,
                        failures = alert.consecutive_failures,
                        "Instance not answering after start, extending grace"
                    );
                    continue;
                }
            }
            if self.workload.request_restart(&alert.instance_id) {
                warn!(
                    instance = %alert.instance_id,
                    epoch = alert.epoch,
                    failures = alert.consecutive_failures,
                    "Instance unreachable, scheduling replacement"
                );
            }
        }

        let pool_id = &self.options.pool;
        let fetched = with_deadline(
            &pool_id.to_string(),
            "get_node_pool",
            self.options.api_timeout,
            self.cluster.get_node_pool(pool_id),
        )
        .await;
        self.self_health.report(components::POOL, &fetched).await;
        let pool = desired.bound_pool(&fetched?);
        let spec = desired.workload_spec();

        let snapshot = self.health.borrow().clone();
        self.report_monitor(&snapshot).await;

        cycle.cost.set_budget(desired.budget.clone());
        let signal = DemandSignal {
            health: snapshot.aggregate_phase(),
            last_activity: self.last_activity().await,
            workload_nodes: workload::nodes_for(&spec, &pool, spec.replicas),
        };
        let decision = cycle.cost.decide(&signal, &desired.active_hours, &pool, now);
        self.record_decision(&decision, pool.node_count).await;
        self.self_health.set_healthy(components::COST_POLICY).await;
        self.metrics.set_pool_target_nodes(decision.target_node_count);

        let parked = decision.target_node_count == 0;
        cycle.decision = Some(decision.clone());
        let spec = if parked { spec.parked() } else { spec };

        let scaled = self
            .scaler
            .reconcile(pool_id, decision.target_node_count)
            .await;
        self.self_health.report(components::POOL, &scaled).await;
        let pool_state = scaled?;
        self.observe_pool(cycle);

        let volume = desired.volume_spec();
        let bound = self.storage.ensure_volume(&volume).await;
        self.self_health.report(components::STORAGE, &bound).await;
        bound?;

        if !parked {
            let published = self
                .publisher
                .ensure_published(&spec.image)
                .await
                .map_err(FarmError::from);
            self.self_health.report(components::IMAGE, &published).await;
            published?;
        }

        if let Some(blocked) = &cycle.blocked {
            if blocked.version == version {
                return Err(blocked.error.clone());
            }
            cycle.blocked = None;
        }

        let placed = ClusterPool {
            node_count: pool_state.node_count,
            ..pool
        };
        let claim = self.storage.claim(&volume);
        let reconciled = self.workload.reconcile(&spec, &placed, &claim).await;
        self.self_health.report(components::WORKLOAD, &reconciled).await;
        let state = match reconciled {
            Ok(state) => state,
            Err(e) => {
                if matches!(e, FarmError::UnschedulableSpec { .. }) {
                    cycle.blocked = Some(Blocked {
                        version,
                        error: e.clone(),
                    });
                }
                return Err(e);
            }
        };

        if !state.is_waiting() {
            self.sync_instances(&spec, &state, cycle.cold_start);
            cycle
                .startup_retries
                .retain(|id| state.replicas().iter().any(|r| &r.id == id));
        }
        if snapshot.aggregate_phase() == Some(HealthPhase::Ready) {
            cycle.cold_start = false;
        }
        let ready = state.replicas().iter().filter(|r| r.ready).count();
        self.metrics.set_ready_replicas(ready as u32);
        cycle.workload_state = Some(state);
        Ok(())
    }

    async fn record_decision(&self, decision: &CostDecision, current_nodes: u32) {
        let mut log = self.decisions.lock().await;
        let changed = log.last().map_or(true, |last| {
            last.target_node_count != decision.target_node_count || last.reason != decision.reason
        });
        if !changed {
            return;
        }

        if let Err(e) = log.append(decision.clone()) {
            warn!(error = %e, "Failed to persist cost decision");
        }
        self.logger.log_cost_decision(decision, current_nodes);
        self.metrics.inc_cost_decisions();
    }

    /// Follow the pool state feed; an empty pool means the next replicas start cold
    fn observe_pool(&self, cycle: &mut CycleState) {
        let Some(state) = cycle.pool_events.borrow_and_update().clone() else {
            return;
        };
        if state.node_count == 0 {
            cycle.cold_start = true;
        }
        if cycle.pool_phase != Some(state.phase) {
            info!(
                from = ?cycle.pool_phase,
                to = ?state.phase,
                nodes = state.node_count,
                target = ?state.in_flight_target,
                "Pool phase changed"
            );
            cycle.pool_phase = Some(state.phase);
        }
    }

    /// Keep the monitored set equal to the replicas the cluster reports
    fn sync_instances(&self, spec: &WorkloadSpec, state: &WorkloadState, cold_start: bool) {
        let live: Vec<String> = state.replicas().iter().map(|r| r.id.clone()).collect();

        for replica in state.replicas() {
            let start_kind = if cold_start || self.workload.started_cold(&replica.id) {
                StartKind::Cold
            } else {
                StartKind::Warm
            };
            self.instances.register(
                ProbeTarget {
                    workload_id: spec.name.clone(),
                    instance_id: replica.id.clone(),
                    address: replica.address.clone(),
                    port: spec.probe.port,
                    path: spec.probe.path.clone(),
                },
                start_kind,
            );
        }

        let removed = self.instances.retain_only(&live);
        if !removed.is_empty() {
            debug!(removed = ?removed, "Stopped monitoring replicas");
        }
    }

    async fn report_monitor(&self, snapshot: &HealthSnapshot) {
        let unreachable = snapshot.unreachable();
        if unreachable.is_empty() {
            self.self_health.set_healthy(components::MONITOR).await;
        } else {
            self.self_health
                .set_degraded(
                    components::MONITOR,
                    format!("{} instance(s) unreachable", unreachable.len()),
                )
                .await;
        }
    }

    async fn build_status(
        &self,
        cycle: &CycleState,
        desired: &DesiredState,
        outcome: &FarmResult<()>,
        now: DateTime<Utc>,
    ) -> ControllerStatus {
        let pool_state = cycle.pool_events.borrow().clone();
        let snapshot = self.health.borrow().clone();
        let spec = desired.workload_spec();
        let parked = cycle
            .decision
            .as_ref()
            .map_or(false, |d| d.target_node_count == 0);

        let phase = match (outcome, &cycle.workload_state) {
            (Err(e), _) if !e.is_retryable() => ControllerPhase::Blocked,
            _ if parked => ControllerPhase::Parked,
            (_, None) => ControllerPhase::Starting,
            (_, Some(WorkloadState::Waiting { .. })) => ControllerPhase::Waiting,
            (_, Some(WorkloadState::RollingOut { .. })) => ControllerPhase::RollingOut,
            (_, Some(WorkloadState::Available { .. })) => ControllerPhase::Available,
        };

        let workload_state = cycle.workload_state.as_ref();
        ControllerStatus {
            pool: self.options.pool.to_string(),
            workload: desired.workload.clone(),
            phase,
            node_count: pool_state.as_ref().map_or(0, |s| s.node_count),
            pool_phase: pool_state.as_ref().map(|s| s.phase),
            in_flight_target: pool_state.as_ref().and_then(|s| s.in_flight_target),
            last_decision: cycle.decision.clone(),
            health_phase: snapshot.aggregate_phase(),
            instances: snapshot.records,
            volume_state: self.storage.claim(&desired.volume_spec()).bound_state,
            image_digest: self.publisher.published(&spec.image).map(|a| a.digest),
            revision: spec.revision(),
            workload_state: workload_state.map_or("waiting", |s| s.label()).to_string(),
            replicas: workload_state.map_or_else(Vec::new, |s| s.replicas().to_vec()),
            last_error: outcome.as_ref().err().map(|e| e.to_string()),
            updated_at: now,
        }
    }

    /// Reconcile on a fixed interval until shutdown
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.options.reconcile_interval.as_secs(),
            pool = %self.options.pool,
            "Starting reconcile loop"
        );

        let mut ticker = interval(self.options.reconcile_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.reconcile_once(Utc::now()).await {
                        Ok(status) => debug!(phase = %status.phase, nodes = status.node_count, "Reconcile cycle complete"),
                        Err(e) => debug!(error = %e, "Reconcile cycle failed"),
                    }
                }
                _ = shutdown.recv() => {
                    info!("Shutting down reconcile loop");
                    break;
                }
            }
        }
    }

    /// Remove the workload and optionally its volume
    ///
    /// The pool is left where it is; the cost policy parks it afterwards.
    pub async fn teardown(&self, delete_volume: bool) -> FarmResult<usize> {
        let _cycle = self.cycle.lock().await;
        let desired = self.desired().await;

        let stopped = self.workload.teardown(&desired.workload).await?;
        self.instances.retain_only(&[]);
        if delete_volume {
            self.storage.delete_volume(&desired.volume.name).await?;
        }
        info!(stopped, delete_volume, workload = %desired.workload, "Workload torn down");
        Ok(stopped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{SimulatedCluster, SimulationConfig};
    use crate::cost::ActiveHours;
    use crate::image::InMemoryRegistry;
    use crate::models::{BoundState, DiskProfile, MachineProfile};
    use chrono::TimeZone;

    const IMAGE: &str = "registry.local/ci/jenkins:lts";

    fn pool_record(node_count: u32) -> ClusterPool {
        ClusterPool {
            name: "ci-pool".to_string(),
            zone: "us-central1-a".to_string(),
            node_count,
            min_nodes: 0,
            max_nodes: 3,
            machine_profile: MachineProfile {
                machine_type: "e2-standard-2".to_string(),
                allocatable_cpu_millicores: 1930,
                allocatable_memory_bytes: 6 << 30,
                preemptible: true,
                hourly_cost: 0.02,
            },
            disk_profile: DiskProfile {
                disk_type: "pd-standard".to_string(),
                size_gb: 30,
            },
        }
    }

    fn desired() -> DesiredState {
        DesiredState {
            image: IMAGE.to_string(),
            max_nodes: 3,
            active_hours: ActiveHours::never(),
            ..Default::default()
        }
    }

    struct Harness {
        cluster: Arc<SimulatedCluster>,
        images: Arc<InMemoryRegistry>,
        instances: Arc<InstanceRegistry>,
        controller: FarmController,
        _health_tx: watch::Sender<HealthSnapshot>,
        alert_tx: mpsc::Sender<HealthAlert>,
    }

    fn harness(desired: DesiredState) -> Harness {
        let cluster = Arc::new(SimulatedCluster::new(SimulationConfig {
            claim_bind_delay: Duration::ZERO,
            resize_delay: Duration::ZERO,
            replica_ready_delay: Duration::ZERO,
            bind_claims: true,
        }));
        cluster.seed_pool(pool_record(0));
        let images = Arc::new(InMemoryRegistry::new());
        images.add_local(IMAGE, b"jenkins build 1");
        let instances = Arc::new(InstanceRegistry::new());
        let (health_tx, health_rx) = watch::channel(HealthSnapshot::default());
        let (alert_tx, alert_rx) = mpsc::channel(8);

        let controller = FarmController::new(
            ControllerOptions::new(PoolId::new("us-central1-a", "ci-pool")),
            desired,
            ControllerParts {
                cluster: cluster.clone(),
                image_source: images.clone(),
                registry: images.clone(),
                instances: instances.clone(),
                health: health_rx,
                alerts: alert_rx,
                decisions: DecisionLog::in_memory(),
            },
            HealthRegistry::new(),
            StructuredLogger::new("us-central1-a/ci-pool"),
        )
        .unwrap();

        Harness {
            cluster,
            images,
            instances,
            controller,
            _health_tx: health_tx,
            alert_tx,
        }
    }

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 6, hour, minute, 0).unwrap()
    }

    #[tokio::test]
    async fn test_activity_brings_workload_up() {
        let h = harness(desired());
        h.controller.record_activity(at(10, 0)).await;

        let mut status = h.controller.reconcile_once(at(10, 0)).await.unwrap();
        for minute in 1..6 {
            if status.phase == ControllerPhase::Available {
                break;
            }
            status = h.controller.reconcile_once(at(10, minute)).await.unwrap();
        }

        assert_eq!(status.phase, ControllerPhase::Available);
        assert_eq!(status.node_count, 1);
        assert_eq!(status.volume_state, BoundState::Bound);
        assert!(status.image_digest.is_some());
        assert_eq!(status.replicas.len(), 1);
        assert_eq!(h.instances.len(), 1);
        assert_eq!(h.images.push_count(), 1);
        assert!(h.controller.health_registry().readiness().await.ready);
    }

    #[tokio::test]
    async fn test_unschedulable_revision_stays_blocked_until_changed() {
        let h = harness(DesiredState {
            replicas: 20,
            ..desired()
        });
        h.controller.record_activity(at(10, 0)).await;

        let mut last = None;
        for minute in 0..3 {
            last = Some(h.controller.reconcile_once(at(10, minute)).await);
        }
        let err = last.unwrap().unwrap_err();
        assert!(matches!(err, FarmError::UnschedulableSpec { .. }));
        assert_eq!(h.controller.status().await.phase, ControllerPhase::Blocked);
        assert_eq!(h.cluster.counters().start_replica, 0);
        assert!(!h.controller.health_registry().readiness().await.ready);

        let patch = DesiredPatch {
            replicas: Some(1),
            ..Default::default()
        };
        h.controller.apply_desired(&patch).await.unwrap();
        let mut status = h.controller.status().await;
        for minute in 3..8 {
            status = h.controller.reconcile_once(at(10, minute)).await.unwrap();
        }
        assert_eq!(status.phase, ControllerPhase::Available);
    }

    #[tokio::test]
    async fn test_invalid_patch_is_rejected() {
        let h = harness(desired());
        let patch = DesiredPatch {
            min_nodes: Some(5),
            ..Default::default()
        };
        assert!(matches!(
            h.controller.apply_desired(&patch).await,
            Err(FarmError::InvalidConfig(_))
        ));
        assert_eq!(h.controller.desired().await, desired());
    }

    #[tokio::test]
    async fn test_alert_replaces_instance() {
        let h = harness(desired());
        h.controller.record_activity(at(10, 0)).await;
        let mut status = h.controller.status().await;
        for minute in 0..5 {
            status = h.controller.reconcile_once(at(10, minute)).await.unwrap();
        }
        let original = status.replicas[0].id.clone();

        h.alert_tx
            .send(HealthAlert {
                workload_id: "jenkins".to_string(),
                instance_id: original.clone(),
                epoch: 1,
                consecutive_failures: 3,
                was_ready: true,
                at: at(10, 5),
            })
            .await
            .unwrap();

        for minute in 6..12 {
            status = h.controller.reconcile_once(at(10, minute)).await.unwrap();
        }
        assert_eq!(status.phase, ControllerPhase::Available);
        assert_eq!(status.replicas.len(), 1);
        assert_ne!(status.replicas[0].id, original);
        assert!(h.instances.get(&original).is_none());
    }

    #[tokio::test]
    async fn test_startup_failure_extends_grace_once() {
        let h = harness(desired());
        h.controller.record_activity(at(10, 0)).await;
        let mut status = h.controller.status().await;
        for minute in 0..5 {
            status = h.controller.reconcile_once(at(10, minute)).await.unwrap();
        }
        let original = status.replicas[0].id.clone();
        let starts = h.cluster.counters().start_replica;
        let alert = |epoch| HealthAlert {
            workload_id: "jenkins".to_string(),
            instance_id: original.clone(),
            epoch,
            consecutive_failures: 3,
            was_ready: false,
            at: at(10, 5),
        };

        h.alert_tx.send(alert(1)).await.unwrap();
        status = h.controller.reconcile_once(at(10, 6)).await.unwrap();
        assert_eq!(status.replicas[0].id, original);
        assert_eq!(h.cluster.counters().start_replica, starts);
        let monitored = h.instances.get(&original).unwrap();
        assert_eq!(monitored.epoch, 2);
        assert_eq!(monitored.start_kind, StartKind::Cold);

        h.alert_tx.send(alert(2)).await.unwrap();
        for minute in 7..12 {
            status = h.controller.reconcile_once(at(10, minute)).await.unwrap();
        }
        assert_eq!(status.replicas.len(), 1);
        assert_ne!(status.replicas[0].id, original);
        assert_eq!(h.cluster.counters().start_replica, starts + 1);
    }

    #[tokio::test]
    async fn test_status_follows_pool_feed() {
        let h = harness(desired());
        let pool = PoolId::new("us-central1-a", "ci-pool");
        let feed = h.controller.scaler().subscribe(&pool);
        h.controller.record_activity(at(10, 0)).await;

        let mut status = h.controller.status().await;
        for minute in 0..5 {
            status = h.controller.reconcile_once(at(10, minute)).await.unwrap();
        }
        let published = feed.borrow().clone().unwrap();
        assert_eq!(status.pool_phase, Some(ScalePhase::Steady));
        assert_eq!(status.node_count, published.node_count);
        assert_eq!(status.node_count, 1);

        // Idle past the window: the pool drains and the status follows
        for minute in 40..50 {
            status = h.controller.reconcile_once(at(10, minute)).await.unwrap();
        }
        assert_eq!(status.phase, ControllerPhase::Parked);
        assert_eq!(status.pool_phase, Some(ScalePhase::Parked));
        assert_eq!(status.node_count, 0);
        assert_eq!(feed.borrow().as_ref().unwrap().node_count, 0);
    }

    #[tokio::test]
    async fn test_decisions_logged_on_change_only() {
        let h = harness(desired());
        h.controller.record_activity(at(10, 0)).await;
        for minute in 0..4 {
            h.controller.reconcile_once(at(10, minute)).await.unwrap();
        }

        let decisions = h.controller.decisions(10).await;
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].target_node_count, 1);
        assert_eq!(decisions[0].reason, "recent activity signal");
    }

    #[tokio::test]
    async fn test_teardown_stops_replicas() {
        let h = harness(desired());
        h.controller.record_activity(at(10, 0)).await;
        for minute in 0..5 {
            h.controller.reconcile_once(at(10, minute)).await.unwrap();
        }

        let stopped = h.controller.teardown(true).await.unwrap();
        assert_eq!(stopped, 1);
        assert!(h.instances.is_empty());
    }
}
