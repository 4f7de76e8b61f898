//! In-process cluster used for dry runs and tests
//!
//! Resizes, claim binding and replica start-up take configurable wall-clock
//! time (tokio's clock, so paused-time tests advance them deterministically).
//! Faults such as conflicting operations, claims that never bind, preempted
//! nodes and unhealthy replicas can be injected.

use super::{ClusterApi, ClusterApiError, OperationId, OperationStatus, PoolId};
use crate::models::{
    BoundState, ClusterPool, PersistentVolumeClaim, Replica, VolumeSpec, WorkloadSpec,
};
use crate::monitor::{HealthProbe, ProbeOutcome, ProbeTarget};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Timings of the simulated cluster
#[derive(Debug, Clone)]
pub struct SimulationConfig {
    pub claim_bind_delay: Duration,
    pub resize_delay: Duration,
    pub replica_ready_delay: Duration,
    /// When false, claims stay `Pending` forever
    pub bind_claims: bool,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            claim_bind_delay: Duration::from_secs(5),
            resize_delay: Duration::from_secs(90),
            replica_ready_delay: Duration::from_secs(60),
            bind_claims: true,
        }
    }
}

/// Calls observed by the simulated cluster
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallCounters {
    pub resize_node_pool: u32,
    pub create_claim: u32,
    pub start_replica: u32,
    pub stop_replica: u32,
    /// Start requests made while the pool had no nodes
    pub start_without_capacity: u32,
}

struct PendingResize {
    id: OperationId,
    target: u32,
    completes_at: Instant,
}

struct PoolEntry {
    pool: ClusterPool,
    pending: Option<PendingResize>,
}

struct ClaimEntry {
    claim: PersistentVolumeClaim,
    binds_at: Option<Instant>,
}

struct ReplicaEntry {
    replica: Replica,
    workload: String,
    pool: PoolId,
    port: u16,
    ready_at: Instant,
    healthy: bool,
}

#[derive(Default)]
struct State {
    pools: HashMap<PoolId, PoolEntry>,
    finished_operations: HashMap<OperationId, OperationStatus>,
    claims: HashMap<String, ClaimEntry>,
    replicas: Vec<ReplicaEntry>,
    resize_conflicts: HashMap<PoolId, u32>,
    next_id: u64,
    calls: CallCounters,
}

pub struct SimulatedCluster {
    config: SimulationConfig,
    state: Mutex<State>,
}

impl SimulatedCluster {
    pub fn new(config: SimulationConfig) -> Self {
        Self {
            config,
            state: Mutex::new(State::default()),
        }
    }

    /// Register a pool as it exists before the controller starts
    pub fn seed_pool(&self, pool: ClusterPool) {
        let mut state = self.lock();
        state.pools.insert(
            PoolId::from(&pool),
            PoolEntry {
                pool,
                pending: None,
            },
        );
    }

    /// Current pool record, with completed operations applied
    pub fn pool(&self, id: &PoolId) -> Option<ClusterPool> {
        let mut state = self.lock();
        Self::advance(&mut state);
        state.pools.get(id).map(|entry| entry.pool.clone())
    }

    pub fn counters(&self) -> CallCounters {
        self.lock().calls.clone()
    }

    /// Make the next `count` resize calls on `pool` fail as already in progress
    pub fn inject_resize_conflicts(&self, pool: &PoolId, count: u32) {
        self.lock().resize_conflicts.insert(pool.clone(), count);
    }

    /// Preempt every node of the pool; the managed group replaces them empty
    pub fn preempt(&self, pool: &PoolId) {
        let mut state = self.lock();
        let before = state.replicas.len();
        state.replicas.retain(|r| &r.pool != pool);
        debug!(pool = %pool, evicted = before - state.replicas.len(), "Simulated preemption");
    }

    /// Toggle whether a replica answers its health endpoint
    pub fn set_replica_healthy(&self, replica_id: &str, healthy: bool) {
        let mut state = self.lock();
        if let Some(entry) = state.replicas.iter_mut().find(|r| r.replica.id == replica_id) {
            entry.healthy = healthy;
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn advance(state: &mut State) {
        let now = Instant::now();

        let mut emptied = Vec::new();
        let mut finished = Vec::new();
        for (id, entry) in state.pools.iter_mut() {
            let done = matches!(&entry.pending, Some(p) if p.completes_at <= now);
            if done {
                if let Some(pending) = entry.pending.take() {
                    entry.pool.node_count = pending.target;
                    if pending.target == 0 {
                        emptied.push(id.clone());
                    }
                    finished.push(pending.id);
                }
            }
        }
        for id in finished {
            state.finished_operations.insert(id, OperationStatus::Done);
        }
        if !emptied.is_empty() {
            state.replicas.retain(|r| !emptied.contains(&r.pool));
        }

        for entry in state.claims.values_mut() {
            if entry.claim.bound_state == BoundState::Pending
                && entry.binds_at.map(|at| at <= now).unwrap_or(false)
            {
                entry.claim.bound_state = BoundState::Bound;
            }
        }

        for entry in state.replicas.iter_mut() {
            entry.replica.ready = entry.healthy && entry.ready_at <= now;
        }
    }
}

#[async_trait]
impl ClusterApi for SimulatedCluster {
    async fn get_node_pool(&self, pool: &PoolId) -> Result<ClusterPool, ClusterApiError> {
        self.pool(pool)
            .ok_or_else(|| ClusterApiError::NotFound(format!("node pool {}", pool)))
    }

    async fn resize_node_pool(
        &self,
        pool: &PoolId,
        node_count: u32,
    ) -> Result<OperationId, ClusterApiError> {
        let mut state = self.lock();
        Self::advance(&mut state);
        state.calls.resize_node_pool += 1;

        if let Some(remaining) = state.resize_conflicts.get_mut(pool) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(ClusterApiError::OperationInProgress(pool.to_string()));
            }
        }

        state.next_id += 1;
        let id = OperationId(format!("operation-{}", state.next_id));
        let completes_at = Instant::now() + self.config.resize_delay;

        let entry = state
            .pools
            .get_mut(pool)
            .ok_or_else(|| ClusterApiError::NotFound(format!("node pool {}", pool)))?;
        if entry.pending.is_some() {
            return Err(ClusterApiError::OperationInProgress(pool.to_string()));
        }
        if node_count > entry.pool.max_nodes || node_count < entry.pool.min_nodes {
            return Err(ClusterApiError::Rejected(format!(
                "node count {} outside [{}, {}]",
                node_count, entry.pool.min_nodes, entry.pool.max_nodes
            )));
        }
        entry.pending = Some(PendingResize {
            id: id.clone(),
            target: node_count,
            completes_at,
        });
        state
            .finished_operations
            .insert(id.clone(), OperationStatus::Running);

        debug!(pool = %pool, node_count, operation = %id, "Simulated resize issued");
        Ok(id)
    }

    async fn get_operation(
        &self,
        _pool: &PoolId,
        operation: &OperationId,
    ) -> Result<OperationStatus, ClusterApiError> {
        let mut state = self.lock();
        Self::advance(&mut state);
        state
            .finished_operations
            .get(operation)
            .cloned()
            .ok_or_else(|| ClusterApiError::NotFound(format!("operation {}", operation)))
    }

    async fn get_claim(&self, name: &str) -> Result<Option<PersistentVolumeClaim>, ClusterApiError> {
        let mut state = self.lock();
        Self::advance(&mut state);
        Ok(state.claims.get(name).map(|entry| entry.claim.clone()))
    }

    async fn create_claim(&self, spec: &VolumeSpec) -> Result<(), ClusterApiError> {
        let mut state = self.lock();
        state.calls.create_claim += 1;
        if state.claims.contains_key(&spec.name) {
            return Ok(());
        }
        let binds_at = self
            .config
            .bind_claims
            .then(|| Instant::now() + self.config.claim_bind_delay);
        state.claims.insert(
            spec.name.clone(),
            ClaimEntry {
                claim: PersistentVolumeClaim::from_spec(spec, BoundState::Pending),
                binds_at,
            },
        );
        Ok(())
    }

    async fn resize_claim(&self, name: &str, size_bytes: u64) -> Result<(), ClusterApiError> {
        let mut state = self.lock();
        let entry = state
            .claims
            .get_mut(name)
            .ok_or_else(|| ClusterApiError::NotFound(format!("claim {}", name)))?;
        if size_bytes < entry.claim.requested_size_bytes {
            return Err(ClusterApiError::Rejected(
                "volume claims can only grow".to_string(),
            ));
        }
        entry.claim.requested_size_bytes = size_bytes;
        Ok(())
    }

    async fn delete_claim(&self, name: &str) -> Result<(), ClusterApiError> {
        self.lock().claims.remove(name);
        Ok(())
    }

    async fn list_replicas(&self, workload: &str) -> Result<Vec<Replica>, ClusterApiError> {
        let mut state = self.lock();
        Self::advance(&mut state);
        Ok(state
            .replicas
            .iter()
            .filter(|r| r.workload == workload)
            .map(|r| r.replica.clone())
            .collect())
    }

    async fn start_replica(
        &self,
        pool: &PoolId,
        spec: &WorkloadSpec,
    ) -> Result<Replica, ClusterApiError> {
        let mut state = self.lock();
        Self::advance(&mut state);
        state.calls.start_replica += 1;

        let node_count = state
            .pools
            .get(pool)
            .map(|entry| entry.pool.node_count)
            .ok_or_else(|| ClusterApiError::NotFound(format!("node pool {}", pool)))?;
        if node_count == 0 {
            state.calls.start_without_capacity += 1;
            return Err(ClusterApiError::Rejected(format!(
                "pool {} has no nodes to schedule on",
                pool
            )));
        }

        state.next_id += 1;
        let now = Instant::now();
        let replica = Replica {
            id: format!("{}-{}-{}", spec.name, spec.revision(), state.next_id),
            revision: spec.revision(),
            address: format!("10.8.0.{}", state.next_id % 250 + 2),
            ready: false,
            started_at: chrono::Utc::now(),
        };
        state.replicas.push(ReplicaEntry {
            replica: replica.clone(),
            workload: spec.name.clone(),
            pool: pool.clone(),
            port: spec.probe.port,
            ready_at: now + self.config.replica_ready_delay,
            healthy: true,
        });
        Ok(replica)
    }

    async fn stop_replica(&self, workload: &str, replica_id: &str) -> Result<(), ClusterApiError> {
        let mut state = self.lock();
        state.calls.stop_replica += 1;
        state
            .replicas
            .retain(|r| !(r.workload == workload && r.replica.id == replica_id));
        Ok(())
    }
}

#[async_trait]
impl HealthProbe for SimulatedCluster {
    async fn probe(&self, target: &ProbeTarget) -> ProbeOutcome {
        let mut state = self.lock();
        Self::advance(&mut state);
        match state
            .replicas
            .iter()
            .find(|r| r.replica.address == target.address && r.port == target.port)
        {
            Some(entry) if entry.replica.ready => ProbeOutcome::Healthy,
            Some(_) => ProbeOutcome::Failed("503 Service Unavailable".to_string()),
            None => ProbeOutcome::Failed("connection refused".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DiskProfile, MachineProfile};

    fn pool() -> ClusterPool {
        ClusterPool {
            name: "ci-pool".to_string(),
            zone: "us-central1-a".to_string(),
            node_count: 0,
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

    #[tokio::test(start_paused = true)]
    async fn test_resize_completes_after_delay() {
        let cluster = SimulatedCluster::new(SimulationConfig::default());
        cluster.seed_pool(pool());
        let id = PoolId::new("us-central1-a", "ci-pool");

        let op = cluster.resize_node_pool(&id, 1).await.unwrap();
        assert_eq!(
            cluster.get_operation(&id, &op).await.unwrap(),
            OperationStatus::Running
        );

        let second = cluster.resize_node_pool(&id, 2).await;
        assert!(matches!(second, Err(ClusterApiError::OperationInProgress(_))));

        tokio::time::advance(Duration::from_secs(91)).await;
        assert_eq!(
            cluster.get_operation(&id, &op).await.unwrap(),
            OperationStatus::Done
        );
        assert_eq!(cluster.get_node_pool(&id).await.unwrap().node_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_claim_binds_after_delay() {
        let cluster = SimulatedCluster::new(SimulationConfig::default());
        let spec = VolumeSpec {
            name: "jenkins-home".to_string(),
            requested_size_bytes: 10 << 30,
            storage_class: "standard".to_string(),
        };
        cluster.create_claim(&spec).await.unwrap();
        let claim = cluster.get_claim("jenkins-home").await.unwrap().unwrap();
        assert_eq!(claim.bound_state, BoundState::Pending);

        tokio::time::advance(Duration::from_secs(6)).await;
        let claim = cluster.get_claim("jenkins-home").await.unwrap().unwrap();
        assert_eq!(claim.bound_state, BoundState::Bound);

        assert!(cluster.resize_claim("jenkins-home", 1 << 30).await.is_err());
    }

    #[tokio::test]
    async fn test_start_replica_rejected_without_nodes() {
        let cluster = SimulatedCluster::new(SimulationConfig::default());
        cluster.seed_pool(pool());
        let id = PoolId::new("us-central1-a", "ci-pool");
        let spec = WorkloadSpec {
            name: "jenkins".to_string(),
            image: "gcr.io/acme/jenkins:lts".to_string(),
            replicas: 1,
            resource_requests: Default::default(),
            resource_limits: Default::default(),
            rollout_strategy: Default::default(),
            mounted_volume: "jenkins-home".to_string(),
            probe: Default::default(),
        };

        assert!(cluster.start_replica(&id, &spec).await.is_err());
        assert_eq!(cluster.counters().start_without_capacity, 1);
    }
}
