//! Workload reconciliation
//!
//! Drives the CI server's replicas toward the desired spec once the volume is
//! bound and the pool has nodes. Rollouts surge one replica above the desired
//! count and only drain an outdated replica once enough updated replicas are
//! ready to keep serving.

use crate::cluster::{ClusterApi, PoolId};
use crate::error::{FarmError, FarmResult};
use crate::models::{
    BoundState, ClusterPool, PersistentVolumeClaim, Replica, WorkloadDemand, WorkloadSpec,
};
use crate::observability::{FarmMetrics, StructuredLogger};
use crate::retry::with_deadline;
use dashmap::DashSet;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum WorkloadState {
    /// Preconditions unmet; nothing was scheduled
    Waiting { reason: String },
    RollingOut {
        revision: String,
        desired: u32,
        updated: u32,
        ready: u32,
        replicas: Vec<Replica>,
    },
    /// Every replica runs the desired revision and is ready
    Available {
        revision: String,
        ready: u32,
        replicas: Vec<Replica>,
    },
}

impl WorkloadState {
    pub fn replicas(&self) -> &[Replica] {
        match self {
            WorkloadState::Waiting { .. } => &[],
            WorkloadState::RollingOut { replicas, .. } | WorkloadState::Available { replicas, .. } => {
                replicas
            }
        }
    }

    pub fn is_waiting(&self) -> bool {
        matches!(self, WorkloadState::Waiting { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            WorkloadState::Waiting { .. } => "waiting",
            WorkloadState::RollingOut { .. } => "rolling_out",
            WorkloadState::Available { .. } => "available",
        }
    }
}

/// Nodes needed to host `replicas` replicas of `spec`
pub fn nodes_for(spec: &WorkloadSpec, pool: &ClusterPool, replicas: u32) -> u32 {
    if replicas == 0 {
        return 0;
    }
    let per_node = pool
        .machine_profile
        .replicas_per_node(&spec.resource_requests)
        .max(1);
    replicas.div_ceil(per_node)
}

/// Reject specs that can never be scheduled on `pool`
pub fn validate(spec: &WorkloadSpec, pool: &ClusterPool) -> FarmResult<()> {
    let fail = |reason: String| FarmError::UnschedulableSpec {
        workload: spec.name.clone(),
        pool: pool.key(),
        revision: spec.revision(),
        reason,
    };

    if !spec.resource_requests.fits_within(&spec.resource_limits) {
        return Err(fail(format!(
            "requests ({}m, {} bytes) exceed limits ({}m, {} bytes)",
            spec.resource_requests.cpu_millicores,
            spec.resource_requests.memory_bytes,
            spec.resource_limits.cpu_millicores,
            spec.resource_limits.memory_bytes
        )));
    }
    if !pool.machine_profile.fits(&spec.resource_limits) {
        return Err(fail(format!(
            "limits ({}m, {} bytes) exceed {} allocatable capacity ({}m, {} bytes)",
            spec.resource_limits.cpu_millicores,
            spec.resource_limits.memory_bytes,
            pool.machine_profile.machine_type,
            pool.machine_profile.allocatable_cpu_millicores,
            pool.machine_profile.allocatable_memory_bytes
        )));
    }
    let Some(surge_replicas) = spec.replicas.checked_add(spec.rollout_strategy.max_surge) else {
        return Err(fail(format!(
            "{} replicas plus a surge of {} overflow the replica count",
            spec.replicas, spec.rollout_strategy.max_surge
        )));
    };
    let surge_nodes = nodes_for(spec, pool, surge_replicas);
    if surge_nodes > pool.max_nodes {
        return Err(fail(format!(
            "{} replicas during rollout need {} nodes, pool ceiling is {}",
            surge_replicas, surge_nodes, pool.max_nodes
        )));
    }
    Ok(())
}

pub struct WorkloadReconciler {
    cluster: Arc<dyn ClusterApi>,
    api_timeout: Duration,
    replacements: DashSet<String>,
    /// Replica ids as of the end of the previous reconcile
    known: DashSet<String>,
    /// Replicas started in place of evicted ones; their nodes may be fresh
    cold_started: DashSet<String>,
    demand: watch::Sender<WorkloadDemand>,
    metrics: FarmMetrics,
    logger: StructuredLogger,
}

impl WorkloadReconciler {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        api_timeout: Duration,
        logger: StructuredLogger,
    ) -> (Self, watch::Receiver<WorkloadDemand>) {
        let (demand, demand_rx) = watch::channel(WorkloadDemand::default());
        let reconciler = Self {
            cluster,
            api_timeout,
            replacements: DashSet::new(),
            known: DashSet::new(),
            cold_started: DashSet::new(),
            demand,
            metrics: FarmMetrics::new(),
            logger,
        };
        (reconciler, demand_rx)
    }

    /// Another receiver of the demand feed
    pub fn subscribe_demand(&self) -> watch::Receiver<WorkloadDemand> {
        self.demand.subscribe()
    }

    pub fn demand(&self) -> WorkloadDemand {
        *self.demand.borrow()
    }

    /// Mark a replica for replacement on the next reconcile
    ///
    /// Returns false if the replica was already marked.
    pub fn request_restart(&self, replica_id: &str) -> bool {
        let inserted = self.replacements.insert(replica_id.to_string());
        if inserted {
            debug!(replica = %replica_id, "Replica marked for replacement");
        }
        inserted
    }

    pub fn pending_restarts(&self) -> usize {
        self.replacements.len()
    }

    /// Whether the replica was started to replace an evicted one
    pub fn started_cold(&self, replica_id: &str) -> bool {
        self.cold_started.contains(replica_id)
    }

    /// Drive the workload one step toward `desired`
    pub async fn reconcile(
        &self,
        desired: &WorkloadSpec,
        pool: &ClusterPool,
        pvc: &PersistentVolumeClaim,
    ) -> FarmResult<WorkloadState> {
        validate(desired, pool)?;

        let waiting = if pvc.bound_state != BoundState::Bound {
            Some(format!("volume {} is {}", pvc.name, pvc.bound_state))
        } else if !pool.has_capacity() {
            Some(format!("pool {} has no nodes", pool.key()))
        } else {
            None
        };
        if let Some(reason) = waiting {
            self.publish_demand(WorkloadDemand {
                requires_ready_capacity: desired.replicas > 0,
                nodes: nodes_for(desired, pool, desired.replicas),
            });
            debug!(workload = %desired.name, reason = %reason, "Workload waiting");
            return Ok(WorkloadState::Waiting { reason });
        }

        let mut replicas = self.list(&desired.name).await?;
        self.replacements
            .retain(|id| replicas.iter().any(|r| &r.id == id));

        // Known replicas that vanished without a stop were evicted
        let evicted: Vec<String> = self
            .known
            .iter()
            .filter(|id| !replicas.iter().any(|r| r.id == *id.key()))
            .map(|id| id.key().clone())
            .collect();
        if !evicted.is_empty() {
            warn!(workload = %desired.name, evicted = ?evicted, "Replicas disappeared without being stopped");
        }

        let revision = desired.revision();
        let wanted = desired.replicas as usize;
        let max_total = wanted + desired.rollout_strategy.max_surge.max(1) as usize;
        let min_ready = wanted.saturating_sub(desired.rollout_strategy.max_unavailable as usize);
        let is_updated =
            |r: &Replica, replacements: &DashSet<String>| r.revision == revision && !replacements.contains(&r.id);

        // Surge
        while replicas.iter().filter(|r| is_updated(r, &self.replacements)).count() < wanted
            && replicas.len() < max_total
        {
            let replica = self.start(pool, desired).await?;
            if !evicted.is_empty() {
                self.cold_started.insert(replica.id.clone());
            }
            self.logger
                .log_rollout_step(&desired.name, "start", &replica.id, replicas.len() + 1);
            replicas.push(replica);
        }

        // Drain: outdated first, unready before ready
        let mut candidates: Vec<Replica> = replicas
            .iter()
            .filter(|r| !is_updated(r, &self.replacements))
            .cloned()
            .collect();
        let mut excess_updated: Vec<Replica> = replicas
            .iter()
            .filter(|r| is_updated(r, &self.replacements))
            .cloned()
            .collect();
        candidates.sort_by_key(|r| r.ready);
        excess_updated.sort_by_key(|r| r.ready);
        let excess = excess_updated.len().saturating_sub(wanted);
        candidates.extend(excess_updated.into_iter().take(excess));

        for candidate in candidates {
            let ready_now = replicas.iter().filter(|r| r.ready).count();
            let ready_after = ready_now - usize::from(candidate.ready);
            let outdated = !is_updated(&candidate, &self.replacements);
            let allowed = if wanted == 0 {
                true
            } else if outdated {
                replicas.len() > wanted && ready_after >= min_ready
            } else {
                replicas.len() > wanted
            };
            if !allowed {
                continue;
            }
            self.stop(&desired.name, &candidate.id).await?;
            replicas.retain(|r| r.id != candidate.id);
            self.replacements.remove(&candidate.id);
            self.logger
                .log_rollout_step(&desired.name, "stop", &candidate.id, replicas.len());
        }

        self.remember(&replicas);

        let updated = replicas
            .iter()
            .filter(|r| is_updated(r, &self.replacements))
            .count();
        let ready = replicas.iter().filter(|r| r.ready).count();
        self.metrics.set_ready_replicas(ready as u32);

        // While rolling out the surge replica counts toward demand
        let converged = updated == wanted && replicas.len() == wanted && ready == wanted;
        let planned = if converged { wanted } else { max_total.max(replicas.len()) };
        self.publish_demand(WorkloadDemand {
            requires_ready_capacity: wanted > 0 || !replicas.is_empty(),
            nodes: nodes_for(desired, pool, planned as u32),
        });

        Ok(if converged {
            WorkloadState::Available {
                revision,
                ready: ready as u32,
                replicas,
            }
        } else {
            WorkloadState::RollingOut {
                revision,
                desired: desired.replicas,
                updated: updated as u32,
                ready: ready as u32,
                replicas,
            }
        })
    }

    /// Stop every replica of the workload
    pub async fn teardown(&self, workload: &str) -> FarmResult<usize> {
        let replicas = self.list(workload).await?;
        for replica in &replicas {
            self.stop(workload, &replica.id).await?;
        }
        self.replacements.clear();
        self.known.clear();
        self.cold_started.clear();
        self.publish_demand(WorkloadDemand::default());
        Ok(replicas.len())
    }

    fn remember(&self, replicas: &[Replica]) {
        self.known.clear();
        for replica in replicas {
            self.known.insert(replica.id.clone());
        }
        self.cold_started
            .retain(|id| replicas.iter().any(|r| &r.id == id));
    }

    fn publish_demand(&self, demand: WorkloadDemand) {
        self.demand.send_if_modified(|current| {
            let changed = *current != demand;
            *current = demand;
            changed
        });
    }

    async fn list(&self, workload: &str) -> FarmResult<Vec<Replica>> {
        with_deadline(
            workload,
            "list_replicas",
            self.api_timeout,
            self.cluster.list_replicas(workload),
        )
        .await
    }

    async fn start(&self, pool: &ClusterPool, spec: &WorkloadSpec) -> FarmResult<Replica> {
        with_deadline(
            &spec.name,
            "start_replica",
            self.api_timeout,
            self.cluster.start_replica(&PoolId::from(pool), spec),
        )
        .await
    }

    async fn stop(&self, workload: &str, replica_id: &str) -> FarmResult<()> {
        with_deadline(
            replica_id,
            "stop_replica",
            self.api_timeout,
            self.cluster.stop_replica(workload, replica_id),
        )
        .await
    }
}
