//! Node pool scaling
//!
//! The scaler is the only writer of a pool's node count. It converges a pool
//! toward a target with a single resize, tracks that operation until the
//! cluster reports it done, and never lets two resizes overlap on one pool.
//! The target never drops below the capacity the workload last reported it
//! needs, so a pool is only parked once the workload has drained.

use crate::cluster::{ClusterApi, ClusterApiError, OperationId, OperationStatus, PoolId};
use crate::error::{FarmError, FarmResult};
use crate::models::{ClusterPool, WorkloadDemand};
use crate::observability::{FarmMetrics, StructuredLogger};
use crate::retry::{with_deadline, BackoffPolicy};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct ScalerConfig {
    /// Wall-clock bound on a single resize operation
    pub operation_timeout: Duration,
    /// Bound on each individual cluster call
    pub api_timeout: Duration,
    /// Retries when the cluster reports another operation in progress
    pub conflict_backoff: BackoffPolicy,
}

impl Default for ScalerConfig {
    fn default() -> Self {
        Self {
            operation_timeout: Duration::from_secs(600),
            api_timeout: Duration::from_secs(30),
            conflict_backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalePhase {
    /// Nodes available and no operation in flight
    Steady,
    Scaling,
    /// Zero nodes and no operation in flight
    Parked,
}

/// Pool view published to subscribers after every scaler call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolState {
    pub pool: PoolId,
    pub node_count: u32,
    pub min_nodes: u32,
    pub max_nodes: u32,
    pub phase: ScalePhase,
    pub in_flight_target: Option<u32>,
    pub queued_target: Option<u32>,
    pub observed_at: DateTime<Utc>,
}

impl PoolState {
    /// Whether replicas can be scheduled right now
    pub fn has_capacity(&self) -> bool {
        self.node_count >= 1
    }
}

#[derive(Debug, Clone)]
struct InFlight {
    operation: OperationId,
    target: u32,
    issued_at: Instant,
}

#[derive(Debug, Default)]
struct PoolTracking {
    in_flight: Option<InFlight>,
    queued: Option<u32>,
}

pub struct PoolScaler {
    cluster: Arc<dyn ClusterApi>,
    config: ScalerConfig,
    pools: DashMap<PoolId, Arc<Mutex<PoolTracking>>>,
    demand: DashMap<PoolId, watch::Receiver<WorkloadDemand>>,
    states: DashMap<PoolId, watch::Sender<Option<PoolState>>>,
    metrics: FarmMetrics,
    logger: StructuredLogger,
}

impl PoolScaler {
    pub fn new(cluster: Arc<dyn ClusterApi>, config: ScalerConfig, logger: StructuredLogger) -> Self {
        Self {
            cluster,
            config,
            pools: DashMap::new(),
            demand: DashMap::new(),
            states: DashMap::new(),
            metrics: FarmMetrics::new(),
            logger,
        }
    }

    /// Attach the workload demand feed for a pool
    pub fn track_demand(&self, pool: &PoolId, demand: watch::Receiver<WorkloadDemand>) {
        self.demand.insert(pool.clone(), demand);
    }

    /// Receive every `PoolState` published for `pool`
    pub fn subscribe(&self, pool: &PoolId) -> watch::Receiver<Option<PoolState>> {
        self.states
            .entry(pool.clone())
            .or_insert_with(|| watch::channel(None).0)
            .subscribe()
    }

    /// Last published state of a pool
    pub fn state(&self, pool: &PoolId) -> Option<PoolState> {
        self.states.get(pool).and_then(|tx| tx.borrow().clone())
    }

    /// Demand floor the scaler currently honours for a pool
    pub fn demand(&self, pool: &PoolId) -> WorkloadDemand {
        self.demand
            .get(pool)
            .map(|rx| *rx.borrow())
            .unwrap_or_default()
    }

    /// Target after clamping to bounds and honouring reported demand
    pub fn effective_target(&self, pool: &ClusterPool, requested: u32) -> u32 {
        let demand = self.demand(&PoolId::from(pool));
        let mut target = requested.max(demand.nodes);
        if demand.requires_ready_capacity {
            target = target.max(1);
        }
        pool.clamp(target)
    }

    /// Converge `pool` toward `target` nodes
    ///
    /// Returns as soon as a resize is issued or observed in flight; later
    /// calls poll it to completion. A target requested while a resize is in
    /// flight is queued and issued once the current one finishes.
    pub async fn reconcile(&self, pool: &PoolId, target: u32) -> FarmResult<PoolState> {
        let lock = self.lock_for(pool);
        let mut tracking = lock.lock().await;
        self.progress(pool, &mut tracking, Some(target)).await
    }

    /// Advance in-flight and queued work without a new target
    pub async fn poll(&self, pool: &PoolId) -> FarmResult<PoolState> {
        let lock = self.lock_for(pool);
        let mut tracking = lock.lock().await;
        self.progress(pool, &mut tracking, None).await
    }

    /// Drop a queued target; an issued resize keeps running
    pub async fn cancel_queued(&self, pool: &PoolId) -> Option<u32> {
        let lock = self.lock_for(pool);
        let mut tracking = lock.lock().await;
        let cancelled = tracking.queued.take();
        if let Some(target) = cancelled {
            debug!(pool = %pool, target, "Queued resize cancelled");
            if let Some(mut state) = self.state(pool) {
                state.queued_target = None;
                self.publish(pool, state);
            }
        }
        cancelled
    }

    fn lock_for(&self, pool: &PoolId) -> Arc<Mutex<PoolTracking>> {
        self.pools
            .entry(pool.clone())
            .or_insert_with(|| Arc::new(Mutex::new(PoolTracking::default())))
            .clone()
    }

    async fn fetch(&self, pool: &PoolId) -> FarmResult<ClusterPool> {
        with_deadline(
            &pool.to_string(),
            "get_node_pool",
            self.config.api_timeout,
            self.cluster.get_node_pool(pool),
        )
        .await
    }

    async fn progress(
        &self,
        pool: &PoolId,
        tracking: &mut PoolTracking,
        requested: Option<u32>,
    ) -> FarmResult<PoolState> {
        let mut current = self.fetch(pool).await?;

        if let Some(in_flight) = tracking.in_flight.clone() {
            let status = with_deadline(
                &pool.to_string(),
                "get_operation",
                self.config.api_timeout,
                self.cluster.get_operation(pool, &in_flight.operation),
            )
            .await?;

            match status {
                OperationStatus::Running => {
                    if in_flight.issued_at.elapsed() > self.config.operation_timeout {
                        tracking.in_flight = None;
                        return Err(FarmError::OperationTimeout {
                            entity: pool.to_string(),
                            operation: format!("resize_node_pool {}", in_flight.operation),
                            timeout: self.config.operation_timeout,
                        });
                    }
                    if let Some(target) = requested {
                        let target = self.effective_target(&current, target);
                        tracking.queued = (target != in_flight.target).then_some(target);
                    }
                    return Ok(self.observe(pool, &current, tracking));
                }
                OperationStatus::Done => {
                    tracking.in_flight = None;
                    current = self.fetch(pool).await?;
                    self.logger.log_scale_completed(current.node_count);
                }
                OperationStatus::Failed(message) => {
                    tracking.in_flight = None;
                    warn!(
                        pool = %pool,
                        operation = %in_flight.operation,
                        target = in_flight.target,
                        error = %message,
                        "Pool resize failed"
                    );
                }
            }
        }

        let requested = match requested.or_else(|| tracking.queued.take()) {
            Some(target) => target,
            None => return Ok(self.observe(pool, &current, tracking)),
        };
        tracking.queued = None;

        let target = self.effective_target(&current, requested);
        self.metrics.set_pool_target_nodes(target);
        if target == current.node_count {
            return Ok(self.observe(pool, &current, tracking));
        }

        let operation = self.issue_resize(pool, &current, target).await?;
        self.logger
            .log_scale_issued(current.node_count, target, &operation.0);
        tracking.in_flight = Some(InFlight {
            operation,
            target,
            issued_at: Instant::now(),
        });
        Ok(self.observe(pool, &current, tracking))
    }

    async fn issue_resize(
        &self,
        pool: &PoolId,
        current: &ClusterPool,
        target: u32,
    ) -> FarmResult<OperationId> {
        let backoff = self.config.conflict_backoff;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = with_deadline(
                &pool.to_string(),
                "resize_node_pool",
                self.config.api_timeout,
                self.cluster.resize_node_pool(pool, target),
            )
            .await;

            match result {
                Ok(operation) => {
                    self.metrics.inc_scale_operations();
                    return Ok(operation);
                }
                Err(FarmError::Cluster {
                    source: ClusterApiError::OperationInProgress(_),
                    ..
                }) => {
                    self.metrics.inc_scale_conflicts();
                    if !backoff.should_retry(attempt) {
                        return Err(FarmError::ScaleConflict {
                            pool: pool.to_string(),
                            attempts: attempt,
                            node_count: current.node_count,
                            target,
                        });
                    }
                    let delay = backoff.delay_after(attempt);
                    debug!(
                        pool = %pool,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Another operation in progress, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn observe(&self, pool: &PoolId, current: &ClusterPool, tracking: &PoolTracking) -> PoolState {
        let in_flight_target = tracking.in_flight.as_ref().map(|op| op.target);
        let phase = match (in_flight_target, current.node_count) {
            (Some(_), _) => ScalePhase::Scaling,
            (None, 0) => ScalePhase::Parked,
            (None, _) => ScalePhase::Steady,
        };
        let state = PoolState {
            pool: pool.clone(),
            node_count: current.node_count,
            min_nodes: current.min_nodes,
            max_nodes: current.max_nodes,
            phase,
            in_flight_target,
            queued_target: tracking.queued,
            observed_at: Utc::now(),
        };
        self.metrics.set_pool_node_count(current.node_count);
        self.publish(pool, state.clone());
        state
    }

    fn publish(&self, pool: &PoolId, state: PoolState) {
        self.states
            .entry(pool.clone())
            .or_insert_with(|| watch::channel(None).0)
            .send_replace(Some(state));
    }
}
