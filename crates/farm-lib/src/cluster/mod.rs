//! Seam to the managed cluster
//!
//! The controller consumes the cluster through [`ClusterApi`]. Calls are
//! idempotent by intent and the cluster is treated as eventually consistent
//! and rate limited. [`SimulatedCluster`] is an in-process implementation
//! used for dry runs and tests.

mod simulated;

pub use simulated::{SimulatedCluster, SimulationConfig};

use crate::models::{ClusterPool, PersistentVolumeClaim, Replica, VolumeSpec, WorkloadSpec};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Explicit identity of a node pool; no ambient project/zone context
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PoolId {
    pub zone: String,
    pub name: String,
}

impl PoolId {
    pub fn new(zone: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            zone: zone.into(),
            name: name.into(),
        }
    }
}

impl From<&ClusterPool> for PoolId {
    fn from(pool: &ClusterPool) -> Self {
        Self::new(&pool.zone, &pool.name)
    }
}

impl std::fmt::Display for PoolId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.zone, self.name)
    }
}

/// Handle of a long-running cluster operation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationId(pub String);

impl std::fmt::Display for OperationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationStatus {
    Running,
    Done,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClusterApiError {
    /// Another operation on the same resource has not finished yet
    #[error("incompatible operation already in progress on {0}")]
    OperationInProgress(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("request rejected: {0}")]
    Rejected(String),
    #[error("cluster API unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn get_node_pool(&self, pool: &PoolId) -> Result<ClusterPool, ClusterApiError>;

    /// Start resizing a pool; completion is observed through `get_operation`
    async fn resize_node_pool(
        &self,
        pool: &PoolId,
        node_count: u32,
    ) -> Result<OperationId, ClusterApiError>;

    async fn get_operation(
        &self,
        pool: &PoolId,
        operation: &OperationId,
    ) -> Result<OperationStatus, ClusterApiError>;

    async fn get_claim(&self, name: &str) -> Result<Option<PersistentVolumeClaim>, ClusterApiError>;

    /// Request a claim; succeeds if an identical claim already exists
    async fn create_claim(&self, spec: &VolumeSpec) -> Result<(), ClusterApiError>;

    async fn resize_claim(&self, name: &str, size_bytes: u64) -> Result<(), ClusterApiError>;

    async fn delete_claim(&self, name: &str) -> Result<(), ClusterApiError>;

    async fn list_replicas(&self, workload: &str) -> Result<Vec<Replica>, ClusterApiError>;

    /// Schedule one replica of `spec` onto `pool`
    async fn start_replica(
        &self,
        pool: &PoolId,
        spec: &WorkloadSpec,
    ) -> Result<Replica, ClusterApiError>;

    async fn stop_replica(&self, workload: &str, replica_id: &str) -> Result<(), ClusterApiError>;
}
