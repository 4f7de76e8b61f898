//! Core data models for the build farm controller

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Machine type backing every node of a pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineProfile {
    pub machine_type: String,
    /// CPU a single node can hand out to pods
    pub allocatable_cpu_millicores: u32,
    /// Memory a single node can hand out to pods
    pub allocatable_memory_bytes: u64,
    #[serde(default)]
    pub preemptible: bool,
    /// Price of one node for one hour
    #[serde(default)]
    pub hourly_cost: f64,
}

impl MachineProfile {
    /// Whether a single replica with the given footprint fits on one node
    pub fn fits(&self, resources: &ResourceQuantities) -> bool {
        resources.cpu_millicores <= self.allocatable_cpu_millicores
            && resources.memory_bytes <= self.allocatable_memory_bytes
    }

    /// How many replicas with the given requests can share one node
    pub fn replicas_per_node(&self, requests: &ResourceQuantities) -> u32 {
        let by_cpu = if requests.cpu_millicores == 0 {
            u32::MAX
        } else {
            self.allocatable_cpu_millicores / requests.cpu_millicores
        };
        let by_memory = if requests.memory_bytes == 0 {
            u32::MAX
        } else {
            (self.allocatable_memory_bytes / requests.memory_bytes).min(u32::MAX as u64) as u32
        };
        by_cpu.min(by_memory)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskProfile {
    pub disk_type: String,
    pub size_gb: u32,
}

/// Elastic compute pool hosting the workload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterPool {
    pub name: String,
    pub zone: String,
    pub node_count: u32,
    pub min_nodes: u32,
    pub max_nodes: u32,
    pub machine_profile: MachineProfile,
    pub disk_profile: DiskProfile,
}

impl ClusterPool {
    /// Clamp a requested node count into `[min_nodes, max_nodes]`
    pub fn clamp(&self, target: u32) -> u32 {
        target.clamp(self.min_nodes, self.max_nodes.max(self.min_nodes))
    }

    /// Whether `min_nodes <= node_count <= max_nodes` holds
    pub fn within_bounds(&self) -> bool {
        self.min_nodes <= self.node_count && self.node_count <= self.max_nodes
    }

    pub fn has_capacity(&self) -> bool {
        self.node_count >= 1
    }

    /// Identity used for logging and locking
    pub fn key(&self) -> String {
        format!("{}/{}", self.zone, self.name)
    }
}

/// Binding state of a persistent volume claim
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BoundState {
    Unbound,
    Pending,
    Bound,
    Lost,
}

impl std::fmt::Display for BoundState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BoundState::Unbound => write!(f, "unbound"),
            BoundState::Pending => write!(f, "pending"),
            BoundState::Bound => write!(f, "bound"),
            BoundState::Lost => write!(f, "lost"),
        }
    }
}

/// Declared volume for the CI server's home directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSpec {
    pub name: String,
    pub requested_size_bytes: u64,
    pub storage_class: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistentVolumeClaim {
    pub name: String,
    pub requested_size_bytes: u64,
    pub storage_class: String,
    pub bound_state: BoundState,
}

impl PersistentVolumeClaim {
    pub fn from_spec(spec: &VolumeSpec, bound_state: BoundState) -> Self {
        Self {
            name: spec.name.clone(),
            requested_size_bytes: spec.requested_size_bytes,
            storage_class: spec.storage_class.clone(),
            bound_state,
        }
    }

    pub fn is_bound(&self) -> bool {
        self.bound_state == BoundState::Bound
    }
}

/// CPU and memory footprint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceQuantities {
    pub cpu_millicores: u32,
    pub memory_bytes: u64,
}

impl ResourceQuantities {
    pub fn new(cpu_millicores: u32, memory_bytes: u64) -> Self {
        Self {
            cpu_millicores,
            memory_bytes,
        }
    }

    /// True when every dimension of `self` is at most the same dimension of `other`
    pub fn fits_within(&self, other: &ResourceQuantities) -> bool {
        self.cpu_millicores <= other.cpu_millicores && self.memory_bytes <= other.memory_bytes
    }
}

/// Update strategy for replacing replicas
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolloutStrategy {
    pub max_surge: u32,
    pub max_unavailable: u32,
}

impl Default for RolloutStrategy {
    fn default() -> Self {
        Self {
            max_surge: 1,
            max_unavailable: 0,
        }
    }
}

/// Health endpoint exposed by every replica
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeEndpoint {
    pub path: String,
    pub port: u16,
}

impl Default for ProbeEndpoint {
    fn default() -> Self {
        Self {
            path: "/login".to_string(),
            port: 8080,
        }
    }
}

/// Desired shape of the CI server deployment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadSpec {
    pub name: String,
    pub image: String,
    pub replicas: u32,
    pub resource_requests: ResourceQuantities,
    pub resource_limits: ResourceQuantities,
    #[serde(default)]
    pub rollout_strategy: RolloutStrategy,
    pub mounted_volume: String,
    #[serde(default)]
    pub probe: ProbeEndpoint,
}

impl WorkloadSpec {
    /// Content digest over every field whose change requires new replicas
    pub fn revision(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.image.as_bytes());
        hasher.update(self.resource_requests.cpu_millicores.to_le_bytes());
        hasher.update(self.resource_requests.memory_bytes.to_le_bytes());
        hasher.update(self.resource_limits.cpu_millicores.to_le_bytes());
        hasher.update(self.resource_limits.memory_bytes.to_le_bytes());
        hasher.update(self.mounted_volume.as_bytes());
        hasher.update(self.probe.path.as_bytes());
        hasher.update(self.probe.port.to_le_bytes());
        let digest = hasher.finalize();
        hex::encode(&digest[..6])
    }

    /// Copy of this spec with replicas forced to zero
    pub fn parked(&self) -> Self {
        Self {
            replicas: 0,
            ..self.clone()
        }
    }
}

/// A replica of the workload as reported by the cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Replica {
    pub id: String,
    pub revision: String,
    /// Host or IP the health endpoint is reachable on
    pub address: String,
    pub ready: bool,
    pub started_at: DateTime<Utc>,
}

/// Phase of a single workload instance as observed by probing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthPhase {
    Starting,
    Ready,
    Degraded,
    Unreachable,
}

impl HealthPhase {
    /// Position in the per-epoch lifecycle
    pub fn rank(&self) -> u8 {
        match self {
            HealthPhase::Starting => 0,
            HealthPhase::Ready => 1,
            HealthPhase::Degraded => 2,
            HealthPhase::Unreachable => 3,
        }
    }
}

impl std::fmt::Display for HealthPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthPhase::Starting => write!(f, "starting"),
            HealthPhase::Ready => write!(f, "ready"),
            HealthPhase::Degraded => write!(f, "degraded"),
            HealthPhase::Unreachable => write!(f, "unreachable"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthRecord {
    pub workload_id: String,
    pub instance_id: String,
    /// Restart epoch, bumped every time the instance re-enters `Starting`
    pub epoch: u64,
    pub last_probe_time: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub phase: HealthPhase,
}

/// Append-only directive from the cost policy to the pool scaler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostDecision {
    pub timestamp: DateTime<Utc>,
    pub target_node_count: u32,
    pub reason: String,
}

/// Capacity the workload needs right now, as last reported by the reconciler
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadDemand {
    pub requires_ready_capacity: bool,
    pub nodes: u32,
}
