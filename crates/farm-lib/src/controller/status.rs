//! Read-only status of the controller

use crate::models::{BoundState, CostDecision, HealthPhase, HealthRecord, Replica};
use crate::pool::ScalePhase;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerPhase {
    /// No cycle has completed yet
    Starting,
    /// Preconditions for scheduling are not met yet
    Waiting,
    RollingOut,
    Available,
    /// Pool at zero nodes by cost policy
    Parked,
    /// Needs operator action
    Blocked,
}

impl std::fmt::Display for ControllerPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ControllerPhase::Starting => "starting",
            ControllerPhase::Waiting => "waiting",
            ControllerPhase::RollingOut => "rolling_out",
            ControllerPhase::Available => "available",
            ControllerPhase::Parked => "parked",
            ControllerPhase::Blocked => "blocked",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerStatus {
    pub pool: String,
    pub workload: String,
    pub phase: ControllerPhase,
    pub node_count: u32,
    pub pool_phase: Option<ScalePhase>,
    pub in_flight_target: Option<u32>,
    pub last_decision: Option<CostDecision>,
    pub health_phase: Option<HealthPhase>,
    pub instances: Vec<HealthRecord>,
    pub volume_state: BoundState,
    pub image_digest: Option<String>,
    pub revision: String,
    pub workload_state: String,
    pub replicas: Vec<Replica>,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ControllerStatus {
    pub fn initial(pool: impl Into<String>, workload: impl Into<String>) -> Self {
        Self {
            pool: pool.into(),
            workload: workload.into(),
            phase: ControllerPhase::Starting,
            node_count: 0,
            pool_phase: None,
            in_flight_target: None,
            last_decision: None,
            health_phase: None,
            instances: Vec::new(),
            volume_state: BoundState::Unbound,
            image_digest: None,
            revision: String::new(),
            workload_state: "waiting".to_string(),
            replicas: Vec::new(),
            last_error: None,
            updated_at: Utc::now(),
        }
    }

    pub fn ready_replicas(&self) -> usize {
        self.replicas.iter().filter(|r| r.ready).count()
    }
}
