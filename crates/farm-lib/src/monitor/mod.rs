//! Health monitoring of workload instances
//!
//! This module provides:
//! - A per-instance phase machine (Starting, Ready, Degraded, Unreachable)
//!   with distinct cold-start and warm-restart grace periods
//! - A registry of instances the controller wants probed
//! - A periodic, jittered probe loop that publishes snapshots through a
//!   single-writer watch slot and raises alerts for unreachable instances
//! - An HTTP probe against the workload's health endpoint

mod machine;
mod probe;
mod registry;
mod runner;

pub use machine::{InstanceHealth, PhaseTransition};
pub use probe::HttpProbe;
pub use registry::{InstanceRegistry, MonitoredInstance};
pub use runner::{HealthAlert, HealthMonitor, HealthSnapshot};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Where and how to probe one instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeTarget {
    pub workload_id: String,
    pub instance_id: String,
    pub address: String,
    pub port: u16,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Healthy,
    Failed(String),
}

impl ProbeOutcome {
    pub fn is_healthy(&self) -> bool {
        matches!(self, ProbeOutcome::Healthy)
    }
}

/// How an instance came up, which decides its grace period
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartKind {
    /// First start after boot or after the pool scaled up from zero
    Cold,
    /// Restart on an already warm pool
    Warm,
}

/// Trait for health probe implementations
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, target: &ProbeTarget) -> ProbeOutcome;
}

/// Probe timing and thresholds
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub interval: Duration,
    /// Maximum jitter added to every interval
    pub jitter: Duration,
    pub timeout: Duration,
    pub cold_start_grace: Duration,
    pub warm_start_grace: Duration,
    /// Consecutive failures that make an instance unreachable
    pub failure_threshold: u32,
    pub alert_buffer: usize,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            jitter: Duration::from_secs(2),
            timeout: Duration::from_secs(5),
            cold_start_grace: Duration::from_secs(300),
            warm_start_grace: Duration::from_secs(90),
            failure_threshold: 3,
            alert_buffer: 64,
        }
    }
}

impl ProbeConfig {
    pub fn grace_for(&self, kind: StartKind) -> Duration {
        match kind {
            StartKind::Cold => self.cold_start_grace,
            StartKind::Warm => self.warm_start_grace,
        }
    }
}
