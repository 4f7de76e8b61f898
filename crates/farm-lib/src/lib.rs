//! Core library of the build farm controller
//!
//! This crate provides the components that keep a CI server running on an
//! elastic node pool while its cost is kept in check:
//! - Durable volume provisioning
//! - Image publication with read-after-write verification
//! - Node pool scaling with a single in-flight resize per pool
//! - Workload rollouts gated on storage and capacity
//! - Health monitoring of running instances
//! - Cost policy driven by active hours, activity and budget

pub mod cluster;
pub mod controller;
pub mod cost;
pub mod decision_log;
pub mod error;
pub mod health;
pub mod image;
pub mod models;
pub mod monitor;
pub mod observability;
pub mod pool;
pub mod retry;
pub mod storage;
pub mod workload;

pub use controller::{
    ControllerOptions, ControllerParts, ControllerPhase, ControllerStatus, DesiredPatch,
    DesiredState, FarmController,
};
pub use error::{FarmError, FarmResult, PublishError, PublishErrorKind};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{FarmMetrics, StructuredLogger};
