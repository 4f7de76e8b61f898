//! Self-health of the controller
//!
//! Each controller component reports its last outcome here; `/healthz` and
//! `/readyz` are served from this registry.

use crate::error::FarmError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    /// Last step failed but will be retried next tick
    Degraded,
    /// Blocked until the operator intervenes
    Unhealthy,
}

impl ComponentStatus {
    pub fn is_operational(&self) -> bool {
        matches!(self, ComponentStatus::Healthy | ComponentStatus::Degraded)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_check_timestamp: i64,
}

impl ComponentHealth {
    fn with(status: ComponentStatus, message: Option<String>) -> Self {
        Self {
            status,
            message,
            last_check_timestamp: chrono::Utc::now().timestamp(),
        }
    }

    pub fn healthy() -> Self {
        Self::with(ComponentStatus::Healthy, None)
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self::with(ComponentStatus::Degraded, Some(message.into()))
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self::with(ComponentStatus::Unhealthy, Some(message.into()))
    }

    /// Retryable errors degrade a component, the rest make it unhealthy
    pub fn from_error(error: &FarmError) -> Self {
        if error.is_retryable() {
            Self::degraded(error.to_string())
        } else {
            Self::unhealthy(error.to_string())
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub components: HashMap<String, ComponentHealth>,
}

impl HealthResponse {
    /// Worst status across all components
    pub fn compute_status(components: &HashMap<String, ComponentHealth>) -> ComponentStatus {
        components
            .values()
            .map(|health| health.status)
            .max_by_key(|status| match status {
                ComponentStatus::Healthy => 0,
                ComponentStatus::Degraded => 1,
                ComponentStatus::Unhealthy => 2,
            })
            .unwrap_or(ComponentStatus::Healthy)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Component names for health tracking
pub mod components {
    pub const STORAGE: &str = "storage";
    pub const IMAGE: &str = "image";
    pub const POOL: &str = "pool";
    pub const WORKLOAD: &str = "workload";
    pub const MONITOR: &str = "monitor";
    pub const COST_POLICY: &str = "cost_policy";

    pub const ALL: [&str; 6] = [STORAGE, IMAGE, POOL, WORKLOAD, MONITOR, COST_POLICY];
}

#[derive(Debug, Clone, Default)]
pub struct HealthRegistry {
    components: Arc<RwLock<HashMap<String, ComponentHealth>>>,
    ready: Arc<RwLock<bool>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every controller component registered healthy
    pub async fn for_controller() -> Self {
        let registry = Self::new();
        for name in components::ALL {
            registry.register(name).await;
        }
        registry
    }

    pub async fn register(&self, name: &str) {
        self.update(name, ComponentHealth::healthy()).await;
    }

    pub async fn update(&self, name: &str, health: ComponentHealth) {
        self.components.write().await.insert(name.to_string(), health);
    }

    pub async fn set_healthy(&self, name: &str) {
        self.update(name, ComponentHealth::healthy()).await;
    }

    pub async fn set_degraded(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::degraded(message)).await;
    }

    pub async fn set_unhealthy(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::unhealthy(message)).await;
    }

    /// Record the outcome of a component's step in a reconcile cycle
    pub async fn report<T>(&self, name: &str, outcome: &Result<T, FarmError>) {
        let health = match outcome {
            Ok(_) => ComponentHealth::healthy(),
            Err(e) => ComponentHealth::from_error(e),
        };
        self.update(name, health).await;
    }

    pub async fn component(&self, name: &str) -> Option<ComponentHealth> {
        self.components.read().await.get(name).cloned()
    }

    pub async fn set_ready(&self, ready: bool) {
        *self.ready.write().await = ready;
    }

    pub async fn health(&self) -> HealthResponse {
        let components = self.components.read().await.clone();
        let status = HealthResponse::compute_status(&components);
        HealthResponse { status, components }
    }

    /// Ready once the first reconcile cycle ran and nothing is blocked
    pub async fn readiness(&self) -> ReadinessResponse {
        let ready = *self.ready.read().await;
        let health = self.health().await;

        let reason = if !ready {
            Some("Controller has not completed a reconcile cycle".to_string())
        } else if health.status == ComponentStatus::Unhealthy {
            let blocked: Vec<&str> = health
                .components
                .iter()
                .filter(|(_, h)| h.status == ComponentStatus::Unhealthy)
                .map(|(name, _)| name.as_str())
                .collect();
            Some(format!("Blocked components: {}", blocked.join(", ")))
        } else {
            None
        };

        ReadinessResponse {
            ready: reason.is_none(),
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BoundState;
    use std::time::Duration;

    #[tokio::test]
    async fn test_controller_registry_starts_healthy() {
        let registry = HealthRegistry::for_controller().await;
        let health = registry.health().await;

        assert_eq!(health.status, ComponentStatus::Healthy);
        assert_eq!(health.components.len(), 6);
        assert!(health.components.contains_key(components::COST_POLICY));
    }

    #[tokio::test]
    async fn test_retryable_error_degrades() {
        let registry = HealthRegistry::for_controller().await;
        let outcome: Result<(), FarmError> = Err(FarmError::StorageTimeout {
            claim: "jenkins-home".to_string(),
            last_state: BoundState::Pending,
            waited: Duration::from_secs(300),
        });
        registry.report(components::STORAGE, &outcome).await;

        let health = registry.health().await;
        assert_eq!(health.status, ComponentStatus::Degraded);
        let storage = registry.component(components::STORAGE).await.unwrap();
        assert!(storage.message.unwrap().contains("jenkins-home"));

        registry.report(components::STORAGE, &Ok::<_, FarmError>(())).await;
        assert_eq!(registry.health().await.status, ComponentStatus::Healthy);
    }

    #[tokio::test]
    async fn test_unschedulable_blocks_readiness() {
        let registry = HealthRegistry::for_controller().await;
        registry.set_ready(true).await;
        assert!(registry.readiness().await.ready);

        let outcome: Result<(), FarmError> = Err(FarmError::UnschedulableSpec {
            workload: "jenkins".to_string(),
            pool: "us-central1-a/ci-pool".to_string(),
            revision: "abc123".to_string(),
            reason: "limits exceed node".to_string(),
        });
        registry.report(components::WORKLOAD, &outcome).await;

        let readiness = registry.readiness().await;
        assert!(!readiness.ready);
        assert_eq!(readiness.reason.as_deref(), Some("Blocked components: workload"));
    }

    #[tokio::test]
    async fn test_not_ready_before_first_cycle() {
        let registry = HealthRegistry::new();
        let readiness = registry.readiness().await;
        assert!(!readiness.ready);
        assert!(readiness.reason.is_some());
    }
}
