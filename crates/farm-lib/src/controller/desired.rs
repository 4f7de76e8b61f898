//! Operator-declared desired state

use crate::cost::{ActiveHours, BudgetDefaults, BudgetPolicy};
use crate::error::{FarmError, FarmResult};
use crate::image::ImageRef;
use crate::models::{
    ClusterPool, ProbeEndpoint, ResourceQuantities, RolloutStrategy, VolumeSpec, WorkloadSpec,
};
use serde::{Deserialize, Serialize};

const GIB: u64 = 1 << 30;

/// Upper bound on replicas an operator may request for one workload
pub const MAX_REPLICAS: u32 = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeDesired {
    #[serde(default = "default_volume_name")]
    pub name: String,
    #[serde(default = "default_volume_size_gb")]
    pub size_gb: u64,
    #[serde(default)]
    pub storage_class: Option<String>,
}

impl Default for VolumeDesired {
    fn default() -> Self {
        Self {
            name: default_volume_name(),
            size_gb: default_volume_size_gb(),
            storage_class: None,
        }
    }
}

fn default_volume_name() -> String {
    "jenkins-home".to_string()
}

fn default_volume_size_gb() -> u64 {
    10
}

fn default_workload() -> String {
    "jenkins".to_string()
}

fn default_image() -> String {
    "jenkins/jenkins:lts".to_string()
}

fn default_replicas() -> u32 {
    1
}

fn default_max_nodes() -> u32 {
    1
}

/// What the operator wants running; omitted fields take budget defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesiredState {
    #[serde(default = "default_workload")]
    pub workload: String,
    #[serde(default = "default_image")]
    pub image: String,
    #[serde(default = "default_replicas")]
    pub replicas: u32,
    #[serde(default)]
    pub requests: Option<ResourceQuantities>,
    #[serde(default)]
    pub limits: Option<ResourceQuantities>,
    #[serde(default)]
    pub min_nodes: Option<u32>,
    #[serde(default = "default_max_nodes")]
    pub max_nodes: u32,
    #[serde(default)]
    pub active_hours: ActiveHours,
    #[serde(default)]
    pub volume: VolumeDesired,
    #[serde(default)]
    pub probe: ProbeEndpoint,
    #[serde(default)]
    pub budget: BudgetPolicy,
}

impl Default for DesiredState {
    fn default() -> Self {
        Self {
            workload: default_workload(),
            image: default_image(),
            replicas: default_replicas(),
            requests: None,
            limits: None,
            min_nodes: None,
            max_nodes: default_max_nodes(),
            active_hours: ActiveHours::default(),
            volume: VolumeDesired::default(),
            probe: ProbeEndpoint::default(),
            budget: BudgetPolicy::default(),
        }
    }
}

impl DesiredState {
    /// Reject states that are malformed regardless of the pool
    pub fn validate(&self) -> FarmResult<()> {
        let invalid = |msg: String| Err(FarmError::InvalidConfig(msg));

        if self.workload.trim().is_empty() {
            return invalid("workload name must not be empty".to_string());
        }
        if let Err(e) = self.image.parse::<ImageRef>() {
            return invalid(e);
        }
        if self.replicas > MAX_REPLICAS {
            return invalid(format!(
                "replicas {} exceeds the maximum of {}",
                self.replicas, MAX_REPLICAS
            ));
        }
        if self.max_nodes == 0 {
            return invalid("max_nodes must be at least 1".to_string());
        }
        if self.min_nodes() > self.max_nodes {
            return invalid(format!(
                "min_nodes {} exceeds max_nodes {}",
                self.min_nodes(),
                self.max_nodes
            ));
        }
        if self.volume.name.trim().is_empty() || self.volume.size_gb == 0 {
            return invalid("volume needs a name and a non-zero size".to_string());
        }
        if let Some(budget) = self.budget.monthly_budget {
            if budget < 0.0 {
                return invalid("monthly budget must not be negative".to_string());
            }
        }
        self.active_hours.validate().map_err(FarmError::InvalidConfig)
    }

    pub fn min_nodes(&self) -> u32 {
        self.min_nodes.unwrap_or(BudgetDefaults::MIN_NODES)
    }

    pub fn workload_spec(&self) -> WorkloadSpec {
        WorkloadSpec {
            name: self.workload.clone(),
            image: self.image.clone(),
            replicas: self.replicas,
            resource_requests: self.requests.unwrap_or_else(BudgetDefaults::requests),
            resource_limits: self.limits.unwrap_or_else(BudgetDefaults::limits),
            rollout_strategy: RolloutStrategy::default(),
            mounted_volume: self.volume.name.clone(),
            probe: self.probe.clone(),
        }
    }

    pub fn volume_spec(&self) -> VolumeSpec {
        VolumeSpec {
            name: self.volume.name.clone(),
            requested_size_bytes: self.volume.size_gb.saturating_mul(GIB),
            storage_class: self
                .volume
                .storage_class
                .clone()
                .unwrap_or_else(|| BudgetDefaults::STORAGE_CLASS.to_string()),
        }
    }

    /// Pool record narrowed to the desired bounds
    ///
    /// The desired bounds never widen what the cluster allows.
    pub fn bound_pool(&self, pool: &ClusterPool) -> ClusterPool {
        let max_nodes = self.max_nodes.min(pool.max_nodes);
        let min_nodes = self.min_nodes().max(pool.min_nodes).min(max_nodes);
        ClusterPool {
            min_nodes,
            max_nodes,
            ..pool.clone()
        }
    }
}

/// Partial update accepted at runtime
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DesiredPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests: Option<ResourceQuantities>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<ResourceQuantities>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_nodes: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_nodes: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_hours: Option<ActiveHours>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monthly_budget: Option<f64>,
}

impl DesiredPatch {
    pub fn is_empty(&self) -> bool {
        *self == DesiredPatch::default()
    }

    pub fn apply(&self, current: &DesiredState) -> DesiredState {
        let mut next = current.clone();
        if let Some(image) = &self.image {
            next.image = image.clone();
        }
        if let Some(replicas) = self.replicas {
            next.replicas = replicas;
        }
        if let Some(requests) = self.requests {
            next.requests = Some(requests);
        }
        if let Some(limits) = self.limits {
            next.limits = Some(limits);
        }
        if let Some(min_nodes) = self.min_nodes {
            next.min_nodes = Some(min_nodes);
        }
        if let Some(max_nodes) = self.max_nodes {
            next.max_nodes = max_nodes;
        }
        if let Some(active_hours) = &self.active_hours {
            next.active_hours = active_hours.clone();
        }
        if let Some(budget) = self.monthly_budget {
            next.budget.monthly_budget = Some(budget);
        }
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_defaults_fill_omissions() {
        let desired = DesiredState::default();
        let spec = desired.workload_spec();
        assert_eq!(spec.resource_requests, ResourceQuantities::new(500, GIB));
        assert_eq!(spec.resource_limits, ResourceQuantities::new(1000, 2 * GIB));
        assert_eq!(desired.min_nodes(), 0);

        let volume = desired.volume_spec();
        assert_eq!(volume.storage_class, "standard");
        assert_eq!(volume.requested_size_bytes, 10 * GIB);
    }

    #[test]
    fn test_validation() {
        assert!(DesiredState::default().validate().is_ok());

        let bad_bounds = DesiredState {
            min_nodes: Some(3),
            max_nodes: 2,
            ..Default::default()
        };
        assert!(matches!(bad_bounds.validate(), Err(FarmError::InvalidConfig(_))));

        let bad_image = DesiredState {
            image: "jenkins lts".to_string(),
            ..Default::default()
        };
        assert!(bad_image.validate().is_err());

        let bad_hours = DesiredState {
            active_hours: ActiveHours {
                weekdays: vec![],
                start_hour: 25,
                end_hour: 3,
            },
            ..Default::default()
        };
        assert!(bad_hours.validate().is_err());
    }

    #[test]
    fn test_replicas_are_capped() {
        let at_cap = DesiredState {
            replicas: MAX_REPLICAS,
            ..Default::default()
        };
        assert!(at_cap.validate().is_ok());

        let overflowing = DesiredState {
            replicas: u32::MAX,
            ..Default::default()
        };
        let err = overflowing.validate().unwrap_err();
        assert!(err.to_string().contains("replicas"));
    }

    #[test]
    fn test_patch_overrides_only_given_fields() {
        let current = DesiredState::default();
        let patch: DesiredPatch =
            serde_json::from_str(r#"{"replicas": 0, "max_nodes": 3}"#).unwrap();
        let next = patch.apply(&current);

        assert_eq!(next.replicas, 0);
        assert_eq!(next.max_nodes, 3);
        assert_eq!(next.image, current.image);
        assert!(!patch.is_empty());
        assert!(DesiredPatch::default().is_empty());
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let desired: DesiredState = serde_json::from_str(
            r#"{"image": "gcr.io/acme/jenkins:lts", "active_hours": {"weekdays": ["Mon", "Fri"], "start_hour": 22, "end_hour": 4}}"#,
        )
        .unwrap();
        assert_eq!(desired.workload, "jenkins");
        assert_eq!(desired.replicas, 1);
        assert_eq!(desired.active_hours.start_hour, 22);
        assert_eq!(desired.volume.name, "jenkins-home");
    }
}
