//! Durable volume provisioning
//!
//! Makes sure the CI server's claim exists and is bound before anything is
//! scheduled. Provisioning requests are issued once per state transition,
//! never on repeated polling, and a claim stuck pending past the bind
//! timeout is declared lost with a typed error.

use crate::cluster::ClusterApi;
use crate::error::{FarmError, FarmResult};
use crate::models::{BoundState, PersistentVolumeClaim, VolumeSpec};
use crate::observability::StructuredLogger;
use crate::retry::with_deadline;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// How long a claim may stay pending before it is declared lost
    pub bind_timeout: Duration,
    /// Hard bound on every cluster call
    pub api_timeout: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            bind_timeout: Duration::from_secs(300),
            api_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
struct ClaimTracking {
    spec: VolumeSpec,
    state: BoundState,
    pending_since: Option<Instant>,
}

pub struct StorageProvisioner {
    cluster: Arc<dyn ClusterApi>,
    config: StorageConfig,
    claims: DashMap<String, ClaimTracking>,
    logger: StructuredLogger,
}

impl StorageProvisioner {
    pub fn new(cluster: Arc<dyn ClusterApi>, config: StorageConfig, logger: StructuredLogger) -> Self {
        Self {
            cluster,
            config,
            claims: DashMap::new(),
            logger,
        }
    }

    /// Last state this provisioner observed for a claim
    pub fn cached_state(&self, name: &str) -> Option<BoundState> {
        self.claims.get(name).map(|t| t.state)
    }

    /// Claim record as last observed, for status reporting
    pub fn claim(&self, spec: &VolumeSpec) -> PersistentVolumeClaim {
        let state = self.cached_state(&spec.name).unwrap_or(BoundState::Unbound);
        let spec = self
            .claims
            .get(&spec.name)
            .map(|t| t.spec.clone())
            .unwrap_or_else(|| spec.clone());
        PersistentVolumeClaim::from_spec(&spec, state)
    }

    /// Drive the claim toward `Bound`
    pub async fn ensure_volume(&self, spec: &VolumeSpec) -> FarmResult<BoundState> {
        let previous = self.claims.get(&spec.name).map(|t| t.clone());

        if let Some(tracked) = &previous {
            if tracked.state == BoundState::Bound && tracked.spec == *spec {
                return Ok(BoundState::Bound);
            }
        }

        let observed = with_deadline(
            &spec.name,
            "get_claim",
            self.config.api_timeout,
            self.cluster.get_claim(&spec.name),
        )
        .await?;

        let previous_state = previous.as_ref().map(|t| t.state).unwrap_or(BoundState::Unbound);
        let mut pending_since = previous.as_ref().and_then(|t| t.pending_since);
        let now = Instant::now();

        let state = match observed {
            Some(claim) => {
                if claim.requested_size_bytes != spec.requested_size_bytes {
                    warn!(
                        claim = %spec.name,
                        existing_bytes = claim.requested_size_bytes,
                        declared_bytes = spec.requested_size_bytes,
                        "Claim size differs from declared size; use an explicit resize"
                    );
                }
                match claim.bound_state {
                    BoundState::Bound => {
                        pending_since = None;
                        BoundState::Bound
                    }
                    BoundState::Lost => {
                        pending_since = None;
                        BoundState::Lost
                    }
                    BoundState::Pending | BoundState::Unbound => {
                        if previous_state == BoundState::Lost {
                            // Retrying after a timeout is a new transition
                            self.request_claim(spec).await?;
                            pending_since = Some(now);
                        } else if pending_since.is_none() {
                            pending_since = Some(now);
                        }
                        BoundState::Pending
                    }
                }
            }
            None => {
                if previous_state != BoundState::Pending {
                    self.request_claim(spec).await?;
                    pending_since = Some(now);
                }
                BoundState::Pending
            }
        };

        if state == BoundState::Pending {
            let waited = pending_since.map(|since| now.duration_since(since)).unwrap_or_default();
            if waited > self.config.bind_timeout {
                self.record(spec, BoundState::Lost, None, previous_state);
                return Err(FarmError::StorageTimeout {
                    claim: spec.name.clone(),
                    last_state: BoundState::Pending,
                    waited,
                });
            }
        }

        self.record(spec, state, pending_since, previous_state);
        Ok(state)
    }

    /// Grow an existing claim; shrinking is rejected
    pub async fn resize_volume(&self, name: &str, size_bytes: u64) -> FarmResult<()> {
        let current = with_deadline(
            name,
            "get_claim",
            self.config.api_timeout,
            self.cluster.get_claim(name),
        )
        .await?
        .ok_or_else(|| FarmError::InvalidConfig(format!("claim {} does not exist", name)))?;

        if size_bytes < current.requested_size_bytes {
            return Err(FarmError::InvalidConfig(format!(
                "claim {} can only grow ({} -> {} bytes)",
                name, current.requested_size_bytes, size_bytes
            )));
        }

        with_deadline(
            name,
            "resize_claim",
            self.config.api_timeout,
            self.cluster.resize_claim(name, size_bytes),
        )
        .await?;

        if let Some(mut tracked) = self.claims.get_mut(name) {
            tracked.spec.requested_size_bytes = size_bytes;
        }
        debug!(claim = %name, size_bytes, "Claim resized");
        Ok(())
    }

    /// Explicit teardown; the only path that destroys a claim
    pub async fn delete_volume(&self, name: &str) -> FarmResult<()> {
        with_deadline(
            name,
            "delete_claim",
            self.config.api_timeout,
            self.cluster.delete_claim(name),
        )
        .await?;
        self.claims.remove(name);
        warn!(claim = %name, "Volume claim deleted");
        Ok(())
    }

    async fn request_claim(&self, spec: &VolumeSpec) -> FarmResult<()> {
        debug!(claim = %spec.name, storage_class = %spec.storage_class, "Requesting volume claim");
        with_deadline(
            &spec.name,
            "create_claim",
            self.config.api_timeout,
            self.cluster.create_claim(spec),
        )
        .await
    }

    fn record(
        &self,
        spec: &VolumeSpec,
        state: BoundState,
        pending_since: Option<Instant>,
        previous: BoundState,
    ) {
        if state != previous {
            self.logger
                .log_volume_state(&spec.name, &previous.to_string(), &state.to_string());
        }
        self.claims.insert(
            spec.name.clone(),
            ClaimTracking {
                spec: spec.clone(),
                state,
                pending_since,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{SimulatedCluster, SimulationConfig};

    fn spec() -> VolumeSpec {
        VolumeSpec {
            name: "jenkins-home".to_string(),
            requested_size_bytes: 10 << 30,
            storage_class: "standard".to_string(),
        }
    }

    fn provisioner(cluster: Arc<SimulatedCluster>) -> StorageProvisioner {
        StorageProvisioner::new(
            cluster,
            StorageConfig {
                bind_timeout: Duration::from_secs(60),
                api_timeout: Duration::from_secs(5),
            },
            StructuredLogger::new("test"),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_claim_requested_once_until_bound() {
        let cluster = Arc::new(SimulatedCluster::new(SimulationConfig {
            claim_bind_delay: Duration::from_secs(10),
            ..Default::default()
        }));
        let storage = provisioner(cluster.clone());

        assert_eq!(storage.ensure_volume(&spec()).await.unwrap(), BoundState::Pending);
        assert_eq!(storage.ensure_volume(&spec()).await.unwrap(), BoundState::Pending);
        assert_eq!(cluster.counters().create_claim, 1);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(storage.ensure_volume(&spec()).await.unwrap(), BoundState::Bound);
        assert_eq!(storage.ensure_volume(&spec()).await.unwrap(), BoundState::Bound);
        assert_eq!(cluster.counters().create_claim, 1);
        assert!(storage.claim(&spec()).is_bound());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_claim_times_out_as_lost() {
        let cluster = Arc::new(SimulatedCluster::new(SimulationConfig {
            bind_claims: false,
            ..Default::default()
        }));
        let storage = provisioner(cluster.clone());

        storage.ensure_volume(&spec()).await.unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;

        let err = storage.ensure_volume(&spec()).await.unwrap_err();
        match err {
            FarmError::StorageTimeout { claim, last_state, .. } => {
                assert_eq!(claim, "jenkins-home");
                assert_eq!(last_state, BoundState::Pending);
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(storage.cached_state("jenkins-home"), Some(BoundState::Lost));

        // Next tick retries with exactly one new request
        assert_eq!(storage.ensure_volume(&spec()).await.unwrap(), BoundState::Pending);
        assert_eq!(cluster.counters().create_claim, 2);
        storage.ensure_volume(&spec()).await.unwrap();
        assert_eq!(cluster.counters().create_claim, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resize_is_grow_only() {
        let cluster = Arc::new(SimulatedCluster::new(SimulationConfig::default()));
        let storage = provisioner(cluster.clone());
        storage.ensure_volume(&spec()).await.unwrap();

        assert!(storage.resize_volume("jenkins-home", 1 << 30).await.is_err());
        storage.resize_volume("jenkins-home", 20 << 30).await.unwrap();
        let claim = cluster.get_claim("jenkins-home").await.unwrap().unwrap();
        assert_eq!(claim.requested_size_bytes, 20 << 30);
    }

    #[tokio::test]
    async fn test_delete_volume_forgets_claim() {
        let cluster = Arc::new(SimulatedCluster::new(SimulationConfig::default()));
        let storage = provisioner(cluster.clone());
        storage.ensure_volume(&spec()).await.unwrap();

        storage.delete_volume("jenkins-home").await.unwrap();
        assert_eq!(storage.cached_state("jenkins-home"), None);
        assert!(cluster.get_claim("jenkins-home").await.unwrap().is_none());
    }
}
