//! Registry of workload instances to probe
//!
//! The controller registers instances as the reconciler reports them; the
//! monitor loop reads the registry on every probe cycle.

use super::{ProbeTarget, StartKind};
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct MonitoredInstance {
    pub target: ProbeTarget,
    pub start_kind: StartKind,
    /// Bumped on every restart; the monitor resets to `Starting` when it changes
    pub epoch: u64,
    pub registered_at: Instant,
}

/// Instances currently under observation, keyed by instance id
#[derive(Debug, Default)]
pub struct InstanceRegistry {
    instances: DashMap<String, MonitoredInstance>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self {
            instances: DashMap::new(),
        }
    }

    /// Start observing an instance; registering a known instance is a no-op
    pub fn register(&self, target: ProbeTarget, start_kind: StartKind) -> bool {
        if self.instances.contains_key(&target.instance_id) {
            return false;
        }
        debug!(instance = %target.instance_id, kind = ?start_kind, "Registering instance");
        self.instances.insert(
            target.instance_id.clone(),
            MonitoredInstance {
                target,
                start_kind,
                epoch: 1,
                registered_at: Instant::now(),
            },
        );
        true
    }

    /// Record that an instance restarted in place, opening a new epoch
    pub fn restarted(&self, instance_id: &str, start_kind: StartKind) -> Option<u64> {
        let mut entry = self.instances.get_mut(instance_id)?;
        entry.epoch += 1;
        entry.start_kind = start_kind;
        entry.registered_at = Instant::now();
        Some(entry.epoch)
    }

    pub fn unregister(&self, instance_id: &str) -> Option<MonitoredInstance> {
        debug!(instance = %instance_id, "Unregistering instance");
        self.instances.remove(instance_id).map(|(_, v)| v)
    }

    /// Drop every instance not in `live`
    pub fn retain_only(&self, live: &[String]) -> Vec<String> {
        let gone: Vec<String> = self
            .instances
            .iter()
            .filter(|entry| !live.contains(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();
        for id in &gone {
            self.unregister(id);
        }
        gone
    }

    pub fn get(&self, instance_id: &str) -> Option<MonitoredInstance> {
        self.instances.get(instance_id).map(|r| r.clone())
    }

    pub fn list(&self) -> Vec<MonitoredInstance> {
        self.instances.iter().map(|r| r.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}
