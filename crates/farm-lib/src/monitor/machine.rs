//! Per-instance health phase machine

use super::{ProbeOutcome, StartKind};
use crate::models::{HealthPhase, HealthRecord};
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::time::Instant;

/// A phase change observed for one instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseTransition {
    pub workload_id: String,
    pub instance_id: String,
    pub epoch: u64,
    pub from: HealthPhase,
    pub to: HealthPhase,
    pub consecutive_failures: u32,
    pub at: DateTime<Utc>,
}

/// Health of one instance within one restart epoch
#[derive(Debug, Clone)]
pub struct InstanceHealth {
    record: HealthRecord,
    start_kind: StartKind,
    started_at: Instant,
    grace: Duration,
}

impl InstanceHealth {
    pub fn new(
        workload_id: impl Into<String>,
        instance_id: impl Into<String>,
        epoch: u64,
        start_kind: StartKind,
        grace: Duration,
        started_at: Instant,
    ) -> Self {
        Self {
            record: HealthRecord {
                workload_id: workload_id.into(),
                instance_id: instance_id.into(),
                epoch,
                last_probe_time: None,
                consecutive_failures: 0,
                phase: HealthPhase::Starting,
            },
            start_kind,
            started_at,
            grace,
        }
    }

    pub fn record(&self) -> &HealthRecord {
        &self.record
    }

    pub fn phase(&self) -> HealthPhase {
        self.record.phase
    }

    pub fn epoch(&self) -> u64 {
        self.record.epoch
    }

    pub fn start_kind(&self) -> StartKind {
        self.start_kind
    }

    /// Probes are not sent until the grace period has elapsed
    pub fn in_grace(&self, now: Instant) -> bool {
        now.duration_since(self.started_at) < self.grace
    }

    /// Fold one probe result into the phase machine
    ///
    /// Phases only move forward within an epoch, except that a degraded
    /// instance answering again returns to `Ready`. A ready instance always
    /// passes through `Degraded` before it can become `Unreachable`, and
    /// `Unreachable` holds until the instance restarts with a new epoch.
    pub fn observe(
        &mut self,
        outcome: &ProbeOutcome,
        failure_threshold: u32,
        at: DateTime<Utc>,
    ) -> Option<PhaseTransition> {
        let from = self.record.phase;
        self.record.last_probe_time = Some(at);

        let to = match outcome {
            ProbeOutcome::Healthy => {
                self.record.consecutive_failures = 0;
                match from {
                    HealthPhase::Starting | HealthPhase::Degraded => HealthPhase::Ready,
                    other => other,
                }
            }
            ProbeOutcome::Failed(_) => {
                self.record.consecutive_failures += 1;
                let exhausted = self.record.consecutive_failures >= failure_threshold.max(1);
                match from {
                    HealthPhase::Starting if exhausted => HealthPhase::Unreachable,
                    HealthPhase::Starting => HealthPhase::Starting,
                    HealthPhase::Ready => HealthPhase::Degraded,
                    HealthPhase::Degraded if exhausted => HealthPhase::Unreachable,
                    HealthPhase::Degraded => HealthPhase::Degraded,
                    HealthPhase::Unreachable => HealthPhase::Unreachable,
                }
            }
        };

        if to == from {
            return None;
        }
        self.record.phase = to;
        Some(PhaseTransition {
            workload_id: self.record.workload_id.clone(),
            instance_id: self.record.instance_id.clone(),
            epoch: self.record.epoch,
            from,
            to,
            consecutive_failures: self.record.consecutive_failures,
            at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance() -> InstanceHealth {
        InstanceHealth::new(
            "jenkins",
            "jenkins-abc-1",
            1,
            StartKind::Cold,
            Duration::from_secs(300),
            Instant::now(),
        )
    }

    fn fail() -> ProbeOutcome {
        ProbeOutcome::Failed("timeout".to_string())
    }

    #[tokio::test(start_paused = true)]
    async fn test_grace_period() {
        let health = instance();
        assert!(health.in_grace(Instant::now()));
        tokio::time::advance(Duration::from_secs(301)).await;
        assert!(!health.in_grace(Instant::now()));
    }

    #[test]
    fn test_full_lifecycle() {
        let mut health = instance();
        let now = Utc::now();

        let t = health.observe(&ProbeOutcome::Healthy, 3, now).unwrap();
        assert_eq!((t.from, t.to), (HealthPhase::Starting, HealthPhase::Ready));

        let t = health.observe(&fail(), 3, now).unwrap();
        assert_eq!((t.from, t.to), (HealthPhase::Ready, HealthPhase::Degraded));

        assert!(health.observe(&fail(), 3, now).is_none());
        let t = health.observe(&fail(), 3, now).unwrap();
        assert_eq!((t.from, t.to), (HealthPhase::Degraded, HealthPhase::Unreachable));
        assert_eq!(t.consecutive_failures, 3);

        // Unreachable holds until restart
        assert!(health.observe(&ProbeOutcome::Healthy, 3, now).is_none());
        assert_eq!(health.phase(), HealthPhase::Unreachable);
    }

    #[test]
    fn test_ready_never_jumps_to_unreachable() {
        let mut health = instance();
        let now = Utc::now();
        health.observe(&ProbeOutcome::Healthy, 1, now);

        let t = health.observe(&fail(), 1, now).unwrap();
        assert_eq!(t.to, HealthPhase::Degraded);
        let t = health.observe(&fail(), 1, now).unwrap();
        assert_eq!(t.to, HealthPhase::Unreachable);
    }

    #[test]
    fn test_degraded_recovers() {
        let mut health = instance();
        let now = Utc::now();
        health.observe(&ProbeOutcome::Healthy, 3, now);
        health.observe(&fail(), 3, now);

        let t = health.observe(&ProbeOutcome::Healthy, 3, now).unwrap();
        assert_eq!((t.from, t.to), (HealthPhase::Degraded, HealthPhase::Ready));
        assert_eq!(health.record().consecutive_failures, 0);
    }

    #[test]
    fn test_startup_failure_becomes_unreachable() {
        let mut health = instance();
        let now = Utc::now();
        assert!(health.observe(&fail(), 2, now).is_none());
        let t = health.observe(&fail(), 2, now).unwrap();
        assert_eq!((t.from, t.to), (HealthPhase::Starting, HealthPhase::Unreachable));
    }

    #[test]
    fn test_phase_sequences_are_forward_only() {
        // Every outcome sequence up to length 8 keeps transitions on the allowed edges
        let allowed = [
            (HealthPhase::Starting, HealthPhase::Ready),
            (HealthPhase::Starting, HealthPhase::Unreachable),
            (HealthPhase::Ready, HealthPhase::Degraded),
            (HealthPhase::Degraded, HealthPhase::Ready),
            (HealthPhase::Degraded, HealthPhase::Unreachable),
        ];
        for threshold in 1..=3u32 {
            for bits in 0u32..256 {
                let mut health = instance();
                for i in 0..8 {
                    let outcome = if bits & (1 << i) != 0 {
                        ProbeOutcome::Healthy
                    } else {
                        fail()
                    };
                    if let Some(t) = health.observe(&outcome, threshold, Utc::now()) {
                        assert!(
                            allowed.contains(&(t.from, t.to)),
                            "unexpected transition {:?} -> {:?}",
                            t.from,
                            t.to
                        );
                    }
                }
            }
        }
    }
}
