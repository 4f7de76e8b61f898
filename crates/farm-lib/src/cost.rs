//! Cost policy
//!
//! Turns demand signals into a target node count for the pool. The pool is
//! parked at its floor once no demand has been seen for the idle window, the
//! ceiling is capped by the monthly budget, and the target may reverse
//! direction at most once per cooldown window.

use crate::models::{ClusterPool, CostDecision, HealthPhase, ResourceQuantities};
use chrono::{DateTime, Datelike, Duration as ChronoDuration, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Hours a month is billed for
pub const HOURS_PER_MONTH: f64 = 730.0;

/// Weekly window in UTC during which the farm is expected to be busy
///
/// `start_hour == end_hour` covers the whole day. A range with
/// `start_hour > end_hour` wraps midnight; the early-morning hours belong to
/// the previous weekday's window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveHours {
    pub weekdays: Vec<Weekday>,
    pub start_hour: u32,
    pub end_hour: u32,
}

impl Default for ActiveHours {
    fn default() -> Self {
        Self {
            weekdays: vec![
                Weekday::Mon,
                Weekday::Tue,
                Weekday::Wed,
                Weekday::Thu,
                Weekday::Fri,
            ],
            start_hour: 8,
            end_hour: 18,
        }
    }
}

impl ActiveHours {
    /// Never active; only activity signals create demand
    pub fn never() -> Self {
        Self {
            weekdays: Vec::new(),
            start_hour: 0,
            end_hour: 0,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.start_hour > 23 || self.end_hour > 23 {
            return Err(format!(
                "active hours {}..{} must be within 0..=23",
                self.start_hour, self.end_hour
            ));
        }
        Ok(())
    }

    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        let hour = now.hour();
        let today = now.weekday();
        let listed = |day: Weekday| self.weekdays.contains(&day);

        if self.start_hour == self.end_hour {
            listed(today)
        } else if self.start_hour < self.end_hour {
            listed(today) && hour >= self.start_hour && hour < self.end_hour
        } else {
            (listed(today) && hour >= self.start_hour)
                || (listed(today.pred()) && hour < self.end_hour)
        }
    }
}

/// Monthly spending cap for the pool
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BudgetPolicy {
    pub monthly_budget: Option<f64>,
    /// Overrides the machine profile's hourly cost
    #[serde(default)]
    pub hourly_node_cost: Option<f64>,
}

impl BudgetPolicy {
    /// Largest node count the budget affords, never below `min_nodes`
    pub fn ceiling(&self, pool: &ClusterPool) -> u32 {
        let Some(budget) = self.monthly_budget else {
            return pool.max_nodes;
        };
        let cost = self
            .hourly_node_cost
            .unwrap_or(pool.machine_profile.hourly_cost);
        if cost <= 0.0 {
            return pool.max_nodes;
        }
        let affordable = (budget / (cost * HOURS_PER_MONTH)).floor().max(0.0);
        let affordable = affordable.min(u32::MAX as f64) as u32;
        affordable.min(pool.max_nodes).max(pool.min_nodes)
    }

    /// Projected monthly spend for `nodes` nodes
    pub fn monthly_cost(&self, pool: &ClusterPool, nodes: u32) -> f64 {
        let cost = self
            .hourly_node_cost
            .unwrap_or(pool.machine_profile.hourly_cost);
        cost * HOURS_PER_MONTH * nodes as f64
    }
}

/// Conservative values used when the operator leaves them out
pub struct BudgetDefaults;

impl BudgetDefaults {
    pub const MIN_NODES: u32 = 0;
    pub const STORAGE_CLASS: &'static str = "standard";

    pub fn requests() -> ResourceQuantities {
        ResourceQuantities::new(500, 1 << 30)
    }

    pub fn limits() -> ResourceQuantities {
        ResourceQuantities::new(1000, 2 << 30)
    }
}

#[derive(Debug, Clone)]
pub struct CostPolicyConfig {
    /// How long without demand before the pool drops to its floor
    pub idle_window: Duration,
    /// Minimum spacing between reversals of the scaling direction
    pub cooldown: Duration,
    pub budget: BudgetPolicy,
}

impl Default for CostPolicyConfig {
    fn default() -> Self {
        Self {
            idle_window: Duration::from_secs(30 * 60),
            cooldown: Duration::from_secs(10 * 60),
            budget: BudgetPolicy::default(),
        }
    }
}

/// Inputs the policy looks at each tick
#[derive(Debug, Clone, Default)]
pub struct DemandSignal {
    /// Aggregate phase reported by the health monitor
    pub health: Option<HealthPhase>,
    /// Most recent external activity (queued build, operator wake-up)
    pub last_activity: Option<DateTime<Utc>>,
    /// Nodes the workload needs when it runs
    pub workload_nodes: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionReason {
    ActiveHours,
    RecentActivity,
    WorkloadStarting,
    IdleGrace,
    IdleWindowElapsed,
    Cooldown,
}

impl std::fmt::Display for DecisionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecisionReason::ActiveHours => write!(f, "within active hours"),
            DecisionReason::RecentActivity => write!(f, "recent activity signal"),
            DecisionReason::WorkloadStarting => write!(f, "workload still starting"),
            DecisionReason::IdleGrace => write!(f, "idle, within idle window"),
            DecisionReason::IdleWindowElapsed => write!(f, "idle beyond idle window"),
            DecisionReason::Cooldown => write!(f, "direction change held by cooldown"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Up,
    Down,
}

#[derive(Debug, Clone, Copy)]
struct Change {
    direction: Direction,
    at: DateTime<Utc>,
}

pub struct CostPolicyEngine {
    config: CostPolicyConfig,
    last_demand_at: Option<DateTime<Utc>>,
    last_target: Option<u32>,
    last_change: Option<Change>,
    last_decision: Option<CostDecision>,
}

impl CostPolicyEngine {
    pub fn new(config: CostPolicyConfig) -> Self {
        Self {
            config,
            last_demand_at: None,
            last_target: None,
            last_change: None,
            last_decision: None,
        }
    }

    pub fn config(&self) -> &CostPolicyConfig {
        &self.config
    }

    /// Replace the budget, e.g. after the operator patched the desired state
    pub fn set_budget(&mut self, budget: BudgetPolicy) {
        self.config.budget = budget;
    }

    pub fn last_decision(&self) -> Option<&CostDecision> {
        self.last_decision.as_ref()
    }

    /// Seed the engine from a persisted decision, e.g. after a restart
    pub fn restore(&mut self, decision: CostDecision) {
        self.last_target = Some(decision.target_node_count);
        self.last_decision = Some(decision);
    }

    /// Compute the pool target for this tick
    ///
    /// Active hours and a starting workload are demand at `now`; an activity
    /// signal is demand at the time it was raised.
    pub fn decide(
        &mut self,
        signal: &DemandSignal,
        schedule: &ActiveHours,
        pool: &ClusterPool,
        now: DateTime<Utc>,
    ) -> CostDecision {
        let ceiling = self.config.budget.ceiling(pool);
        let active_target = signal.workload_nodes.max(1).max(pool.min_nodes).min(ceiling);
        let idle_window = ChronoDuration::from_std(self.config.idle_window)
            .unwrap_or(ChronoDuration::MAX);

        let current = if schedule.is_active(now) {
            Some(DecisionReason::ActiveHours)
        } else if signal.health == Some(HealthPhase::Starting) {
            Some(DecisionReason::WorkloadStarting)
        } else {
            None
        };

        let (proposed, reason) = match current {
            Some(reason) => {
                self.last_demand_at = Some(now);
                (active_target, reason)
            }
            None => {
                let activity = signal.last_activity.filter(|at| *at <= now);
                if let Some(at) = activity {
                    if self.last_demand_at.map_or(true, |last| at > last) {
                        self.last_demand_at = Some(at);
                    }
                }
                let idle_since = *self.last_demand_at.get_or_insert(now);
                if now - idle_since >= idle_window {
                    (pool.min_nodes, DecisionReason::IdleWindowElapsed)
                } else if activity == Some(idle_since) {
                    (active_target, DecisionReason::RecentActivity)
                } else {
                    let held = self.last_target.unwrap_or(pool.node_count);
                    (held.min(ceiling).max(pool.min_nodes), DecisionReason::IdleGrace)
                }
            }
        };

        let (target, reason) = self.rate_limit(proposed, reason, now);
        let decision = CostDecision {
            timestamp: now,
            target_node_count: target,
            reason: reason.to_string(),
        };
        self.last_target = Some(target);
        self.last_decision = Some(decision.clone());
        decision
    }

    fn rate_limit(
        &mut self,
        proposed: u32,
        reason: DecisionReason,
        now: DateTime<Utc>,
    ) -> (u32, DecisionReason) {
        let Some(previous) = self.last_target else {
            return (proposed, reason);
        };
        let direction = match proposed.cmp(&previous) {
            std::cmp::Ordering::Greater => Direction::Up,
            std::cmp::Ordering::Less => Direction::Down,
            std::cmp::Ordering::Equal => return (proposed, reason),
        };

        if let Some(last) = self.last_change {
            let cooldown =
                ChronoDuration::from_std(self.config.cooldown).unwrap_or(ChronoDuration::MAX);
            if last.direction != direction && now - last.at < cooldown {
                return (previous, DecisionReason::Cooldown);
            }
        }
        self.last_change = Some(Change { direction, at: now });
        (proposed, reason)
    }
}
