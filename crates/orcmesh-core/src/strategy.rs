//! Auto Strategy: picks an assignment policy per call from live metrics,
//! and emits scale-up/scale-down recommendations.
//!
//! Pure with respect to external state: every value consulted here (idle
//! workers, metrics, history) is passed in by the caller. Nothing in this
//! module reaches back into the pool or scheduler locks.

use std::collections::VecDeque;

use crate::config::AutoscalerConfig;
use crate::pool::WorkerInfo;
use crate::types::{Task, TaskPriority, TaskType};

/// The policy selected for one `pick` call, recorded in the rolling
/// history for introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignmentPolicy {
    Pipeline,
    Consensus,
    Parallel,
    Hierarchical,
    Adaptive,
}

/// One entry in the Strategy's rolling selection history.
#[derive(Debug, Clone)]
pub struct PolicySelection {
    pub task_id: String,
    pub policy: AssignmentPolicy,
    pub complexity: f64,
}

const HISTORY_CAP: usize = 100;

/// Snapshot of pool-wide load, computed by the caller and handed to
/// `should_scale`/`pick` so the Strategy never touches pool internals.
#[derive(Debug, Clone, Copy)]
pub struct PoolMetrics {
    pub utilization: f64,
    pub queue_depth: usize,
    pub backlog: usize,
}

/// Trend over the last `trend_window` scheduler ticks, computed from a
/// rolling buffer of per-tick success rates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trend {
    Improving,
    Stable,
    Degrading,
}

/// Tracks a rolling window of per-tick success rates and derives the
/// performance trend used by `should_scale`.
#[derive(Debug, Clone)]
pub struct TrendTracker {
    window: VecDeque<f64>,
    capacity: usize,
}

impl TrendTracker {
    pub fn new(capacity: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&mut self, success_rate: f64) {
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(success_rate);
    }

    /// `Stable` until the window has filled; afterward, compares the mean
    /// of the first half against the second half.
    pub fn trend(&self) -> Trend {
        if self.window.len() < self.capacity {
            return Trend::Stable;
        }
        let mid = self.window.len() / 2;
        let first: f64 = self.window.iter().take(mid).sum::<f64>() / mid as f64;
        let second: f64 = self.window.iter().skip(mid).sum::<f64>() / (self.window.len() - mid) as f64;
        if second - first > 0.05 {
            Trend::Improving
        } else if first - second > 0.05 {
            Trend::Degrading
        } else {
            Trend::Stable
        }
    }
}

/// A scale recommendation from `should_scale`.
#[derive(Debug, Clone, PartialEq)]
pub enum ScaleDecision {
    None,
    Up { n: u32, reason: String },
    Down { n: u32, reason: String },
}

/// Derive a task's complexity score in `[0, 1]`: a per-type base, plus
/// contributions from its resource reservation and dependency count.
pub fn task_complexity(task: &Task) -> f64 {
    let base = match task.task_type {
        TaskType::Analyze => 0.3,
        TaskType::Process => 0.2,
        TaskType::Transform => 0.4,
        TaskType::Validate => 0.3,
        TaskType::Aggregate => 0.5,
        TaskType::Custom => 0.4,
    };
    let resource_component = ((task.resources.cpu / 4.0) + (task.resources.memory / 4096.0)) / 2.0;
    let dependency_component = (task.dependencies.len() as f64 / 10.0).min(0.3);
    (base + resource_component.min(0.3) + dependency_component).clamp(0.0, 1.0)
}

fn priority_score(priority: TaskPriority) -> f64 {
    match priority {
        TaskPriority::Low => 0.25,
        TaskPriority::Medium => 0.5,
        TaskPriority::High => 0.75,
        TaskPriority::Critical => 1.0,
    }
}

/// Chooses an assignment policy per call from live metrics, and makes
/// scale-up/scale-down recommendations. Stateless aside from the rolling
/// selection history it maintains for introspection.
#[derive(Default)]
pub struct AutoStrategy {
    history: std::sync::Mutex<VecDeque<PolicySelection>>,
}

impl AutoStrategy {
    pub fn new() -> Self {
        Self::default()
    }

    /// The most recent (capped at 100) policy selections, oldest first.
    pub fn history(&self) -> Vec<PolicySelection> {
        self.history.lock().unwrap().iter().cloned().collect()
    }

    fn record(&self, selection: PolicySelection) {
        let mut history = self.history.lock().unwrap();
        if history.len() == HISTORY_CAP {
            history.pop_front();
        }
        history.push_back(selection);
    }

    /// Choose the policy for `task` from its live signal thresholds, per
    /// the Strategy selection table.
    pub fn select_policy(&self, task: &Task, pool: PoolMetrics) -> (AssignmentPolicy, f64) {
        let complexity = task_complexity(task);
        let policy = if task.dependencies.len() > 3 {
            AssignmentPolicy::Pipeline
        } else if complexity > 0.7 {
            AssignmentPolicy::Consensus
        } else if pool.utilization < 0.5 && pool.queue_depth > 10 {
            AssignmentPolicy::Parallel
        } else if priority_score(task.priority) >= 0.8 {
            AssignmentPolicy::Hierarchical
        } else {
            AssignmentPolicy::Adaptive
        };
        self.record(PolicySelection {
            task_id: task.id.clone(),
            policy,
            complexity,
        });
        (policy, complexity)
    }

    /// Filter `idle` down to workers eligible for `task` (capability set,
    /// resource fit, type compatibility), then pick one per the policy
    /// selected for this call.
    pub fn pick<'a>(&self, task: &Task, idle: &'a [WorkerInfo], pool: PoolMetrics) -> Option<&'a WorkerInfo> {
        let eligible: Vec<&WorkerInfo> = idle
            .iter()
            .filter(|w| {
                crate::worker::is_compatible(task.task_type, w.config.worker_type)
                    && task.required_capabilities.is_subset(&w.config.capabilities)
                    && task.resources.fits_within(&w.config.resource_cap)
            })
            .collect();
        if eligible.is_empty() {
            return None;
        }

        let (policy, _complexity) = self.select_policy(task, pool);
        match policy {
            AssignmentPolicy::Pipeline => eligible
                .iter()
                .find(|w| w.config.capabilities.contains(&format!("stage:{}", task.task_type)))
                .or_else(|| eligible.first())
                .copied(),
            AssignmentPolicy::Consensus => eligible
                .iter()
                .find(|w| w.config.worker_type == crate::types::WorkerType::Validation)
                .or_else(|| eligible.first())
                .copied(),
            AssignmentPolicy::Parallel => eligible
                .iter()
                .min_by(|a, b| {
                    let a_load = a.metrics.tasks_completed() + a.metrics.tasks_failed();
                    let b_load = b.metrics.tasks_completed() + b.metrics.tasks_failed();
                    a_load.cmp(&b_load)
                })
                .copied(),
            AssignmentPolicy::Hierarchical => eligible
                .iter()
                .find(|w| {
                    w.config.worker_type == crate::types::WorkerType::Coordination
                        || w.config.capabilities.contains("senior")
                })
                .or_else(|| eligible.first())
                .copied(),
            AssignmentPolicy::Adaptive => eligible
                .iter()
                .max_by(|a, b| {
                    a.metrics
                        .success_rate_for(task.task_type)
                        .partial_cmp(&b.metrics.success_rate_for(task.task_type))
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .copied(),
        }
    }

    /// Whether the pool should scale, based on utilization/backlog
    /// thresholds and the rolling performance trend.
    pub fn should_scale(&self, pool: PoolMetrics, trend: Trend, config: &AutoscalerConfig) -> ScaleDecision {
        if pool.utilization > config.scale_up_threshold || pool.backlog > 50 {
            return ScaleDecision::Up {
                n: config.up_step,
                reason: format!(
                    "utilization {:.2} or backlog {} over threshold",
                    pool.utilization, pool.backlog
                ),
            };
        }
        if pool.utilization < config.scale_down_threshold && pool.backlog < 5 && trend != Trend::Degrading {
            return ScaleDecision::Down {
                n: config.down_step,
                reason: format!("utilization {:.2} and backlog {} below threshold", pool.utilization, pool.backlog),
            };
        }
        ScaleDecision::None
    }
}
