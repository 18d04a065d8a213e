//! The `Worker` trait -- the polymorphic execution contract -- plus the
//! runtime state and static compatibility matrix built around it.
//!
//! Workers are modeled as a sum type over agent kinds sharing one
//! capability contract, realized as an object-safe `async_trait` so the
//! pool can hold `Arc<dyn Worker>` regardless of concrete kind -- shared,
//! not owned, so a handle can be cloned out from under a lock before the
//! execute call is awaited.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::types::{ResourceEnvelope, Task, TaskType, WorkerId, WorkerState, WorkerType};

/// Outcome of a single `Worker::execute` call.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl ExecutionOutcome {
    pub fn success(output: serde_json::Value) -> Self {
        Self {
            output: Some(output),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            output: None,
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// The shared capability contract every worker kind implements.
///
/// # Object Safety
///
/// All methods take `&self` and return owned/boxed types, so `dyn Worker`
/// can be stored as `Arc<dyn Worker>` by the pool.
#[async_trait]
pub trait Worker: Send + Sync {
    /// This worker's kind.
    fn worker_type(&self) -> WorkerType;

    /// Capability tags this worker advertises.
    fn capabilities(&self) -> &HashSet<String>;

    /// Execute `task`, observing `cancel` at natural yield points.
    async fn execute(&self, task: &Task, cancel: CancellationToken) -> ExecutionOutcome;

    /// Liveness probe used by the pool's health loop.
    async fn health(&self) -> bool {
        true
    }
}

// Compile-time assertion: Worker must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn Worker) {}
};

/// Static compatibility matrix between task type and worker type.
///
/// `custom` tasks are compatible with every worker type. `specialist`
/// workers are compatible with every task type, subject to the
/// capability-tag filter applied independently by the Strategy.
pub fn is_compatible(task_type: TaskType, worker_type: WorkerType) -> bool {
    use TaskType::*;
    use WorkerType::*;

    if task_type == Custom || worker_type == Specialist {
        return true;
    }

    matches!(
        (task_type, worker_type),
        (Analyze, Research)
            | (Analyze, Analysis)
            | (Process, Execution)
            | (Transform, Analysis)
            | (Transform, Execution)
            | (Validate, Validation)
            | (Aggregate, Research)
            | (Aggregate, Analysis)
            | (Aggregate, Coordination)
    )
}

/// Restart policy applied by the Worker Pool's health loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartPolicy {
    pub max_restarts: u32,
    pub restart_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 3,
            restart_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
        }
    }
}

impl RestartPolicy {
    /// Delay before the restart attempt numbered `restart_count` (0-based,
    /// i.e. the count of restarts already performed).
    pub fn delay_for(&self, restart_count: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(restart_count as i32);
        Duration::from_millis((self.restart_delay.as_millis() as f64 * factor) as u64)
    }
}

/// Static configuration for one worker, supplied at scale-up time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub worker_type: WorkerType,
    pub capabilities: HashSet<String>,
    pub resource_cap: ResourceEnvelope,
    pub priority_weight: f64,
}

impl WorkerConfig {
    pub fn new(worker_type: WorkerType) -> Self {
        Self {
            worker_type,
            capabilities: HashSet::new(),
            resource_cap: ResourceEnvelope {
                cpu: 1.0,
                memory: 1024.0,
            },
            priority_weight: 1.0,
        }
    }

    pub fn with_capabilities(mut self, caps: impl IntoIterator<Item = String>) -> Self {
        self.capabilities = caps.into_iter().collect();
        self
    }

    pub fn with_resource_cap(mut self, cap: ResourceEnvelope) -> Self {
        self.resource_cap = cap;
        self
    }
}

/// Completed/failed tally, either overall or scoped to one task type.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Tally {
    pub completed: u64,
    pub failed: u64,
}

impl Tally {
    /// Fraction completed successfully, or `1.0` with no history yet
    /// (optimistic prior -- an untested worker is not penalized).
    pub fn success_rate(&self) -> f64 {
        let total = self.completed + self.failed;
        if total == 0 {
            1.0
        } else {
            self.completed as f64 / total as f64
        }
    }
}

/// Running totals the pool tracks per worker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerMetrics {
    pub overall: Tally,
    /// Per-task-type breakdown, consulted by the Adaptive assignment
    /// policy ("highest historical success rate for this task type").
    pub by_task_type: HashMap<TaskType, Tally>,
    pub cumulative_duration: Duration,
    pub last_error: Option<String>,
}

impl WorkerMetrics {
    /// Fraction of attempted tasks that completed successfully, or `1.0`
    /// if this worker has not attempted any task yet (optimistic prior).
    pub fn success_rate(&self) -> f64 {
        self.overall.success_rate()
    }

    pub fn tasks_completed(&self) -> u64 {
        self.overall.completed
    }

    pub fn tasks_failed(&self) -> u64 {
        self.overall.failed
    }

    /// Success rate scoped to `task_type`, falling back to the optimistic
    /// prior if this worker has never attempted that type.
    pub fn success_rate_for(&self, task_type: TaskType) -> f64 {
        self.by_task_type
            .get(&task_type)
            .map(Tally::success_rate)
            .unwrap_or(1.0)
    }

    pub fn record_completion(&mut self, task_type: TaskType, duration: Duration) {
        self.overall.completed += 1;
        self.by_task_type.entry(task_type).or_default().completed += 1;
        self.cumulative_duration += duration;
    }

    pub fn record_failure(&mut self, task_type: TaskType, error: impl Into<String>) {
        self.overall.failed += 1;
        self.by_task_type.entry(task_type).or_default().failed += 1;
        self.last_error = Some(error.into());
    }
}

/// Pool-owned runtime state for one worker: its config, mutable lifecycle
/// fields, and the execution contract.
///
/// `worker` is reference-counted rather than boxed so the pool can clone it
/// out from under its lock before `execute`, instead of holding the lock
/// for the whole task duration.
pub struct WorkerHandle {
    pub id: WorkerId,
    pub config: WorkerConfig,
    pub state: WorkerState,
    pub current_task_id: Option<crate::types::TaskId>,
    pub restart_count: u32,
    pub last_health_at: Option<chrono::DateTime<chrono::Utc>>,
    pub metrics: WorkerMetrics,
    pub worker: std::sync::Arc<dyn Worker>,
}

impl WorkerHandle {
    pub fn new(config: WorkerConfig, worker: std::sync::Arc<dyn Worker>) -> Self {
        Self {
            id: crate::types::new_worker_id(),
            config,
            state: WorkerState::Created,
            current_task_id: None,
            restart_count: 0,
            last_health_at: None,
            metrics: WorkerMetrics::default(),
            worker,
        }
    }

    pub fn is_compatible_with(&self, task: &Task) -> bool {
        is_compatible(task.task_type, self.config.worker_type)
            && task.required_capabilities.is_subset(&self.config.capabilities)
            && task.resources.fits_within(&self.config.resource_cap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{TaskPriority, TaskType};

    struct NoopWorker {
        worker_type: WorkerType,
        capabilities: HashSet<String>,
    }

    #[async_trait]
    impl Worker for NoopWorker {
        fn worker_type(&self) -> WorkerType {
            self.worker_type
        }

        fn capabilities(&self) -> &HashSet<String> {
            &self.capabilities
        }

        async fn execute(&self, _task: &Task, _cancel: CancellationToken) -> ExecutionOutcome {
            ExecutionOutcome::success(serde_json::json!({"ok": true}))
        }
    }

    #[test]
    fn custom_task_compatible_with_every_worker_type() {
        for wt in [
            WorkerType::Research,
            WorkerType::Analysis,
            WorkerType::Execution,
            WorkerType::Validation,
            WorkerType::Coordination,
            WorkerType::Monitoring,
            WorkerType::Specialist,
        ] {
            assert!(is_compatible(TaskType::Custom, wt));
        }
    }

    #[test]
    fn specialist_compatible_with_every_task_type() {
        for tt in [
            TaskType::Analyze,
            TaskType::Process,
            TaskType::Transform,
            TaskType::Validate,
            TaskType::Aggregate,
            TaskType::Custom,
        ] {
            assert!(is_compatible(tt, WorkerType::Specialist));
        }
    }

    #[test]
    fn process_only_compatible_with_execution_and_specialist() {
        assert!(is_compatible(TaskType::Process, WorkerType::Execution));
        assert!(!is_compatible(TaskType::Process, WorkerType::Research));
        assert!(!is_compatible(TaskType::Process, WorkerType::Monitoring));
    }

    #[test]
    fn transform_compatible_with_analysis_and_execution() {
        assert!(is_compatible(TaskType::Transform, WorkerType::Analysis));
        assert!(is_compatible(TaskType::Transform, WorkerType::Execution));
        assert!(!is_compatible(TaskType::Transform, WorkerType::Validation));
    }

    #[test]
    fn restart_policy_backoff_grows_with_count() {
        let policy = RestartPolicy {
            max_restarts: 5,
            restart_delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
    }

    #[test]
    fn worker_metrics_success_rate_defaults_optimistic() {
        let metrics = WorkerMetrics::default();
        assert_eq!(metrics.success_rate(), 1.0);
    }

    #[test]
    fn worker_metrics_success_rate_reflects_history() {
        let mut metrics = WorkerMetrics::default();
        metrics.record_completion(TaskType::Process, Duration::from_millis(10));
        metrics.record_completion(TaskType::Process, Duration::from_millis(10));
        metrics.record_failure(TaskType::Process, "boom");
        assert!((metrics.success_rate() - (2.0 / 3.0)).abs() < 1e-9);
    }

    #[test]
    fn worker_metrics_tracks_success_rate_per_task_type() {
        let mut metrics = WorkerMetrics::default();
        metrics.record_completion(TaskType::Analyze, Duration::from_millis(10));
        metrics.record_failure(TaskType::Process, "boom");
        assert_eq!(metrics.success_rate_for(TaskType::Analyze), 1.0);
        assert_eq!(metrics.success_rate_for(TaskType::Process), 0.0);
        assert_eq!(metrics.success_rate_for(TaskType::Validate), 1.0);
    }

    #[test]
    fn handle_compatible_checks_type_capability_and_resources() {
        let config = WorkerConfig::new(WorkerType::Execution)
            .with_capabilities(["shell".to_string()])
            .with_resource_cap(ResourceEnvelope {
                cpu: 2.0,
                memory: 2048.0,
            });
        let handle = WorkerHandle::new(
            config,
            std::sync::Arc::new(NoopWorker {
                worker_type: WorkerType::Execution,
                capabilities: HashSet::from(["shell".to_string()]),
            }),
        );

        let mut task = Task::new("t", TaskType::Process, TaskPriority::Medium);
        task.required_capabilities = HashSet::from(["shell".to_string()]);
        task.resources = ResourceEnvelope {
            cpu: 1.0,
            memory: 512.0,
        };
        assert!(handle.is_compatible_with(&task));

        task.required_capabilities = HashSet::from(["gpu".to_string()]);
        assert!(!handle.is_compatible_with(&task));
    }
}
