//! Core data model: tasks, their enums, results, and resource envelopes.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique task identifier. Caller-supplied or generated with [`TaskId::new`].
pub type TaskId = String;

/// Unique worker identifier.
pub type WorkerId = String;

/// Generate a fresh random task id.
pub fn new_task_id() -> TaskId {
    Uuid::new_v4().to_string()
}

/// Generate a fresh random worker id.
pub fn new_worker_id() -> WorkerId {
    Uuid::new_v4().to_string()
}

/// Error returned when parsing a string into one of this module's enums fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    kind: &'static str,
    value: String,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {}: {:?}", self.kind, self.value)
    }
}

impl std::error::Error for ParseError {}

/// Strict ordering: Critical > High > Medium > Low.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    Medium,
    High,
    Critical,
}

impl TaskPriority {
    /// Promote one tier, capped at `Critical`. Used by the Scheduler's aging pass.
    pub fn promote(self) -> Self {
        match self {
            TaskPriority::Low => TaskPriority::Medium,
            TaskPriority::Medium => TaskPriority::High,
            TaskPriority::High | TaskPriority::Critical => TaskPriority::Critical,
        }
    }
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskPriority::Low => "low",
            TaskPriority::Medium => "medium",
            TaskPriority::High => "high",
            TaskPriority::Critical => "critical",
        };
        write!(f, "{s}")
    }
}

impl FromStr for TaskPriority {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(TaskPriority::Low),
            "medium" => Ok(TaskPriority::Medium),
            "high" => Ok(TaskPriority::High),
            "critical" => Ok(TaskPriority::Critical),
            other => Err(ParseError {
                kind: "task priority",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Analyze,
    Process,
    Transform,
    Validate,
    Aggregate,
    Custom,
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskType::Analyze => "analyze",
            TaskType::Process => "process",
            TaskType::Transform => "transform",
            TaskType::Validate => "validate",
            TaskType::Aggregate => "aggregate",
            TaskType::Custom => "custom",
        };
        write!(f, "{s}")
    }
}

impl FromStr for TaskType {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "analyze" => Ok(TaskType::Analyze),
            "process" => Ok(TaskType::Process),
            "transform" => Ok(TaskType::Transform),
            "validate" => Ok(TaskType::Validate),
            "aggregate" => Ok(TaskType::Aggregate),
            "custom" => Ok(TaskType::Custom),
            other => Err(ParseError {
                kind: "task type",
                value: other.to_string(),
            }),
        }
    }
}

/// Task lifecycle state machine. See the Scheduler and Task Graph for the
/// transition rules; this type only names the states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Waiting,
    Ready,
    Assigned,
    Running,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
    CascadeFailed,
    Skipped,
}

impl TaskStatus {
    /// Whether this status is terminal (no further transitions allowed).
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed
                | TaskStatus::Failed
                | TaskStatus::TimedOut
                | TaskStatus::Cancelled
                | TaskStatus::CascadeFailed
                | TaskStatus::Skipped
        )
    }

    /// Whether this status counts as a successful terminal state for
    /// dependency resolution.
    pub fn is_success(self) -> bool {
        matches!(self, TaskStatus::Completed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Waiting => "waiting",
            TaskStatus::Ready => "ready",
            TaskStatus::Assigned => "assigned",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::TimedOut => "timed_out",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::CascadeFailed => "cascade_failed",
            TaskStatus::Skipped => "skipped",
        };
        write!(f, "{s}")
    }
}

impl FromStr for TaskStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "waiting" => Ok(TaskStatus::Waiting),
            "ready" => Ok(TaskStatus::Ready),
            "assigned" => Ok(TaskStatus::Assigned),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "timed_out" => Ok(TaskStatus::TimedOut),
            "cancelled" => Ok(TaskStatus::Cancelled),
            "cascade_failed" => Ok(TaskStatus::CascadeFailed),
            "skipped" => Ok(TaskStatus::Skipped),
            other => Err(ParseError {
                kind: "task status",
                value: other.to_string(),
            }),
        }
    }
}

/// How a task's failure affects its not-yet-started descendants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CascadePolicy {
    Abort,
    Skip,
    Continue,
}

impl Default for CascadePolicy {
    fn default() -> Self {
        CascadePolicy::Abort
    }
}

impl fmt::Display for CascadePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CascadePolicy::Abort => "abort",
            CascadePolicy::Skip => "skip",
            CascadePolicy::Continue => "continue",
        };
        write!(f, "{s}")
    }
}

impl FromStr for CascadePolicy {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "abort" => Ok(CascadePolicy::Abort),
            "skip" => Ok(CascadePolicy::Skip),
            "continue" => Ok(CascadePolicy::Continue),
            other => Err(ParseError {
                kind: "cascade policy",
                value: other.to_string(),
            }),
        }
    }
}

/// Worker capability kind. See the compatibility matrix in `worker.rs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerType {
    Research,
    Analysis,
    Execution,
    Validation,
    Coordination,
    Monitoring,
    Specialist,
}

impl fmt::Display for WorkerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkerType::Research => "research",
            WorkerType::Analysis => "analysis",
            WorkerType::Execution => "execution",
            WorkerType::Validation => "validation",
            WorkerType::Coordination => "coordination",
            WorkerType::Monitoring => "monitoring",
            WorkerType::Specialist => "specialist",
        };
        write!(f, "{s}")
    }
}

impl FromStr for WorkerType {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "research" => Ok(WorkerType::Research),
            "analysis" => Ok(WorkerType::Analysis),
            "execution" => Ok(WorkerType::Execution),
            "validation" => Ok(WorkerType::Validation),
            "coordination" => Ok(WorkerType::Coordination),
            "monitoring" => Ok(WorkerType::Monitoring),
            "specialist" => Ok(WorkerType::Specialist),
            other => Err(ParseError {
                kind: "worker type",
                value: other.to_string(),
            }),
        }
    }
}

/// Worker lifecycle state. Transitions are owned by the Worker Pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Created,
    Initializing,
    Ready,
    Idle,
    Busy,
    Error,
    Terminating,
    Terminated,
}

impl WorkerState {
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkerState::Terminated)
    }

    pub fn is_available(self) -> bool {
        matches!(self, WorkerState::Idle)
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkerState::Created => "created",
            WorkerState::Initializing => "initializing",
            WorkerState::Ready => "ready",
            WorkerState::Idle => "idle",
            WorkerState::Busy => "busy",
            WorkerState::Error => "error",
            WorkerState::Terminating => "terminating",
            WorkerState::Terminated => "terminated",
        };
        write!(f, "{s}")
    }
}

impl FromStr for WorkerState {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(WorkerState::Created),
            "initializing" => Ok(WorkerState::Initializing),
            "ready" => Ok(WorkerState::Ready),
            "idle" => Ok(WorkerState::Idle),
            "busy" => Ok(WorkerState::Busy),
            "error" => Ok(WorkerState::Error),
            "terminating" => Ok(WorkerState::Terminating),
            "terminated" => Ok(WorkerState::Terminated),
            other => Err(ParseError {
                kind: "worker state",
                value: other.to_string(),
            }),
        }
    }
}

/// CPU/memory envelope, used both as a task requirement and a worker cap.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceEnvelope {
    /// Fractional CPU cores.
    pub cpu: f64,
    /// Megabytes of memory.
    pub memory: f64,
}

impl ResourceEnvelope {
    pub const ZERO: ResourceEnvelope = ResourceEnvelope {
        cpu: 0.0,
        memory: 0.0,
    };

    /// Whether `self` fits within `cap`, componentwise.
    pub fn fits_within(&self, cap: &ResourceEnvelope) -> bool {
        self.cpu <= cap.cpu && self.memory <= cap.memory
    }
}

impl Default for ResourceEnvelope {
    fn default() -> Self {
        Self::ZERO
    }
}

/// Backoff shape for task retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryBackoff {
    Constant,
    Linear,
    Exponential,
}

/// Per-task (or orchestrator-default) retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: RetryBackoff,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: RetryBackoff::Exponential,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before the given 1-based attempt number, per
    /// `min(maxDelay, initialDelay * multiplier^(attempt-1))`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier: f64 = match self.backoff {
            RetryBackoff::Constant => 1.0,
            RetryBackoff::Linear => attempt.max(1) as f64,
            RetryBackoff::Exponential => 2f64.powi((attempt.max(1) - 1) as i32),
        };
        let millis = (self.initial_delay.as_millis() as f64 * multiplier)
            .min(self.max_delay.as_millis() as f64);
        Duration::from_millis(millis as u64)
    }
}

/// A unit of work submitted to the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    pub task_type: TaskType,
    pub priority: TaskPriority,
    pub input: serde_json::Value,
    pub required_capabilities: HashSet<String>,
    pub resources: ResourceEnvelope,
    pub dependencies: Vec<TaskId>,
    pub deadline: Option<DateTime<Utc>>,
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_policy: RetryPolicy,
    pub on_dependency_failure: CascadePolicy,
    pub result_retention: Duration,

    // Mutable scheduler-owned fields.
    pub status: TaskStatus,
    pub attempts: u32,
    pub assigned_worker: Option<WorkerId>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub enqueued_at: Option<DateTime<Utc>>,
    pub results: Vec<TaskResult>,
    pub result_delivered: bool,
    /// Set when a dependency failed and this task's `onDependencyFailure`
    /// policy is `continue` -- the task still executes, marked accordingly.
    pub dependency_failed: bool,
}

impl Task {
    /// Build a new task in `Pending` state with sane defaults for every
    /// mutable field. Callers typically go through `TaskBuilder` instead.
    pub fn new(name: impl Into<String>, task_type: TaskType, priority: TaskPriority) -> Self {
        Self {
            id: new_task_id(),
            name: name.into(),
            task_type,
            priority,
            input: serde_json::Value::Null,
            required_capabilities: HashSet::new(),
            resources: ResourceEnvelope::ZERO,
            dependencies: Vec::new(),
            deadline: None,
            timeout: Duration::from_secs(60),
            max_retries: 3,
            retry_policy: RetryPolicy::default(),
            on_dependency_failure: CascadePolicy::default(),
            result_retention: Duration::from_secs(300),
            status: TaskStatus::Pending,
            attempts: 0,
            assigned_worker: None,
            started_at: None,
            ended_at: None,
            next_retry_at: None,
            enqueued_at: None,
            results: Vec::new(),
            result_delivered: false,
            dependency_failed: false,
        }
    }

    /// The most recent result recorded for this task, if any.
    pub fn last_result(&self) -> Option<&TaskResult> {
        self.results.last()
    }
}

/// Outcome of a single execution attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub attempt: u32,
    pub worker_id: WorkerId,
    pub status: TaskStatus,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

impl TaskResult {
    pub fn duration(&self) -> chrono::Duration {
        self.ended_at - self.started_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip<T>(values: &[T])
    where
        T: fmt::Display + FromStr<Err = ParseError> + PartialEq + fmt::Debug + Clone,
    {
        for v in values {
            let s = v.to_string();
            let parsed = T::from_str(&s).unwrap_or_else(|_| panic!("failed to parse {s:?}"));
            assert_eq!(&parsed, v);
        }
    }

    #[test]
    fn task_priority_roundtrips() {
        roundtrip(&[
            TaskPriority::Low,
            TaskPriority::Medium,
            TaskPriority::High,
            TaskPriority::Critical,
        ]);
    }

    #[test]
    fn task_priority_ordering_is_strict() {
        assert!(TaskPriority::Critical > TaskPriority::High);
        assert!(TaskPriority::High > TaskPriority::Medium);
        assert!(TaskPriority::Medium > TaskPriority::Low);
    }

    #[test]
    fn task_priority_promote_caps_at_critical() {
        assert_eq!(TaskPriority::Low.promote(), TaskPriority::Medium);
        assert_eq!(TaskPriority::Critical.promote(), TaskPriority::Critical);
    }

    #[test]
    fn task_type_roundtrips() {
        roundtrip(&[
            TaskType::Analyze,
            TaskType::Process,
            TaskType::Transform,
            TaskType::Validate,
            TaskType::Aggregate,
            TaskType::Custom,
        ]);
    }

    #[test]
    fn task_status_roundtrips() {
        roundtrip(&[
            TaskStatus::Pending,
            TaskStatus::Waiting,
            TaskStatus::Ready,
            TaskStatus::Assigned,
            TaskStatus::Running,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::TimedOut,
            TaskStatus::Cancelled,
            TaskStatus::CascadeFailed,
            TaskStatus::Skipped,
        ]);
    }

    #[test]
    fn task_status_terminal_classification() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(TaskStatus::Completed.is_success());
        assert!(!TaskStatus::Skipped.is_success());
    }

    #[test]
    fn cascade_policy_roundtrips() {
        roundtrip(&[
            CascadePolicy::Abort,
            CascadePolicy::Skip,
            CascadePolicy::Continue,
        ]);
    }

    #[test]
    fn cascade_policy_defaults_to_abort() {
        assert_eq!(CascadePolicy::default(), CascadePolicy::Abort);
    }

    #[test]
    fn worker_type_roundtrips() {
        roundtrip(&[
            WorkerType::Research,
            WorkerType::Analysis,
            WorkerType::Execution,
            WorkerType::Validation,
            WorkerType::Coordination,
            WorkerType::Monitoring,
            WorkerType::Specialist,
        ]);
    }

    #[test]
    fn worker_state_roundtrips() {
        roundtrip(&[
            WorkerState::Created,
            WorkerState::Initializing,
            WorkerState::Ready,
            WorkerState::Idle,
            WorkerState::Busy,
            WorkerState::Error,
            WorkerState::Terminating,
            WorkerState::Terminated,
        ]);
    }

    #[test]
    fn invalid_strings_produce_parse_error() {
        assert!(TaskPriority::from_str("urgent").is_err());
        assert!(WorkerState::from_str("sleeping").is_err());
    }

    #[test]
    fn resource_envelope_fits_within_is_componentwise() {
        let small = ResourceEnvelope {
            cpu: 1.0,
            memory: 512.0,
        };
        let big = ResourceEnvelope {
            cpu: 2.0,
            memory: 1024.0,
        };
        assert!(small.fits_within(&big));
        assert!(!big.fits_within(&small));
    }

    #[test]
    fn retry_policy_exponential_backoff_doubles() {
        let policy = RetryPolicy {
            max_retries: 5,
            backoff: RetryBackoff::Exponential,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
    }

    #[test]
    fn retry_policy_caps_at_max_delay() {
        let policy = RetryPolicy {
            max_retries: 10,
            backoff: RetryBackoff::Exponential,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(300),
        };
        assert_eq!(policy.delay_for_attempt(10), Duration::from_millis(300));
    }

    #[test]
    fn retry_policy_linear_scales_by_attempt() {
        let policy = RetryPolicy {
            max_retries: 5,
            backoff: RetryBackoff::Linear,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
        };
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(300));
    }

    #[test]
    fn new_task_has_pending_status_and_zero_attempts() {
        let task = Task::new("t", TaskType::Analyze, TaskPriority::Medium);
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.attempts, 0);
        assert!(task.last_result().is_none());
    }
}
