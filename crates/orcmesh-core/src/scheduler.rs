//! Scheduler: the single logical tick that moves tasks through retry
//! admission, dependency resolution, assignment, and timeout sweep.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::sync::{Mutex, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::events::{Event, EventBus, EventKind};
use crate::graph::TaskGraph;
use crate::pool::{TaskOutcome, WorkerPool};
use crate::queue::PriorityQueue;
use crate::strategy::{AutoStrategy, PoolMetrics};
use crate::types::{CascadePolicy, RetryPolicy, Task, TaskId, TaskResult, TaskStatus};

/// Summary of one `tick()` call, returned for introspection and tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct TickSummary {
    pub admitted_from_retry: usize,
    pub admitted_from_dependencies: usize,
    pub assigned: usize,
    pub timed_out: usize,
    pub promoted_by_aging: usize,
}

/// Drives the task graph and priority queue forward. Holds no reference to
/// the Orchestrator; all collaborators (pool, strategy, events, clock) are
/// injected so the Scheduler can be driven in isolation by tests.
pub struct Scheduler {
    graph: Arc<RwLock<TaskGraph>>,
    queue: Arc<Mutex<PriorityQueue>>,
    pool: Arc<WorkerPool>,
    strategy: Arc<AutoStrategy>,
    events: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    execution_permits: Arc<Semaphore>,
    cancels: Arc<std::sync::Mutex<HashMap<TaskId, CancellationToken>>>,
    last_aging_at: std::sync::Mutex<chrono::DateTime<Utc>>,
    /// Cooperative pause flag: set by the Orchestrator's `Pause()`. Only the
    /// assignment phase of `tick` checks this -- retry admission, dependency
    /// resolution, and the timeout sweep keep running so already in-flight
    /// tasks still make progress toward completion while paused.
    paused: AtomicBool,

    default_retry_policy: RetryPolicy,
    default_timeout: Duration,
    max_queue_size: usize,
    aging_interval: chrono::Duration,
    aging_threshold: chrono::Duration,
}

impl Scheduler {
    pub fn new(
        pool: Arc<WorkerPool>,
        strategy: Arc<AutoStrategy>,
        events: Arc<EventBus>,
        clock: Arc<dyn Clock>,
        config: &OrchestratorConfig,
    ) -> Self {
        Self {
            graph: Arc::new(RwLock::new(TaskGraph::new())),
            queue: Arc::new(Mutex::new(PriorityQueue::new())),
            pool,
            strategy,
            events,
            execution_permits: Arc::new(Semaphore::new(config.max_agents)),
            cancels: Arc::new(std::sync::Mutex::new(HashMap::new())),
            last_aging_at: std::sync::Mutex::new(clock.now()),
            paused: AtomicBool::new(false),
            clock,
            default_retry_policy: config.default_retry_policy.clone(),
            default_timeout: config.default_timeout,
            max_queue_size: config.max_queue_size,
            aging_interval: chrono::Duration::from_std(config.aging_interval).unwrap_or_default(),
            aging_threshold: chrono::Duration::from_std(config.aging_threshold).unwrap_or_default(),
        }
    }

    fn emit(&self, event: Event) {
        self.events.publish(event);
    }

    /// Stop handing ready tasks to idle workers. Already-running tasks are
    /// unaffected; retry admission, dependency resolution, and the timeout
    /// sweep all keep running.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    /// Number of tasks currently pending/waiting/ready/assigned/running --
    /// the figure `Submit`'s backpressure check and `QueueFull` are based on.
    pub async fn backlog(&self) -> usize {
        self.graph
            .read()
            .await
            .values()
            .filter(|t| !t.status.is_terminal())
            .count()
    }

    pub async fn queue_depth(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// Insert `task` into the graph and, if it has no unmet dependencies,
    /// admit it straight to the ready queue. Rejects on backpressure or a
    /// graph conflict (cycle, unknown dependency, duplicate live id).
    pub async fn submit(&self, mut task: Task) -> OrchestratorResult<TaskId> {
        if self.backlog().await >= self.max_queue_size {
            return Err(OrchestratorError::QueueFull {
                pending: self.backlog().await,
                capacity: self.max_queue_size,
            });
        }

        let mut graph = self.graph.write().await;
        if let Some(existing) = graph.get(&task.id) {
            if existing.status.is_terminal() {
                return Err(OrchestratorError::InvalidArgument(format!(
                    "task {} already exists and is terminal",
                    task.id
                )));
            }
            return Ok(task.id);
        }

        if task.timeout.is_zero() {
            task.timeout = self.default_timeout;
        }
        task.status = TaskStatus::Waiting;
        let id = task.id.clone();
        let deps_satisfied = task.dependencies.is_empty();
        graph.insert(task)?;

        self.emit(Event::new(EventKind::TaskSubmitted, "scheduler").with_task(id.clone()));

        if deps_satisfied || graph.is_ready(&id) {
            let task = graph.get_mut(&id).expect("just inserted");
            task.status = TaskStatus::Ready;
            task.enqueued_at = Some(self.clock.now());
            let priority = task.priority;
            drop(graph);
            self.queue.lock().await.push(id.clone(), priority);
            self.emit(Event::new(EventKind::TaskReady, "scheduler").with_task(id.clone()));
        }

        Ok(id)
    }

    pub async fn status(&self, id: &str) -> OrchestratorResult<TaskStatus> {
        self.graph
            .read()
            .await
            .get(id)
            .map(|t| t.status)
            .ok_or_else(|| OrchestratorError::NotFound(format!("task {id}")))
    }

    /// The task's most recent result, marking it delivered (so the graph is
    /// now free to prune it once its retention window has also elapsed).
    pub async fn result(&self, id: &str) -> OrchestratorResult<Option<TaskResult>> {
        let mut graph = self.graph.write().await;
        let task = graph
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("task {id}")))?;
        if task.status.is_terminal() {
            task.result_delivered = true;
        }
        Ok(task.last_result().cloned())
    }

    /// Mark `id` cancelled and, if it is currently executing, signal its
    /// cancellation token. Queued-but-not-yet-assigned tasks are marked
    /// cancelled in place and lazily skipped when popped.
    pub async fn cancel(&self, id: &str) -> OrchestratorResult<()> {
        let mut graph = self.graph.write().await;
        let task = graph
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("task {id}")))?;
        if task.status.is_terminal() {
            return Err(OrchestratorError::InvalidState(format!(
                "task {id} is already terminal"
            )));
        }
        task.status = TaskStatus::Cancelled;
        task.ended_at = Some(self.clock.now());
        let policy = task.on_dependency_failure;
        drop(graph);

        if let Some(token) = self.cancels.lock().unwrap().get(id) {
            token.cancel();
        }
        self.emit(Event::new(EventKind::TaskCancelled, "scheduler").with_task(id.to_string()));

        let cascaded = self.graph.write().await.cascade(id, policy);
        for descendant in cascaded {
            self.emit(Event::new(EventKind::TaskCascadeFailed, "scheduler").with_task(descendant));
        }
        Ok(())
    }

    /// One full scheduling pass: retry admission, dependency resolution,
    /// assignment, timeout sweep, then aging if its interval has elapsed.
    pub async fn tick(&self) -> TickSummary {
        let mut summary = TickSummary::default();
        let now = self.clock.now();

        summary.admitted_from_retry = self.admit_retries(now).await;
        summary.admitted_from_dependencies = self.admit_ready_dependents().await;
        if !self.paused.load(Ordering::SeqCst) {
            summary.assigned = self.assign_ready_tasks().await;
        }
        summary.timed_out = self.sweep_timeouts(now).await;

        if now - *self.last_aging_at.lock().unwrap() >= self.aging_interval {
            summary.promoted_by_aging = self.age_starved_tasks(now).await;
            *self.last_aging_at.lock().unwrap() = now;
        }

        summary
    }

    async fn admit_retries(&self, now: chrono::DateTime<Utc>) -> usize {
        let mut graph = self.graph.write().await;
        let due: Vec<TaskId> = graph
            .values()
            .filter(|t| t.status == TaskStatus::Waiting && t.next_retry_at.is_some_and(|at| at <= now))
            .map(|t| t.id.clone())
            .collect();

        for id in &due {
            let task = graph.get_mut(id).expect("id from graph scan");
            task.status = TaskStatus::Ready;
            task.next_retry_at = None;
            task.enqueued_at = Some(now);
        }
        drop(graph);

        let graph = self.graph.read().await;
        let mut queue = self.queue.lock().await;
        for id in &due {
            if let Some(task) = graph.get(id) {
                queue.push(id.clone(), task.priority);
            }
        }
        due.len()
    }

    async fn admit_ready_dependents(&self) -> usize {
        let mut graph = self.graph.write().await;
        let ready = graph.newly_ready();
        let now = self.clock.now();
        for id in &ready {
            let task = graph.get_mut(id).expect("id from newly_ready");
            task.status = TaskStatus::Ready;
            task.enqueued_at = Some(now);
        }
        drop(graph);

        let graph = self.graph.read().await;
        let mut queue = self.queue.lock().await;
        for id in &ready {
            if let Some(task) = graph.get(id) {
                queue.push(id.clone(), task.priority);
                self.emit(Event::new(EventKind::TaskReady, "scheduler").with_task(id.clone()));
            }
        }
        ready.len()
    }

    /// While the queue is non-empty and a worker is idle, pop the
    /// highest-priority task and hand it to the Strategy. If the Strategy
    /// cannot find a worker, the task is pushed back at the head of its
    /// tier (preserving its original sequence) and the phase stops.
    async fn assign_ready_tasks(&self) -> usize {
        let mut assigned = 0;
        loop {
            let idle = self.pool.idle_worker_infos().await;
            if idle.is_empty() {
                break;
            }

            let popped = self.queue.lock().await.pop();
            let Some(task_id) = popped else {
                break;
            };

            // Snapshot the task under a short-lived read lock; the graph
            // lock is never held across the awaits below.
            let task = self.graph.read().await.get(&task_id).cloned();
            let Some(task) = task else { continue };
            if task.status != TaskStatus::Ready {
                // Stale entry (cancelled/cascaded since it was enqueued).
                continue;
            }

            let metrics = PoolMetrics {
                utilization: self.pool.utilization().await,
                queue_depth: self.queue_depth().await,
                backlog: self.backlog().await,
            };
            let Some(worker) = self.strategy.pick(&task, &idle, metrics).cloned() else {
                // No eligible worker for this task right now; put it back
                // at the head of its tier and stop -- other idle workers
                // may still suit tasks further back in the queue, but the
                // spec requires the phase to stop here once a pick fails.
                let sequence = self.queue.lock().await.peek_next_sequence();
                self.queue.lock().await.push_front(task_id, task.priority, sequence);
                break;
            };

            if self.pool.assign(&worker.id, &task_id).await.is_err() {
                // Lost the race for this worker; retry the task next tick.
                self.queue.lock().await.push(task_id, task.priority);
                continue;
            }

            {
                let mut graph = self.graph.write().await;
                if let Some(task) = graph.get_mut(&task_id) {
                    task.status = TaskStatus::Assigned;
                    task.assigned_worker = Some(worker.id.clone());
                }
            }
            self.emit(
                Event::new(EventKind::TaskAssigned, "scheduler")
                    .with_task(task_id.clone())
                    .with_worker(worker.id.clone()),
            );

            self.spawn_execution(task_id, worker.id);
            assigned += 1;
        }
        assigned
    }

    /// Spawn the long-running execution future for one assigned task,
    /// gated by the pool-sized semaphore so no more tasks run concurrently
    /// than there are workers.
    fn spawn_execution(&self, task_id: TaskId, worker_id: String) {
        let graph = self.graph.clone();
        let pool = self.pool.clone();
        let events = self.events.clone();
        let clock = self.clock.clone();
        let permits = self.execution_permits.clone();
        let cancels = self.cancels.clone();
        let default_retry_policy = self.default_retry_policy.clone();

        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire().await else {
                return;
            };
            let cancel = CancellationToken::new();
            cancels.lock().unwrap().insert(task_id.clone(), cancel.clone());

            let started_at = clock.now();
            let task_type = {
                let mut graph = graph.write().await;
                let Some(task) = graph.get_mut(&task_id) else {
                    return;
                };
                task.status = TaskStatus::Running;
                task.started_at = Some(started_at);
                task.attempts += 1;
                task.task_type
            };
            events.publish(
                Event::new(EventKind::TaskStarted, "scheduler")
                    .with_task(task_id.clone())
                    .with_worker(worker_id.clone()),
            );

            let task_snapshot = graph.read().await.get(&task_id).cloned();
            let outcome = match task_snapshot {
                Some(task) => Some(pool.execute(&worker_id, &task, cancel.clone()).await),
                None => None,
            };

            cancels.lock().unwrap().remove(&task_id);
            let ended_at = clock.now();

            // A concurrent Cancel()/timeout sweep may have already decided
            // this task's fate; don't clobber that terminal status, but
            // still return the worker to the pool.
            let already_terminal = graph
                .read()
                .await
                .get(&task_id)
                .is_none_or(|t| t.status.is_terminal());
            if already_terminal {
                let outcome = match outcome {
                    Some(o) if o.is_success() => TaskOutcome::Completed {
                        task_type,
                        duration: (ended_at - started_at).to_std().unwrap_or_default(),
                    },
                    _ => TaskOutcome::Failed {
                        task_type,
                        error: "task reached a terminal state before execution returned".to_string(),
                    },
                };
                let _ = pool.release(&worker_id, outcome).await;
                return;
            }

            match outcome {
                Some(execution_outcome) if execution_outcome.is_success() => {
                    let mut graph = graph.write().await;
                    let task = graph.get_mut(&task_id).expect("checked terminal above");
                    task.status = TaskStatus::Completed;
                    task.ended_at = Some(ended_at);
                    task.results.push(TaskResult {
                        attempt: task.attempts,
                        worker_id: worker_id.clone(),
                        status: TaskStatus::Completed,
                        output: execution_outcome.output,
                        error: None,
                        started_at,
                        ended_at,
                    });
                    drop(graph);
                    events.publish(
                        Event::new(EventKind::TaskCompleted, "scheduler")
                            .with_task(task_id.clone())
                            .with_worker(worker_id.clone()),
                    );
                    let _ = pool
                        .release(
                            &worker_id,
                            TaskOutcome::Completed { task_type, duration: (ended_at - started_at).to_std().unwrap_or_default() },
                        )
                        .await;
                }
                Some(execution_outcome) => {
                    let error = execution_outcome.error.unwrap_or_else(|| "unknown error".to_string());
                    let (failed_terminally, cascade_policy) = {
                        let mut graph = graph.write().await;
                        let task = graph.get_mut(&task_id).expect("checked terminal above");
                        Self::handle_failure(task, worker_id.clone(), started_at, ended_at, error.clone(), &default_retry_policy, TaskStatus::Failed);
                        (task.status == TaskStatus::Failed, task.on_dependency_failure)
                    };
                    let _ = pool.release(&worker_id, TaskOutcome::Failed { task_type, error }).await;
                    if failed_terminally {
                        events.publish(Event::new(EventKind::TaskFailed, "scheduler").with_task(task_id.clone()));
                        let cascaded = graph.write().await.cascade(&task_id, cascade_policy);
                        for descendant in cascaded {
                            events.publish(Event::new(EventKind::TaskCascadeFailed, "scheduler").with_task(descendant));
                        }
                    }
                }
                None => {}
            }
        });
    }

    /// Apply a failed-attempt outcome to `task`: schedule a retry if the
    /// policy allows and the computed delay stays within the deadline,
    /// otherwise transition to the given terminal status.
    fn handle_failure(
        task: &mut Task,
        worker_id: String,
        started_at: chrono::DateTime<Utc>,
        ended_at: chrono::DateTime<Utc>,
        error: String,
        default_retry_policy: &RetryPolicy,
        terminal_status: TaskStatus,
    ) {
        task.results.push(TaskResult {
            attempt: task.attempts,
            worker_id,
            status: terminal_status,
            output: None,
            error: Some(error.clone()),
            started_at,
            ended_at,
        });

        let policy = if task.retry_policy.max_retries > 0 || task.max_retries == 0 {
            task.retry_policy.clone()
        } else {
            default_retry_policy.clone()
        };
        let max_retries = task.max_retries.max(policy.max_retries);

        if task.attempts <= max_retries {
            let delay = policy.delay_for_attempt(task.attempts);
            let next_retry_at = ended_at + chrono::Duration::from_std(delay).unwrap_or_default();
            let within_deadline = task.deadline.is_none_or(|deadline| next_retry_at <= deadline);
            if within_deadline {
                task.status = TaskStatus::Waiting;
                task.next_retry_at = Some(next_retry_at);
                task.assigned_worker = None;
                return;
            }
        }

        task.status = terminal_status;
        task.ended_at = Some(ended_at);
        task.assigned_worker = None;
    }

    async fn sweep_timeouts(&self, now: chrono::DateTime<Utc>) -> usize {
        let mut graph = self.graph.write().await;
        let timed_out: Vec<(TaskId, CascadePolicy)> = graph
            .values()
            .filter(|t| {
                t.status == TaskStatus::Running
                    && t.started_at.is_some_and(|start| start + chrono::Duration::from_std(t.timeout).unwrap_or_default() < now)
            })
            .map(|t| (t.id.clone(), t.on_dependency_failure))
            .collect();

        for (id, _) in &timed_out {
            if let Some(task) = graph.get_mut(id) {
                task.status = TaskStatus::TimedOut;
                task.ended_at = Some(now);
            }
            if let Some(token) = self.cancels.lock().unwrap().get(id) {
                token.cancel();
            }
        }
        drop(graph);

        for (id, policy) in &timed_out {
            self.emit(Event::new(EventKind::TaskTimedOut, "scheduler").with_task(id.clone()));
            let cascaded = self.graph.write().await.cascade(id, *policy);
            for descendant in cascaded {
                self.emit(Event::new(EventKind::TaskCascadeFailed, "scheduler").with_task(descendant));
            }
        }
        timed_out.len()
    }

    /// Promote any `Waiting`/`Ready` task that has sat past `agingThreshold`
    /// by one priority tier. Never demotes.
    async fn age_starved_tasks(&self, now: chrono::DateTime<Utc>) -> usize {
        let mut graph = self.graph.write().await;
        let starved: Vec<TaskId> = graph
            .values()
            .filter(|t| {
                matches!(t.status, TaskStatus::Waiting | TaskStatus::Ready)
                    && t.enqueued_at.is_some_and(|at| now - at > self.aging_threshold)
            })
            .map(|t| t.id.clone())
            .collect();

        for id in &starved {
            if let Some(task) = graph.get_mut(id) {
                task.priority = task.priority.promote();
            }
        }
        starved.len()
    }

    pub async fn task(&self, id: &str) -> Option<Task> {
        self.graph.read().await.get(id).cloned()
    }

    /// Snapshot every task currently in the graph, for checkpointing.
    pub async fn all_tasks(&self) -> Vec<Task> {
        self.graph.read().await.values().cloned().collect()
    }

    /// Re-hydrate the graph (and, for any still-`Ready` task, the priority
    /// queue) from a checkpoint's flattened task list. Tasks are inserted in
    /// dependency order by repeatedly scanning for ids whose dependencies
    /// are already present -- the same closure-building `insert` performs
    /// on a live `submit`, just driven bottom-up once instead of per-call.
    pub async fn restore_tasks(&self, tasks: Vec<Task>) -> OrchestratorResult<()> {
        let mut graph = self.graph.write().await;
        let mut queue = self.queue.lock().await;
        let mut pending = tasks;
        loop {
            let mut inserted_any = false;
            let mut next_round = Vec::with_capacity(pending.len());
            for task in pending {
                if task.dependencies.iter().all(|d| graph.contains(d)) {
                    let id = task.id.clone();
                    let (status, priority) = (task.status, task.priority);
                    graph.insert(task)?;
                    if status == TaskStatus::Ready {
                        queue.push(id, priority);
                    }
                    inserted_any = true;
                } else {
                    next_round.push(task);
                }
            }
            pending = next_round;
            if pending.is_empty() || !inserted_any {
                break;
            }
        }
        if !pending.is_empty() {
            return Err(OrchestratorError::InvalidGraph(
                "checkpoint contains tasks whose dependencies never resolve".into(),
            ));
        }
        Ok(())
    }

    /// Best-effort pruning pass: drop terminal, delivered tasks whose
    /// retention window has elapsed and that have no undelivered dependents.
    pub async fn prune_expired(&self, now: chrono::DateTime<Utc>) -> usize {
        let mut graph = self.graph.write().await;
        let candidates: Vec<TaskId> = graph
            .values()
            .filter(|t| {
                t.status.is_terminal()
                    && t.result_delivered
                    && t.ended_at
                        .is_some_and(|ended| now - ended >= chrono::Duration::from_std(t.result_retention).unwrap_or_default())
            })
            .map(|t| t.id.clone())
            .collect();
        candidates.into_iter().filter(|id| graph.try_prune(id)).count()
    }
}
