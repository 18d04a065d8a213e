//! Orchestrator: the public façade. Owns every subcomponent (Scheduler,
//! Worker Pool, Auto Strategy, Event Bus, Knowledge Store) and the
//! background loops that drive them, behind one typed lifecycle.
//!
//! Construction is separate from the background work: `initialize` builds
//! and validates every subcomponent and leaves the orchestrator `Ready`;
//! `start` spawns the scheduler tick, health-check, autoscale, and (if
//! configured) checkpoint loops, each cancelled together on `stop` via a
//! shared `CancellationToken` -- the same shape the core's execution
//! loop uses for its own per-task cancellation, just one level up.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde_json::json;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use orcmesh_kv::checkpoint::{OrchestratorStateSnapshot, TaskSnapshot, WorkerSnapshot};
use orcmesh_kv::{Checkpoint, KvStore};

use crate::clock::{Clock, SystemClock};
use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::events::{Event, EventBus, EventKind, EventStream};
use crate::knowledge::KnowledgeStore;
use crate::pool::{HealthOutcome, WorkerFactory, WorkerPool};
use crate::scheduler::Scheduler;
use crate::strategy::{AutoStrategy, PoolMetrics, ScaleDecision, TrendTracker};
use crate::types::{Task, TaskId, TaskResult, TaskStatus, WorkerId};
use crate::worker::{WorkerConfig, WorkerMetrics};

const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Orchestrator lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    Initializing,
    Ready,
    Running,
    Paused,
    Completing,
    Completed,
    Failed,
    Terminated,
}

impl OrchestratorState {
    fn to_snapshot(self) -> OrchestratorStateSnapshot {
        match self {
            OrchestratorState::Initializing => OrchestratorStateSnapshot::Initializing,
            OrchestratorState::Ready => OrchestratorStateSnapshot::Ready,
            OrchestratorState::Running => OrchestratorStateSnapshot::Running,
            OrchestratorState::Paused => OrchestratorStateSnapshot::Paused,
            OrchestratorState::Completing => OrchestratorStateSnapshot::Completing,
            OrchestratorState::Completed => OrchestratorStateSnapshot::Completed,
            OrchestratorState::Failed => OrchestratorStateSnapshot::Failed,
            OrchestratorState::Terminated => OrchestratorStateSnapshot::Terminated,
        }
    }
}

/// Concurrent, in-process task orchestrator for a pool of capability-typed
/// workers. See the module docs for the lifecycle shape.
pub struct Orchestrator {
    id: Uuid,
    config: OrchestratorConfig,
    state: std::sync::RwLock<OrchestratorState>,
    scheduler: Arc<Scheduler>,
    pool: Arc<WorkerPool>,
    strategy: Arc<AutoStrategy>,
    events: Arc<EventBus>,
    knowledge: Arc<KnowledgeStore>,
    clock: Arc<dyn Clock>,
    kv: Arc<dyn KvStore>,
    default_worker_config: WorkerConfig,
    sequence: AtomicU64,
    shutdown: CancellationToken,
    background: AsyncMutex<Vec<JoinHandle<()>>>,
    trend: AsyncMutex<TrendTracker>,
    overage_since: AsyncMutex<Option<DateTime<Utc>>>,
}

impl Orchestrator {
    /// Validate `config`, construct every subcomponent, and return a
    /// `Ready` orchestrator backed by the real wall clock.
    pub fn initialize(
        config: OrchestratorConfig,
        factory: WorkerFactory,
        default_worker_config: WorkerConfig,
        kv: Arc<dyn KvStore>,
    ) -> OrchestratorResult<Self> {
        Self::initialize_with_clock(config, factory, default_worker_config, kv, Arc::new(SystemClock))
    }

    /// Same as [`Orchestrator::initialize`], with an injectable clock so
    /// tests can drive retry/timeout/aging logic deterministically.
    pub fn initialize_with_clock(
        config: OrchestratorConfig,
        factory: WorkerFactory,
        default_worker_config: WorkerConfig,
        kv: Arc<dyn KvStore>,
        clock: Arc<dyn Clock>,
    ) -> OrchestratorResult<Self> {
        config.validate()?;

        let pool = Arc::new(WorkerPool::new(
            factory,
            config.max_agents,
            config.restart_policy.clone(),
            clock.clone(),
        ));
        let strategy = Arc::new(AutoStrategy::new());
        let events = Arc::new(EventBus::new());
        let scheduler = Arc::new(Scheduler::new(pool.clone(), strategy.clone(), events.clone(), clock.clone(), &config));
        let knowledge = Arc::new(KnowledgeStore::new(config.max_knowledge, config.consensus_threshold, clock.clone()));
        let trend = TrendTracker::new(config.autoscaler.trend_window);

        Ok(Self {
            id: Uuid::new_v4(),
            state: std::sync::RwLock::new(OrchestratorState::Ready),
            scheduler,
            pool,
            strategy,
            events,
            knowledge,
            clock,
            kv,
            default_worker_config,
            sequence: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
            background: AsyncMutex::new(Vec::new()),
            trend: AsyncMutex::new(trend),
            overage_since: AsyncMutex::new(None),
            config,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> OrchestratorState {
        *self.state.read().unwrap()
    }

    fn set_state(&self, new: OrchestratorState) {
        *self.state.write().unwrap() = new;
    }

    fn require_state(&self, expected: &[OrchestratorState]) -> OrchestratorResult<OrchestratorState> {
        let current = self.state();
        if expected.contains(&current) {
            Ok(current)
        } else {
            Err(OrchestratorError::InvalidState(format!(
                "expected orchestrator state in {expected:?}, found {current:?}"
            )))
        }
    }

    /// Spawn the scheduler tick, health-check, autoscale, and (if
    /// configured) checkpoint loops. Requires `Arc<Self>` since each loop
    /// outlives this call.
    #[tracing::instrument(skip(self), err)]
    pub async fn start(self: &Arc<Self>) -> OrchestratorResult<()> {
        self.require_state(&[OrchestratorState::Ready])?;
        self.set_state(OrchestratorState::Running);
        info!(orchestrator_id = %self.id, "orchestrator starting");
        self.events.publish(Event::new(EventKind::OrchestratorStarted, "orchestrator"));

        let mut handles = self.background.lock().await;
        handles.push(self.spawn_scheduler_loop());
        handles.push(self.spawn_health_loop());
        handles.push(self.spawn_autoscale_loop());
        if let Some(handle) = self.spawn_checkpoint_loop() {
            handles.push(handle);
        }
        Ok(())
    }

    #[tracing::instrument(skip(self), err)]
    pub fn pause(&self) -> OrchestratorResult<()> {
        self.require_state(&[OrchestratorState::Running])?;
        self.scheduler.pause();
        self.set_state(OrchestratorState::Paused);
        self.events.publish(Event::new(EventKind::OrchestratorPaused, "orchestrator"));
        Ok(())
    }

    #[tracing::instrument(skip(self), err)]
    pub fn resume(&self) -> OrchestratorResult<()> {
        self.require_state(&[OrchestratorState::Paused])?;
        self.scheduler.resume();
        self.set_state(OrchestratorState::Running);
        self.events.publish(Event::new(EventKind::OrchestratorResumed, "orchestrator"));
        Ok(())
    }

    /// Stop accepting new assignments, drain in-flight work up to
    /// `drainTimeout`, checkpoint, cancel the background loops, and
    /// transition to `Completed`.
    #[tracing::instrument(skip(self), err)]
    pub async fn stop(&self) -> OrchestratorResult<()> {
        self.require_state(&[OrchestratorState::Running, OrchestratorState::Paused])?;
        self.set_state(OrchestratorState::Completing);
        self.scheduler.pause();

        let deadline = tokio::time::Instant::now() + self.config.drain_timeout;
        while self.scheduler.backlog().await > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(STOP_POLL_INTERVAL).await;
        }

        self.shutdown.cancel();
        let mut handles = self.background.lock().await;
        for handle in handles.drain(..) {
            let _ = handle.await;
        }
        drop(handles);

        if let Err(err) = self.checkpoint().await {
            warn!(error = %err, "final checkpoint on stop failed");
        }

        self.set_state(OrchestratorState::Completed);
        info!(orchestrator_id = %self.id, "orchestrator stopped");
        self.events.publish(Event::new(EventKind::OrchestratorStopped, "orchestrator"));
        Ok(())
    }

    fn spawn_scheduler_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(this.config.tick_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let scheduler = this.scheduler.clone();
                        let outcome = std::panic::AssertUnwindSafe(async move { scheduler.tick().await })
                            .catch_unwind()
                            .await;
                        if outcome.is_err() {
                            this.report_internal_fault("scheduler tick panicked");
                        }
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
        })
    }

    fn spawn_health_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(this.config.health_check_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        this.run_health_pass().await;
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
        })
    }

    async fn run_health_pass(&self) {
        for outcome in self.pool.health_check_pass(HEALTH_PROBE_TIMEOUT).await {
            self.emit_health_outcome("health", outcome);
        }
        for worker_id in self.pool.run_due_restarts().await {
            self.events.publish(Event::new(EventKind::WorkerRestarted, "health").with_worker(worker_id));
        }
    }

    fn emit_health_outcome(&self, source: &'static str, outcome: HealthOutcome) {
        match outcome {
            HealthOutcome::RestartScheduled { worker_id, delay } => {
                self.events.publish(
                    Event::new(EventKind::WorkerFailed, source)
                        .with_worker(worker_id)
                        .with_payload(json!({"restart_delay_ms": delay.as_millis()})),
                );
            }
            HealthOutcome::Destroyed { worker_id } => {
                self.knowledge.unregister_worker(&worker_id);
                self.events.publish(Event::new(EventKind::WorkerTerminated, source).with_worker(worker_id));
            }
        }
    }

    fn spawn_autoscale_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(this.config.autoscale_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        this.autoscale_tick().await;
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
        })
    }

    async fn autoscale_tick(&self) {
        let active = self.pool.active_count().await;
        if active < self.config.min_agents {
            let deficit = self.config.min_agents - active;
            if let Ok(ids) = self.pool.scale_up(deficit, self.default_worker_config.clone()).await {
                self.register_new_workers(&ids);
                self.events.publish(
                    Event::new(EventKind::ScaleUp, "autoscaler")
                        .with_payload(json!({"n": ids.len(), "reason": "below min_agents floor"})),
                );
            }
        }

        let metrics = PoolMetrics {
            utilization: self.pool.utilization().await,
            queue_depth: self.scheduler.queue_depth().await,
            backlog: self.scheduler.backlog().await,
        };

        let trend = {
            let infos = self.pool.all_worker_infos().await;
            let (completed, failed) = infos.iter().fold((0u64, 0u64), |(c, f), w| {
                (c + w.metrics.tasks_completed(), f + w.metrics.tasks_failed())
            });
            let success_rate = if completed + failed == 0 {
                1.0
            } else {
                completed as f64 / (completed + failed) as f64
            };
            let mut tracker = self.trend.lock().await;
            tracker.record(success_rate);
            tracker.trend()
        };

        match self.strategy.should_scale(metrics, trend, &self.config.autoscaler) {
            ScaleDecision::Up { n, reason } => {
                let room = self.config.max_agents.saturating_sub(self.pool.total_count().await);
                let n = (n as usize).min(room);
                if n > 0 {
                    if let Ok(ids) = self.pool.scale_up(n, self.default_worker_config.clone()).await {
                        self.register_new_workers(&ids);
                        self.events.publish(
                            Event::new(EventKind::ScaleUp, "autoscaler").with_payload(json!({"n": ids.len(), "reason": reason})),
                        );
                    }
                }
            }
            ScaleDecision::Down { n, reason } => {
                let floor = self.pool.active_count().await.saturating_sub(self.config.min_agents);
                let n = (n as usize).min(floor);
                if n > 0 {
                    let removed = self.pool.scale_down(n, false).await;
                    for id in &removed {
                        self.knowledge.unregister_worker(id);
                    }
                    if !removed.is_empty() {
                        self.events.publish(
                            Event::new(EventKind::ScaleDown, "autoscaler")
                                .with_payload(json!({"n": removed.len(), "reason": reason})),
                        );
                    }
                }
            }
            ScaleDecision::None => {}
        }

        self.check_resource_overage().await;
        self.check_starvation(&metrics).await;
    }

    /// §4.1's fatal condition: cumulative reserved resources over
    /// `resourceHardCap` continuously for longer than
    /// `sustainedOverageWindow` transitions `Running -> Failed`.
    async fn check_resource_overage(&self) {
        let reserved = self.pool.reserved_resources().await;
        let cap = &self.config.resource_hard_cap;
        let over = reserved.cpu > cap.cpu || reserved.memory > cap.memory;

        let mut since = self.overage_since.lock().await;
        if over {
            let started = *since.get_or_insert_with(|| self.clock.now());
            let window = chrono::Duration::from_std(self.config.sustained_overage_window).unwrap_or_default();
            if self.clock.now() - started >= window {
                drop(since);
                self.fail("sustained resource overage past resource_hard_cap").await;
            }
        } else {
            *since = None;
        }
    }

    /// No functioning worker can make progress and the pool is already at
    /// `max_agents`. Always raises `AlertTriggered`; fatal only if
    /// `fail_on_starvation` is set.
    async fn check_starvation(&self, metrics: &PoolMetrics) {
        let active = self.pool.active_count().await;
        let at_capacity = self.pool.total_count().await >= self.config.max_agents;
        if active == 0 && metrics.backlog > 0 && at_capacity {
            self.events.publish(
                Event::new(EventKind::AlertTriggered, "autoscaler").with_payload(json!({"condition": "starvation"})),
            );
            if self.config.fail_on_starvation {
                self.fail("starvation: no workers available and pool at max_agents").await;
            }
        }
    }

    async fn fail(&self, reason: &str) {
        if matches!(self.state(), OrchestratorState::Running | OrchestratorState::Paused) {
            self.set_state(OrchestratorState::Failed);
            self.events
                .publish(Event::new(EventKind::OrchestratorFailed, "orchestrator").with_payload(json!({"reason": reason})));
            self.shutdown.cancel();
        }
    }

    fn spawn_checkpoint_loop(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let period = self.config.checkpoint_interval?;
        let this = self.clone();
        let shutdown = self.shutdown.clone();
        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(err) = this.checkpoint().await {
                            warn!(error = %err, "periodic checkpoint failed");
                        }
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
        }))
    }

    fn report_internal_fault(&self, message: &str) {
        let correlation_id = Uuid::new_v4();
        warn!(%correlation_id, message, "subcomponent panic caught, orchestrator staying up");
        self.events.publish(
            Event::new(EventKind::Internal, "orchestrator")
                .with_payload(json!({"correlation_id": correlation_id.to_string(), "message": message})),
        );
    }

    fn register_new_workers(&self, ids: &[WorkerId]) {
        for id in ids {
            self.knowledge.register_worker(id.clone());
            self.events.publish(Event::new(EventKind::WorkerSpawned, "orchestrator").with_worker(id.clone()));
        }
    }

    /// Submit a task. Rejected if the orchestrator isn't running, or if no
    /// worker in the current pool inventory could ever satisfy the task's
    /// capability and resource requirements -- autoscaling is opaque here
    /// (the factory may create other shapes later), so this only checks
    /// what's already registered.
    #[tracing::instrument(skip(self, task), fields(task_name = %task.name), err)]
    pub async fn submit(&self, task: Task) -> OrchestratorResult<TaskId> {
        self.require_state(&[OrchestratorState::Running])?;
        if !self.pool.can_satisfy(&task.required_capabilities, &task.resources).await {
            return Err(OrchestratorError::InvalidArgument(format!(
                "no worker in the pool can satisfy task {}'s capability/resource requirements",
                task.id
            )));
        }
        self.scheduler.submit(task).await
    }

    #[tracing::instrument(skip(self), err)]
    pub async fn status(&self, id: &str) -> OrchestratorResult<TaskStatus> {
        self.scheduler.status(id).await
    }

    #[tracing::instrument(skip(self), err)]
    pub async fn result(&self, id: &str) -> OrchestratorResult<Option<TaskResult>> {
        self.scheduler.result(id).await
    }

    /// Cancel `id`. If it is currently assigned to a worker, schedule a
    /// check after `gracefulCancelWindow`: if the worker still hasn't
    /// relinquished the task by then, it is marked unresponsive and the
    /// restart policy takes over.
    #[tracing::instrument(skip(self), err)]
    pub async fn cancel(&self, id: &str) -> OrchestratorResult<()> {
        let task_before = self.scheduler.task(id).await;
        self.scheduler.cancel(id).await?;
        if let Some(worker_id) = task_before.and_then(|t| t.assigned_worker) {
            self.spawn_unresponsive_check(id.to_string(), worker_id);
        }
        Ok(())
    }

    fn spawn_unresponsive_check(&self, task_id: TaskId, worker_id: WorkerId) {
        let scheduler = self.scheduler.clone();
        let pool = self.pool.clone();
        let events = self.events.clone();
        let knowledge = self.knowledge.clone();
        let window = self.config.graceful_cancel_window;
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let still_holding_worker = scheduler
                .task(&task_id)
                .await
                .is_some_and(|t| !t.status.is_terminal() && t.assigned_worker.as_deref() == Some(worker_id.as_str()));
            if !still_holding_worker {
                return;
            }
            if let Some(outcome) = pool.mark_unresponsive(&worker_id).await {
                match outcome {
                    HealthOutcome::RestartScheduled { worker_id, delay } => {
                        events.publish(
                            Event::new(EventKind::WorkerFailed, "cancel")
                                .with_worker(worker_id)
                                .with_payload(json!({"restart_delay_ms": delay.as_millis()})),
                        );
                    }
                    HealthOutcome::Destroyed { worker_id } => {
                        knowledge.unregister_worker(&worker_id);
                        events.publish(Event::new(EventKind::WorkerTerminated, "cancel").with_worker(worker_id));
                    }
                }
            }
        });
    }

    #[tracing::instrument(skip(self), err)]
    pub async fn scale_up(&self, n: usize) -> OrchestratorResult<Vec<WorkerId>> {
        self.scale_up_with_config(n, self.default_worker_config.clone()).await
    }

    #[tracing::instrument(skip(self, config), err)]
    pub async fn scale_up_with_config(&self, n: usize, config: WorkerConfig) -> OrchestratorResult<Vec<WorkerId>> {
        let ids = self.pool.scale_up(n, config).await?;
        self.register_new_workers(&ids);
        self.events
            .publish(Event::new(EventKind::ScaleUp, "orchestrator").with_payload(json!({"n": ids.len()})));
        Ok(ids)
    }

    #[tracing::instrument(skip(self))]
    pub async fn scale_down(&self, n: usize) -> Vec<WorkerId> {
        let removed = self.pool.scale_down(n, false).await;
        for id in &removed {
            self.knowledge.unregister_worker(id);
        }
        if !removed.is_empty() {
            self.events
                .publish(Event::new(EventKind::ScaleDown, "orchestrator").with_payload(json!({"n": removed.len()})));
        }
        removed
    }

    pub async fn worker_count(&self) -> usize {
        self.pool.active_count().await
    }

    #[tracing::instrument(skip(self))]
    pub fn subscribe(&self, kinds: Option<Vec<EventKind>>) -> EventStream {
        self.events.subscribe(kinds)
    }

    pub fn knowledge(&self) -> &Arc<KnowledgeStore> {
        &self.knowledge
    }

    /// Snapshot every task and worker, persist it through the injected
    /// `KvStore`, and return the checkpoint's id.
    #[tracing::instrument(skip(self), err)]
    pub async fn checkpoint(&self) -> OrchestratorResult<Uuid> {
        let tasks = self.scheduler.all_tasks().await;

        let mut dependents_of: HashMap<TaskId, Vec<TaskId>> = HashMap::new();
        for task in &tasks {
            for dependency in &task.dependencies {
                dependents_of.entry(dependency.clone()).or_default().push(task.id.clone());
            }
        }

        let task_snapshots = tasks
            .iter()
            .map(|task| {
                let full = serde_json::to_value(task).unwrap_or(serde_json::Value::Null);
                TaskSnapshot {
                    id: task.id.clone(),
                    name: task.name.clone(),
                    task_type: task.task_type.to_string(),
                    priority: task.priority.to_string(),
                    status: task.status.to_string(),
                    attempts: task.attempts,
                    dependencies: task.dependencies.clone(),
                    dependents: dependents_of.get(&task.id).cloned().unwrap_or_default(),
                    assigned_worker: task.assigned_worker.clone(),
                    started_at: task.started_at,
                    ended_at: task.ended_at,
                    input: task.input.clone(),
                    full,
                }
            })
            .collect();

        let worker_snapshots = self
            .pool
            .all_worker_infos()
            .await
            .iter()
            .map(|worker| WorkerSnapshot {
                id: worker.id.clone(),
                worker_type: worker.config.worker_type.to_string(),
                capabilities: worker.config.capabilities.iter().cloned().collect(),
                restart_count: worker.restart_count,
                tasks_completed: worker.metrics.tasks_completed(),
                tasks_failed: worker.metrics.tasks_failed(),
                config: serde_json::to_value(&worker.config).unwrap_or(serde_json::Value::Null),
            })
            .collect();

        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let checkpoint = Checkpoint {
            id: Uuid::new_v4(),
            orchestrator_id: self.id,
            state: self.state().to_snapshot(),
            created_at: self.clock.now(),
            tasks: task_snapshots,
            workers: worker_snapshots,
            sequence,
        };

        checkpoint
            .save(self.kv.as_ref())
            .await
            .map_err(|err| OrchestratorError::internal(format!("checkpoint save failed: {err}")))?;

        self.events.publish(
            Event::new(EventKind::CheckpointSaved, "orchestrator")
                .with_payload(json!({"checkpoint_id": checkpoint.id.to_string(), "sequence": sequence})),
        );
        Ok(checkpoint.id)
    }

    /// Restore a checkpoint into a freshly initialized (`Ready`)
    /// orchestrator. Rejects a checkpoint whose sequence number is not
    /// strictly newer than this orchestrator's current sequence.
    #[tracing::instrument(skip(self), err)]
    pub async fn restore(&self, checkpoint_id: Uuid) -> OrchestratorResult<()> {
        self.require_state(&[OrchestratorState::Ready])?;

        let checkpoint = Checkpoint::load(self.kv.as_ref(), checkpoint_id)
            .await
            .map_err(|err| OrchestratorError::NotFound(format!("checkpoint {checkpoint_id}: {err}")))?;

        let current_sequence = self.sequence.load(Ordering::SeqCst);
        if !checkpoint.is_restorable_over(current_sequence) {
            return Err(OrchestratorError::InvalidState(format!(
                "checkpoint sequence {} is not newer than current sequence {current_sequence}",
                checkpoint.sequence
            )));
        }

        let tasks: Vec<Task> = checkpoint
            .tasks
            .iter()
            .map(|snapshot| serde_json::from_value(snapshot.full.clone()))
            .collect::<Result<_, _>>()
            .map_err(|err| OrchestratorError::internal(format!("corrupt task snapshot in checkpoint: {err}")))?;
        self.scheduler.restore_tasks(tasks).await?;

        for worker in &checkpoint.workers {
            let config: WorkerConfig = serde_json::from_value(worker.config.clone())
                .map_err(|err| OrchestratorError::internal(format!("corrupt worker config in checkpoint: {err}")))?;
            let mut metrics = WorkerMetrics::default();
            metrics.overall.completed = worker.tasks_completed;
            metrics.overall.failed = worker.tasks_failed;
            let id = self.pool.restore_worker(config, worker.restart_count, metrics).await?;
            self.knowledge.register_worker(id);
        }

        self.sequence.store(checkpoint.sequence, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::types::{TaskPriority, TaskType, WorkerType};
    use crate::worker::{ExecutionOutcome, Worker};
    use async_trait::async_trait;
    use orcmesh_kv::MemoryKv;
    use std::collections::HashSet;

    struct EchoWorker;

    #[async_trait]
    impl Worker for EchoWorker {
        fn worker_type(&self) -> WorkerType {
            WorkerType::Execution
        }
        fn capabilities(&self) -> &HashSet<String> {
            static EMPTY: std::sync::OnceLock<HashSet<String>> = std::sync::OnceLock::new();
            EMPTY.get_or_init(HashSet::new)
        }
        async fn execute(&self, _task: &Task, _cancel: CancellationToken) -> ExecutionOutcome {
            ExecutionOutcome::success(serde_json::json!({"ok": true}))
        }
    }

    fn echo_factory() -> WorkerFactory {
        Arc::new(|_cfg: &WorkerConfig| Arc::new(EchoWorker) as Arc<dyn Worker>)
    }

    fn fresh(kv: Arc<dyn KvStore>) -> (Orchestrator, Arc<FakeClock>) {
        let start = chrono::DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let clock = Arc::new(FakeClock::new(start));
        let orchestrator = Orchestrator::initialize_with_clock(
            OrchestratorConfig::default(),
            echo_factory(),
            WorkerConfig::new(WorkerType::Execution),
            kv,
            clock.clone(),
        )
        .unwrap();
        (orchestrator, clock)
    }

    #[tokio::test]
    async fn initialize_starts_ready() {
        let (orchestrator, _clock) = fresh(Arc::new(MemoryKv::new()));
        assert_eq!(orchestrator.state(), OrchestratorState::Ready);
    }

    #[tokio::test]
    async fn start_transitions_to_running_and_spawns_loops() {
        let (orchestrator, _clock) = fresh(Arc::new(MemoryKv::new()));
        let orchestrator = Arc::new(orchestrator);
        orchestrator.start().await.unwrap();
        assert_eq!(orchestrator.state(), OrchestratorState::Running);
        orchestrator.stop().await.unwrap();
        assert_eq!(orchestrator.state(), OrchestratorState::Completed);
    }

    #[tokio::test]
    async fn submit_rejects_before_start() {
        let (orchestrator, _clock) = fresh(Arc::new(MemoryKv::new()));
        let task = Task::new("t", TaskType::Process, TaskPriority::Medium);
        let err = orchestrator.submit(task).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidState(_)));
    }

    #[tokio::test]
    async fn submit_rejects_unsatisfiable_capability() {
        let (orchestrator, _clock) = fresh(Arc::new(MemoryKv::new()));
        let orchestrator = Arc::new(orchestrator);
        orchestrator.start().await.unwrap();

        let mut task = Task::new("t", TaskType::Process, TaskPriority::Medium);
        task.required_capabilities = HashSet::from(["gpu".to_string()]);
        let err = orchestrator.submit(task).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidArgument(_)));
        orchestrator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn pause_blocks_assignment_then_resume_allows_it() {
        let (orchestrator, _clock) = fresh(Arc::new(MemoryKv::new()));
        let orchestrator = Arc::new(orchestrator);
        orchestrator.start().await.unwrap();
        orchestrator.scale_up(1).await.unwrap();
        orchestrator.pause().unwrap();
        assert_eq!(orchestrator.state(), OrchestratorState::Paused);
        orchestrator.resume().unwrap();
        assert_eq!(orchestrator.state(), OrchestratorState::Running);
        orchestrator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn scale_up_registers_workers_in_knowledge_store() {
        let (orchestrator, _clock) = fresh(Arc::new(MemoryKv::new()));
        let orchestrator = Arc::new(orchestrator);
        orchestrator.start().await.unwrap();
        let ids = orchestrator.scale_up(2).await.unwrap();
        assert_eq!(ids.len(), 2);
        orchestrator.knowledge().share(ids[0].clone(), "k", serde_json::json!(1), None).unwrap();
        assert_eq!(orchestrator.knowledge().get("k"), Some(serde_json::json!(1)));
        orchestrator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn checkpoint_then_restore_round_trips_task_status() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let (source, _clock) = fresh(kv.clone());
        let source = Arc::new(source);
        source.start().await.unwrap();
        source.scale_up(1).await.unwrap();

        let task = Task::new("roundtrip", TaskType::Process, TaskPriority::Medium);
        let task_id = source.submit(task).await.unwrap();

        // Give the scheduler tick loop a chance to assign and complete it.
        for _ in 0..50 {
            if source.status(&task_id).await.unwrap() == TaskStatus::Completed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(source.status(&task_id).await.unwrap(), TaskStatus::Completed);

        let checkpoint_id = source.checkpoint().await.unwrap();
        source.stop().await.unwrap();

        let (target, _clock2) = fresh(kv.clone());
        target.restore(checkpoint_id).await.unwrap();
        assert_eq!(target.status(&task_id).await.unwrap(), TaskStatus::Completed);
    }

    #[tokio::test]
    async fn restore_rejects_checkpoint_not_newer_than_current_sequence() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let (source, _clock) = fresh(kv.clone());
        let source = Arc::new(source);
        source.start().await.unwrap();
        let checkpoint_id = source.checkpoint().await.unwrap();
        source.stop().await.unwrap();

        let (target, _clock2) = fresh(kv.clone());
        target.restore(checkpoint_id).await.unwrap();
        let err = target.restore(checkpoint_id).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidState(_)));
    }
}
