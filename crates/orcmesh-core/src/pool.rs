//! Worker Pool: creates/destroys workers, enforces restart policy, and
//! aggregates resource use. Owns exactly one lock over the worker map so
//! no operation here ever holds two locks at once.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::types::{ResourceEnvelope, Task, TaskId, TaskType};
use crate::worker::{RestartPolicy, Worker, WorkerConfig, WorkerHandle, WorkerMetrics};
use crate::types::WorkerId;
use crate::worker::WorkerState;

/// Builds a fresh worker instance for a given [`WorkerConfig`]. Invoked on
/// scale-up and on restart, so a pool can recreate a worker without the
/// caller re-supplying it each time.
pub type WorkerFactory = Arc<dyn Fn(&WorkerConfig) -> Arc<dyn Worker> + Send + Sync>;

/// A read-only snapshot of one worker's pool-visible state, used by the
/// Scheduler and Strategy without holding the pool's lock.
#[derive(Debug, Clone)]
pub struct WorkerInfo {
    pub id: WorkerId,
    pub config: WorkerConfig,
    pub state: WorkerState,
    pub current_task_id: Option<TaskId>,
    pub restart_count: u32,
    pub metrics: WorkerMetrics,
}

/// Outcome of a worker's execution, reported back to the pool via
/// [`WorkerPool::release`].
pub enum TaskOutcome {
    Completed { task_type: TaskType, duration: Duration },
    Failed { task_type: TaskType, error: String },
}

/// Pending restart, scheduled by the health loop and driven to completion
/// by a subsequent `run_due_restarts` call once its delay has elapsed.
struct PendingRestart {
    worker_id: WorkerId,
    due_at: DateTime<Utc>,
}

struct Pool {
    workers: HashMap<WorkerId, WorkerHandle>,
    pending_restarts: Vec<PendingRestart>,
}

/// Creates/destroys workers, tracks lifecycle and resource use, and applies
/// the restart policy after health-check failures.
pub struct WorkerPool {
    inner: RwLock<Pool>,
    factory: WorkerFactory,
    max_agents: usize,
    restart_policy: RestartPolicy,
    clock: Arc<dyn Clock>,
}

/// A worker restarted or destroyed by the health loop, for event emission.
pub enum HealthOutcome {
    RestartScheduled { worker_id: WorkerId, delay: Duration },
    Destroyed { worker_id: WorkerId },
}

impl WorkerPool {
    pub fn new(factory: WorkerFactory, max_agents: usize, restart_policy: RestartPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: RwLock::new(Pool {
                workers: HashMap::new(),
                pending_restarts: Vec::new(),
            }),
            factory,
            max_agents,
            restart_policy,
            clock,
        }
    }

    /// Create `n` new workers from `config`. Rejected wholesale if it would
    /// exceed `max_agents`, or if `config`'s reservation alone exceeds the
    /// per-worker cap it declares (a self-contradictory config).
    pub async fn scale_up(&self, n: usize, config: WorkerConfig) -> OrchestratorResult<Vec<WorkerId>> {
        if config.resource_cap.cpu < 0.0 || config.resource_cap.memory < 0.0 {
            return Err(OrchestratorError::InvalidArgument(
                "worker resource cap must be non-negative".into(),
            ));
        }
        let mut pool = self.inner.write().await;
        if pool.workers.len() + n > self.max_agents {
            return Err(OrchestratorError::ResourceExhausted {
                requested: (pool.workers.len() + n) as f64,
                available: self.max_agents as f64,
            });
        }
        let mut ids = Vec::with_capacity(n);
        for _ in 0..n {
            let worker = (self.factory)(&config);
            let mut handle = WorkerHandle::new(config.clone(), worker);
            handle.state = WorkerState::Idle;
            handle.last_health_at = Some(self.clock.now());
            let id = handle.id.clone();
            pool.workers.insert(id.clone(), handle);
            ids.push(id);
        }
        Ok(ids)
    }

    /// Destroy up to `n` workers. Prefers the oldest-idle workers first and
    /// never touches a `Busy` worker unless `force` is set.
    pub async fn scale_down(&self, n: usize, force: bool) -> Vec<WorkerId> {
        let mut pool = self.inner.write().await;
        let mut candidates: Vec<WorkerId> = pool
            .workers
            .values()
            .filter(|w| force || w.state == WorkerState::Idle)
            .map(|w| w.id.clone())
            .collect();
        // HashMap iteration order is not insertion order; within the
        // idle-preference set there is no further recency signal available
        // without extra bookkeeping, so ids are sorted for determinism.
        candidates.sort();
        candidates.truncate(n);
        for id in &candidates {
            pool.workers.remove(id);
        }
        candidates
    }

    /// Ids of every worker currently `Idle`, snapshotted under the lock.
    pub async fn idle_worker_ids(&self) -> Vec<WorkerId> {
        self.inner
            .read()
            .await
            .workers
            .values()
            .filter(|w| w.state == WorkerState::Idle)
            .map(|w| w.id.clone())
            .collect()
    }

    /// Full info snapshots for every idle worker -- the input the Strategy
    /// is handed so it can remain pure with respect to pool state.
    pub async fn idle_worker_infos(&self) -> Vec<WorkerInfo> {
        self.inner
            .read()
            .await
            .workers
            .values()
            .filter(|w| w.state == WorkerState::Idle)
            .map(Self::info_of)
            .collect()
    }

    pub async fn all_worker_infos(&self) -> Vec<WorkerInfo> {
        self.inner.read().await.workers.values().map(Self::info_of).collect()
    }

    fn info_of(handle: &WorkerHandle) -> WorkerInfo {
        WorkerInfo {
            id: handle.id.clone(),
            config: handle.config.clone(),
            state: handle.state,
            current_task_id: handle.current_task_id.clone(),
            restart_count: handle.restart_count,
            metrics: handle.metrics.clone(),
        }
    }

    pub async fn active_count(&self) -> usize {
        self.inner
            .read()
            .await
            .workers
            .values()
            .filter(|w| !matches!(w.state, WorkerState::Terminated | WorkerState::Terminating))
            .count()
    }

    pub async fn total_count(&self) -> usize {
        self.inner.read().await.workers.len()
    }

    /// Whether any registered worker could ever satisfy `required`
    /// capabilities and `resources` -- used by `Submit` to decide whether a
    /// task's requirements are satisfiable by the current inventory.
    pub async fn can_satisfy(&self, required: &std::collections::HashSet<String>, resources: &ResourceEnvelope) -> bool {
        self.inner.read().await.workers.values().any(|w| {
            required.is_subset(&w.config.capabilities) && resources.fits_within(&w.config.resource_cap)
        })
    }

    /// Mark `worker_id` `Busy` running `task_id`. Fails if the worker is
    /// absent or not `Idle` (e.g. a race with scale-down or another
    /// assignment).
    pub async fn assign(&self, worker_id: &str, task_id: &TaskId) -> OrchestratorResult<()> {
        let mut pool = self.inner.write().await;
        let handle = pool
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("worker {worker_id}")))?;
        if handle.state != WorkerState::Idle {
            return Err(OrchestratorError::InvalidState(format!(
                "worker {worker_id} is not idle"
            )));
        }
        handle.state = WorkerState::Busy;
        handle.current_task_id = Some(task_id.clone());
        Ok(())
    }

    /// Run `task` on `worker_id`, recording the outcome and returning the
    /// worker to `Idle`. The caller supplies `cancel` so the Scheduler
    /// retains ownership of the per-task cancellation token.
    ///
    /// Clones the worker's `Arc` out from under the lock before calling
    /// `execute`, so the pool lock is never held across the await -- other
    /// workers' assignments and the health loop are not blocked by a
    /// long-running task.
    pub async fn execute(&self, worker_id: &str, task: &Task, cancel: CancellationToken) -> OrchestratorResult<crate::worker::ExecutionOutcome> {
        let worker = {
            let pool = self.inner.read().await;
            let handle = pool
                .workers
                .get(worker_id)
                .ok_or_else(|| OrchestratorError::NotFound(format!("worker {worker_id}")))?;
            handle.worker.clone()
        };
        Ok(worker.execute(task, cancel).await)
    }

    /// Record a finished task's outcome and return the worker to `Idle`.
    pub async fn release(&self, worker_id: &str, outcome: TaskOutcome) -> OrchestratorResult<()> {
        let mut pool = self.inner.write().await;
        let handle = pool
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("worker {worker_id}")))?;
        handle.current_task_id = None;
        handle.state = WorkerState::Idle;
        match outcome {
            TaskOutcome::Completed { task_type, duration } => {
                handle.metrics.record_completion(task_type, duration);
            }
            TaskOutcome::Failed { task_type, error } => {
                handle.metrics.record_failure(task_type, error);
            }
        }
        Ok(())
    }

    /// Recreate a worker from a checkpointed snapshot: a fresh instance from
    /// `config`, but with its prior `restart_count`/`metrics` preserved so
    /// restart backoff and adaptive assignment keep their history across a
    /// restore.
    pub async fn restore_worker(&self, config: WorkerConfig, restart_count: u32, metrics: WorkerMetrics) -> OrchestratorResult<WorkerId> {
        let mut pool = self.inner.write().await;
        if pool.workers.len() + 1 > self.max_agents {
            return Err(OrchestratorError::ResourceExhausted {
                requested: (pool.workers.len() + 1) as f64,
                available: self.max_agents as f64,
            });
        }
        let worker = (self.factory)(&config);
        let mut handle = WorkerHandle::new(config, worker);
        handle.state = WorkerState::Idle;
        handle.restart_count = restart_count;
        handle.metrics = metrics;
        handle.last_health_at = Some(self.clock.now());
        let id = handle.id.clone();
        pool.workers.insert(id.clone(), handle);
        Ok(id)
    }

    /// Mark a worker `Unresponsive` (modeled as `Error`) after it failed to
    /// honor a cancellation within the graceful window, then apply the same
    /// restart-or-destroy decision a health-check failure would.
    pub async fn mark_unresponsive(&self, worker_id: &str) -> Option<HealthOutcome> {
        {
            let mut pool = self.inner.write().await;
            let handle = pool.workers.get_mut(worker_id)?;
            handle.state = WorkerState::Error;
        }
        self.restart_or_destroy(worker_id).await
    }

    /// Shared restart-policy decision: schedule a backed-off restart if the
    /// worker's budget allows it, otherwise destroy it outright. Used by
    /// both the health loop and unresponsive-worker handling.
    async fn restart_or_destroy(&self, worker_id: &str) -> Option<HealthOutcome> {
        let mut pool = self.inner.write().await;
        let handle = pool.workers.get(worker_id)?;
        if handle.restart_count < self.restart_policy.max_restarts {
            let delay = self.restart_policy.delay_for(handle.restart_count);
            let due_at = self.clock.now() + chrono::Duration::from_std(delay).unwrap_or_default();
            pool.pending_restarts.push(PendingRestart {
                worker_id: worker_id.to_string(),
                due_at,
            });
            Some(HealthOutcome::RestartScheduled {
                worker_id: worker_id.to_string(),
                delay,
            })
        } else {
            pool.workers.remove(worker_id);
            Some(HealthOutcome::Destroyed {
                worker_id: worker_id.to_string(),
            })
        }
    }

    /// Run one health-check pass over every worker, scheduling restarts or
    /// destroying workers whose restart budget is exhausted.
    pub async fn health_check_pass(&self, probe_timeout: Duration) -> Vec<HealthOutcome> {
        let worker_ids: Vec<WorkerId> = {
            let pool = self.inner.read().await;
            pool.workers.keys().cloned().collect()
        };

        let mut outcomes = Vec::new();
        for id in worker_ids {
            let healthy = {
                let pool = self.inner.read().await;
                let Some(handle) = pool.workers.get(&id) else {
                    continue;
                };
                if handle.state == WorkerState::Busy || handle.state == WorkerState::Terminated {
                    continue;
                }
                match tokio::time::timeout(probe_timeout, handle.worker.health()).await {
                    Ok(ok) => ok,
                    Err(_) => false,
                }
            };

            if healthy {
                let mut pool = self.inner.write().await;
                if let Some(handle) = pool.workers.get_mut(&id) {
                    handle.last_health_at = Some(self.clock.now());
                    if handle.state == WorkerState::Error {
                        handle.state = WorkerState::Idle;
                    }
                }
                continue;
            }

            {
                let mut pool = self.inner.write().await;
                let Some(handle) = pool.workers.get_mut(&id) else {
                    continue;
                };
                handle.state = WorkerState::Error;
            }
            if let Some(outcome) = self.restart_or_destroy(&id).await {
                outcomes.push(outcome);
            }
        }
        outcomes
    }

    /// Drive any restarts whose delay has elapsed: rebuild the worker
    /// instance from its original config and return it to `Idle`.
    pub async fn run_due_restarts(&self) -> Vec<WorkerId> {
        let now = self.clock.now();
        let mut pool = self.inner.write().await;
        let (due, pending): (Vec<_>, Vec<_>) = pool
            .pending_restarts
            .drain(..)
            .partition(|r| r.due_at <= now);
        pool.pending_restarts = pending;

        let mut restarted = Vec::new();
        for restart in due {
            let Some(handle) = pool.workers.get_mut(&restart.worker_id) else {
                continue;
            };
            handle.worker = (self.factory)(&handle.config);
            handle.state = WorkerState::Idle;
            handle.restart_count += 1;
            handle.last_health_at = Some(now);
            restarted.push(restart.worker_id.clone());
        }
        restarted
    }

    /// Aggregate CPU/memory currently reserved by `Busy` workers, for the
    /// sustained-overage check in `§4.1`.
    pub async fn reserved_resources(&self) -> ResourceEnvelope {
        let pool = self.inner.read().await;
        pool.workers
            .values()
            .filter(|w| w.state == WorkerState::Busy)
            .fold(ResourceEnvelope::ZERO, |mut acc, w| {
                acc.cpu += w.config.resource_cap.cpu;
                acc.memory += w.config.resource_cap.memory;
                acc
            })
    }

    /// Fraction of active (non-terminated) workers currently `Busy`.
    pub async fn utilization(&self) -> f64 {
        let pool = self.inner.read().await;
        let active: Vec<_> = pool
            .workers
            .values()
            .filter(|w| !matches!(w.state, WorkerState::Terminated | WorkerState::Terminating))
            .collect();
        if active.is_empty() {
            return 0.0;
        }
        let busy = active.iter().filter(|w| w.state == WorkerState::Busy).count();
        busy as f64 / active.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::{ExecutionOutcome, WorkerType};
    use async_trait::async_trait;
    use std::collections::HashSet;

    struct NoopWorker;

    #[async_trait]
    impl Worker for NoopWorker {
        fn worker_type(&self) -> WorkerType {
            WorkerType::Execution
        }
        fn capabilities(&self) -> &HashSet<String> {
            static EMPTY: std::sync::OnceLock<HashSet<String>> = std::sync::OnceLock::new();
            EMPTY.get_or_init(HashSet::new)
        }
        async fn execute(&self, _task: &Task, _cancel: CancellationToken) -> ExecutionOutcome {
            ExecutionOutcome::success(serde_json::json!({}))
        }
        async fn health(&self) -> bool {
            true
        }
    }

    fn factory() -> WorkerFactory {
        Arc::new(|_cfg: &WorkerConfig| Arc::new(NoopWorker) as Arc<dyn Worker>)
    }

    fn clock() -> Arc<dyn Clock> {
        Arc::new(crate::clock::SystemClock)
    }

    #[tokio::test]
    async fn scale_up_creates_idle_workers() {
        let pool = WorkerPool::new(factory(), 5, RestartPolicy::default(), clock());
        let ids = pool.scale_up(3, WorkerConfig::new(WorkerType::Execution)).await.unwrap();
        assert_eq!(ids.len(), 3);
        assert_eq!(pool.idle_worker_ids().await.len(), 3);
    }

    #[tokio::test]
    async fn scale_up_rejects_over_max_agents() {
        let pool = WorkerPool::new(factory(), 2, RestartPolicy::default(), clock());
        let err = pool
            .scale_up(3, WorkerConfig::new(WorkerType::Execution))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::ResourceExhausted { .. }));
    }

    #[tokio::test]
    async fn scale_down_never_touches_busy_without_force() {
        let pool = WorkerPool::new(factory(), 5, RestartPolicy::default(), clock());
        let ids = pool.scale_up(2, WorkerConfig::new(WorkerType::Execution)).await.unwrap();
        pool.assign(&ids[0], &"t1".to_string()).await.unwrap();

        let removed = pool.scale_down(5, false).await;
        assert_eq!(removed, vec![ids[1].clone()]);
        assert_eq!(pool.total_count().await, 1);
    }

    #[tokio::test]
    async fn assign_requires_idle_worker() {
        let pool = WorkerPool::new(factory(), 5, RestartPolicy::default(), clock());
        let ids = pool.scale_up(1, WorkerConfig::new(WorkerType::Execution)).await.unwrap();
        pool.assign(&ids[0], &"t1".to_string()).await.unwrap();
        let err = pool.assign(&ids[0], &"t2".to_string()).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidState(_)));
    }

    #[tokio::test]
    async fn release_returns_worker_to_idle_and_records_metrics() {
        let pool = WorkerPool::new(factory(), 5, RestartPolicy::default(), clock());
        let ids = pool.scale_up(1, WorkerConfig::new(WorkerType::Execution)).await.unwrap();
        pool.assign(&ids[0], &"t1".to_string()).await.unwrap();
        pool.release(
            &ids[0],
            TaskOutcome::Completed {
                task_type: TaskType::Process,
                duration: Duration::from_millis(5),
            },
        )
        .await
        .unwrap();

        let infos = pool.idle_worker_infos().await;
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].metrics.tasks_completed(), 1);
    }

    #[tokio::test]
    async fn utilization_reflects_busy_fraction() {
        let pool = WorkerPool::new(factory(), 5, RestartPolicy::default(), clock());
        let ids = pool.scale_up(2, WorkerConfig::new(WorkerType::Execution)).await.unwrap();
        assert_eq!(pool.utilization().await, 0.0);
        pool.assign(&ids[0], &"t1".to_string()).await.unwrap();
        assert_eq!(pool.utilization().await, 0.5);
    }

    #[tokio::test]
    async fn can_satisfy_checks_capability_and_resources() {
        let pool = WorkerPool::new(factory(), 5, RestartPolicy::default(), clock());
        let config = WorkerConfig::new(WorkerType::Execution)
            .with_capabilities(["shell".to_string()])
            .with_resource_cap(ResourceEnvelope { cpu: 2.0, memory: 2048.0 });
        pool.scale_up(1, config).await.unwrap();

        let mut required = HashSet::new();
        required.insert("shell".to_string());
        assert!(pool.can_satisfy(&required, &ResourceEnvelope { cpu: 1.0, memory: 512.0 }).await);

        required.insert("gpu".to_string());
        assert!(!pool.can_satisfy(&required, &ResourceEnvelope::ZERO).await);
    }
}
