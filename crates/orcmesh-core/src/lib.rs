//! `orcmesh-core`: a concurrent, in-process task orchestrator for pools of
//! capability-typed workers.
//!
//! The [`orchestrator::Orchestrator`] is the public façade; it owns a
//! [`scheduler::Scheduler`] (task graph, priority queue, retry/timeout/aging),
//! a [`pool::WorkerPool`] (worker lifecycle, health, restarts), an
//! [`strategy::AutoStrategy`] (assignment policy selection, autoscale
//! recommendations), an [`events::EventBus`] (fan-out event stream), and a
//! [`knowledge::KnowledgeStore`] (shared facts, consensus, learned
//! patterns). Checkpoint persistence is delegated to an injected
//! `orcmesh_kv::KvStore`.

pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod graph;
pub mod knowledge;
pub mod orchestrator;
pub mod pool;
pub mod queue;
pub mod scheduler;
pub mod strategy;
pub mod types;
pub mod worker;

pub use clock::{Clock, FakeClock, SystemClock};
pub use config::{AutoscalerConfig, OrchestratorConfig};
pub use error::{OrchestratorError, OrchestratorResult};
pub use events::{Event, EventBus, EventKind, EventStream};
pub use knowledge::KnowledgeStore;
pub use orchestrator::{Orchestrator, OrchestratorState};
pub use pool::{WorkerFactory, WorkerInfo, WorkerPool};
pub use queue::PriorityQueue;
pub use scheduler::Scheduler;
pub use strategy::{AssignmentPolicy, AutoStrategy, PoolMetrics, ScaleDecision, Trend};
pub use types::{Task, TaskId, TaskPriority, TaskResult, TaskStatus, TaskType, WorkerId};
pub use worker::{RestartPolicy, Worker, WorkerConfig};

/// Configure a `tracing-subscriber` `fmt` layer from `RUST_LOG` (`info` if
/// unset). Idempotent -- later calls are no-ops rather than panicking, so
/// both a binary's `main` and a test's setup code can call it freely.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
