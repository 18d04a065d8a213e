//! Self-describing checkpoint record.
//!
//! A [`Checkpoint`] is a snapshot of everything the orchestrator needs to
//! resume: its own lifecycle state, every task (with dependency and
//! dependent sets flattened to arrays), and every worker's configuration,
//! metrics, and restart count. Checkpoints are serialized as JSON and
//! stored behind the `checkpoint:<id>` key namespace (see [`crate::keys`]).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{KvError, KvResult};
use crate::store::KvStore;

/// A flattened snapshot of a single task, suitable for serialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub id: String,
    pub name: String,
    pub task_type: String,
    pub priority: String,
    pub status: String,
    pub attempts: u32,
    pub dependencies: Vec<String>,
    pub dependents: Vec<String>,
    pub assigned_worker: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Opaque, caller-defined task payload, serialized as JSON.
    pub input: serde_json::Value,
    /// The full task record, opaque to this crate, serialized by the
    /// caller. Carries every field `orcmesh-core`'s `Task` needs to resume
    /// scheduling exactly where it left off (retry state, resource
    /// requirements, result history); the flattened fields above exist so a
    /// checkpoint can be inspected without deserializing into that type.
    pub full: serde_json::Value,
}

/// A flattened snapshot of a single worker, suitable for serialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSnapshot {
    pub id: String,
    pub worker_type: String,
    pub capabilities: Vec<String>,
    pub restart_count: u32,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    /// Opaque `WorkerConfig`, serialized by the caller, used to respawn an
    /// equivalent worker through the pool's factory on restore.
    pub config: serde_json::Value,
}

/// Orchestrator lifecycle state as of the checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorStateSnapshot {
    Initializing,
    Ready,
    Running,
    Paused,
    Completing,
    Completed,
    Failed,
    Terminated,
}

/// A full, self-describing orchestrator checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: Uuid,
    pub orchestrator_id: Uuid,
    pub state: OrchestratorStateSnapshot,
    pub created_at: DateTime<Utc>,
    pub tasks: Vec<TaskSnapshot>,
    pub workers: Vec<WorkerSnapshot>,
    /// Monotonically increasing sequence number. `Restore` must reject a
    /// checkpoint whose sequence number is not strictly greater than the
    /// orchestrator's current sequence number.
    pub sequence: u64,
}

impl Checkpoint {
    /// Persist this checkpoint to `store` under `checkpoint:<id>`.
    pub async fn save(&self, store: &dyn KvStore) -> KvResult<()> {
        let key = crate::keys::checkpoint(&self.id.to_string());
        let bytes = serde_json::to_vec(self)?;
        store.set(&key, bytes, None).await
    }

    /// Load a checkpoint previously saved with [`Checkpoint::save`].
    pub async fn load(store: &dyn KvStore, id: Uuid) -> KvResult<Checkpoint> {
        let key = crate::keys::checkpoint(&id.to_string());
        let bytes = store
            .get(&key)
            .await?
            .ok_or_else(|| KvError::NotFound(key.clone()))?;
        let checkpoint: Checkpoint = serde_json::from_slice(&bytes)?;
        Ok(checkpoint)
    }

    /// Whether this checkpoint may be restored given the orchestrator's
    /// current sequence number.
    ///
    /// Restore is rejected if this checkpoint's sequence number is not
    /// strictly greater than `current_sequence` -- an intentional
    /// tightening over the source, which has no protection against a
    /// stale or duplicate restore overwriting a running orchestrator.
    pub fn is_restorable_over(&self, current_sequence: u64) -> bool {
        self.sequence > current_sequence
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryKv;

    fn sample(sequence: u64) -> Checkpoint {
        Checkpoint {
            id: Uuid::new_v4(),
            orchestrator_id: Uuid::new_v4(),
            state: OrchestratorStateSnapshot::Running,
            created_at: Utc::now(),
            tasks: vec![TaskSnapshot {
                id: "t1".into(),
                name: "task one".into(),
                task_type: "analyze".into(),
                priority: "high".into(),
                status: "completed".into(),
                attempts: 1,
                dependencies: vec![],
                dependents: vec![],
                assigned_worker: Some("w1".into()),
                started_at: None,
                ended_at: None,
                input: serde_json::json!({"k": "v"}),
                full: serde_json::json!({"id": "t1"}),
            }],
            workers: vec![WorkerSnapshot {
                id: "w1".into(),
                worker_type: "execution".into(),
                capabilities: vec!["shell".into()],
                restart_count: 0,
                tasks_completed: 1,
                tasks_failed: 0,
                config: serde_json::json!({"worker_type": "execution"}),
            }],
            sequence,
        }
    }

    #[tokio::test]
    async fn save_and_load_roundtrip() {
        let kv = MemoryKv::new();
        let checkpoint = sample(1);
        checkpoint.save(&kv).await.unwrap();

        let loaded = Checkpoint::load(&kv, checkpoint.id).await.unwrap();
        assert_eq!(loaded.sequence, 1);
        assert_eq!(loaded.tasks.len(), 1);
        assert_eq!(loaded.workers[0].id, "w1");
    }

    #[tokio::test]
    async fn load_missing_errors_not_found() {
        let kv = MemoryKv::new();
        let err = Checkpoint::load(&kv, Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, KvError::NotFound(_)));
    }

    #[test]
    fn sequence_must_strictly_increase() {
        let checkpoint = sample(5);
        assert!(checkpoint.is_restorable_over(4));
        assert!(!checkpoint.is_restorable_over(5));
        assert!(!checkpoint.is_restorable_over(6));
    }
}
