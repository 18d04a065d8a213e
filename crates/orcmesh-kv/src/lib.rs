//! Abstract key/value store used by the orchestrator core for checkpoints
//! and shared knowledge.
//!
//! The core only ever depends on the [`KvStore`] trait. [`MemoryKv`] is the
//! default, in-process implementation; the `postgres` feature adds
//! [`postgres::PostgresKv`] as a durable alternative behind the same trait.
//! Only two key namespaces are reserved by the core: `checkpoint:<id>` and
//! `knowledge:<k>` (see [`keys`]).

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod memory;
pub mod store;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use checkpoint::Checkpoint;
pub use error::{KvError, KvResult};
pub use memory::MemoryKv;
pub use store::KvStore;

/// Reserved key namespaces.
pub mod keys {
    /// Build the key for a checkpoint with the given id.
    pub fn checkpoint(id: &str) -> String {
        format!("checkpoint:{id}")
    }

    /// Build the key for a knowledge entry with the given logical key.
    pub fn knowledge(k: &str) -> String {
        format!("knowledge:{k}")
    }
}
