//! The [`KvStore`] trait -- the adapter interface for checkpoint and
//! knowledge persistence.
//!
//! Each concrete backend ([`crate::MemoryKv`], the optional
//! [`crate::postgres::PostgresKv`]) implements this trait. The trait is
//! intentionally object-safe so it can be stored as `Arc<dyn KvStore>` by
//! the orchestrator.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::KvResult;

/// Abstract key/value store with optional per-entry TTL.
///
/// # Object Safety
///
/// Every method returns a concrete or boxed type, so `dyn KvStore` can be
/// used as a trait object (e.g. `Arc<dyn KvStore>`).
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Store `value` under `key`, replacing any existing entry.
    ///
    /// If `ttl` is `Some`, the entry becomes unreadable (and eligible for
    /// removal) once that duration has elapsed since this call.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> KvResult<()>;

    /// Fetch the value stored under `key`, or `None` if absent or expired.
    ///
    /// Implementations lazily drop expired entries on access.
    async fn get(&self, key: &str) -> KvResult<Option<Vec<u8>>>;

    /// Remove the entry stored under `key`, if any. Never errors on a
    /// missing key.
    async fn delete(&self, key: &str) -> KvResult<()>;

    /// List all live (non-expired) keys.
    async fn keys(&self) -> KvResult<Vec<String>>;

    /// Number of live (non-expired) entries.
    async fn size(&self) -> KvResult<usize>;

    /// Remove every entry.
    async fn clear(&self) -> KvResult<()>;
}

// Compile-time assertion: KvStore must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn KvStore) {}
};
