//! Postgres-backed [`KvStore`], gated behind the `postgres` feature.
//!
//! This is the durable alternative to [`crate::MemoryKv`] -- same trait,
//! a `kv_entries` table instead of a `HashMap`. Expired rows are pruned
//! lazily on read, same as the in-memory backend, plus an explicit
//! [`PostgresKv::purge_expired`] for callers that want a periodic sweep.

use chrono::Utc;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::time::Duration;

use async_trait::async_trait;

use crate::config::PostgresKvConfig;
use crate::error::{KvError, KvResult};
use crate::store::KvStore;

/// A [`KvStore`] backed by a Postgres `kv_entries` table.
pub struct PostgresKv {
    pool: PgPool,
}

impl PostgresKv {
    /// Connect to Postgres and run pending migrations.
    pub async fn connect(config: &PostgresKvConfig) -> KvResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await
            .map_err(KvError::Database)?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| KvError::Backend(e.to_string()))?;
        Ok(Self { pool })
    }

    /// Wrap an already-connected, already-migrated pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Delete every row whose `expires_at` has passed.
    pub async fn purge_expired(&self) -> KvResult<u64> {
        let result = sqlx::query("DELETE FROM kv_entries WHERE expires_at IS NOT NULL AND expires_at <= now()")
            .execute(&self.pool)
            .await
            .map_err(KvError::Database)?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl KvStore for PostgresKv {
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> KvResult<()> {
        let expires_at = ttl.map(|d| {
            Utc::now()
                + chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::zero())
        });
        sqlx::query(
            "INSERT INTO kv_entries (key, value, expires_at) VALUES ($1, $2, $3)
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at",
        )
        .bind(key)
        .bind(value)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .map_err(KvError::Database)?;
        Ok(())
    }

    async fn get(&self, key: &str) -> KvResult<Option<Vec<u8>>> {
        let row = sqlx::query("SELECT value, expires_at FROM kv_entries WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(KvError::Database)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let expires_at: Option<chrono::DateTime<Utc>> = row.try_get("expires_at").map_err(KvError::Database)?;
        if let Some(expires_at) = expires_at {
            if expires_at <= Utc::now() {
                self.delete(key).await?;
                return Ok(None);
            }
        }
        let value: Vec<u8> = row.try_get("value").map_err(KvError::Database)?;
        Ok(Some(value))
    }

    async fn delete(&self, key: &str) -> KvResult<()> {
        sqlx::query("DELETE FROM kv_entries WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(KvError::Database)?;
        Ok(())
    }

    async fn keys(&self) -> KvResult<Vec<String>> {
        self.purge_expired().await?;
        let rows = sqlx::query("SELECT key FROM kv_entries")
            .fetch_all(&self.pool)
            .await
            .map_err(KvError::Database)?;
        rows.into_iter()
            .map(|row| row.try_get::<String, _>("key").map_err(KvError::Database))
            .collect()
    }

    async fn size(&self) -> KvResult<usize> {
        self.purge_expired().await?;
        let row = sqlx::query("SELECT count(*) AS count FROM kv_entries")
            .fetch_one(&self.pool)
            .await
            .map_err(KvError::Database)?;
        let count: i64 = row.try_get("count").map_err(KvError::Database)?;
        Ok(count as usize)
    }

    async fn clear(&self) -> KvResult<()> {
        sqlx::query("DELETE FROM kv_entries")
            .execute(&self.pool)
            .await
            .map_err(KvError::Database)?;
        Ok(())
    }
}
