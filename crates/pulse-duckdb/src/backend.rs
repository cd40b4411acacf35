use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use duckdb::Connection;
use tokio::sync::Mutex;
use tracing::info;

use pulse_core::error::BackendError;
use pulse_core::shard::ShardingConfig;

use crate::schema::init_sql;

/// DuckDB-backed store for the ingest pipeline.
///
/// DuckDB is single-writer, so the connection sits behind
/// `Arc<tokio::sync::Mutex<_>>`: concurrent chunk writes from the batch
/// writer queue up on the lock instead of contending inside DuckDB.
///
/// Raw events are written under a partition key chosen by `sharding`;
/// reads for a sharded site fan out over every shard key and merge.
pub struct DuckDbBackend {
    pub(crate) conn: Arc<Mutex<Connection>>,
    pub(crate) sharding: ShardingConfig,
}

impl DuckDbBackend {
    /// Open (or create) a DuckDB database file at `path`.
    ///
    /// `memory_limit` is a DuckDB size string such as `"1GB"` or `"512MB"`.
    pub fn open(path: &str, memory_limit: &str, sharding: ShardingConfig) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(&init_sql(memory_limit))?;
        info!(
            "DuckDB opened at {} with memory_limit={}, threads=2",
            path, memory_limit
        );
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            sharding,
        })
    }

    /// Open an **in-memory** database. Intended for tests.
    pub fn open_in_memory(sharding: ShardingConfig) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(&init_sql("1GB"))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            sharding,
        })
    }

    pub fn sharding(&self) -> &ShardingConfig {
        &self.sharding
    }

    /// Execute `SELECT 1` as a lightweight liveness check.
    pub async fn ping(&self) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute_batch("SELECT 1")?;
        Ok(())
    }

    /// Acquire the connection lock for direct queries.
    ///
    /// Intended for integration tests that need to verify stored data.
    pub async fn conn_for_test(&self) -> tokio::sync::MutexGuard<'_, Connection> {
        self.conn.lock().await
    }
}

/// Map a DuckDB error onto the transport taxonomy. Write-write conflicts
/// and lock contention are the only conditions worth retrying.
pub(crate) fn classify(error: duckdb::Error) -> BackendError {
    let message = error.to_string();
    if message.contains("Conflict") || message.contains("could not set lock") {
        BackendError::ServiceUnavailable(message)
    } else if message.contains("Constraint Error") {
        BackendError::Validation(message)
    } else {
        BackendError::Other(error.into())
    }
}

pub(crate) fn millis_to_utc(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}
