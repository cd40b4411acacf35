use std::time::Duration;

use crate::event::TtlPolicy;
use crate::shard::{ShardKeyStrategy, ShardPolicy, ShardingConfig};

/// Process configuration, read once at startup from `PULSE_*` variables.
///
/// Components never read the environment themselves; they receive the
/// relevant pieces of this struct as constructor parameters.
#[derive(Debug, Clone)]
pub struct Config {
    pub queue_url: Option<String>,
    pub dead_letter_queue_url: Option<String>,
    pub region: String,
    pub endpoint: Option<String>,
    pub max_retries: u32,
    pub table_name: String,
    pub data_dir: String,
    pub duckdb_memory_limit: String,
    pub buffer_flush_interval_ms: u64,
    pub buffer_max_size: usize,
    pub max_batch_size: usize,
    pub coalesce_window_ms: u64,
    pub shard_count: u32,
    pub shard_policy: ShardPolicy,
    pub sharded_sites: Vec<String>,
    pub raw_event_ttl_days: u32,
    pub session_ttl_days: u32,
    pub session_cache_ttl_minutes: i64,
    pub consumer_concurrency: usize,
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        Ok(Self {
            queue_url: optional("PULSE_QUEUE_URL"),
            dead_letter_queue_url: optional("PULSE_DLQ_URL"),
            region: std::env::var("PULSE_REGION").unwrap_or_else(|_| "us-east-1".to_string()),
            endpoint: optional("PULSE_ENDPOINT"),
            max_retries: parsed("PULSE_MAX_RETRIES", 3)?,
            table_name: std::env::var("PULSE_TABLE_NAME")
                .unwrap_or_else(|_| "pulse".to_string()),
            data_dir: std::env::var("PULSE_DATA_DIR").unwrap_or_else(|_| "./data".to_string()),
            duckdb_memory_limit: std::env::var("PULSE_DUCKDB_MEMORY")
                .unwrap_or_else(|_| "1GB".to_string()),
            buffer_flush_interval_ms: parsed("PULSE_BUFFER_FLUSH_INTERVAL_MS", 5000)?,
            buffer_max_size: parsed("PULSE_BUFFER_MAX_SIZE", 100)?,
            max_batch_size: parsed("PULSE_MAX_BATCH_SIZE", 25)?,
            coalesce_window_ms: parsed("PULSE_COALESCE_WINDOW_MS", 100)?,
            shard_count: parsed("PULSE_SHARD_COUNT", 10)?,
            shard_policy: ShardPolicy::parse(
                &std::env::var("PULSE_SHARD_POLICY").unwrap_or_default(),
            )?,
            sharded_sites: std::env::var("PULSE_SHARDED_SITES")
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            raw_event_ttl_days: parsed("PULSE_RAW_EVENT_TTL_DAYS", 30)?,
            session_ttl_days: parsed("PULSE_SESSION_TTL_DAYS", 30)?,
            session_cache_ttl_minutes: parsed("PULSE_SESSION_CACHE_TTL_MINUTES", 30)?,
            consumer_concurrency: parsed("PULSE_CONSUMER_CONCURRENCY", 1)?,
        })
    }

    pub fn buffer_flush_interval(&self) -> Duration {
        Duration::from_millis(self.buffer_flush_interval_ms)
    }

    pub fn coalesce_window(&self) -> Duration {
        Duration::from_millis(self.coalesce_window_ms)
    }

    pub fn ttl_policy(&self) -> TtlPolicy {
        TtlPolicy {
            raw_event_days: self.raw_event_ttl_days,
            session_days: self.session_ttl_days,
        }
    }

    pub fn sharding(&self) -> ShardingConfig {
        ShardingConfig::new(
            ShardKeyStrategy::new(self.shard_policy, self.shard_count),
            self.sharded_sites.iter().cloned(),
        )
    }

    pub fn database_path(&self) -> String {
        format!("{}/{}.db", self.data_dir, self.table_name)
    }
}

fn optional(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parsed<T: std::str::FromStr>(name: &str, default: T) -> Result<T, String>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e| format!("invalid {name}: {e}")),
        _ => Ok(default),
    }
}
