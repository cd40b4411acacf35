//! Write sharding for hot partition keys.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use rand::Rng;

pub const DEFAULT_SHARD_COUNT: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShardPolicy {
    /// Shard = current UTC minute modulo the shard count. All writers land
    /// on the same shard within a minute.
    #[default]
    Deterministic,
    /// Uniformly random shard on every call.
    Random,
}

impl ShardPolicy {
    pub fn parse(raw: &str) -> Result<Self, String> {
        match raw.trim() {
            "" | "deterministic" => Ok(ShardPolicy::Deterministic),
            "random" => Ok(ShardPolicy::Random),
            other => Err(format!(
                "shard policy must be one of: deterministic, random (got {other})"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardKeyStrategy {
    policy: ShardPolicy,
    shard_count: u32,
}

impl Default for ShardKeyStrategy {
    fn default() -> Self {
        Self::new(ShardPolicy::Deterministic, DEFAULT_SHARD_COUNT)
    }
}

impl ShardKeyStrategy {
    pub fn new(policy: ShardPolicy, shard_count: u32) -> Self {
        Self {
            policy,
            shard_count: shard_count.max(1),
        }
    }

    pub fn shard_count(&self) -> u32 {
        self.shard_count
    }

    pub fn shard_key(&self, logical_key: &str) -> String {
        self.shard_key_at(logical_key, Utc::now())
    }

    /// Like [`Self::shard_key`] with an explicit clock for the deterministic
    /// policy.
    pub fn shard_key_at(&self, logical_key: &str, now: DateTime<Utc>) -> String {
        let index = match self.policy {
            ShardPolicy::Deterministic => {
                let minute = now.timestamp().div_euclid(60);
                minute.rem_euclid(i64::from(self.shard_count)) as u32
            }
            ShardPolicy::Random => rand::thread_rng().gen_range(0..self.shard_count),
        };
        format_shard_key(logical_key, index)
    }

    /// Every physical key a logical key may have been written under. Reads
    /// must fan out across all of them and merge.
    pub fn all_shard_keys(&self, logical_key: &str) -> Vec<String> {
        (0..self.shard_count)
            .map(|index| format_shard_key(logical_key, index))
            .collect()
    }
}

fn format_shard_key(logical_key: &str, index: u32) -> String {
    format!("{logical_key}#{index}")
}

/// Sharding is opt-in per site; other sites write under the logical key.
#[derive(Debug, Clone, Default)]
pub struct ShardingConfig {
    pub strategy: ShardKeyStrategy,
    pub sharded_sites: HashSet<String>,
}

impl ShardingConfig {
    pub fn new(strategy: ShardKeyStrategy, sharded_sites: impl IntoIterator<Item = String>) -> Self {
        Self {
            strategy,
            sharded_sites: sharded_sites.into_iter().collect(),
        }
    }

    pub fn is_sharded(&self, site_id: &str) -> bool {
        self.sharded_sites.contains(site_id)
    }

    pub fn partition_key_for(&self, site_id: &str) -> String {
        if self.is_sharded(site_id) {
            self.strategy.shard_key(site_id)
        } else {
            site_id.to_string()
        }
    }

    pub fn read_keys_for(&self, site_id: &str) -> Vec<String> {
        if self.is_sharded(site_id) {
            self.strategy.all_shard_keys(site_id)
        } else {
            vec![site_id.to_string()]
        }
    }
}
