//! Store seams used by the writers.

use async_trait::async_trait;

use crate::error::BackendError;
use crate::event::BatchItem;
use crate::session::Session;

/// Hard per-request item limit of the store's batch-write call.
pub const STORE_BATCH_LIMIT: usize = 25;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchWriteOutput {
    /// Items the store accepted the request for but did not write, usually
    /// because of partial throttling. Safe to resubmit.
    pub unprocessed: Vec<BatchItem>,
}

impl BatchWriteOutput {
    pub fn complete() -> Self {
        Self::default()
    }
}

/// Durable store for batch items.
#[async_trait]
pub trait BatchStore: Send + Sync + 'static {
    /// Write at most [`STORE_BATCH_LIMIT`] items in one request.
    async fn batch_write(&self, items: &[BatchItem]) -> Result<BatchWriteOutput, BackendError>;
}

/// Read side for session aggregates that fell out of the in-memory cache.
#[async_trait]
pub trait SessionLoader: Send + Sync + 'static {
    async fn load_session(
        &self,
        site_id: &str,
        session_id: &str,
    ) -> Result<Option<Session>, BackendError>;
}

/// Target of coalesced, best-effort writes.
#[async_trait]
pub trait CoalescedSink<V>: Send + Sync + 'static {
    async fn write(&self, key: &str, value: V) -> anyhow::Result<()>;
}
