use thiserror::Error;

use pulse_core::error::{BackendError, CoreError};
use pulse_core::event::BatchItem;

use crate::retry::Retryable;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("writer is closed")]
    Closed,

    /// The store kept handing back part of a batch until retries ran out.
    /// The leftover items are carried so the caller can decide what to do.
    #[error("{count} items still unprocessed after retries")]
    Unprocessed { count: usize, items: Vec<BatchItem> },

    #[error("{count} items could not be written")]
    Rejected { count: usize },

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Codec(#[from] CoreError),

    #[error("task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl Retryable for IngestError {
    fn is_transient(&self) -> bool {
        match self {
            IngestError::Backend(e) => e.is_transient(),
            _ => false,
        }
    }
}
