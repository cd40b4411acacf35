//! Queue wire format and the at-least-once queue seam.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{BackendError, CoreError};
use crate::event::AnalyticsEvent;

/// Maximum number of entries the queue accepts in one batch-send call.
pub const QUEUE_BATCH_LIMIT: usize = 10;

/// Body of one queue message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMessage {
    pub events: Vec<AnalyticsEvent>,
    /// Deduplication token. Derived from the serialized events, so sending
    /// the same events again produces the same token.
    pub batch_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
}

impl QueueMessage {
    pub fn new(events: Vec<AnalyticsEvent>) -> Result<Self, CoreError> {
        let batch_id = compute_batch_id(&events)?;
        Ok(Self {
            events,
            batch_id,
            timestamp: Utc::now(),
            retry_count: None,
        })
    }

    pub fn to_body(&self) -> Result<String, CoreError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_body(body: &str) -> Result<Self, CoreError> {
        Ok(serde_json::from_str(body)?)
    }
}

/// `sha256(json(events))`, first 16 bytes as 32 hex chars.
pub fn compute_batch_id(events: &[AnalyticsEvent]) -> Result<String, CoreError> {
    let serialized = serde_json::to_vec(events)?;
    let hash = Sha256::digest(&serialized);
    Ok(hex::encode(&hash[..16]))
}

/// Grouping key that keeps one site's messages in submission order.
pub fn group_id_for(site_id: &str) -> String {
    format!("site-{site_id}")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub body: String,
    pub group_id: Option<String>,
    pub deduplication_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchSendEntry {
    /// Entry id, unique within one batch-send call.
    pub id: String,
    pub message: OutboundMessage,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchSendFailure {
    pub id: String,
    pub code: String,
    pub message: String,
    pub sender_fault: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSendOutcome {
    pub successful: Vec<String>,
    pub failed: Vec<BatchSendFailure>,
}

/// External at-least-once queue with per-group ordering.
#[async_trait]
pub trait EventQueue: Send + Sync + 'static {
    /// Returns the queue-assigned message id.
    async fn send_message(&self, message: OutboundMessage) -> Result<String, BackendError>;

    /// At most [`QUEUE_BATCH_LIMIT`] entries per call.
    async fn send_message_batch(
        &self,
        entries: Vec<BatchSendEntry>,
    ) -> Result<BatchSendOutcome, BackendError>;
}

/// One message as handed to the consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceivedMessage {
    pub message_id: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchItemFailure {
    pub item_identifier: String,
}

/// Partial-batch failure report: only the listed messages are redriven.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResponse {
    pub batch_item_failures: Vec<BatchItemFailure>,
}

impl BatchResponse {
    pub fn failed_ids(&self) -> Vec<&str> {
        self.batch_item_failures
            .iter()
            .map(|f| f.item_identifier.as_str())
            .collect()
    }
}
