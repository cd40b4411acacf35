use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, warn};

use pulse_core::error::CoreError;
use pulse_core::event::AnalyticsEvent;
use pulse_core::queue::{
    group_id_for, BatchSendEntry, EventQueue, OutboundMessage, QueueMessage, QUEUE_BATCH_LIMIT,
};

use crate::error::IngestError;

/// Result of [`EventQueueProducer::send_events_batch`]. Events in `failed`
/// were not acknowledged by the queue and are returned for fallback.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchSendReport {
    pub sent: usize,
    pub failed: Vec<AnalyticsEvent>,
}

/// Submits analytics events to the at-least-once queue.
///
/// Every message carries the grouping key `site-<siteId>`, so one site's
/// messages are delivered in order, and its batch id as deduplication id.
pub struct EventQueueProducer<Q> {
    queue: Arc<Q>,
}

impl<Q: EventQueue> EventQueueProducer<Q> {
    pub fn new(queue: Arc<Q>) -> Self {
        Self { queue }
    }

    pub async fn send_event(&self, event: AnalyticsEvent) -> Result<String, IngestError> {
        self.send_events(vec![event]).await
    }

    /// Send `events` as a single queue message grouped by the first event's
    /// site. Returns the queue-assigned message id.
    pub async fn send_events(&self, events: Vec<AnalyticsEvent>) -> Result<String, IngestError> {
        let Some(first) = events.first() else {
            return Err(CoreError::InvalidItem("no events to send".to_string()).into());
        };
        let group_id = group_id_for(&first.site_id);
        let count = events.len();
        let message = outbound(events, group_id)?;

        let message_id = self.queue.send_message(message).await?;
        debug!(count, message_id = %message_id, "Events queued");
        Ok(message_id)
    }

    /// Send one queue message per event using batch-send calls.
    ///
    /// Events are grouped by site in first-seen order and each site's events
    /// are cut into chunks of [`QUEUE_BATCH_LIMIT`]; every chunk is one call.
    /// A failed call fails its whole chunk; per-entry failures fail only
    /// those events.
    pub async fn send_events_batch(&self, events: Vec<AnalyticsEvent>) -> BatchSendReport {
        let mut report = BatchSendReport::default();

        let mut order: Vec<String> = Vec::new();
        let mut by_site: HashMap<String, Vec<AnalyticsEvent>> = HashMap::new();
        for event in events {
            if !by_site.contains_key(&event.site_id) {
                order.push(event.site_id.clone());
            }
            by_site.entry(event.site_id.clone()).or_default().push(event);
        }

        for site_id in order {
            let Some(site_events) = by_site.remove(&site_id) else {
                continue;
            };
            let group_id = group_id_for(&site_id);
            let mut remaining = site_events.into_iter();
            loop {
                let chunk: Vec<AnalyticsEvent> =
                    remaining.by_ref().take(QUEUE_BATCH_LIMIT).collect();
                if chunk.is_empty() {
                    break;
                }
                self.send_chunk(&group_id, chunk, &mut report).await;
            }
        }
        report
    }

    async fn send_chunk(
        &self,
        group_id: &str,
        chunk: Vec<AnalyticsEvent>,
        report: &mut BatchSendReport,
    ) {
        let mut entries = Vec::with_capacity(chunk.len());
        let mut submitted = Vec::with_capacity(chunk.len());
        for (index, event) in chunk.into_iter().enumerate() {
            match outbound(vec![event.clone()], group_id.to_string()) {
                Ok(message) => {
                    let id = index.to_string();
                    entries.push(BatchSendEntry {
                        id: id.clone(),
                        message,
                    });
                    submitted.push((id, event));
                }
                Err(e) => {
                    warn!(error = %e, "Event could not be serialized for the queue");
                    report.failed.push(event);
                }
            }
        }
        if entries.is_empty() {
            return;
        }

        match self.queue.send_message_batch(entries).await {
            Ok(outcome) => {
                for failure in &outcome.failed {
                    warn!(
                        entry = %failure.id,
                        code = %failure.code,
                        sender_fault = failure.sender_fault,
                        "Queue rejected batch entry: {}",
                        failure.message
                    );
                }
                let accepted: HashSet<&str> =
                    outcome.successful.iter().map(String::as_str).collect();
                for (id, event) in submitted {
                    if accepted.contains(id.as_str()) {
                        report.sent += 1;
                    } else {
                        report.failed.push(event);
                    }
                }
            }
            Err(e) => {
                warn!(
                    group_id,
                    count = submitted.len(),
                    error = %e,
                    "Queue batch send failed"
                );
                report
                    .failed
                    .extend(submitted.into_iter().map(|(_, event)| event));
            }
        }
    }
}

fn outbound(events: Vec<AnalyticsEvent>, group_id: String) -> Result<OutboundMessage, CoreError> {
    let message = QueueMessage::new(events)?;
    Ok(OutboundMessage {
        body: message.to_body()?,
        group_id: Some(group_id),
        deduplication_id: Some(message.batch_id),
    })
}
