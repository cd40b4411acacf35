use std::sync::Arc;

use tracing::{info, warn};

use pulse_core::event::{BatchItem, EventPayload, RealtimePresence};
use pulse_core::queue::{BatchItemFailure, BatchResponse, QueueMessage, ReceivedMessage};
use pulse_core::store::{BatchStore, CoalescedSink};

use crate::batch_writer::BatchWriter;
use crate::coalescer::WriteCoalescer;
use crate::error::IngestError;
use crate::retry::RetryPolicy;
use crate::worker_pool::parallel_process;

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Messages processed at once. 1 keeps each site's messages in order.
    pub concurrency: usize,
    pub retry: RetryPolicy,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            retry: RetryPolicy::consumer(),
        }
    }
}

/// Turns received queue messages into store writes and reports which
/// messages must be redelivered.
pub struct EventQueueConsumer<S, P> {
    writer: Arc<BatchWriter<S>>,
    presence: Arc<WriteCoalescer<RealtimePresence, P>>,
    config: ConsumerConfig,
}

impl<S, P> EventQueueConsumer<S, P>
where
    S: BatchStore,
    P: CoalescedSink<RealtimePresence>,
{
    pub fn new(
        writer: Arc<BatchWriter<S>>,
        presence: Arc<WriteCoalescer<RealtimePresence, P>>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            writer,
            presence,
            config,
        }
    }

    /// Process one delivery. A message is reported as failed when its body
    /// does not decode or any of its items was not written; the other
    /// messages are unaffected.
    pub async fn process_batch(&self, messages: Vec<ReceivedMessage>) -> BatchResponse {
        let received = messages.len();
        let writer = Arc::clone(&self.writer);
        let presence = Arc::clone(&self.presence);
        let retry = self.config.retry.clone();

        let outcomes = parallel_process(messages, self.config.concurrency, move |message| {
            let writer = Arc::clone(&writer);
            let presence = Arc::clone(&presence);
            let retry = retry.clone();
            async move {
                let outcome = process_message(&writer, &presence, &retry, &message.body).await;
                (message.message_id, outcome)
            }
        })
        .await;

        let mut response = BatchResponse::default();
        for (message_id, outcome) in outcomes {
            if let Err(e) = outcome {
                warn!(message_id = %message_id, error = %e, "Queue message failed");
                response.batch_item_failures.push(BatchItemFailure {
                    item_identifier: message_id,
                });
            }
        }
        info!(
            received,
            failed = response.batch_item_failures.len(),
            "Queue batch processed"
        );
        response
    }
}

async fn process_message<S, P>(
    writer: &BatchWriter<S>,
    presence: &WriteCoalescer<RealtimePresence, P>,
    retry: &RetryPolicy,
    body: &str,
) -> Result<(), IngestError>
where
    S: BatchStore,
    P: CoalescedSink<RealtimePresence>,
{
    let message = QueueMessage::from_body(body)?;

    let mut items = Vec::with_capacity(message.events.len());
    for event in message.events {
        match event.payload {
            EventPayload::PageView(pv) => items.push(BatchItem::PageView(pv)),
            EventPayload::Custom(ev) => items.push(BatchItem::Event(ev)),
            EventPayload::Session(session) => items.push(BatchItem::Session(session)),
            EventPayload::Realtime(update) => {
                presence.write(&update.coalesce_key(), update).await;
            }
        }
    }
    if items.is_empty() {
        return Ok(());
    }

    let result = writer.write_now_with(items, retry).await;
    if !result.unprocessed.is_empty() {
        let items = result.unprocessed;
        return Err(IngestError::Unprocessed {
            count: items.len(),
            items,
        });
    }
    if result.failed > 0 {
        return Err(IngestError::Rejected {
            count: result.failed,
        });
    }
    Ok(())
}
