use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, warn};

use pulse_core::event::{AnalyticsEvent, BatchItem};
use pulse_core::goal::Conversion;
use pulse_core::queue::EventQueue;
use pulse_core::session::Session;
use pulse_core::store::BatchStore;

use crate::batch_writer::BatchWriter;
use crate::context::IngestContext;
use crate::detached::spawn_detached;
use crate::producer::EventQueueProducer;

/// Receives each new conversion, e.g. to notify a webhook. Runs detached;
/// failures are logged and never reach the ingest path.
#[async_trait]
pub trait ConversionHook: Send + Sync + 'static {
    async fn on_conversion(&self, conversion: Conversion) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct IngestReport {
    /// Events acknowledged by the queue, derived session updates included.
    pub queued: usize,
    /// Events the queue refused that went to the batch writer instead.
    pub fallback: usize,
    pub conversions: usize,
    /// Refused by the queue and by the batch writer. The caller owns them.
    pub unbuffered: Vec<AnalyticsEvent>,
}

/// Producer-side entry point: tracks sessions and goals, then sends events
/// to the queue and falls back to the batch writer for anything the queue
/// refuses.
pub struct IngestPipeline<Q, S> {
    context: Arc<IngestContext>,
    producer: EventQueueProducer<Q>,
    writer: Arc<BatchWriter<S>>,
    hook: Option<Arc<dyn ConversionHook>>,
}

impl<Q, S> IngestPipeline<Q, S>
where
    Q: EventQueue,
    S: BatchStore,
{
    pub fn new(
        context: Arc<IngestContext>,
        producer: EventQueueProducer<Q>,
        writer: Arc<BatchWriter<S>>,
    ) -> Self {
        Self {
            context,
            producer,
            writer,
            hook: None,
        }
    }

    pub fn with_conversion_hook(mut self, hook: Arc<dyn ConversionHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn context(&self) -> &Arc<IngestContext> {
        &self.context
    }

    pub async fn ingest(&self, events: Vec<AnalyticsEvent>) -> IngestReport {
        let now = Utc::now();
        let mut outgoing = Vec::with_capacity(events.len());
        let mut conversions = Vec::new();

        // One session update per session per call; the last fold wins.
        let mut session_order: Vec<(String, String)> = Vec::new();
        let mut sessions: HashMap<(String, String), Session> = HashMap::new();

        for event in events {
            let observation = self.context.observe(&event, now).await;
            outgoing.push(event);
            conversions.extend(observation.conversions);
            if let Some(session) = observation.session {
                let key = (session.site_id.clone(), session.session_id.clone());
                if !sessions.contains_key(&key) {
                    session_order.push(key.clone());
                }
                sessions.insert(key, session);
            }
        }
        outgoing.extend(
            session_order
                .iter()
                .filter_map(|key| sessions.remove(key))
                .map(AnalyticsEvent::session),
        );

        let sent = self.producer.send_events_batch(outgoing).await;
        let mut fallback = 0;
        let mut unbuffered = Vec::new();
        for event in sent.failed {
            let Some(item) = BatchItem::from_event(event.clone()) else {
                warn!("Dropping realtime presence the queue refused");
                continue;
            };
            match self.writer.add(item).await {
                Ok(()) => fallback += 1,
                Err(e) => {
                    warn!(error = %e, "Batch writer refused a queue fallback event");
                    unbuffered.push(event);
                }
            }
        }
        if fallback > 0 {
            warn!(count = fallback, "Queue refused events, buffered for direct write");
        }

        let conversion_count = conversions.len();
        if let Some(hook) = &self.hook {
            for conversion in conversions {
                let hook = Arc::clone(hook);
                spawn_detached("conversion_hook", async move {
                    hook.on_conversion(conversion).await
                });
            }
        }
        debug!(
            queued = sent.sent,
            fallback,
            unbuffered = unbuffered.len(),
            conversions = conversion_count,
            "Events ingested"
        );

        IngestReport {
            queued: sent.sent,
            fallback,
            conversions: conversion_count,
            unbuffered,
        }
    }
}
