use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use pulse_core::config::Config;
use pulse_core::event::{BatchItem, TtlPolicy};
use pulse_core::store::{BatchStore, STORE_BATCH_LIMIT};

use crate::error::IngestError;
use crate::retry::{write_batch_with_retry, RetryPolicy};

/// Called with the items of a chunk whose write failed outright.
pub type ErrorCallback = Arc<dyn Fn(&[BatchItem], &IngestError) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct BatchWriterConfig {
    /// Items per store request. Clamped to [`STORE_BATCH_LIMIT`].
    pub max_batch_size: usize,
    /// Queue length that triggers an immediate flush from `add`.
    pub max_queue_size: usize,
    pub flush_interval: Duration,
    pub retry: RetryPolicy,
    pub ttl: TtlPolicy,
}

impl Default for BatchWriterConfig {
    fn default() -> Self {
        Self {
            max_batch_size: STORE_BATCH_LIMIT,
            max_queue_size: 100,
            flush_interval: Duration::from_millis(5000),
            retry: RetryPolicy::default(),
            ttl: TtlPolicy::default(),
        }
    }
}

impl BatchWriterConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_batch_size: config.max_batch_size,
            max_queue_size: config.buffer_max_size,
            flush_interval: config.buffer_flush_interval(),
            retry: RetryPolicy::default().with_max_retries(config.max_retries),
            ttl: config.ttl_policy(),
        }
    }

    fn chunk_size(&self) -> usize {
        self.max_batch_size.clamp(1, STORE_BATCH_LIMIT)
    }
}

/// Outcome of one flush. `unprocessed` items were accepted by the store
/// request but never written and are safe to resubmit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlushResult {
    pub successful: usize,
    pub failed: usize,
    pub unprocessed: Vec<BatchItem>,
}

impl FlushResult {
    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.unprocessed.is_empty()
    }
}

/// In-process write buffer in front of a [`BatchStore`].
///
/// Items accumulate in memory and are written in chunks of at most
/// [`STORE_BATCH_LIMIT`] when the queue reaches `max_queue_size`, when the
/// periodic timer finds it non-empty, or on an explicit `flush`.
///
/// The queue lock is held only for the push or the `std::mem::take` drain,
/// never across a store write. A separate flush lock keeps flushes
/// single-flight: a second caller waits, then drains whatever arrived in
/// the meantime, so every queued item is written by exactly one flush.
pub struct BatchWriter<S> {
    store: Arc<S>,
    config: BatchWriterConfig,
    queue: Mutex<Vec<BatchItem>>,
    flush_lock: Mutex<()>,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
    timer: Mutex<Option<JoinHandle<()>>>,
    on_error: Option<ErrorCallback>,
}

impl<S: BatchStore> BatchWriter<S> {
    pub fn new(store: Arc<S>, config: BatchWriterConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            store,
            config,
            queue: Mutex::new(Vec::new()),
            flush_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
            shutdown,
            timer: Mutex::new(None),
            on_error: None,
        }
    }

    pub fn with_error_callback(
        mut self,
        callback: impl Fn(&[BatchItem], &IngestError) + Send + Sync + 'static,
    ) -> Self {
        self.on_error = Some(Arc::new(callback));
        self
    }

    pub async fn queued(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// Enqueue one item, stamping its `ttl` when missing.
    ///
    /// Reaching `max_queue_size` flushes before returning; unprocessed
    /// items from that flush go back on the queue.
    pub async fn add(&self, mut item: BatchItem) -> Result<(), IngestError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(IngestError::Closed);
        }
        item.ensure_ttl(&self.config.ttl);

        let should_flush = {
            let mut queue = self.queue.lock().await;
            // `close` flips the flag under this lock before its final drain.
            if self.closed.load(Ordering::Acquire) {
                return Err(IngestError::Closed);
            }
            queue.push(item);
            queue.len() >= self.config.max_queue_size
        };
        if should_flush {
            debug!("Queue threshold reached, flushing");
            self.background_flush().await;
        }
        Ok(())
    }

    /// Drain the queue and write everything in it.
    pub async fn flush(&self) -> FlushResult {
        let _flushing = self.flush_lock.lock().await;
        let batch = {
            let mut queue = self.queue.lock().await;
            std::mem::take(&mut *queue)
        };
        if batch.is_empty() {
            return FlushResult::default();
        }
        let count = batch.len();
        let result = self.write_items(batch, &self.config.retry).await;
        info!(
            count,
            successful = result.successful,
            failed = result.failed,
            unprocessed = result.unprocessed.len(),
            "Batch writer flushed"
        );
        result
    }

    /// Write `items` straight through the validate/chunk/retry path,
    /// bypassing the queue.
    pub async fn write_now(&self, items: Vec<BatchItem>) -> FlushResult {
        self.write_now_with(items, &self.config.retry).await
    }

    /// [`Self::write_now`] with an explicit retry policy.
    pub async fn write_now_with(
        &self,
        mut items: Vec<BatchItem>,
        policy: &RetryPolicy,
    ) -> FlushResult {
        for item in &mut items {
            item.ensure_ttl(&self.config.ttl);
        }
        self.write_items(items, policy).await
    }

    /// Spawn the periodic flush task. Calling it again is a no-op.
    pub async fn start(self: &Arc<Self>) {
        let mut timer = self.timer.lock().await;
        if timer.is_some() {
            return;
        }
        let writer = Arc::downgrade(self);
        let mut shutdown = self.shutdown.subscribe();
        let interval = self.config.flush_interval;

        *timer = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(writer) = writer.upgrade() else { break };
                        if writer.queued().await > 0 {
                            writer.background_flush().await;
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
            debug!("Batch writer timer stopped");
        }));
    }

    /// Stop the timer and run a final flush. Unprocessed items are handed
    /// back to the caller. Later `add` calls fail with [`IngestError::Closed`].
    pub async fn close(&self) -> FlushResult {
        {
            let _queue = self.queue.lock().await;
            if self.closed.swap(true, Ordering::AcqRel) {
                return FlushResult::default();
            }
        }
        self.shutdown.send_replace(true);
        let handle = self.timer.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Batch writer timer task ended abnormally");
            }
        }
        let result = self.flush().await;
        if !result.unprocessed.is_empty() {
            warn!(
                count = result.unprocessed.len(),
                "Batch writer closed with unprocessed items"
            );
        }
        result
    }

    /// Flush on the writer's own initiative. Nobody is waiting for the
    /// result, so unprocessed items are put back at the head of the queue.
    async fn background_flush(&self) {
        let result = self.flush().await;
        if result.unprocessed.is_empty() {
            return;
        }
        let mut queue = self.queue.lock().await;
        if self.closed.load(Ordering::Acquire) {
            error!(
                count = result.unprocessed.len(),
                "Dropping unprocessed items, writer closed during flush"
            );
            return;
        }
        warn!(
            count = result.unprocessed.len(),
            "Re-queueing unprocessed items for the next flush"
        );
        let mut requeued = result.unprocessed;
        requeued.append(&mut queue);
        *queue = requeued;
    }

    async fn write_items(&self, items: Vec<BatchItem>, policy: &RetryPolicy) -> FlushResult {
        let mut result = FlushResult::default();

        let mut valid = Vec::with_capacity(items.len());
        for item in items {
            match item.validate() {
                Ok(()) => valid.push(item),
                Err(e) => {
                    warn!(item = %item.item_id(), error = %e, "Dropping invalid item");
                    result.failed += 1;
                }
            }
        }

        let chunk_size = self.config.chunk_size();
        let mut chunks = Vec::new();
        let mut tasks = JoinSet::new();
        while !valid.is_empty() {
            let rest = valid.split_off(chunk_size.min(valid.len()));
            let chunk = std::mem::replace(&mut valid, rest);
            let index = chunks.len();

            let store = Arc::clone(&self.store);
            let policy = policy.clone();
            let submitted = chunk.clone();
            chunks.push(chunk);
            tasks.spawn(async move {
                let outcome = write_batch_with_retry(store.as_ref(), &submitted, &policy).await;
                (index, outcome)
            });
        }

        let mut outcomes: Vec<Option<Result<(), IngestError>>> =
            chunks.iter().map(|_| None).collect();
        let mut task_errors = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, outcome)) => outcomes[index] = Some(outcome),
                Err(e) => task_errors.push(e),
            }
        }

        for (chunk, outcome) in chunks.into_iter().zip(outcomes) {
            let e = match outcome {
                Some(Ok(())) => {
                    result.successful += chunk.len();
                    continue;
                }
                Some(Err(IngestError::Unprocessed { items, .. })) => {
                    result.successful += chunk.len().saturating_sub(items.len());
                    result.unprocessed.extend(items);
                    continue;
                }
                Some(Err(e)) => e,
                // Join errors carry no chunk index; pair them up in order.
                None => match task_errors.pop() {
                    Some(join) => IngestError::Join(join),
                    None => IngestError::Rejected { count: chunk.len() },
                },
            };
            let ids: Vec<String> = chunk.iter().map(BatchItem::item_id).collect();
            error!(count = chunk.len(), items = ?ids, error = %e, "Chunk write failed");
            result.failed += chunk.len();
            if let Some(callback) = &self.on_error {
                callback(&chunk, &e);
            }
        }
        result
    }
}
