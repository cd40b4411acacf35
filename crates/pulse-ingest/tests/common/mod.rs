#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use pulse_core::error::BackendError;
use pulse_core::event::{AnalyticsEvent, BatchItem, PageView};
use pulse_core::queue::{
    BatchSendEntry, BatchSendFailure, BatchSendOutcome, EventQueue, OutboundMessage,
};
use pulse_core::store::{BatchStore, BatchWriteOutput, CoalescedSink};

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).single().expect("ts") + chrono::Duration::seconds(secs)
}

pub fn page_view(site_id: &str, n: i64) -> PageView {
    PageView::new(site_id, format!("sess_{n}"), format!("vis_{n}"), format!("/p/{n}"), at(n))
}

pub fn page_view_item(n: i64) -> BatchItem {
    BatchItem::PageView(page_view("site_1", n))
}

pub fn page_view_event(site_id: &str, n: i64) -> AnalyticsEvent {
    AnalyticsEvent::page_view(page_view(site_id, n))
}

/// Scripted response for the next `batch_write` call.
pub enum Step {
    Fail(BackendError),
    /// Write everything except the last `n` items and hand those back.
    LeaveUnprocessed(usize),
    Panic,
}

/// In-memory store that counts how often each item id was written.
#[derive(Default)]
pub struct MockStore {
    writes: Mutex<HashMap<String, usize>>,
    chunk_sizes: Mutex<Vec<usize>>,
    script: Mutex<VecDeque<Step>>,
    calls: AtomicUsize,
    latency: Option<Duration>,
}

impl MockStore {
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::default()
        }
    }

    pub fn script(&self, step: Step) {
        self.script.lock().expect("script").push_back(step);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn chunk_sizes(&self) -> Vec<usize> {
        let mut sizes = self.chunk_sizes.lock().expect("sizes").clone();
        sizes.sort_unstable_by(|a, b| b.cmp(a));
        sizes
    }

    pub fn writes_of(&self, item_id: &str) -> usize {
        self.writes
            .lock()
            .expect("writes")
            .get(item_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn written_ids(&self) -> Vec<String> {
        self.writes.lock().expect("writes").keys().cloned().collect()
    }

    pub fn total_writes(&self) -> usize {
        self.writes.lock().expect("writes").values().sum()
    }
}

#[async_trait]
impl BatchStore for MockStore {
    async fn batch_write(&self, items: &[BatchItem]) -> Result<BatchWriteOutput, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.chunk_sizes.lock().expect("sizes").push(items.len());
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let step = self.script.lock().expect("script").pop_front();
        let keep = match step {
            Some(Step::Fail(e)) => return Err(e),
            Some(Step::Panic) => panic!("store blew up"),
            Some(Step::LeaveUnprocessed(n)) => items.len().saturating_sub(n),
            None => items.len(),
        };

        let mut writes = self.writes.lock().expect("writes");
        for item in &items[..keep] {
            *writes.entry(item.item_id()).or_default() += 1;
        }
        Ok(BatchWriteOutput {
            unprocessed: items[keep..].to_vec(),
        })
    }
}

/// Queue that records every call and can refuse whole batches or
/// individual entries.
#[derive(Default)]
pub struct MockQueue {
    singles: Mutex<Vec<OutboundMessage>>,
    batches: Mutex<Vec<Vec<BatchSendEntry>>>,
    refuse_batches: AtomicBool,
    reject_entries: HashSet<String>,
}

impl MockQueue {
    pub fn refusing() -> Self {
        let queue = Self::default();
        queue.refuse_batches.store(true, Ordering::SeqCst);
        queue
    }

    /// Report the entries with these ids as failed in every batch call.
    pub fn rejecting_entries(ids: &[&str]) -> Self {
        Self {
            reject_entries: ids.iter().map(|id| id.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn singles(&self) -> Vec<OutboundMessage> {
        self.singles.lock().expect("singles").clone()
    }

    pub fn batches(&self) -> Vec<Vec<BatchSendEntry>> {
        self.batches.lock().expect("batches").clone()
    }
}

#[async_trait]
impl EventQueue for MockQueue {
    async fn send_message(&self, message: OutboundMessage) -> Result<String, BackendError> {
        let mut singles = self.singles.lock().expect("singles");
        singles.push(message);
        Ok(format!("msg-{}", singles.len()))
    }

    async fn send_message_batch(
        &self,
        entries: Vec<BatchSendEntry>,
    ) -> Result<BatchSendOutcome, BackendError> {
        self.batches.lock().expect("batches").push(entries.clone());
        if self.refuse_batches.load(Ordering::SeqCst) {
            return Err(BackendError::ServiceUnavailable("queue down".to_string()));
        }
        let (failed, successful): (Vec<_>, Vec<_>) = entries
            .into_iter()
            .map(|entry| entry.id)
            .partition(|id| self.reject_entries.contains(id));
        Ok(BatchSendOutcome {
            successful,
            failed: failed
                .into_iter()
                .map(|id| BatchSendFailure {
                    id,
                    code: "InternalError".to_string(),
                    message: "entry rejected".to_string(),
                    sender_fault: false,
                })
                .collect(),
        })
    }
}

/// Sink that records every write it receives. Can fail the first few
/// writes or take a while to answer.
pub struct RecordingSink<V> {
    writes: Mutex<Vec<(String, V)>>,
    attempts: AtomicUsize,
    fail_first: usize,
    latency: Option<Duration>,
}

impl<V> Default for RecordingSink<V> {
    fn default() -> Self {
        Self {
            writes: Mutex::new(Vec::new()),
            attempts: AtomicUsize::new(0),
            fail_first: 0,
            latency: None,
        }
    }
}

impl<V: Clone> RecordingSink<V> {
    pub fn failing_first(n: usize) -> Self {
        Self {
            fail_first: n,
            ..Self::default()
        }
    }

    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::default()
        }
    }

    pub fn writes(&self) -> Vec<(String, V)> {
        self.writes.lock().expect("writes").clone()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<V: Send + 'static> CoalescedSink<V> for RecordingSink<V> {
    async fn write(&self, key: &str, value: V) -> anyhow::Result<()> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if attempt < self.fail_first {
            anyhow::bail!("sink unavailable");
        }
        self.writes
            .lock()
            .expect("writes")
            .push((key.to_string(), value));
        Ok(())
    }
}
