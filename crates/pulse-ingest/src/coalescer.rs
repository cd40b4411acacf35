use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use pulse_core::store::CoalescedSink;

struct Pending<V> {
    generation: u64,
    value: V,
    timer: JoinHandle<()>,
}

/// Last write generation that reached the sink for one key.
type KeyLock = Arc<Mutex<u64>>;

struct Inner<V, S> {
    sink: Arc<S>,
    window: Duration,
    next_generation: AtomicU64,
    pending: Mutex<HashMap<String, Pending<V>>>,
    key_locks: Mutex<HashMap<String, KeyLock>>,
}

/// Last-write-wins deferral of writes to the same key.
///
/// `write` schedules the value to reach the sink after `window`; a newer
/// write for the key inside that window replaces the pending value and
/// restarts the timer. Writes for one key are serialized and stamped with a
/// generation, so an older value never lands after a newer one.
///
/// Failed sink writes are logged and dropped.
pub struct WriteCoalescer<V, S> {
    inner: Arc<Inner<V, S>>,
}

impl<V, S> WriteCoalescer<V, S>
where
    V: Send + 'static,
    S: CoalescedSink<V>,
{
    pub fn new(sink: Arc<S>, window: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                sink,
                window,
                next_generation: AtomicU64::new(1),
                pending: Mutex::new(HashMap::new()),
                key_locks: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub async fn write(&self, key: &str, value: V) {
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let mut pending = self.inner.pending.lock().await;

        let inner = Arc::clone(&self.inner);
        let timer_key = key.to_string();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(inner.window).await;
            inner.fire(&timer_key, generation).await;
        });

        let replaced = pending.insert(
            key.to_string(),
            Pending {
                generation,
                value,
                timer,
            },
        );
        if let Some(previous) = replaced {
            // Still sleeping or waiting for `pending`: it has not claimed
            // its value, so cancelling it loses nothing.
            previous.timer.abort();
            debug!(key, "Coalesced write replaced");
        }
    }

    /// Write every pending value now and wait for the writes to finish,
    /// including writes a timer had already claimed.
    pub async fn flush(&self) {
        let (drained, in_flight) = {
            let mut pending = self.inner.pending.lock().await;
            let mut claimed = Vec::with_capacity(pending.len());
            for (key, entry) in pending.drain() {
                entry.timer.abort();
                let lock = self.inner.key_lock(&key).await;
                claimed.push((key, entry.generation, entry.value, lock));
            }
            // A timer claims its value and the key's guard under `pending`,
            // so every earlier claim is visible here as a held key lock.
            let in_flight: Vec<KeyLock> = self
                .inner
                .key_locks
                .lock()
                .await
                .values()
                .map(Arc::clone)
                .collect();
            (claimed, in_flight)
        };
        for (key, generation, value, lock) in drained {
            let guard = Arc::clone(&lock).lock_owned().await;
            self.inner
                .write_claimed(&key, generation, value, lock, guard)
                .await;
        }
        for lock in in_flight {
            drop(lock.lock().await);
        }
    }

    pub async fn pending(&self) -> usize {
        self.inner.pending.lock().await.len()
    }
}

impl<V, S> Inner<V, S>
where
    V: Send + 'static,
    S: CoalescedSink<V>,
{
    async fn fire(&self, key: &str, generation: u64) {
        let claimed = {
            let mut pending = self.pending.lock().await;
            let current = pending
                .get(key)
                .is_some_and(|entry| entry.generation == generation);
            if current {
                let lock = self.key_lock(key).await;
                let guard = Arc::clone(&lock).lock_owned().await;
                pending
                    .remove(key)
                    .map(|entry| (entry.value, lock, guard))
            } else {
                None
            }
        };
        if let Some((value, lock, guard)) = claimed {
            self.write_claimed(key, generation, value, lock, guard).await;
        }
    }

    async fn key_lock(&self, key: &str) -> KeyLock {
        let mut locks = self.key_locks.lock().await;
        Arc::clone(locks.entry(key.to_string()).or_default())
    }

    async fn write_claimed(
        &self,
        key: &str,
        generation: u64,
        value: V,
        lock: KeyLock,
        mut last_written: OwnedMutexGuard<u64>,
    ) {
        if *last_written > generation {
            debug!(key, generation, "Skipping stale coalesced write");
        } else {
            match self.sink.write(key, value).await {
                Ok(()) => *last_written = generation,
                Err(e) => warn!(key, error = %e, "Coalesced write failed"),
            }
        }
        drop(last_written);

        // Drop the key's lock entry once nobody else holds it.
        let mut locks = self.key_locks.lock().await;
        if Arc::strong_count(&lock) == 2 {
            locks.remove(key);
        }
    }
}
