//! Bounded exponential-backoff retry.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::warn;

use pulse_core::error::BackendError;
use pulse_core::event::BatchItem;
use pulse_core::store::BatchStore;

use crate::error::IngestError;

/// Errors that can tell whether another attempt might succeed.
pub trait Retryable {
    fn is_transient(&self) -> bool;
}

impl Retryable for BackendError {
    fn is_transient(&self) -> bool {
        BackendError::is_transient(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: None,
        }
    }
}

impl RetryPolicy {
    /// Policy for the queue consumer: same backoff, capped at 5 s so one
    /// message cannot eat the whole visibility timeout.
    pub fn consumer() -> Self {
        Self {
            max_delay: Some(Duration::from_secs(5)),
            ..Self::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Delay before retry `retry` (0-based): `base_delay * 2^retry`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u32.checked_pow(retry).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        match self.max_delay {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }
}

/// Run `operation` until it succeeds, fails permanently, or `max_retries`
/// retries have been spent. The operation is invoked at most
/// `max_retries + 1` times.
pub async fn with_retry<T, E, F, Fut>(policy: &RetryPolicy, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + Display,
{
    let mut retry = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if retry < policy.max_retries && e.is_transient() => {
                let delay = policy.delay_for(retry);
                warn!(
                    attempt = retry + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
                retry += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Write one chunk, resubmitting only the unprocessed subset after each
/// backoff. Whole-request transient errors are retried by [`with_retry`].
///
/// Returns [`IngestError::Unprocessed`] carrying the leftover items once
/// `max_retries` resubmissions have not drained them.
pub async fn write_batch_with_retry<S>(
    store: &S,
    items: &[BatchItem],
    policy: &RetryPolicy,
) -> Result<(), IngestError>
where
    S: BatchStore + ?Sized,
{
    let mut output = with_retry(policy, || store.batch_write(items)).await?;
    let mut retry = 0;
    while !output.unprocessed.is_empty() {
        if retry >= policy.max_retries {
            let items = std::mem::take(&mut output.unprocessed);
            return Err(IngestError::Unprocessed {
                count: items.len(),
                items,
            });
        }
        let delay = policy.delay_for(retry);
        warn!(
            unprocessed = output.unprocessed.len(),
            attempt = retry + 1,
            delay_ms = delay.as_millis() as u64,
            "Store left items unprocessed, resubmitting"
        );
        tokio::time::sleep(delay).await;
        retry += 1;

        let pending = std::mem::take(&mut output.unprocessed);
        output = with_retry(policy, || store.batch_write(&pending)).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_from_the_base() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
    }

    #[test]
    fn consumer_policy_caps_delay() {
        let policy = RetryPolicy::consumer();
        assert_eq!(policy.delay_for(10), Duration::from_secs(5));
        assert_eq!(policy.delay_for(40), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_errors_are_not_retried() {
        let mut calls = 0;
        let result: Result<(), BackendError> = with_retry(&RetryPolicy::default(), || {
            calls += 1;
            async { Err(BackendError::Validation("bad item".to_string())) }
        })
        .await;

        assert!(matches!(result, Err(BackendError::Validation(_))));
        assert_eq!(calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_stop_after_max_retries() {
        let mut calls = 0;
        let policy = RetryPolicy::default().with_max_retries(2);
        let result: Result<(), BackendError> = with_retry(&policy, || {
            calls += 1;
            async { Err(BackendError::Throttled("slow down".to_string())) }
        })
        .await;

        assert!(matches!(result, Err(BackendError::Throttled(_))));
        assert_eq!(calls, 3);
    }
}
