mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use pulse_core::error::BackendError;
use pulse_core::event::BatchItem;
use pulse_ingest::error::IngestError;
use pulse_ingest::retry::{with_retry, write_batch_with_retry, RetryPolicy};

use common::{page_view_item, MockStore, Step};

#[tokio::test(start_paused = true)]
async fn fails_twice_then_succeeds_with_doubling_delays() {
    let mut attempts: Vec<Instant> = Vec::new();
    let policy = RetryPolicy::default();

    let result: Result<&str, BackendError> = with_retry(&policy, || {
        attempts.push(Instant::now());
        let n = attempts.len();
        async move {
            if n < 3 {
                Err(BackendError::ServiceUnavailable(format!("attempt {n}")))
            } else {
                Ok("done")
            }
        }
    })
    .await;

    assert_eq!(result.expect("third attempt succeeds"), "done");
    assert_eq!(attempts.len(), 3);
    let first_delay = attempts[1] - attempts[0];
    let second_delay = attempts[2] - attempts[1];
    assert!(first_delay >= Duration::from_millis(100));
    assert!(second_delay >= first_delay * 2);
}

#[tokio::test(start_paused = true)]
async fn only_the_unprocessed_subset_is_resubmitted() {
    let store = Arc::new(MockStore::default());
    store.script(Step::LeaveUnprocessed(3));
    let items: Vec<BatchItem> = (0..10).map(page_view_item).collect();

    write_batch_with_retry(store.as_ref(), &items, &RetryPolicy::default())
        .await
        .expect("drained on second call");

    assert_eq!(store.chunk_sizes(), vec![10, 3]);
    assert_eq!(store.total_writes(), 10);
}

#[tokio::test(start_paused = true)]
async fn exhausted_resubmissions_raise_unprocessed() {
    let store = Arc::new(MockStore::default());
    for _ in 0..3 {
        store.script(Step::LeaveUnprocessed(1));
    }
    let items: Vec<BatchItem> = (0..4).map(page_view_item).collect();
    let policy = RetryPolicy::default().with_max_retries(2);

    let err = write_batch_with_retry(store.as_ref(), &items, &policy)
        .await
        .expect_err("leftover");

    match err {
        IngestError::Unprocessed { count, items } => {
            assert_eq!(count, 1);
            assert_eq!(items.len(), 1);
        }
        other => panic!("expected Unprocessed, got {other:?}"),
    }
    assert_eq!(store.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn consumer_policy_never_waits_more_than_five_seconds() {
    let mut attempts: Vec<Instant> = Vec::new();
    let policy = RetryPolicy::consumer().with_max_retries(8);

    let _: Result<(), BackendError> = with_retry(&policy, || {
        attempts.push(Instant::now());
        async { Err(BackendError::InternalServerError("boom".to_string())) }
    })
    .await;

    assert_eq!(attempts.len(), 9);
    let longest = attempts
        .windows(2)
        .map(|w| w[1] - w[0])
        .max()
        .expect("gaps");
    assert!(longest <= Duration::from_millis(5_001));
}
