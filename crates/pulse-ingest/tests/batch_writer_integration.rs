mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use pulse_core::error::BackendError;
use pulse_core::event::{BatchItem, PageView};
use pulse_ingest::batch_writer::{BatchWriter, BatchWriterConfig};
use pulse_ingest::error::IngestError;

use common::{at, page_view_item, MockStore, Step};

fn writer(store: &Arc<MockStore>, config: BatchWriterConfig) -> Arc<BatchWriter<MockStore>> {
    Arc::new(BatchWriter::new(Arc::clone(store), config))
}

#[tokio::test(start_paused = true)]
async fn no_auto_flush_below_threshold_until_timer_fires() {
    let store = Arc::new(MockStore::default());
    let writer = writer(&store, BatchWriterConfig::default());
    writer.start().await;

    for n in 0..99 {
        writer.add(page_view_item(n)).await.expect("add");
    }
    tokio::time::sleep(Duration::from_millis(4_900)).await;
    assert_eq!(store.calls(), 0, "nothing written before the timer fires");
    assert_eq!(writer.queued().await, 99);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(store.total_writes(), 99);
    assert_eq!(writer.queued().await, 0);

    writer.close().await;
}

#[tokio::test]
async fn reaching_max_queue_size_flushes_immediately() {
    let store = Arc::new(MockStore::default());
    let writer = writer(
        &store,
        BatchWriterConfig {
            max_queue_size: 10,
            ..BatchWriterConfig::default()
        },
    );

    for n in 0..9 {
        writer.add(page_view_item(n)).await.expect("add");
    }
    assert_eq!(store.calls(), 0);

    writer.add(page_view_item(9)).await.expect("add");
    assert_eq!(store.total_writes(), 10);
    assert_eq!(writer.queued().await, 0);
}

#[tokio::test]
async fn concurrent_flushes_write_each_item_exactly_once() {
    let store = Arc::new(MockStore::with_latency(Duration::from_millis(10)));
    let writer = writer(
        &store,
        BatchWriterConfig {
            max_queue_size: 1_000,
            ..BatchWriterConfig::default()
        },
    );
    let items: Vec<BatchItem> = (0..60).map(page_view_item).collect();
    let ids: Vec<String> = items.iter().map(BatchItem::item_id).collect();
    for item in items {
        writer.add(item).await.expect("add");
    }

    let (first, second) = tokio::join!(writer.flush(), writer.flush());

    assert_eq!(first.successful + second.successful, 60);
    assert_eq!(store.total_writes(), 60);
    for id in &ids {
        assert_eq!(store.writes_of(id), 1, "{id} written once");
    }
}

#[tokio::test]
async fn fifty_seven_items_are_written_as_25_25_7() {
    let store = Arc::new(MockStore::default());
    let writer = writer(
        &store,
        BatchWriterConfig {
            max_queue_size: 1_000,
            ..BatchWriterConfig::default()
        },
    );
    for n in 0..57 {
        writer.add(page_view_item(n)).await.expect("add");
    }

    let result = writer.flush().await;

    assert_eq!(result.successful, 57);
    assert!(result.is_clean());
    assert_eq!(store.calls(), 3);
    assert_eq!(store.chunk_sizes(), vec![25, 25, 7]);
}

#[tokio::test]
async fn oversized_batch_setting_is_clamped_to_store_limit() {
    let store = Arc::new(MockStore::default());
    let writer = writer(
        &store,
        BatchWriterConfig {
            max_batch_size: 500,
            max_queue_size: 1_000,
            ..BatchWriterConfig::default()
        },
    );

    let result = writer.write_now((0..30).map(page_view_item).collect()).await;

    assert_eq!(result.successful, 30);
    assert_eq!(store.chunk_sizes(), vec![25, 5]);
}

#[tokio::test(start_paused = true)]
async fn explicit_flush_returns_items_left_unprocessed() {
    let store = Arc::new(MockStore::default());
    // First attempt plus three resubmissions all leave two items behind.
    for _ in 0..4 {
        store.script(Step::LeaveUnprocessed(2));
    }
    let writer = writer(&store, BatchWriterConfig::default());
    for n in 0..5 {
        writer.add(page_view_item(n)).await.expect("add");
    }

    let result = writer.flush().await;

    assert_eq!(result.successful, 3);
    assert_eq!(result.failed, 0);
    assert_eq!(result.unprocessed.len(), 2);
    assert_eq!(store.calls(), 4);
    assert_eq!(writer.queued().await, 0, "explicit flush hands items back");
}

#[tokio::test(start_paused = true)]
async fn background_flush_requeues_unprocessed_items() {
    let store = Arc::new(MockStore::default());
    for _ in 0..4 {
        store.script(Step::LeaveUnprocessed(1));
    }
    let writer = writer(
        &store,
        BatchWriterConfig {
            max_queue_size: 5,
            ..BatchWriterConfig::default()
        },
    );

    for n in 0..5 {
        writer.add(page_view_item(n)).await.expect("add");
    }
    assert_eq!(store.total_writes(), 4);
    assert_eq!(writer.queued().await, 1);

    let result = writer.flush().await;
    assert_eq!(result.successful, 1);
    assert_eq!(store.total_writes(), 5);
}

#[tokio::test(start_paused = true)]
async fn transient_chunk_failure_is_retried() {
    let store = Arc::new(MockStore::default());
    store.script(Step::Fail(BackendError::Throttled("slow down".to_string())));
    let writer = writer(&store, BatchWriterConfig::default());

    let result = writer.write_now((0..5).map(page_view_item).collect()).await;

    assert_eq!(result.successful, 5);
    assert!(result.is_clean());
    assert_eq!(store.calls(), 2);
}

#[tokio::test]
async fn permanent_chunk_failure_fails_the_chunk_and_calls_back() {
    let store = Arc::new(MockStore::default());
    store.script(Step::Fail(BackendError::Validation("bad".to_string())));
    let reported: Arc<Mutex<Vec<String>>> = Arc::default();
    let sink = Arc::clone(&reported);
    let writer = BatchWriter::new(Arc::clone(&store), BatchWriterConfig::default())
        .with_error_callback(move |items, error| {
            assert!(matches!(error, IngestError::Backend(BackendError::Validation(_))));
            sink.lock()
                .expect("reported")
                .extend(items.iter().map(BatchItem::item_id));
        });

    let result = writer.write_now((0..5).map(page_view_item).collect()).await;

    assert_eq!(result.failed, 5);
    assert_eq!(result.successful, 0);
    assert_eq!(store.calls(), 1, "permanent errors are not retried");
    assert_eq!(reported.lock().expect("reported").len(), 5);
}

#[tokio::test]
async fn invalid_items_are_counted_failed_and_never_written() {
    let store = Arc::new(MockStore::default());
    let writer = writer(&store, BatchWriterConfig::default());
    let broken = BatchItem::PageView(PageView::new("site_1", "sess", "vis", "", at(0)));

    let result = writer.write_now(vec![broken, page_view_item(1)]).await;

    assert_eq!(result.failed, 1);
    assert_eq!(result.successful, 1);
    assert_eq!(store.total_writes(), 1);
}

#[tokio::test]
async fn close_flushes_and_rejects_later_adds() {
    let store = Arc::new(MockStore::default());
    let writer = writer(&store, BatchWriterConfig::default());
    writer.start().await;
    for n in 0..3 {
        writer.add(page_view_item(n)).await.expect("add");
    }

    let result = writer.close().await;
    assert_eq!(result.successful, 3);
    assert_eq!(store.total_writes(), 3);

    let err = writer.add(page_view_item(4)).await.expect_err("closed");
    assert!(matches!(err, IngestError::Closed));
    assert_eq!(writer.close().await, Default::default());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn adds_racing_close_are_either_written_or_rejected() {
    let store = Arc::new(MockStore::default());
    let writer = writer(&store, BatchWriterConfig::default());

    let adders: Vec<_> = (0..8)
        .map(|worker| {
            let writer = Arc::clone(&writer);
            tokio::spawn(async move {
                let mut accepted: usize = 0;
                for n in 0..50 {
                    match writer.add(page_view_item(worker * 1_000 + n)).await {
                        Ok(()) => accepted += 1,
                        Err(IngestError::Closed) => break,
                        Err(e) => panic!("unexpected error: {e}"),
                    }
                    tokio::task::yield_now().await;
                }
                accepted
            })
        })
        .collect();
    tokio::task::yield_now().await;
    let closed = writer.close().await;

    let mut accepted: usize = 0;
    for adder in adders {
        accepted += adder.await.expect("adder");
    }
    assert!(closed.is_clean());
    assert_eq!(writer.queued().await, 0, "nothing stranded after close");
    assert_eq!(store.total_writes(), accepted);
}

#[tokio::test]
async fn panicking_chunk_write_is_reported_to_the_callback() {
    let store = Arc::new(MockStore::default());
    store.script(Step::Panic);
    let reported = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&reported);
    let writer = BatchWriter::new(Arc::clone(&store), BatchWriterConfig::default())
        .with_error_callback(move |items: &[BatchItem], err: &IngestError| {
            assert!(matches!(err, IngestError::Join(_)));
            sink.lock()
                .expect("reported")
                .extend(items.iter().map(BatchItem::item_id));
        });

    let result = writer.write_now((0..3).map(page_view_item).collect()).await;

    assert_eq!(result.failed, 3);
    assert_eq!(reported.lock().expect("reported").len(), 3);
}
