use std::sync::Arc;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use pulse_core::config::Config;
use pulse_core::queue::{ReceivedMessage, QUEUE_BATCH_LIMIT};
use pulse_duckdb::DuckDbBackend;
use pulse_ingest::batch_writer::{BatchWriter, BatchWriterConfig};
use pulse_ingest::coalescer::WriteCoalescer;
use pulse_ingest::consumer::{ConsumerConfig, EventQueueConsumer};
use pulse_ingest::retry::RetryPolicy;

type Consumer = EventQueueConsumer<DuckDbBackend, DuckDbBackend>;

/// `pulse-ingest` reads newline-delimited queue message bodies from stdin,
/// writes them to DuckDB and prints one partial-failure report per batch.
///
/// `pulse-ingest purge` deletes rows whose `ttl` has passed.
#[tokio::main]
async fn main() -> Result<()> {
    // Structured JSON logging. Level controlled via RUST_LOG.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("pulse=info".parse()?),
        )
        .json()
        .with_writer(std::io::stderr)
        .init();

    let cfg = Config::from_env().map_err(|e| anyhow::anyhow!(e))?;

    std::fs::create_dir_all(&cfg.data_dir)?;
    let db_path = cfg.database_path();
    let db = Arc::new(DuckDbBackend::open(
        &db_path,
        &cfg.duckdb_memory_limit,
        cfg.sharding(),
    )?);
    db.ping().await?;
    info!(
        db_path = %db_path,
        sharded_sites = db.sharding().sharded_sites.len(),
        "DuckDB ready"
    );

    let args: Vec<String> = std::env::args().collect();
    if args.get(1).map(|s| s.as_str()) == Some("purge") {
        let removed = db.purge_expired(chrono::Utc::now()).await?;
        info!(removed, "TTL sweep finished");
        return Ok(());
    }

    let writer = Arc::new(BatchWriter::new(
        Arc::clone(&db),
        BatchWriterConfig::from_config(&cfg),
    ));
    writer.start().await;
    let presence = Arc::new(WriteCoalescer::new(Arc::clone(&db), cfg.coalesce_window()));
    let consumer = EventQueueConsumer::new(
        Arc::clone(&writer),
        Arc::clone(&presence),
        ConsumerConfig {
            concurrency: cfg.consumer_concurrency,
            retry: RetryPolicy::consumer().with_max_retries(cfg.max_retries),
        },
    );

    info!("Reading queue messages from stdin");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut batch = Vec::with_capacity(QUEUE_BATCH_LIMIT);
    let mut line_no = 0usize;
    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        batch.push(ReceivedMessage {
            message_id: format!("line-{line_no}"),
            body: line,
        });
        if batch.len() == QUEUE_BATCH_LIMIT {
            deliver(&consumer, std::mem::take(&mut batch)).await?;
        }
    }
    if !batch.is_empty() {
        deliver(&consumer, batch).await?;
    }

    presence.flush().await;
    let last = writer.close().await;
    if !last.unprocessed.is_empty() {
        warn!(
            count = last.unprocessed.len(),
            "Exiting with unprocessed items"
        );
    }
    Ok(())
}

async fn deliver(consumer: &Consumer, batch: Vec<ReceivedMessage>) -> Result<()> {
    let response = consumer.process_batch(batch).await;
    println!("{}", serde_json::to_string(&response)?);
    Ok(())
}
