use std::collections::HashMap;

use async_trait::async_trait;
use duckdb::Transaction;

use pulse_core::error::BackendError;
use pulse_core::event::{BatchItem, CustomEvent, PageView};
use pulse_core::session::Session;
use pulse_core::store::{BatchStore, BatchWriteOutput, STORE_BATCH_LIMIT};

use crate::backend::classify;
use crate::session::upsert_session;
use crate::DuckDbBackend;

#[async_trait]
impl BatchStore for DuckDbBackend {
    /// Write one chunk in a single transaction.
    ///
    /// Raw events are keyed by id and inserted with `DO NOTHING`, so a
    /// redelivered queue message does not duplicate rows. When a chunk holds
    /// several updates of the same session only the latest is written.
    async fn batch_write(&self, items: &[BatchItem]) -> Result<BatchWriteOutput, BackendError> {
        if items.len() > STORE_BATCH_LIMIT {
            return Err(BackendError::Validation(format!(
                "batch of {} items exceeds the limit of {STORE_BATCH_LIMIT}",
                items.len()
            )));
        }
        if items.is_empty() {
            return Ok(BatchWriteOutput::complete());
        }

        let mut latest_sessions: HashMap<(&str, &str), &Session> = HashMap::new();
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().map_err(classify)?;

        for item in items {
            match item {
                BatchItem::PageView(pv) => {
                    let partition_key = self.sharding.partition_key_for(&pv.site_id);
                    insert_page_view(&tx, &partition_key, pv).map_err(classify)?;
                }
                BatchItem::Event(ev) => {
                    let partition_key = self.sharding.partition_key_for(&ev.site_id);
                    insert_custom_event(&tx, &partition_key, ev)?;
                }
                BatchItem::Session(session) => {
                    let key = (session.site_id.as_str(), session.session_id.as_str());
                    let newer = latest_sessions
                        .get(&key)
                        .map_or(true, |seen| session.ended_at >= seen.ended_at);
                    if newer {
                        latest_sessions.insert(key, session);
                    }
                }
            }
        }
        for session in latest_sessions.values() {
            upsert_session(&tx, session).map_err(classify)?;
        }

        tx.commit().map_err(classify)?;
        tracing::debug!(count = items.len(), "Batch written to DuckDB");
        Ok(BatchWriteOutput::complete())
    }
}

fn insert_page_view(
    tx: &Transaction<'_>,
    partition_key: &str,
    pv: &PageView,
) -> duckdb::Result<usize> {
    tx.execute(
        r#"INSERT INTO page_views (
            id, partition_key, site_id, session_id, visitor_id,
            path, referrer, title, ts_ms, ttl
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        ON CONFLICT (id) DO NOTHING"#,
        duckdb::params![
            pv.id,
            partition_key,
            pv.site_id,
            pv.session_id,
            pv.visitor_id,
            pv.path,
            pv.referrer,
            pv.title,
            pv.timestamp.timestamp_millis(),
            pv.ttl,
        ],
    )
}

fn insert_custom_event(
    tx: &Transaction<'_>,
    partition_key: &str,
    ev: &CustomEvent,
) -> Result<usize, BackendError> {
    let properties = ev
        .properties
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    tx.execute(
        r#"INSERT INTO custom_events (
            id, partition_key, site_id, session_id, visitor_id,
            name, category, path, properties, ts_ms, ttl
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
        ON CONFLICT (id) DO NOTHING"#,
        duckdb::params![
            ev.id,
            partition_key,
            ev.site_id,
            ev.session_id,
            ev.visitor_id,
            ev.name,
            ev.category,
            ev.path,
            properties,
            ev.timestamp.timestamp_millis(),
            ev.ttl,
        ],
    )
    .map_err(classify)
}
