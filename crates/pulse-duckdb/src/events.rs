use anyhow::Result;
use chrono::{DateTime, Utc};
use duckdb::Connection;

use pulse_core::event::{CustomEvent, PageView};
use pulse_core::matcher::TrackedEvent;

use crate::backend::millis_to_utc;
use crate::DuckDbBackend;

impl DuckDbBackend {
    /// Load every page view and custom event of `site_id` in `[from, to)`,
    /// ordered by event time.
    ///
    /// A sharded site is read shard by shard and the results merged, since
    /// its rows are spread over all `<site>#<n>` partition keys.
    pub async fn load_tracked_events(
        &self,
        site_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<TrackedEvent>> {
        let conn = self.conn.lock().await;
        let (from_ms, to_ms) = (from.timestamp_millis(), to.timestamp_millis());

        let mut merged = Vec::new();
        for partition_key in self.sharding.read_keys_for(site_id) {
            merged.extend(
                load_page_views(&conn, &partition_key, from_ms, to_ms)?
                    .into_iter()
                    .map(TrackedEvent::PageView),
            );
            merged.extend(
                load_custom_events(&conn, &partition_key, from_ms, to_ms)?
                    .into_iter()
                    .map(TrackedEvent::Custom),
            );
        }
        merged.sort_by_key(|event| event.timestamp());
        Ok(merged)
    }

    /// Delete rows whose `ttl` (epoch seconds) lies before `now`.
    ///
    /// Stands in for the store-native expiry the `ttl` attribute is meant
    /// for. Returns the number of rows removed.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let cutoff = now.timestamp();
        let mut removed = 0;
        for table in ["page_views", "custom_events", "sessions"] {
            removed += tx.execute(
                &format!("DELETE FROM {table} WHERE ttl IS NOT NULL AND ttl < ?1"),
                duckdb::params![cutoff],
            )?;
        }
        tx.commit()?;
        tracing::info!(removed, "Expired rows purged");
        Ok(removed)
    }
}

fn load_page_views(
    conn: &Connection,
    partition_key: &str,
    from_ms: i64,
    to_ms: i64,
) -> Result<Vec<PageView>> {
    let mut stmt = conn.prepare(
        r#"SELECT id, site_id, session_id, visitor_id, path, referrer, title, ts_ms, ttl
           FROM page_views
           WHERE partition_key = ?1 AND ts_ms >= ?2 AND ts_ms < ?3"#,
    )?;
    let rows = stmt
        .query_map(duckdb::params![partition_key, from_ms, to_ms], |row| {
            Ok(PageView {
                id: row.get(0)?,
                site_id: row.get(1)?,
                session_id: row.get(2)?,
                visitor_id: row.get(3)?,
                path: row.get(4)?,
                referrer: row.get(5)?,
                title: row.get(6)?,
                timestamp: millis_to_utc(row.get(7)?),
                ttl: row.get(8)?,
            })
        })?
        .collect::<duckdb::Result<Vec<_>>>()?;
    Ok(rows)
}

fn load_custom_events(
    conn: &Connection,
    partition_key: &str,
    from_ms: i64,
    to_ms: i64,
) -> Result<Vec<CustomEvent>> {
    let mut stmt = conn.prepare(
        r#"SELECT id, site_id, session_id, visitor_id, name, category, path, properties, ts_ms, ttl
           FROM custom_events
           WHERE partition_key = ?1 AND ts_ms >= ?2 AND ts_ms < ?3"#,
    )?;
    let rows = stmt
        .query_map(duckdb::params![partition_key, from_ms, to_ms], |row| {
            let properties: Option<String> = row.get(7)?;
            Ok(CustomEvent {
                id: row.get(0)?,
                site_id: row.get(1)?,
                session_id: row.get(2)?,
                visitor_id: row.get(3)?,
                name: row.get(4)?,
                category: row.get(5)?,
                path: row.get(6)?,
                properties: properties.and_then(|raw| serde_json::from_str(&raw).ok()),
                timestamp: millis_to_utc(row.get(8)?),
                ttl: row.get(9)?,
            })
        })?
        .collect::<duckdb::Result<Vec<_>>>()?;
    Ok(rows)
}
