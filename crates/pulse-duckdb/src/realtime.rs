use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use pulse_core::event::RealtimePresence;
use pulse_core::store::CoalescedSink;

use crate::backend::millis_to_utc;
use crate::DuckDbBackend;

#[async_trait]
impl CoalescedSink<RealtimePresence> for DuckDbBackend {
    async fn write(&self, _key: &str, value: RealtimePresence) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"INSERT INTO realtime_presence (site_id, visitor_id, session_id, path, last_seen_ms)
               VALUES (?1, ?2, ?3, ?4, ?5)
               ON CONFLICT (site_id, visitor_id) DO UPDATE SET
                   session_id = EXCLUDED.session_id,
                   path = EXCLUDED.path,
                   last_seen_ms = EXCLUDED.last_seen_ms"#,
            duckdb::params![
                value.site_id,
                value.visitor_id,
                value.session_id,
                value.path,
                value.last_seen.timestamp_millis(),
            ],
        )?;
        Ok(())
    }
}

impl DuckDbBackend {
    /// Visitors seen on `site_id` at or after `since`, most recent first.
    pub async fn active_visitors(
        &self,
        site_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<RealtimePresence>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            r#"SELECT visitor_id, session_id, path, last_seen_ms
               FROM realtime_presence
               WHERE site_id = ?1 AND last_seen_ms >= ?2
               ORDER BY last_seen_ms DESC"#,
        )?;
        let rows = stmt
            .query_map(duckdb::params![site_id, since.timestamp_millis()], |row| {
                Ok(RealtimePresence {
                    site_id: site_id.to_string(),
                    visitor_id: row.get(0)?,
                    session_id: row.get(1)?,
                    path: row.get(2)?,
                    last_seen: millis_to_utc(row.get(3)?),
                })
            })?
            .collect::<duckdb::Result<Vec<_>>>()?;
        Ok(rows)
    }
}
