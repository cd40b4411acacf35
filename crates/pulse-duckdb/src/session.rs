use async_trait::async_trait;
use duckdb::Connection;

use pulse_core::error::BackendError;
use pulse_core::session::Session;
use pulse_core::store::SessionLoader;

use crate::backend::{classify, millis_to_utc};
use crate::DuckDbBackend;

/// Insert or overwrite the durable copy of a session aggregate.
///
/// The ingest path sends the full aggregate on every update. Chunks land in
/// any order and the queue can redeliver, so a copy only replaces the row
/// when it ends later, or ends at the same time and has counted at least as
/// many events.
pub(crate) fn upsert_session(conn: &Connection, session: &Session) -> duckdb::Result<usize> {
    conn.execute(
        r#"INSERT INTO sessions (
            site_id, session_id, visitor_id, started_at_ms, ended_at_ms,
            page_view_count, event_count, is_bounce, duration_ms,
            entry_path, exit_path, ttl
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
        ON CONFLICT (site_id, session_id) DO UPDATE SET
            visitor_id = EXCLUDED.visitor_id,
            started_at_ms = EXCLUDED.started_at_ms,
            ended_at_ms = EXCLUDED.ended_at_ms,
            page_view_count = EXCLUDED.page_view_count,
            event_count = EXCLUDED.event_count,
            is_bounce = EXCLUDED.is_bounce,
            duration_ms = EXCLUDED.duration_ms,
            entry_path = EXCLUDED.entry_path,
            exit_path = EXCLUDED.exit_path,
            ttl = EXCLUDED.ttl
        WHERE EXCLUDED.ended_at_ms > sessions.ended_at_ms
            OR (EXCLUDED.ended_at_ms = sessions.ended_at_ms
                AND EXCLUDED.page_view_count + EXCLUDED.event_count
                    >= sessions.page_view_count + sessions.event_count)"#,
        duckdb::params![
            session.site_id,
            session.session_id,
            session.visitor_id,
            session.started_at.timestamp_millis(),
            session.ended_at.timestamp_millis(),
            i64::from(session.page_view_count),
            i64::from(session.event_count),
            session.is_bounce,
            session.duration,
            session.entry_path,
            session.exit_path,
            session.ttl,
        ],
    )
}

#[async_trait]
impl SessionLoader for DuckDbBackend {
    async fn load_session(
        &self,
        site_id: &str,
        session_id: &str,
    ) -> Result<Option<Session>, BackendError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                r#"SELECT visitor_id, started_at_ms, ended_at_ms, page_view_count,
                          event_count, is_bounce, duration_ms, entry_path, exit_path, ttl
                   FROM sessions
                   WHERE site_id = ?1 AND session_id = ?2"#,
            )
            .map_err(classify)?;
        let mut rows = stmt
            .query_map(duckdb::params![site_id, session_id], |row| {
                Ok(Session {
                    site_id: site_id.to_string(),
                    session_id: session_id.to_string(),
                    visitor_id: row.get(0)?,
                    started_at: millis_to_utc(row.get(1)?),
                    ended_at: millis_to_utc(row.get(2)?),
                    page_view_count: row.get::<_, i64>(3)?.max(0) as u32,
                    event_count: row.get::<_, i64>(4)?.max(0) as u32,
                    is_bounce: row.get(5)?,
                    duration: row.get(6)?,
                    entry_path: row.get(7)?,
                    exit_path: row.get(8)?,
                    ttl: row.get(9)?,
                })
            })
            .map_err(classify)?;
        rows.next().transpose().map_err(classify)
    }
}
