/// DuckDB initialization SQL.
///
/// Executed once at open time via `Connection::execute_batch`. Every
/// statement uses `IF NOT EXISTS` so it is safe on every startup.
///
/// Timestamps are stored as epoch milliseconds (`*_ms BIGINT`) and `ttl`
/// as epoch seconds, matching the `ttl` attribute on the wire.
///
/// IMPORTANT: DuckDB refuses `ON CONFLICT DO UPDATE` on columns that are
/// part of an index. `sessions` and `realtime_presence` therefore carry no
/// secondary indexes; raw event tables are insert-only and may.
pub fn init_sql(memory_limit: &str) -> String {
    format!(
        r#"SET memory_limit = '{memory_limit}';
SET threads = 2;

-- ===========================================
-- RAW EVENTS (insert-only, expire via ttl)
-- ===========================================
-- partition_key is the site id, or '<site>#<n>' for sharded sites.
CREATE TABLE IF NOT EXISTS page_views (
    id              VARCHAR PRIMARY KEY,
    partition_key   VARCHAR NOT NULL,
    site_id         VARCHAR NOT NULL,
    session_id      VARCHAR NOT NULL,
    visitor_id      VARCHAR NOT NULL,
    path            VARCHAR NOT NULL,
    referrer        VARCHAR,
    title           VARCHAR,
    ts_ms           BIGINT NOT NULL,
    ttl             BIGINT
);
CREATE INDEX IF NOT EXISTS idx_page_views_partition ON page_views(partition_key, ts_ms);

CREATE TABLE IF NOT EXISTS custom_events (
    id              VARCHAR PRIMARY KEY,
    partition_key   VARCHAR NOT NULL,
    site_id         VARCHAR NOT NULL,
    session_id      VARCHAR NOT NULL,
    visitor_id      VARCHAR NOT NULL,
    name            VARCHAR NOT NULL,
    category        VARCHAR,
    path            VARCHAR,
    properties      VARCHAR,                       -- JSON object as text
    ts_ms           BIGINT NOT NULL,
    ttl             BIGINT
);
CREATE INDEX IF NOT EXISTS idx_custom_events_partition ON custom_events(partition_key, ts_ms);

-- ===========================================
-- SESSIONS (upserted on every update)
-- ===========================================
CREATE TABLE IF NOT EXISTS sessions (
    site_id         VARCHAR NOT NULL,
    session_id      VARCHAR NOT NULL,
    visitor_id      VARCHAR NOT NULL,
    started_at_ms   BIGINT NOT NULL,
    ended_at_ms     BIGINT NOT NULL,
    page_view_count INTEGER NOT NULL DEFAULT 0,
    event_count     INTEGER NOT NULL DEFAULT 0,
    is_bounce       BOOLEAN NOT NULL DEFAULT FALSE,
    duration_ms     BIGINT NOT NULL DEFAULT 0,
    entry_path      VARCHAR,
    exit_path       VARCHAR,
    ttl             BIGINT,
    PRIMARY KEY (site_id, session_id)
);

-- ===========================================
-- REALTIME PRESENCE (coalesced, latest wins)
-- ===========================================
CREATE TABLE IF NOT EXISTS realtime_presence (
    site_id         VARCHAR NOT NULL,
    visitor_id      VARCHAR NOT NULL,
    session_id      VARCHAR,
    path            VARCHAR NOT NULL,
    last_seen_ms    BIGINT NOT NULL,
    PRIMARY KEY (site_id, visitor_id)
);
"#
    )
}
