use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::matcher::TrackedEvent;

/// Per-session aggregate keyed by `(site_id, session_id)`.
///
/// Read-modify-written on every page view or custom event belonging to the
/// session and persisted after each update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub site_id: String,
    pub session_id: String,
    pub visitor_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub page_view_count: u32,
    pub event_count: u32,
    /// Exactly one page view and no custom events.
    pub is_bounce: bool,
    /// `ended_at - started_at`, in milliseconds.
    pub duration: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<i64>,
}

impl Session {
    pub fn start(
        site_id: impl Into<String>,
        session_id: impl Into<String>,
        visitor_id: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            site_id: site_id.into(),
            session_id: session_id.into(),
            visitor_id: visitor_id.into(),
            started_at: at,
            ended_at: at,
            page_view_count: 0,
            event_count: 0,
            is_bounce: false,
            duration: 0,
            entry_path: None,
            exit_path: None,
            ttl: None,
        }
    }

    /// Fold one event into the aggregate. Events may arrive out of order;
    /// the entry/exit paths follow event time, not arrival order.
    pub fn record(&mut self, event: &TrackedEvent) {
        let at = event.timestamp();
        match event {
            TrackedEvent::PageView(pv) => {
                self.page_view_count += 1;
                if self.entry_path.is_none() || at < self.started_at {
                    self.entry_path = Some(pv.path.clone());
                }
                if self.exit_path.is_none() || at >= self.ended_at {
                    self.exit_path = Some(pv.path.clone());
                }
            }
            TrackedEvent::Custom(_) => {
                self.event_count += 1;
            }
        }
        if at < self.started_at {
            self.started_at = at;
        }
        if at > self.ended_at {
            self.ended_at = at;
        }
        self.is_bounce = self.page_view_count == 1 && self.event_count == 0;
        self.duration = (self.ended_at - self.started_at).num_milliseconds();
        // A stamped ttl is tied to the old ended_at; let the writer restamp it.
        self.ttl = None;
    }
}

struct CachedSession {
    session: Session,
    touched_at: DateTime<Utc>,
}

/// In-memory session aggregates with an inactivity TTL (default 30 minutes).
///
/// Expired entries are invisible to `get`. `put` sweeps them out at most
/// once per half TTL, and `purge_expired` drops them on demand. The durable
/// copy in the store is authoritative.
pub struct SessionCache {
    ttl: Duration,
    entries: HashMap<(String, String), CachedSession>,
    last_sweep: Option<DateTime<Utc>>,
}

impl Default for SessionCache {
    fn default() -> Self {
        Self::new(Duration::minutes(30))
    }
}

impl SessionCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
            last_sweep: None,
        }
    }

    pub fn get(&self, site_id: &str, session_id: &str, now: DateTime<Utc>) -> Option<Session> {
        self.entries
            .get(&(site_id.to_string(), session_id.to_string()))
            .filter(|cached| now - cached.touched_at <= self.ttl)
            .map(|cached| cached.session.clone())
    }

    pub fn put(&mut self, session: Session, now: DateTime<Utc>) {
        let due = self
            .last_sweep
            .map_or(true, |last| now - last >= self.ttl / 2);
        if due {
            self.purge_expired(now);
            self.last_sweep = Some(now);
        }
        let key = (session.site_id.clone(), session.session_id.clone());
        self.entries.insert(
            key,
            CachedSession {
                session,
                touched_at: now,
            },
        );
    }

    pub fn purge_expired(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        let ttl = self.ttl;
        self.entries.retain(|_, cached| now - cached.touched_at <= ttl);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.last_sweep = None;
    }
}
