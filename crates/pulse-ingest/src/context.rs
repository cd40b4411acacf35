use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use tracing::warn;

use pulse_core::conversion::SessionConversionTracker;
use pulse_core::event::AnalyticsEvent;
use pulse_core::goal::{detect_conversions, Conversion, Goal, GoalCache, GoalSource};
use pulse_core::matcher::TrackedEvent;
use pulse_core::session::{Session, SessionCache};
use pulse_core::store::SessionLoader;

/// What one observed event changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Observation {
    /// Updated aggregate of the event's session, to be persisted.
    pub session: Option<Session>,
    pub conversions: Vec<Conversion>,
}

/// Process-wide ingest state: session aggregates, goal definitions and the
/// conversion dedup set.
///
/// Everything lives here rather than in statics, so each test (or each
/// pipeline) builds its own and `clear_all` resets it.
pub struct IngestContext {
    sessions: Mutex<SessionCache>,
    goals: Mutex<GoalCache>,
    tracker: Mutex<SessionConversionTracker>,
    goal_source: Option<Arc<dyn GoalSource>>,
    session_loader: Option<Arc<dyn SessionLoader>>,
}

impl Default for IngestContext {
    fn default() -> Self {
        Self::new(Duration::minutes(30), Duration::minutes(5))
    }
}

impl IngestContext {
    pub fn new(session_ttl: Duration, goal_ttl: Duration) -> Self {
        Self {
            sessions: Mutex::new(SessionCache::new(session_ttl)),
            goals: Mutex::new(GoalCache::new(goal_ttl)),
            tracker: Mutex::new(SessionConversionTracker::default()),
            goal_source: None,
            session_loader: None,
        }
    }

    pub fn with_goal_source(mut self, source: Arc<dyn GoalSource>) -> Self {
        self.goal_source = Some(source);
        self
    }

    pub fn with_session_loader(mut self, loader: Arc<dyn SessionLoader>) -> Self {
        self.session_loader = Some(loader);
        self
    }

    /// Fold a page view or custom event into its session and match it
    /// against the site's goals. Session and realtime events pass through.
    pub async fn observe(&self, event: &AnalyticsEvent, now: DateTime<Utc>) -> Observation {
        let Some(tracked) = TrackedEvent::from_event(event) else {
            return Observation::default();
        };
        let session = self.update_session(&tracked, now).await;

        let goals = self.goals_for(tracked.site_id(), now).await;
        let conversions = if goals.is_empty() {
            Vec::new()
        } else {
            let mut tracker = self.tracker.lock().await;
            detect_conversions(&goals, &mut tracker, &tracked)
        };

        Observation {
            session: Some(session),
            conversions,
        }
    }

    /// Drop cached goals for `site_id`; the next event reloads them.
    pub async fn invalidate_goals(&self, site_id: &str) {
        self.goals.lock().await.invalidate(site_id);
    }

    pub async fn purge_expired_sessions(&self, now: DateTime<Utc>) -> usize {
        self.sessions.lock().await.purge_expired(now)
    }

    pub async fn clear_all(&self) {
        self.sessions.lock().await.clear();
        self.goals.lock().await.clear();
        self.tracker.lock().await.clear();
    }

    async fn update_session(&self, tracked: &TrackedEvent, now: DateTime<Utc>) -> Session {
        let (site_id, session_id) = (tracked.site_id(), tracked.session_id());
        // Held across the store lookup so two events of one session cannot
        // both start from the same stale copy.
        let mut cache = self.sessions.lock().await;

        let cached = cache.get(site_id, session_id, now);
        let existing = match cached {
            Some(session) => Some(session),
            None => self.load_session(site_id, session_id).await,
        };
        let mut session = existing.unwrap_or_else(|| {
            Session::start(site_id, session_id, tracked.visitor_id(), tracked.timestamp())
        });
        session.record(tracked);
        cache.put(session.clone(), now);
        session
    }

    async fn load_session(&self, site_id: &str, session_id: &str) -> Option<Session> {
        let loader = self.session_loader.as_ref()?;
        match loader.load_session(site_id, session_id).await {
            Ok(found) => found,
            Err(e) => {
                warn!(site_id, session_id, error = %e, "Session lookup failed, starting fresh");
                None
            }
        }
    }

    async fn goals_for(&self, site_id: &str, now: DateTime<Utc>) -> Arc<Vec<Goal>> {
        let mut cache = self.goals.lock().await;
        if let Some(goals) = cache.get(site_id, now) {
            return goals;
        }
        let loaded = match &self.goal_source {
            Some(source) => match source.goals_for_site(site_id).await {
                Ok(goals) => goals,
                Err(e) => {
                    warn!(site_id, error = %e, "Goal lookup failed");
                    return Arc::new(Vec::new());
                }
            },
            None => Vec::new(),
        };
        cache.put(site_id, loaded, now)
    }
}
