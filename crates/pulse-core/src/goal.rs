use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::conversion::SessionConversionTracker;
use crate::matcher::{StepMatcher, TrackedEvent};

#[derive(Debug, Clone)]
pub struct Goal {
    pub id: String,
    pub site_id: String,
    pub name: String,
    pub matcher: StepMatcher,
}

impl Goal {
    pub fn new(
        id: impl Into<String>,
        site_id: impl Into<String>,
        name: impl Into<String>,
        matcher: StepMatcher,
    ) -> Self {
        Self {
            id: id.into(),
            site_id: site_id.into(),
            name: name.into(),
            matcher,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversion {
    pub site_id: String,
    pub session_id: String,
    pub visitor_id: String,
    pub goal_id: String,
    pub timestamp: DateTime<Utc>,
}

/// Where goal definitions come from. Goal CRUD lives outside this crate.
#[async_trait]
pub trait GoalSource: Send + Sync + 'static {
    async fn goals_for_site(&self, site_id: &str) -> anyhow::Result<Vec<Goal>>;
}

struct CachedGoals {
    goals: Arc<Vec<Goal>>,
    loaded_at: DateTime<Utc>,
}

/// Per-site goal definitions, refreshed after `ttl`.
pub struct GoalCache {
    ttl: Duration,
    entries: HashMap<String, CachedGoals>,
}

impl Default for GoalCache {
    fn default() -> Self {
        Self::new(Duration::minutes(5))
    }
}

impl GoalCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    pub fn get(&self, site_id: &str, now: DateTime<Utc>) -> Option<Arc<Vec<Goal>>> {
        self.entries
            .get(site_id)
            .filter(|cached| now - cached.loaded_at <= self.ttl)
            .map(|cached| Arc::clone(&cached.goals))
    }

    pub fn put(&mut self, site_id: &str, goals: Vec<Goal>, now: DateTime<Utc>) -> Arc<Vec<Goal>> {
        let goals = Arc::new(goals);
        self.entries.insert(
            site_id.to_string(),
            CachedGoals {
                goals: Arc::clone(&goals),
                loaded_at: now,
            },
        );
        goals
    }

    pub fn invalidate(&mut self, site_id: &str) {
        self.entries.remove(site_id);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Match `event` against `goals` and credit every goal this session has not
/// converted on yet.
pub fn detect_conversions(
    goals: &[Goal],
    tracker: &mut SessionConversionTracker,
    event: &TrackedEvent,
) -> Vec<Conversion> {
    let mut conversions = Vec::new();
    for goal in goals {
        if goal.site_id != event.site_id() || !goal.matcher.matches(event) {
            continue;
        }
        if tracker.mark_converted(event.site_id(), event.session_id(), &goal.id) {
            conversions.push(Conversion {
                site_id: event.site_id().to_string(),
                session_id: event.session_id().to_string(),
                visitor_id: event.visitor_id().to_string(),
                goal_id: goal.id.clone(),
                timestamp: event.timestamp(),
            });
        }
    }
    conversions
}
