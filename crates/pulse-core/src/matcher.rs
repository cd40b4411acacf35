//! Event matching shared by funnel steps and goals.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::event::{AnalyticsEvent, CustomEvent, EventPayload, PageView};

/// An event that can take part in funnel and goal matching.
#[derive(Debug, Clone, PartialEq)]
pub enum TrackedEvent {
    PageView(PageView),
    Custom(CustomEvent),
}

impl TrackedEvent {
    pub fn from_event(event: &AnalyticsEvent) -> Option<Self> {
        match &event.payload {
            EventPayload::PageView(pv) => Some(TrackedEvent::PageView(pv.clone())),
            EventPayload::Custom(ev) => Some(TrackedEvent::Custom(ev.clone())),
            EventPayload::Session(_) | EventPayload::Realtime(_) => None,
        }
    }

    pub fn site_id(&self) -> &str {
        match self {
            TrackedEvent::PageView(pv) => &pv.site_id,
            TrackedEvent::Custom(ev) => &ev.site_id,
        }
    }

    pub fn session_id(&self) -> &str {
        match self {
            TrackedEvent::PageView(pv) => &pv.session_id,
            TrackedEvent::Custom(ev) => &ev.session_id,
        }
    }

    pub fn visitor_id(&self) -> &str {
        match self {
            TrackedEvent::PageView(pv) => &pv.visitor_id,
            TrackedEvent::Custom(ev) => &ev.visitor_id,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            TrackedEvent::PageView(pv) => pv.timestamp,
            TrackedEvent::Custom(ev) => ev.timestamp,
        }
    }

    pub fn path(&self) -> Option<&str> {
        match self {
            TrackedEvent::PageView(pv) => Some(&pv.path),
            TrackedEvent::Custom(ev) => ev.path.as_deref(),
        }
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            TrackedEvent::PageView(_) => None,
            TrackedEvent::Custom(ev) => Some(&ev.name),
        }
    }

    pub fn category(&self) -> Option<&str> {
        match self {
            TrackedEvent::PageView(_) => None,
            TrackedEvent::Custom(ev) => ev.category.as_deref(),
        }
    }
}

pub type MatchPredicate = Arc<dyn Fn(&TrackedEvent) -> bool + Send + Sync>;

/// Criteria an event must meet. Every criterion that is set must hold; a
/// matcher with no criteria matches nothing.
#[derive(Clone, Default)]
pub struct StepMatcher {
    /// Path pattern; `*` stands for exactly one path segment.
    pub path: Option<String>,
    pub event_name: Option<String>,
    pub event_category: Option<String>,
    pub predicate: Option<MatchPredicate>,
}

impl fmt::Debug for StepMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepMatcher")
            .field("path", &self.path)
            .field("event_name", &self.event_name)
            .field("event_category", &self.event_category)
            .field("predicate", &self.predicate.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

impl StepMatcher {
    pub fn path(pattern: impl Into<String>) -> Self {
        Self {
            path: Some(pattern.into()),
            ..Self::default()
        }
    }

    pub fn event(name: impl Into<String>) -> Self {
        Self {
            event_name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn category(category: impl Into<String>) -> Self {
        Self {
            event_category: Some(category.into()),
            ..Self::default()
        }
    }

    pub fn custom(predicate: impl Fn(&TrackedEvent) -> bool + Send + Sync + 'static) -> Self {
        Self {
            predicate: Some(Arc::new(predicate)),
            ..Self::default()
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.event_category = Some(category.into());
        self
    }

    pub fn with_path(mut self, pattern: impl Into<String>) -> Self {
        self.path = Some(pattern.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.path.is_none()
            && self.event_name.is_none()
            && self.event_category.is_none()
            && self.predicate.is_none()
    }

    pub fn matches(&self, event: &TrackedEvent) -> bool {
        if self.is_empty() {
            return false;
        }
        if let Some(pattern) = &self.path {
            match event.path() {
                Some(path) if path_matches(pattern, path) => {}
                _ => return false,
            }
        }
        if let Some(name) = &self.event_name {
            if event.name() != Some(name.as_str()) {
                return false;
            }
        }
        if let Some(category) = &self.event_category {
            if event.category() != Some(category.as_str()) {
                return false;
            }
        }
        if let Some(predicate) = &self.predicate {
            if !predicate(event) {
                return false;
            }
        }
        true
    }
}

/// Compare a path against a pattern segment by segment. Query strings,
/// fragments and a trailing slash are ignored; `*` matches one non-empty
/// segment and never spans a `/`.
pub fn path_matches(pattern: &str, path: &str) -> bool {
    let pattern = normalize_path(pattern);
    let path = normalize_path(path);
    if !pattern.contains('*') {
        return pattern == path;
    }

    let mut pattern_segments = pattern.split('/');
    let mut path_segments = path.split('/');
    loop {
        match (pattern_segments.next(), path_segments.next()) {
            (None, None) => return true,
            (Some("*"), Some(segment)) if !segment.is_empty() => {}
            (Some(expected), Some(segment)) if expected == segment => {}
            _ => return false,
        }
    }
}

fn normalize_path(raw: &str) -> &str {
    let end = raw.find(['?', '#']).unwrap_or(raw.len());
    let trimmed = &raw[..end];
    if trimmed.len() > 1 {
        trimmed.trim_end_matches('/')
    } else {
        trimmed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at() -> DateTime<Utc> {
        Utc.timestamp_opt(1_767_225_600, 0).unwrap()
    }

    fn page(path: &str) -> TrackedEvent {
        TrackedEvent::PageView(PageView::new("s", "x", "v", path, at()))
    }

    #[test]
    fn exact_path_ignores_query_and_trailing_slash() {
        assert!(path_matches("/pricing", "/pricing/"));
        assert!(path_matches("/pricing", "/pricing?plan=pro"));
        assert!(!path_matches("/pricing", "/pricing/enterprise"));
        assert!(path_matches("/", "/"));
    }

    #[test]
    fn wildcard_matches_exactly_one_segment() {
        assert!(path_matches("/product/*", "/product/42"));
        assert!(path_matches("/product/*/reviews", "/product/42/reviews"));
        assert!(!path_matches("/product/*", "/product/42/reviews"));
        assert!(!path_matches("/product/*", "/product/"));
        assert!(!path_matches("/product/*", "/products/42"));
    }

    #[test]
    fn all_set_criteria_must_hold() {
        let matcher = StepMatcher::event("signup").with_category("conversion");
        let hit = TrackedEvent::Custom(
            CustomEvent::new("s", "x", "v", "signup", at()).with_category("conversion"),
        );
        let wrong_category = TrackedEvent::Custom(
            CustomEvent::new("s", "x", "v", "signup", at()).with_category("marketing"),
        );
        assert!(matcher.matches(&hit));
        assert!(!matcher.matches(&wrong_category));
        assert!(!matcher.matches(&page("/signup")));
    }

    #[test]
    fn custom_predicate_and_empty_matcher() {
        let matcher = StepMatcher::custom(|ev| ev.path().is_some_and(|p| p.starts_with("/docs")));
        assert!(matcher.matches(&page("/docs/intro")));
        assert!(!matcher.matches(&page("/blog")));
        assert!(!StepMatcher::default().matches(&page("/")));
    }
}
