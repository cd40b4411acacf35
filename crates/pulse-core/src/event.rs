use chrono::{DateTime, Utc};
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

use crate::error::CoreError;
use crate::session::Session;

/// Wire discriminator of an [`AnalyticsEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Pageview,
    Session,
    Event,
    Realtime,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Pageview => "pageview",
            EventKind::Session => "session",
            EventKind::Event => "event",
            EventKind::Realtime => "realtime",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        match raw {
            "pageview" => Ok(EventKind::Pageview),
            "session" => Ok(EventKind::Session),
            "event" => Ok(EventKind::Event),
            "realtime" => Ok(EventKind::Realtime),
            other => Err(CoreError::UnknownEventType(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageView {
    pub id: String,
    pub site_id: String,
    pub session_id: String,
    pub visitor_id: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referrer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// Store-side expiry, epoch seconds. Filled from the TTL policy when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<i64>,
}

impl PageView {
    pub fn new(
        site_id: impl Into<String>,
        session_id: impl Into<String>,
        visitor_id: impl Into<String>,
        path: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            site_id: site_id.into(),
            session_id: session_id.into(),
            visitor_id: visitor_id.into(),
            path: path.into(),
            referrer: None,
            title: None,
            timestamp,
            ttl: None,
        }
    }

    pub fn with_referrer(mut self, referrer: impl Into<String>) -> Self {
        self.referrer = Some(referrer.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomEvent {
    pub id: String,
    pub site_id: String,
    pub session_id: String,
    pub visitor_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Arbitrary client-supplied properties; expected to be a JSON object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<Value>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<i64>,
}

impl CustomEvent {
    pub fn new(
        site_id: impl Into<String>,
        session_id: impl Into<String>,
        visitor_id: impl Into<String>,
        name: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            site_id: site_id.into(),
            session_id: session_id.into(),
            visitor_id: visitor_id.into(),
            name: name.into(),
            category: None,
            path: None,
            properties: None,
            timestamp,
            ttl: None,
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_properties(mut self, properties: Value) -> Self {
        self.properties = Some(properties);
        self
    }
}

/// Latest-known position of a visitor, used by the realtime view. Written
/// through the coalescer, so only the freshest value per visitor survives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimePresence {
    pub site_id: String,
    pub visitor_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub path: String,
    pub last_seen: DateTime<Utc>,
}

impl RealtimePresence {
    pub fn coalesce_key(&self) -> String {
        format!("{}:{}", self.site_id, self.visitor_id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    PageView(PageView),
    Session(Session),
    Custom(CustomEvent),
    Realtime(RealtimePresence),
}

/// One analytics event as it travels through the queue.
///
/// Wire shape: `{ "type", "siteId", "timestamp", "data" }`. The `data`
/// object is decoded according to `type`; unknown types are rejected.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RawEvent")]
pub struct AnalyticsEvent {
    pub site_id: String,
    /// Event time, not enqueue time.
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEvent {
    #[serde(rename = "type")]
    kind: String,
    site_id: String,
    timestamp: DateTime<Utc>,
    data: Value,
}

impl TryFrom<RawEvent> for AnalyticsEvent {
    type Error = CoreError;

    fn try_from(raw: RawEvent) -> Result<Self, Self::Error> {
        let payload = match EventKind::parse(&raw.kind)? {
            EventKind::Pageview => EventPayload::PageView(serde_json::from_value(raw.data)?),
            EventKind::Session => EventPayload::Session(serde_json::from_value(raw.data)?),
            EventKind::Event => EventPayload::Custom(serde_json::from_value(raw.data)?),
            EventKind::Realtime => EventPayload::Realtime(serde_json::from_value(raw.data)?),
        };
        Ok(Self {
            site_id: raw.site_id,
            timestamp: raw.timestamp,
            payload,
        })
    }
}

impl Serialize for AnalyticsEvent {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("AnalyticsEvent", 4)?;
        state.serialize_field("type", self.kind().as_str())?;
        state.serialize_field("siteId", &self.site_id)?;
        state.serialize_field("timestamp", &self.timestamp)?;
        match &self.payload {
            EventPayload::PageView(data) => state.serialize_field("data", data)?,
            EventPayload::Session(data) => state.serialize_field("data", data)?,
            EventPayload::Custom(data) => state.serialize_field("data", data)?,
            EventPayload::Realtime(data) => state.serialize_field("data", data)?,
        }
        state.end()
    }
}

impl AnalyticsEvent {
    pub fn page_view(data: PageView) -> Self {
        Self {
            site_id: data.site_id.clone(),
            timestamp: data.timestamp,
            payload: EventPayload::PageView(data),
        }
    }

    pub fn custom(data: CustomEvent) -> Self {
        Self {
            site_id: data.site_id.clone(),
            timestamp: data.timestamp,
            payload: EventPayload::Custom(data),
        }
    }

    pub fn session(data: Session) -> Self {
        Self {
            site_id: data.site_id.clone(),
            timestamp: data.ended_at,
            payload: EventPayload::Session(data),
        }
    }

    pub fn realtime(data: RealtimePresence) -> Self {
        Self {
            site_id: data.site_id.clone(),
            timestamp: data.last_seen,
            payload: EventPayload::Realtime(data),
        }
    }

    pub fn kind(&self) -> EventKind {
        match self.payload {
            EventPayload::PageView(_) => EventKind::Pageview,
            EventPayload::Session(_) => EventKind::Session,
            EventPayload::Custom(_) => EventKind::Event,
            EventPayload::Realtime(_) => EventKind::Realtime,
        }
    }
}

/// Writer-facing wrapper around the three durable payload kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum BatchItem {
    #[serde(rename = "pageview")]
    PageView(PageView),
    #[serde(rename = "session")]
    Session(Session),
    #[serde(rename = "event")]
    Event(CustomEvent),
}

impl BatchItem {
    /// Converts a queue event into a durable item. Realtime presence is not
    /// a batch item and yields `None`.
    pub fn from_event(event: AnalyticsEvent) -> Option<Self> {
        match event.payload {
            EventPayload::PageView(pv) => Some(BatchItem::PageView(pv)),
            EventPayload::Session(s) => Some(BatchItem::Session(s)),
            EventPayload::Custom(ev) => Some(BatchItem::Event(ev)),
            EventPayload::Realtime(_) => None,
        }
    }

    pub fn into_event(self) -> AnalyticsEvent {
        match self {
            BatchItem::PageView(pv) => AnalyticsEvent::page_view(pv),
            BatchItem::Session(s) => AnalyticsEvent::session(s),
            BatchItem::Event(ev) => AnalyticsEvent::custom(ev),
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            BatchItem::PageView(_) => EventKind::Pageview,
            BatchItem::Session(_) => EventKind::Session,
            BatchItem::Event(_) => EventKind::Event,
        }
    }

    /// Identifier used in logs, failure reports and test assertions.
    pub fn item_id(&self) -> String {
        match self {
            BatchItem::PageView(pv) => format!("pageview:{}", pv.id),
            BatchItem::Session(s) => format!("session:{}:{}", s.site_id, s.session_id),
            BatchItem::Event(ev) => format!("event:{}", ev.id),
        }
    }

    pub fn site_id(&self) -> &str {
        match self {
            BatchItem::PageView(pv) => &pv.site_id,
            BatchItem::Session(s) => &s.site_id,
            BatchItem::Event(ev) => &ev.site_id,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            BatchItem::PageView(pv) => pv.timestamp,
            BatchItem::Session(s) => s.ended_at,
            BatchItem::Event(ev) => ev.timestamp,
        }
    }

    pub fn ttl(&self) -> Option<i64> {
        match self {
            BatchItem::PageView(pv) => pv.ttl,
            BatchItem::Session(s) => s.ttl,
            BatchItem::Event(ev) => ev.ttl,
        }
    }

    /// Stamp a `ttl` from `policy` unless the producer already set one.
    pub fn ensure_ttl(&mut self, policy: &TtlPolicy) {
        if self.ttl().is_some() {
            return;
        }
        let ttl = Some(policy.expiry_for(self.kind(), self.timestamp()));
        match self {
            BatchItem::PageView(pv) => pv.ttl = ttl,
            BatchItem::Session(s) => s.ttl = ttl,
            BatchItem::Event(ev) => ev.ttl = ttl,
        }
    }

    /// Reject items that can never be written. These are permanent errors
    /// and must not be retried.
    pub fn validate(&self) -> Result<(), CoreError> {
        fn require(field: &str, value: &str) -> Result<(), CoreError> {
            if value.trim().is_empty() {
                return Err(CoreError::InvalidItem(format!("{field} is empty")));
            }
            Ok(())
        }

        require("siteId", self.site_id())?;
        match self {
            BatchItem::PageView(pv) => {
                require("id", &pv.id)?;
                require("sessionId", &pv.session_id)?;
                require("path", &pv.path)?;
            }
            BatchItem::Session(s) => {
                require("sessionId", &s.session_id)?;
                if s.ended_at < s.started_at {
                    return Err(CoreError::InvalidItem(
                        "session ends before it starts".to_string(),
                    ));
                }
            }
            BatchItem::Event(ev) => {
                require("id", &ev.id)?;
                require("sessionId", &ev.session_id)?;
                require("name", &ev.name)?;
                if let Some(props) = &ev.properties {
                    if !props.is_object() {
                        return Err(CoreError::InvalidItem(
                            "properties must be a JSON object".to_string(),
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Per-entity retention used to stamp the `ttl` attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtlPolicy {
    pub raw_event_days: u32,
    pub session_days: u32,
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self {
            raw_event_days: 30,
            session_days: 30,
        }
    }
}

impl TtlPolicy {
    /// Expiry in epoch seconds for an item of `kind` stamped at `at`.
    pub fn expiry_for(&self, kind: EventKind, at: DateTime<Utc>) -> i64 {
        let days = match kind {
            EventKind::Session => self.session_days,
            _ => self.raw_event_days,
        };
        at.timestamp() + i64::from(days) * 86_400
    }
}
