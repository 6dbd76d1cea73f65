//! Core types for the a3s-stream client
//!
//! Events use snake_case JSON on the wire, with the payload fields
//! flattened into the top-level document next to the envelope fields.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Envelope keys that a payload may not override
const RESERVED_KEYS: [&str; 5] = [
    "event_id",
    "event_type",
    "event_version",
    "timestamp",
    "metadata",
];

/// Entity families of the academic event catalogue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AcademicEntity {
    Profile,
    Course,
    Assignment,
    Exam,
    Quiz,
    Lab,
    Study,
    Challenge,
    Schedule,
}

impl AcademicEntity {
    pub const ALL: [AcademicEntity; 9] = [
        AcademicEntity::Profile,
        AcademicEntity::Course,
        AcademicEntity::Assignment,
        AcademicEntity::Exam,
        AcademicEntity::Quiz,
        AcademicEntity::Lab,
        AcademicEntity::Study,
        AcademicEntity::Challenge,
        AcademicEntity::Schedule,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AcademicEntity::Profile => "profile",
            AcademicEntity::Course => "course",
            AcademicEntity::Assignment => "assignment",
            AcademicEntity::Exam => "exam",
            AcademicEntity::Quiz => "quiz",
            AcademicEntity::Lab => "lab",
            AcademicEntity::Study => "study",
            AcademicEntity::Challenge => "challenge",
            AcademicEntity::Schedule => "schedule",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|e| e.as_str() == s)
    }

    /// Whether this entity emits the given action
    ///
    /// Profiles are never deleted; they are enrolled and unenrolled instead.
    pub fn supports(&self, action: EventAction) -> bool {
        match (self, action) {
            (AcademicEntity::Profile, EventAction::Deleted) => false,
            (AcademicEntity::Profile, _) => true,
            (_, EventAction::Enrolled | EventAction::Unenrolled) => false,
            _ => true,
        }
    }
}

/// Lifecycle action carried by an academic event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventAction {
    Created,
    Updated,
    Deleted,
    Enrolled,
    Unenrolled,
}

impl EventAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventAction::Created => "created",
            EventAction::Updated => "updated",
            EventAction::Deleted => "deleted",
            EventAction::Enrolled => "enrolled",
            EventAction::Unenrolled => "unenrolled",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(EventAction::Created),
            "updated" => Some(EventAction::Updated),
            "deleted" => Some(EventAction::Deleted),
            "enrolled" => Some(EventAction::Enrolled),
            "unenrolled" => Some(EventAction::Unenrolled),
            _ => None,
        }
    }
}

/// Event type, decoded once when an event enters the client
///
/// Known `academic.<entity>.<action>` types map to `Academic`; anything
/// else is kept verbatim in `Other`. The string form doubles as the
/// publish subject.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventKind {
    Academic {
        entity: AcademicEntity,
        action: EventAction,
    },
    Other(String),
}

impl EventKind {
    pub fn academic(entity: AcademicEntity, action: EventAction) -> Self {
        if entity.supports(action) {
            EventKind::Academic { entity, action }
        } else {
            EventKind::Other(format!("academic.{}.{}", entity.as_str(), action.as_str()))
        }
    }

    pub fn parse(s: &str) -> Self {
        let mut parts = s.split('.');
        if let (Some("academic"), Some(entity), Some(action), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        {
            if let (Some(entity), Some(action)) =
                (AcademicEntity::parse(entity), EventAction::parse(action))
            {
                if entity.supports(action) {
                    return EventKind::Academic { entity, action };
                }
            }
        }
        EventKind::Other(s.to_string())
    }

    /// Subject this event type is published to
    pub fn as_subject(&self) -> String {
        self.to_string()
    }

    pub fn is_known(&self) -> bool {
        matches!(self, EventKind::Academic { .. })
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Academic { entity, action } => {
                write!(f, "academic.{}.{}", entity.as_str(), action.as_str())
            }
            EventKind::Other(s) => f.write_str(s),
        }
    }
}

impl From<String> for EventKind {
    fn from(s: String) -> Self {
        EventKind::parse(&s)
    }
}

impl From<&str> for EventKind {
    fn from(s: &str) -> Self {
        EventKind::parse(s)
    }
}

impl From<EventKind> for String {
    fn from(kind: EventKind) -> Self {
        kind.to_string()
    }
}

/// Tracing and correlation metadata attached to every event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Service that produced the event
    pub source_service: String,

    /// Links related events across services
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    /// Id of the event that caused this one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,

    /// User who triggered the event
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    /// Tenant isolation key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub institution_id: Option<String>,

    /// Propagated trace context (e.g. `traceparent`)
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub trace_context: HashMap<String, String>,
}

impl EventMetadata {
    pub fn new(source_service: impl Into<String>) -> Self {
        Self {
            source_service: source_service.into(),
            correlation_id: None,
            causation_id: None,
            user_id: None,
            institution_id: None,
            trace_context: HashMap::new(),
        }
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_causation_id(mut self, id: impl Into<String>) -> Self {
        self.causation_id = Some(id.into());
        self
    }

    pub fn with_user_id(mut self, id: impl Into<String>) -> Self {
        self.user_id = Some(id.into());
        self
    }

    pub fn with_institution_id(mut self, id: impl Into<String>) -> Self {
        self.institution_id = Some(id.into());
        self
    }

    pub fn with_trace(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.trace_context.insert(key.into(), value.into());
        self
    }
}

/// An immutable event
///
/// The `event_id` is generated once at construction and is the
/// idempotency key for the whole delivery pipeline: publish retries
/// resend the same id and the broker deduplicates on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    event_id: Uuid,

    event_type: EventKind,

    #[serde(default = "default_version")]
    event_version: String,

    #[serde(with = "timestamp")]
    timestamp: DateTime<Utc>,

    metadata: EventMetadata,

    #[serde(flatten)]
    payload: serde_json::Map<String, serde_json::Value>,
}

fn default_version() -> String {
    "1.0".to_string()
}

impl Event {
    /// Create a new event with a fresh id and the current time
    ///
    /// Object payloads are flattened into the event document; any other
    /// JSON value is stored under `data`. Payload keys that collide with
    /// envelope fields are dropped.
    pub fn new(
        event_type: impl Into<EventKind>,
        metadata: EventMetadata,
        payload: serde_json::Value,
    ) -> Self {
        let mut payload = match payload {
            serde_json::Value::Object(map) => map,
            serde_json::Value::Null => serde_json::Map::new(),
            other => {
                let mut map = serde_json::Map::new();
                map.insert("data".to_string(), other);
                map
            }
        };
        for key in RESERVED_KEYS {
            payload.remove(key);
        }

        Self {
            event_id: Uuid::new_v4(),
            event_type: event_type.into(),
            event_version: default_version(),
            timestamp: Utc::now(),
            metadata,
            payload,
        }
    }

    /// Set the schema version (builder style, before the event is shared)
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.event_version = version.into();
        self
    }

    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn event_type(&self) -> &EventKind {
        &self.event_type
    }

    pub fn event_version(&self) -> &str {
        &self.event_version
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn metadata(&self) -> &EventMetadata {
        &self.metadata
    }

    pub fn payload(&self) -> &serde_json::Map<String, serde_json::Value> {
        &self.payload
    }

    /// Subject derived from the event type
    pub fn subject(&self) -> String {
        self.event_type.as_subject()
    }

    /// Decode the payload into a typed record
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> crate::Result<T> {
        let value = serde_json::Value::Object(self.payload.clone());
        Ok(serde_json::from_value(value)?)
    }
}

/// Timestamps are written as RFC 3339; naive ISO-8601 values (no offset)
/// from older producers are read as UTC.
mod timestamp {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&ts.to_rfc3339())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        if let Ok(ts) = DateTime::parse_from_rfc3339(&raw) {
            return Ok(ts.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f")
            .map(|naive| naive.and_utc())
            .map_err(serde::de::Error::custom)
    }
}

/// Broker confirmation for a published event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishAck {
    /// Stream that stored the message
    pub stream: String,

    /// Stream sequence assigned to the message
    pub sequence: u64,

    /// True if the broker recognised the message id as a duplicate
    pub duplicate: bool,
}

/// How `publish_batch` issues its publishes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchMode {
    /// One at a time; every event is attempted
    Sequential,
    /// One at a time; stop at the first failure and mark the rest skipped
    SequentialFailFast,
    /// Concurrently, bounded by the publisher's concurrency limit
    Parallel,
}

impl BatchMode {
    pub fn parallel(parallel: bool) -> Self {
        if parallel {
            BatchMode::Parallel
        } else {
            BatchMode::Sequential
        }
    }
}

/// Per-event outcome of a batch publish
#[derive(Debug)]
pub enum BatchOutcome {
    Published(PublishAck),
    Failed(crate::EventError),
    /// Not attempted because a fail-fast batch stopped earlier
    Skipped,
}

impl BatchOutcome {
    pub fn is_published(&self) -> bool {
        matches!(self, BatchOutcome::Published(_))
    }

    pub fn ack(&self) -> Option<&PublishAck> {
        match self {
            BatchOutcome::Published(ack) => Some(ack),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&crate::EventError> {
        match self {
            BatchOutcome::Failed(e) => Some(e),
            _ => None,
        }
    }
}

/// Ordered batch outcomes; index `i` belongs to input event `i`
#[derive(Debug, Default)]
pub struct PublishResult {
    outcomes: Vec<BatchOutcome>,
}

impl PublishResult {
    pub(crate) fn new(outcomes: Vec<BatchOutcome>) -> Self {
        Self { outcomes }
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    /// True when every event was published
    pub fn all_published(&self) -> bool {
        self.outcomes.iter().all(BatchOutcome::is_published)
    }

    pub fn published_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_published()).count()
    }

    /// Indices of events that failed
    pub fn failed_indices(&self) -> Vec<usize> {
        self.outcomes
            .iter()
            .enumerate()
            .filter(|(_, o)| matches!(o, BatchOutcome::Failed(_)))
            .map(|(i, _)| i)
            .collect()
    }

    pub fn get(&self, index: usize) -> Option<&BatchOutcome> {
        self.outcomes.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &BatchOutcome> {
        self.outcomes.iter()
    }

    pub fn into_outcomes(self) -> Vec<BatchOutcome> {
        self.outcomes
    }
}

/// Delivery metadata handed to the message handler
#[derive(Debug, Clone)]
pub struct DeliveryContext {
    /// Durable consumer that received the message
    pub consumer: String,

    /// Stream the message belongs to
    pub stream: String,

    /// Subject the message was published to
    pub subject: String,

    /// Stream sequence (stable across redeliveries)
    pub stream_sequence: u64,

    /// Delivery attempt, starting at 1
    pub delivery_count: u64,

    /// Message headers
    pub headers: HashMap<String, String>,
}

/// Handler decision for a delivered message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Processing succeeded
    Ack,
    /// Processing failed; redeliver, optionally after a delay
    Nak(Option<Duration>),
    /// Give up on the message; no further redelivery
    Term(String),
}

impl Outcome {
    pub fn nak() -> Self {
        Outcome::Nak(None)
    }

    pub fn nak_after(delay: Duration) -> Self {
        Outcome::Nak(Some(delay))
    }

    pub fn term(reason: impl Into<String>) -> Self {
        Outcome::Term(reason.into())
    }

    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Ack => "ack",
            Outcome::Nak(_) => "nak",
            Outcome::Term(_) => "term",
        }
    }
}

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Consumer pull-loop state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConsumerState {
    Idle,
    Pulling,
    Dispatching,
    Draining,
    Stopped,
}
