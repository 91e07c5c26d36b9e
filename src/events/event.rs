//! Event model.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::util::clock::now_ms;
use crate::util::serde::{EventId, Priority, Tags};

/// Lifecycle status of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    /// Accepted, waiting for dispatch or aggregation.
    Pending,
    /// Handlers are running.
    Processing,
    /// At least one handler succeeded, or nobody was subscribed.
    Completed,
    /// Every handler failed.
    Failed,
    /// Shed by backpressure.
    Dropped,
    /// Absorbed into an aggregated event, which carries its payload.
    Aggregated,
}

impl EventStatus {
    /// Lowercase name used in persisted rows.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Dropped => "dropped",
            Self::Aggregated => "aggregated",
        }
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery metadata carried by every event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Dispatch priority.
    pub priority: Priority,
    /// Creation time (ms since epoch).
    pub timestamp_ms: u64,
    /// Publisher identity.
    pub source: Option<String>,
    /// Id tying related events together.
    pub correlation_id: Option<String>,
    /// Redeliveries performed so far.
    pub retry_count: u32,
    /// Redeliveries allowed when every handler fails.
    pub max_retries: u32,
    /// Default per-handler deadline in milliseconds.
    pub timeout_ms: Option<u64>,
    /// Free-form tags.
    pub tags: Tags,
    /// Router destinations that matched this event.
    #[serde(default)]
    pub routes: Vec<String>,
}

/// A topic-addressed notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique id.
    pub id: EventId,
    /// Topic handlers subscribe to.
    pub topic: String,
    /// JSON object payload.
    pub payload: Map<String, Value>,
    /// Delivery metadata.
    pub metadata: EventMetadata,
    /// Current status.
    pub status: EventStatus,
}

impl Event {
    /// Dispatch priority.
    #[must_use]
    pub const fn priority(&self) -> Priority {
        self.metadata.priority
    }

    /// Default handler timeout, if any.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.metadata.timeout_ms.map(Duration::from_millis)
    }

    /// Tag lookup.
    #[must_use]
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.metadata.tags.get(key).map(String::as_str)
    }
}

/// Parameters for `EventBus::publish`.
#[derive(Debug, Clone, Default)]
pub struct EventDraft {
    /// Topic.
    pub topic: String,
    /// JSON object payload.
    pub payload: Map<String, Value>,
    /// Dispatch priority.
    pub priority: Priority,
    /// Publisher identity.
    pub source: Option<String>,
    /// Correlation id.
    pub correlation_id: Option<String>,
    /// Free-form tags.
    pub tags: Tags,
    /// Default per-handler deadline.
    pub timeout: Option<Duration>,
    /// Redeliveries allowed when every handler fails.
    pub max_retries: u32,
}

impl EventDraft {
    /// Draft for `topic` with an empty payload.
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            ..Self::default()
        }
    }

    /// Replace the payload. Non-object values are stored under `"value"`.
    #[must_use]
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = match payload {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("value".into(), other);
                map
            }
        };
        self
    }

    /// Add one payload field.
    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }

    /// Set the priority.
    #[must_use]
    pub const fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the source.
    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Set the correlation id.
    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Add one tag.
    #[must_use]
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Set the default handler timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set redeliveries allowed when every handler fails.
    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Materialize a pending event with a fresh id and timestamp.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn into_event(self) -> Event {
        Event {
            id: uuid::Uuid::new_v4(),
            topic: self.topic,
            payload: self.payload,
            metadata: EventMetadata {
                priority: self.priority,
                timestamp_ms: now_ms(),
                source: self.source,
                correlation_id: self.correlation_id,
                retry_count: 0,
                max_retries: self.max_retries,
                timeout_ms: self.timeout.map(|t| t.as_millis() as u64),
                tags: self.tags,
                routes: Vec::new(),
            },
            status: EventStatus::Pending,
        }
    }
}
