//! Durable record store for tasks, events and their execution history.
//!
//! Writes are independent single-call operations with no cross-call
//! transactions. Callers treat failures as best-effort: they are logged and
//! never abort execution.

pub mod jsonl;
pub mod memory;
pub mod schema;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::core::task::{Task, TaskStatus};
use crate::events::{Event, EventMetadata, EventStatus};
use crate::util::serde::{EventId, Priority, ResourceRequirement, Tags, TaskId};

pub use jsonl::JsonlStore;
pub use memory::InMemoryStore;

/// Errors produced by store backends.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Filesystem failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Record could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Backend-specific failure with context.
    #[error("backend error: {0}")]
    Backend(String),
}

/// Scheduling metadata persisted with a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecordMetadata {
    /// Dispatch priority.
    pub priority: Priority,
    /// Per-attempt deadline in milliseconds.
    pub timeout_ms: Option<u64>,
    /// Retries allowed.
    pub max_retries: u32,
    /// Base retry delay in milliseconds.
    pub retry_delay_ms: u64,
    /// Retries consumed.
    pub retry_count: u32,
    /// Dependency ids.
    pub dependencies: Vec<TaskId>,
    /// Resource requirement.
    pub resources: ResourceRequirement,
    /// Free-form tags.
    pub tags: Tags,
}

/// Row of the `tasks` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Task id.
    pub id: TaskId,
    /// Task name.
    pub name: String,
    /// Body kind (`sync` or `async`).
    pub func_name: String,
    /// Positional arguments as a JSON array.
    pub args: Value,
    /// Named arguments as a JSON object.
    pub kwargs: Value,
    /// Scheduling metadata.
    pub metadata: TaskRecordMetadata,
    /// Status at the time of the write.
    pub status: TaskStatus,
    /// Successful result.
    pub result: Option<Value>,
    /// Last error text.
    pub error: Option<String>,
    /// Creation time (ms since epoch).
    pub created_at_ms: u64,
    /// Last update (ms since epoch).
    pub updated_at_ms: u64,
}

impl TaskRecord {
    /// Snapshot of `task`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn from_task(task: &Task) -> Self {
        let mut dependencies: Vec<TaskId> = task.dependencies.iter().copied().collect();
        dependencies.sort_unstable();
        Self {
            id: task.id,
            name: task.name.clone(),
            func_name: task.work.kind().to_string(),
            args: Value::Array(task.args.clone()),
            kwargs: Value::Object(task.kwargs.clone()),
            metadata: TaskRecordMetadata {
                priority: task.priority,
                timeout_ms: task.timeout.map(|t| t.as_millis() as u64),
                max_retries: task.retry.max_retries,
                retry_delay_ms: task.retry.retry_delay.as_millis() as u64,
                retry_count: task.retry.retry_count,
                dependencies,
                resources: task.resources,
                tags: task.tags.clone(),
            },
            status: task.status,
            result: task.result.clone(),
            error: task.error.clone(),
            created_at_ms: task.created_at_ms,
            updated_at_ms: task.updated_at_ms,
        }
    }
}

/// Row of the `task_execution_history` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskExecutionRecord {
    /// Auto-assigned by the store; pass 0 when appending.
    pub id: u64,
    /// Task id.
    pub task_id: TaskId,
    /// Status the attempt ended in.
    pub status: TaskStatus,
    /// Wall time of the attempt in milliseconds.
    pub execution_time_ms: u64,
    /// Resources held during the attempt.
    pub resource_usage: ResourceRequirement,
    /// Error text, if the attempt failed.
    pub error_message: Option<String>,
    /// Append time (ms since epoch).
    pub created_at_ms: u64,
}

/// Row of the `events` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Event id.
    pub id: EventId,
    /// Topic.
    pub name: String,
    /// Payload object.
    pub data: Value,
    /// Delivery metadata.
    pub metadata: EventMetadata,
    /// Status at the time of the write.
    pub status: EventStatus,
    /// Creation time (ms since epoch).
    pub created_at_ms: u64,
    /// Last update (ms since epoch).
    pub updated_at_ms: u64,
}

impl EventRecord {
    /// Snapshot of `event`.
    #[must_use]
    pub fn from_event(event: &Event) -> Self {
        let now = crate::util::clock::now_ms();
        Self {
            id: event.id,
            name: event.topic.clone(),
            data: Value::Object(event.payload.clone()),
            metadata: event.metadata.clone(),
            status: event.status,
            created_at_ms: event.metadata.timestamp_ms,
            updated_at_ms: now,
        }
    }

    /// Rebuild the event this row describes.
    #[must_use]
    pub fn to_event(&self) -> Event {
        let payload = match &self.data {
            Value::Object(map) => map.clone(),
            _ => serde_json::Map::new(),
        };
        Event {
            id: self.id,
            topic: self.name.clone(),
            payload,
            metadata: self.metadata.clone(),
            status: self.status,
        }
    }
}

/// Row of the `event_execution_history` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventExecutionRecord {
    /// Auto-assigned by the store; pass 0 when appending.
    pub id: u64,
    /// Event id.
    pub event_id: EventId,
    /// Subscription name.
    pub handler_name: String,
    /// `Completed` or `Failed`.
    pub status: EventStatus,
    /// Handler result.
    pub result: Option<Value>,
    /// Error text, if the handler failed.
    pub error_message: Option<String>,
    /// Handler wall time in milliseconds.
    pub processing_time_ms: u64,
    /// Append time (ms since epoch).
    pub created_at_ms: u64,
}

/// Filter for `DurableStore::query_events`.
#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    /// Inclusive lower bound on creation time.
    pub start_ms: Option<u64>,
    /// Inclusive upper bound on creation time.
    pub end_ms: Option<u64>,
    /// Topics to match; `None` matches all.
    pub topics: Option<Vec<String>>,
    /// Status to match; `None` matches all.
    pub status: Option<EventStatus>,
    /// Maximum number of rows.
    pub limit: Option<usize>,
}

impl EventQuery {
    /// Query matching every event.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Restrict to a creation-time window.
    #[must_use]
    pub const fn between(mut self, start_ms: u64, end_ms: u64) -> Self {
        self.start_ms = Some(start_ms);
        self.end_ms = Some(end_ms);
        self
    }

    /// Restrict to topics.
    #[must_use]
    pub fn with_topics<I, S>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.topics = Some(topics.into_iter().map(Into::into).collect());
        self
    }

    /// Restrict to a status.
    #[must_use]
    pub const fn with_status(mut self, status: EventStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Whether `record` satisfies the filter (ignoring `limit`).
    #[must_use]
    pub fn matches(&self, record: &EventRecord) -> bool {
        self.start_ms.is_none_or(|s| record.created_at_ms >= s)
            && self.end_ms.is_none_or(|e| record.created_at_ms <= e)
            && self
                .topics
                .as_ref()
                .is_none_or(|topics| topics.iter().any(|t| *t == record.name))
            && self.status.is_none_or(|s| record.status == s)
    }
}

/// Durable record store.
pub trait DurableStore: Send + Sync {
    /// Insert or replace a task row.
    ///
    /// # Errors
    /// Backend failure.
    fn save_task(&self, record: &TaskRecord) -> Result<(), StoreError>;

    /// Fetch a task row.
    ///
    /// # Errors
    /// Backend failure.
    fn get_task(&self, id: TaskId) -> Result<Option<TaskRecord>, StoreError>;

    /// Task rows, optionally filtered by status, oldest first.
    ///
    /// # Errors
    /// Backend failure.
    fn list_tasks(&self, status: Option<TaskStatus>) -> Result<Vec<TaskRecord>, StoreError>;

    /// Append a task history row and return its assigned id.
    ///
    /// # Errors
    /// Backend failure.
    fn append_task_history(&self, record: TaskExecutionRecord) -> Result<u64, StoreError>;

    /// History rows for one task, in append order.
    ///
    /// # Errors
    /// Backend failure.
    fn task_history(&self, task_id: TaskId) -> Result<Vec<TaskExecutionRecord>, StoreError>;

    /// Insert or replace an event row.
    ///
    /// # Errors
    /// Backend failure.
    fn save_event(&self, record: &EventRecord) -> Result<(), StoreError>;

    /// Fetch an event row.
    ///
    /// # Errors
    /// Backend failure.
    fn get_event(&self, id: EventId) -> Result<Option<EventRecord>, StoreError>;

    /// Event rows matching `query`, oldest first.
    ///
    /// # Errors
    /// Backend failure.
    fn query_events(&self, query: &EventQuery) -> Result<Vec<EventRecord>, StoreError>;

    /// Append an event history row and return its assigned id.
    ///
    /// # Errors
    /// Backend failure.
    fn append_event_history(&self, record: EventExecutionRecord) -> Result<u64, StoreError>;

    /// History rows for one event, in append order.
    ///
    /// # Errors
    /// Backend failure.
    fn event_history(&self, event_id: EventId) -> Result<Vec<EventExecutionRecord>, StoreError>;
}
