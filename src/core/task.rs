//! Task model: bodies, submission options, lifecycle status.

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Notify;

use crate::core::error::{AppResult, FailureKind};
use crate::util::clock::now_ms;
use crate::util::serde::{Priority, ResourceRequirement, Tags, TaskId};

/// Boxed, sendable future used by async task bodies and event handlers.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// Await `fut`, failing with `FailureKind::Timeout` once `timeout` elapses.
pub(crate) async fn with_deadline<F: Future>(
    timeout: Option<Duration>,
    fut: F,
) -> Result<F::Output, FailureKind> {
    match timeout {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| FailureKind::Timeout(limit)),
        None => Ok(fut.await),
    }
}

type SyncBody = dyn Fn(&TaskContext) -> AppResult<Value> + Send + Sync;
type AsyncBody = dyn Fn(TaskContext) -> BoxFuture<AppResult<Value>> + Send + Sync;

/// Executable body of a task.
///
/// Sync bodies run on the engine's bounded worker pool; async bodies run as
/// tokio tasks. Bodies are `Fn` so retries can invoke them again.
#[derive(Clone)]
pub enum Work {
    /// Blocking body executed on a worker thread.
    Sync(Arc<SyncBody>),
    /// Future factory executed on the tokio runtime.
    Async(Arc<AsyncBody>),
}

impl Work {
    /// Wrap a blocking closure.
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(&TaskContext) -> AppResult<Value> + Send + Sync + 'static,
    {
        Self::Sync(Arc::new(f))
    }

    /// Wrap a closure producing a future.
    pub fn future<F, Fut>(f: F) -> Self
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = AppResult<Value>> + Send + 'static,
    {
        Self::Async(Arc::new(move |ctx| Box::pin(f(ctx))))
    }

    /// Short label persisted as the task's function name.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Sync(_) => "sync",
            Self::Async(_) => "async",
        }
    }
}

impl fmt::Debug for Work {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Work::{}", self.kind())
    }
}

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for dependencies.
    Pending,
    /// Ready and waiting in a priority queue.
    Queued,
    /// Admitted and executing.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error after exhausting retries.
    Failed,
    /// Cancelled by a caller or shutdown.
    Cancelled,
    /// Failed an attempt and is backing off before the next one.
    Retrying,
    /// Parked by an external controller. Reserved for persisted rows: the
    /// engine never enters this state and never schedules a suspended task.
    Suspended,
}

impl TaskStatus {
    /// Completed, Failed and Cancelled are terminal.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Lowercase name used in persisted rows.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Retrying => "retrying",
            Self::Suspended => "suspended",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Retry settings and progress for one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Additional attempts allowed after the first failure.
    pub max_retries: u32,
    /// Base delay; attempt `n` waits `retry_delay * n` (linear backoff).
    pub retry_delay: Duration,
    /// Retries consumed so far.
    pub retry_count: u32,
}

impl RetryPolicy {
    /// Fresh policy with no retries consumed.
    #[must_use]
    pub const fn new(max_retries: u32, retry_delay: Duration) -> Self {
        Self {
            max_retries,
            retry_delay,
            retry_count: 0,
        }
    }

    /// Whether another attempt is allowed.
    #[must_use]
    pub const fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Backoff before the retry numbered `retry_count`.
    #[must_use]
    pub fn backoff(&self) -> Duration {
        self.retry_delay.saturating_mul(self.retry_count)
    }
}

/// Cooperative cancellation flag shared between the engine and a running body.
#[derive(Debug, Default)]
pub struct CancelFlag {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelFlag {
    /// Request cancellation. Returns false if it was already requested.
    pub fn cancel(&self) -> bool {
        let first = !self.cancelled.swap(true, Ordering::AcqRel);
        if first {
            self.notify.notify_waiters();
        }
        first
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Resolves once cancellation is requested.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Everything a body sees while it runs.
#[derive(Debug, Clone)]
pub struct TaskContext {
    /// Id of the running task.
    pub task_id: TaskId,
    /// Task name.
    pub name: String,
    /// Positional arguments.
    pub args: Vec<Value>,
    /// Named arguments.
    pub kwargs: Map<String, Value>,
    /// Zero for the first attempt, then the retry number.
    pub attempt: u32,
    cancel: Arc<CancelFlag>,
}

impl TaskContext {
    pub(crate) fn new(task: &Task, cancel: Arc<CancelFlag>) -> Self {
        Self {
            task_id: task.id,
            name: task.name.clone(),
            args: task.args.clone(),
            kwargs: task.kwargs.clone(),
            attempt: task.retry.retry_count,
            cancel,
        }
    }

    /// Whether the engine asked this task to stop.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the engine asks this task to stop.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    /// Named argument lookup.
    #[must_use]
    pub fn kwarg(&self, key: &str) -> Option<&Value> {
        self.kwargs.get(key)
    }
}

/// Options accepted by `TaskEngine::submit`.
///
/// Unset fields take the engine's configured defaults.
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    /// Human-readable name; defaults to the task id.
    pub name: Option<String>,
    /// Positional arguments passed to the body.
    pub args: Vec<Value>,
    /// Named arguments passed to the body.
    pub kwargs: Map<String, Value>,
    /// Dispatch priority.
    pub priority: Priority,
    /// Per-attempt deadline.
    pub timeout: Option<Duration>,
    /// Retries after the first failure.
    pub max_retries: Option<u32>,
    /// Base retry delay.
    pub retry_delay: Option<Duration>,
    /// Tasks that must complete first.
    pub dependencies: Vec<TaskId>,
    /// Resources held while running.
    pub resources: Option<ResourceRequirement>,
    /// Free-form tags.
    pub tags: Tags,
}

impl SubmitOptions {
    /// Options with every field defaulted.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the task name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set positional arguments.
    #[must_use]
    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    /// Add one named argument.
    #[must_use]
    pub fn with_kwarg(mut self, key: impl Into<String>, value: Value) -> Self {
        self.kwargs.insert(key.into(), value);
        self
    }

    /// Set the priority.
    #[must_use]
    pub const fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the per-attempt timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set max retries and base delay.
    #[must_use]
    pub const fn with_retries(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.max_retries = Some(max_retries);
        self.retry_delay = Some(retry_delay);
        self
    }

    /// Set dependencies.
    #[must_use]
    pub fn with_dependencies(mut self, dependencies: impl IntoIterator<Item = TaskId>) -> Self {
        self.dependencies = dependencies.into_iter().collect();
        self
    }

    /// Set the resource requirement.
    #[must_use]
    pub const fn with_resources(mut self, resources: ResourceRequirement) -> Self {
        self.resources = Some(resources);
        self
    }

    /// Add one tag.
    #[must_use]
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}

/// A schedulable, retryable unit of work.
#[derive(Debug, Clone)]
pub struct Task {
    /// Unique id.
    pub id: TaskId,
    /// Name.
    pub name: String,
    /// Dispatch priority; fixed at creation.
    pub priority: Priority,
    /// Current status.
    pub status: TaskStatus,
    /// Creation time (ms since epoch).
    pub created_at_ms: u64,
    /// Last status change (ms since epoch).
    pub updated_at_ms: u64,
    /// Start of the latest attempt.
    pub started_at_ms: Option<u64>,
    /// Terminal transition time.
    pub completed_at_ms: Option<u64>,
    /// Per-attempt deadline.
    pub timeout: Option<Duration>,
    /// Retry settings and progress.
    pub retry: RetryPolicy,
    /// Tasks that must complete first.
    pub dependencies: HashSet<TaskId>,
    /// Resources held while running.
    pub resources: ResourceRequirement,
    /// Free-form tags.
    pub tags: Tags,
    /// Body.
    pub work: Work,
    /// Positional arguments.
    pub args: Vec<Value>,
    /// Named arguments.
    pub kwargs: Map<String, Value>,
    /// Result of the successful attempt.
    pub result: Option<Value>,
    /// Error text of the latest failed attempt.
    pub error: Option<String>,
}

impl Task {
    /// Build a new task in `Pending` state.
    #[must_use]
    pub fn new(
        work: Work,
        options: SubmitOptions,
        default_timeout: Option<Duration>,
        default_retry: RetryPolicy,
    ) -> Self {
        let id = uuid::Uuid::new_v4();
        let now = now_ms();
        Self {
            id,
            name: options.name.unwrap_or_else(|| format!("task-{id}")),
            priority: options.priority,
            status: TaskStatus::Pending,
            created_at_ms: now,
            updated_at_ms: now,
            started_at_ms: None,
            completed_at_ms: None,
            timeout: options.timeout.or(default_timeout),
            retry: RetryPolicy::new(
                options.max_retries.unwrap_or(default_retry.max_retries),
                options.retry_delay.unwrap_or(default_retry.retry_delay),
            ),
            dependencies: options.dependencies.into_iter().collect(),
            resources: options.resources.unwrap_or_default().sanitized(),
            tags: options.tags,
            work,
            args: options.args,
            kwargs: options.kwargs,
            result: None,
            error: None,
        }
    }

    /// Move to `status`, stamping the update time.
    pub fn transition(&mut self, status: TaskStatus) {
        let now = now_ms();
        self.status = status;
        self.updated_at_ms = now;
        match status {
            TaskStatus::Running => self.started_at_ms = Some(now),
            s if s.is_terminal() => self.completed_at_ms = Some(now),
            _ => {}
        }
    }
}
