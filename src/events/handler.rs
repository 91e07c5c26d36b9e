//! Event handlers, subscriptions and per-handler execution.
//!
//! A handler attempt runs on the bus worker pool (sync) or as a tokio task
//! (async) under an optional deadline. A subscription may allow extra attempts;
//! the outcome of the last attempt is what gets recorded.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;

use super::event::Event;
use crate::core::error::{AppResult, FailureKind};
use crate::core::task::{with_deadline, BoxFuture};
use crate::core::worker_pool::WorkerPool;
use crate::util::serde::Priority;

/// Topic matching every event.
pub const WILDCARD: &str = "*";

/// Identifier returned by `EventBus::subscribe`.
pub type SubscriptionId = u64;

type SyncHandler = dyn Fn(&Event) -> AppResult<Value> + Send + Sync;
type AsyncHandler = dyn Fn(Event) -> BoxFuture<AppResult<Value>> + Send + Sync;

/// Callable invoked for each matching event.
#[derive(Clone)]
pub enum Handler {
    /// Blocking handler executed on a bus worker thread.
    Sync(Arc<SyncHandler>),
    /// Future factory executed on the tokio runtime.
    Async(Arc<AsyncHandler>),
}

impl Handler {
    /// Wrap a blocking closure.
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(&Event) -> AppResult<Value> + Send + Sync + 'static,
    {
        Self::Sync(Arc::new(f))
    }

    /// Wrap a closure producing a future.
    pub fn future<F, Fut>(f: F) -> Self
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = AppResult<Value>> + Send + 'static,
    {
        Self::Async(Arc::new(move |event| Box::pin(f(event))))
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sync(_) => f.write_str("Handler::Sync"),
            Self::Async(_) => f.write_str("Handler::Async"),
        }
    }
}

/// Per-subscription settings.
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    /// Name recorded in execution history; defaults to `<topic>#<id>`.
    pub name: Option<String>,
    /// Ordering among handlers of the same event.
    pub priority: Priority,
    /// Deadline per attempt; falls back to the event's timeout.
    pub timeout: Option<Duration>,
    /// Extra attempts after a failed one.
    pub retry_count: u32,
}

impl SubscribeOptions {
    /// Default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the handler name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the handler priority.
    #[must_use]
    pub const fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the per-attempt deadline.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the number of extra attempts.
    #[must_use]
    pub const fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }
}

/// A registered handler.
#[derive(Debug, Clone)]
pub struct Subscription {
    /// Registration id.
    pub id: SubscriptionId,
    /// Topic or `*`.
    pub topic: String,
    /// Name recorded in execution history.
    pub name: String,
    /// Callable.
    pub handler: Handler,
    /// Settings.
    pub options: SubscribeOptions,
}

/// Result of running one subscription against one event.
#[derive(Debug, Clone)]
pub struct HandlerOutcome {
    /// Subscription name.
    pub handler_name: String,
    /// Last attempt's result.
    pub result: Result<Value, FailureKind>,
    /// Attempts made.
    pub attempts: u32,
    /// Wall time across all attempts.
    pub elapsed: Duration,
}

impl Subscription {
    /// Run the handler against `event`, retrying up to `retry_count` times.
    pub async fn invoke(
        &self,
        event: &Event,
        workers: &WorkerPool,
        fallback_timeout: Option<Duration>,
    ) -> HandlerOutcome {
        let timeout = self.options.timeout.or_else(|| event.timeout()).or(fallback_timeout);
        let started = Instant::now();
        let mut attempts = 0;
        let mut result = Err(FailureKind::Raised("handler never ran".into()));

        for _ in 0..=self.options.retry_count {
            attempts += 1;
            result = self.attempt(event, workers, timeout).await;
            match &result {
                Ok(_) => break,
                Err(e) => tracing::debug!(
                    handler = %self.name,
                    event_id = %event.id,
                    attempt = attempts,
                    error = %e,
                    "handler attempt failed"
                ),
            }
        }

        HandlerOutcome {
            handler_name: self.name.clone(),
            result,
            attempts,
            elapsed: started.elapsed(),
        }
    }

    async fn attempt(
        &self,
        event: &Event,
        workers: &WorkerPool,
        timeout: Option<Duration>,
    ) -> Result<Value, FailureKind> {
        match &self.handler {
            Handler::Sync(f) => {
                let f = Arc::clone(f);
                let event = event.clone();
                let rx = workers
                    .run_with_reply(move || f(&event))
                    .map_err(|e| FailureKind::Raised(format!("handler not scheduled: {e}")))?;
                let reply = with_deadline(timeout, rx).await?;
                reply
                    .map_err(|_| FailureKind::Raised("handler panicked".into()))?
                    .map_err(|e| FailureKind::Raised(format!("{e:#}")))
            }
            Handler::Async(f) => {
                let mut handle = tokio::spawn(f(event.clone()));
                let joined = match timeout {
                    Some(limit) => match tokio::time::timeout(limit, &mut handle).await {
                        Ok(joined) => joined,
                        Err(_) => {
                            handle.abort();
                            return Err(FailureKind::Timeout(limit));
                        }
                    },
                    None => handle.await,
                };
                joined
                    .map_err(|_| FailureKind::Raised("handler panicked".into()))?
                    .map_err(|e| FailureKind::Raised(format!("{e:#}")))
            }
        }
    }
}

/// Handlers grouped by topic.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    next_id: SubscriptionId,
    by_topic: HashMap<String, Vec<Subscription>>,
}

impl SubscriptionRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `topic` (or `*`).
    pub fn subscribe(
        &mut self,
        topic: impl Into<String>,
        handler: Handler,
        options: SubscribeOptions,
    ) -> SubscriptionId {
        self.next_id += 1;
        let id = self.next_id;
        let topic = topic.into();
        let name = options
            .name
            .clone()
            .unwrap_or_else(|| format!("{topic}#{id}"));
        self.by_topic
            .entry(topic.clone())
            .or_default()
            .push(Subscription {
                id,
                topic,
                name,
                handler,
                options,
            });
        id
    }

    /// Remove one registration. False if it was not registered under `topic`.
    pub fn unsubscribe(&mut self, topic: &str, id: SubscriptionId) -> bool {
        let Some(subs) = self.by_topic.get_mut(topic) else {
            return false;
        };
        let before = subs.len();
        subs.retain(|s| s.id != id);
        let removed = subs.len() != before;
        if subs.is_empty() {
            self.by_topic.remove(topic);
        }
        removed
    }

    /// Topic handlers plus wildcard handlers, most urgent first; registration
    /// order breaks ties.
    #[must_use]
    pub fn handlers_for(&self, topic: &str) -> Vec<Subscription> {
        let mut subs: Vec<Subscription> = self
            .by_topic
            .get(topic)
            .into_iter()
            .flatten()
            .chain(
                (topic != WILDCARD)
                    .then(|| self.by_topic.get(WILDCARD))
                    .flatten()
                    .into_iter()
                    .flatten(),
            )
            .cloned()
            .collect();
        subs.sort_by_key(|s| (s.options.priority.level(), s.id));
        subs
    }

    /// Registered handlers across all topics.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_topic.values().map(Vec::len).sum()
    }

    /// Whether nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_topic.is_empty()
    }
}
