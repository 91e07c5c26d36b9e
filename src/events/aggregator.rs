//! Count/time-windowed merging of same-topic events.
//!
//! Events are bucketed by topic. A bucket flushes as one synthesized event
//! once it holds `max_batch_size` events or has been open for `window`.
//! Topics without a rule (and no global rule) pass straight through.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};

use super::event::{Event, EventMetadata, EventStatus};
use crate::config::AggregationConfig;
use crate::util::serde::Priority;

/// Tag marking synthesized events.
pub const AGGREGATED_TAG: &str = "aggregated";

/// Builds the flushed event from a topic and its buffered events.
pub type Synthesizer = Arc<dyn Fn(&str, Vec<Event>) -> Event + Send + Sync>;

/// Flush thresholds (and optional custom synthesis) for one topic.
#[derive(Clone)]
pub struct AggregationRule {
    /// Flush once the bucket holds this many events.
    pub max_batch_size: usize,
    /// Flush once the bucket has been open this long.
    pub window: Duration,
    /// Replaces `default_synthesis` when set.
    pub synthesizer: Option<Synthesizer>,
}

impl fmt::Debug for AggregationRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregationRule")
            .field("max_batch_size", &self.max_batch_size)
            .field("window", &self.window)
            .field("custom_synthesizer", &self.synthesizer.is_some())
            .finish()
    }
}

impl AggregationRule {
    /// Rule with the default synthesis.
    #[must_use]
    pub const fn new(max_batch_size: usize, window: Duration) -> Self {
        Self {
            max_batch_size,
            window,
            synthesizer: None,
        }
    }

    /// Use a custom synthesizer.
    #[must_use]
    pub fn with_synthesizer<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, Vec<Event>) -> Event + Send + Sync + 'static,
    {
        self.synthesizer = Some(Arc::new(f));
        self
    }

    fn synthesize(&self, topic: &str, events: Vec<Event>) -> Event {
        match &self.synthesizer {
            Some(f) => f(topic, events),
            None => default_synthesis(topic, events),
        }
    }
}

#[derive(Debug)]
struct Bucket {
    opened_at_ms: u64,
    events: Vec<Event>,
}

/// Buffers events per topic and emits merged events.
#[derive(Debug, Default)]
pub struct EventAggregator {
    global: Option<AggregationRule>,
    rules: HashMap<String, AggregationRule>,
    buckets: HashMap<String, Bucket>,
}

impl EventAggregator {
    /// Aggregator with a global rule when `config.enabled`.
    #[must_use]
    pub fn new(config: &AggregationConfig) -> Self {
        Self {
            global: config
                .enabled
                .then(|| AggregationRule::new(config.max_batch_size, config.window())),
            ..Self::default()
        }
    }

    /// Install or replace the rule for `topic`.
    pub fn set_rule(&mut self, topic: impl Into<String>, rule: AggregationRule) {
        self.rules.insert(topic.into(), rule);
    }

    /// Remove the rule for `topic`, flushing its bucket.
    pub fn remove_rule(&mut self, topic: &str) -> Option<Event> {
        let rule = self.rules.remove(topic)?;
        let bucket = self.buckets.remove(topic)?;
        Some(rule.synthesize(topic, bucket.events))
    }

    fn rule_for(&self, topic: &str) -> Option<&AggregationRule> {
        self.rules.get(topic).or(self.global.as_ref())
    }

    /// Whether `add` would take `event` into a bucket rather than pass it on.
    #[must_use]
    pub fn absorbs(&self, event: &Event) -> bool {
        event.tag(AGGREGATED_TAG) != Some("true") && self.rule_for(&event.topic).is_some()
    }

    /// Offer `event`. `Some` carries the event to dispatch (unchanged when the
    /// topic is not aggregated, merged when a bucket flushes); `None` means it
    /// was buffered and must not be dispatched.
    pub fn add(&mut self, event: Event, now_ms: u64) -> Option<Event> {
        if !self.absorbs(&event) {
            return Some(event);
        }
        let Some(rule) = self.rule_for(&event.topic).cloned() else {
            return Some(event);
        };
        let topic = event.topic.clone();
        let bucket = self.buckets.entry(topic.clone()).or_insert_with(|| Bucket {
            opened_at_ms: now_ms,
            events: Vec::new(),
        });
        bucket.events.push(event);

        let full = bucket.events.len() >= rule.max_batch_size;
        let expired = elapsed(bucket.opened_at_ms, now_ms) >= rule.window;
        if !(full || expired) {
            return None;
        }
        let bucket = self.buckets.remove(&topic)?;
        tracing::debug!(
            topic = %topic,
            count = bucket.events.len(),
            full,
            "aggregation bucket flushed"
        );
        Some(rule.synthesize(&topic, bucket.events))
    }

    /// Flush every bucket whose window has elapsed, oldest first.
    pub fn flush_expired(&mut self, now_ms: u64) -> Vec<Event> {
        let expired: Vec<String> = self
            .buckets
            .iter()
            .filter(|(topic, bucket)| {
                self.rule_for(topic)
                    .is_none_or(|rule| elapsed(bucket.opened_at_ms, now_ms) >= rule.window)
            })
            .map(|(topic, _)| topic.clone())
            .collect();
        self.drain(expired)
    }

    /// Flush every bucket regardless of age.
    pub fn flush_all(&mut self) -> Vec<Event> {
        let topics: Vec<String> = self.buckets.keys().cloned().collect();
        self.drain(topics)
    }

    fn drain(&mut self, topics: Vec<String>) -> Vec<Event> {
        let mut flushed: Vec<(u64, Event)> = topics
            .into_iter()
            .filter_map(|topic| {
                let bucket = self.buckets.remove(&topic)?;
                let event = match self.rule_for(&topic) {
                    Some(rule) => rule.synthesize(&topic, bucket.events),
                    None => default_synthesis(&topic, bucket.events),
                };
                Some((bucket.opened_at_ms, event))
            })
            .collect();
        flushed.sort_by_key(|(opened, _)| *opened);
        flushed.into_iter().map(|(_, e)| e).collect()
    }

    /// Events currently buffered across all topics.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buckets.values().map(|b| b.events.len()).sum()
    }
}

fn elapsed(since_ms: u64, now_ms: u64) -> Duration {
    Duration::from_millis(now_ms.saturating_sub(since_ms))
}

/// Merge `events` into one event on `topic`.
///
/// Payload: `events` (original payloads), `event_ids`, `event_count`. The
/// priority is the most urgent one observed and the event is tagged
/// `aggregated=true`.
#[must_use]
pub fn default_synthesis(topic: &str, events: Vec<Event>) -> Event {
    let priority = events
        .iter()
        .map(Event::priority)
        .min_by_key(|p| p.level())
        .unwrap_or(Priority::Normal);
    let correlation_id = events.first().and_then(|e| e.metadata.correlation_id.clone());
    let source = events.first().and_then(|e| e.metadata.source.clone());
    let ids: Vec<Value> = events.iter().map(|e| json!(e.id)).collect();
    let count = events.len();
    let payloads: Vec<Value> = events.into_iter().map(|e| Value::Object(e.payload)).collect();

    let mut payload = Map::new();
    payload.insert("events".into(), Value::Array(payloads));
    payload.insert("event_ids".into(), Value::Array(ids));
    payload.insert("event_count".into(), json!(count));

    let mut tags = crate::util::serde::Tags::new();
    tags.insert(AGGREGATED_TAG.into(), "true".into());

    Event {
        id: uuid::Uuid::new_v4(),
        topic: topic.to_string(),
        payload,
        metadata: EventMetadata {
            priority,
            timestamp_ms: crate::util::clock::now_ms(),
            source,
            correlation_id,
            retry_count: 0,
            max_retries: 0,
            timeout_ms: None,
            tags,
            routes: Vec::new(),
        },
        status: EventStatus::Pending,
    }
}
