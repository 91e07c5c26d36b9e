//! Priority-ordered event bus with backpressure, aggregation and routing.
//!
//! `publish` runs the admission pipeline (gate, persistence, aggregation,
//! routing) and enqueues the event at its priority level. A dispatch loop
//! drains one event per level per cycle, most urgent first, and invokes every
//! matching handler concurrently. Handler failures are isolated: each outcome
//! is recorded on its own and an event completes if any handler succeeded.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use super::aggregator::{AggregationRule, EventAggregator};
use super::backpressure::{BackpressureDecision, BackpressureGate};
use super::event::{Event, EventDraft, EventStatus};
use super::handler::{Handler, HandlerOutcome, SubscribeOptions, SubscriptionId, SubscriptionRegistry};
use super::router::Router;
use super::EventPublisher;
use crate::config::BusConfig;
use crate::core::error::EngineError;
use crate::core::worker_pool::{WorkerPool, WorkerPoolConfig};
use crate::infra::store::{DurableStore, EventExecutionRecord, EventQuery, EventRecord};
use crate::util::clock::now_ms;
use crate::util::serde::{EventId, Priority};

/// Snapshot of bus counters and gauges.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusStats {
    /// Events passed to `publish`.
    pub published: u64,
    /// Events that reached `Completed`.
    pub dispatched: u64,
    /// Events shed by backpressure.
    pub dropped: u64,
    /// Events absorbed into aggregated events.
    pub aggregated: u64,
    /// Events that ended `Failed`.
    pub failed: u64,
    /// Redeliveries of failed events.
    pub retried: u64,
    /// Events re-enqueued by `replay`.
    pub replayed: u64,
    /// Events matching at least one route.
    pub routed: u64,
    /// Handler runs.
    pub handler_invocations: u64,
    /// Handler runs that failed.
    pub handler_failures: u64,
    /// Events waiting in the priority queues.
    pub queued: usize,
    /// Events waiting in the overflow buffer.
    pub overflow: usize,
    /// Events held by the aggregator.
    pub buffered: usize,
    /// Registered handlers.
    pub subscribers: usize,
}

#[derive(Debug, Default)]
struct BusCounters {
    published: AtomicU64,
    dispatched: AtomicU64,
    dropped: AtomicU64,
    aggregated: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    replayed: AtomicU64,
    routed: AtomicU64,
    handler_invocations: AtomicU64,
    handler_failures: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Where an admitted publisher may place its event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Queue,
    Overflow,
}

/// Priority levels and overflow buffer.
///
/// `reserved` and `overflow_reserved` count slots promised to publishers that
/// passed the gate but have not placed their event yet; the gate sees them as
/// occupied so concurrent publishers cannot overshoot the ceiling.
#[derive(Debug, Default)]
struct BusQueues {
    levels: [VecDeque<Event>; Priority::LEVELS],
    overflow: VecDeque<Event>,
    reserved: usize,
    overflow_reserved: usize,
}

impl BusQueues {
    fn depth(&self) -> usize {
        self.levels.iter().map(VecDeque::len).sum()
    }

    fn load(&self) -> usize {
        self.depth() + self.reserved
    }

    fn overflow_load(&self) -> usize {
        self.overflow.len() + self.overflow_reserved
    }

    fn release(&mut self, slot: Slot) {
        match slot {
            Slot::Queue => self.reserved = self.reserved.saturating_sub(1),
            Slot::Overflow => self.overflow_reserved = self.overflow_reserved.saturating_sub(1),
        }
    }

    fn push(&mut self, event: Event) {
        self.levels[event.priority().level()].push_back(event);
    }

    /// Oldest event of the least urgent non-empty level.
    fn evict_oldest(&mut self) -> Option<Event> {
        self.levels
            .iter_mut()
            .rev()
            .find(|level| !level.is_empty())
            .and_then(VecDeque::pop_front)
    }

    fn refill(&mut self, max_queue_size: usize) -> usize {
        let mut moved = 0;
        while self.load() < max_queue_size {
            let Some(event) = self.overflow.pop_front() else {
                break;
            };
            self.push(event);
            moved += 1;
        }
        moved
    }
}

struct BusInner {
    config: BusConfig,
    gate: BackpressureGate,
    queues: Mutex<BusQueues>,
    /// Signalled whenever queue depth decreases.
    space: Notify,
    /// Signalled whenever work is enqueued.
    wake: Notify,
    aggregator: Mutex<EventAggregator>,
    router: RwLock<Router>,
    subscriptions: RwLock<SubscriptionRegistry>,
    store: Arc<dyn DurableStore>,
    workers: Arc<WorkerPool>,
    counters: BusCounters,
    shutdown: AtomicBool,
}

/// Publish/subscribe hub with its own dispatch loop.
pub struct EventBus {
    inner: Arc<BusInner>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl EventBus {
    /// Create a bus writing to `store`. Call `start` to begin dispatching.
    ///
    /// # Errors
    ///
    /// `EngineError::Config` for invalid settings, `EngineError::WorkerPool`
    /// if the handler threads cannot be spawned.
    pub fn new(config: BusConfig, store: Arc<dyn DurableStore>) -> Result<Self, EngineError> {
        config.validate().map_err(EngineError::Config)?;
        let workers = WorkerPool::new(
            WorkerPoolConfig::new()
                .with_worker_count(config.handler_workers)
                .with_thread_name("taskbus-handler"),
        )?;
        let gate = BackpressureGate::new(
            config.backpressure,
            config.max_queue_size,
            config.overflow_capacity,
        );
        let aggregator = EventAggregator::new(&config.aggregation);

        Ok(Self {
            inner: Arc::new(BusInner {
                config,
                gate,
                queues: Mutex::new(BusQueues::default()),
                space: Notify::new(),
                wake: Notify::new(),
                aggregator: Mutex::new(aggregator),
                router: RwLock::new(Router::new()),
                subscriptions: RwLock::new(SubscriptionRegistry::new()),
                store,
                workers: Arc::new(workers),
                counters: BusCounters::default(),
                shutdown: AtomicBool::new(false),
            }),
            loop_handle: Mutex::new(None),
        })
    }

    /// Spawn the dispatch loop. Calling it again while the loop runs is a
    /// no-op. Must be called from within a tokio runtime.
    pub fn start(&self) {
        if self.inner.shutdown.load(Ordering::Acquire) {
            warn!("event bus already shut down; not starting");
            return;
        }
        let mut handle = self.loop_handle.lock();
        if handle.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        *handle = Some(tokio::spawn(run_loop(Arc::clone(&self.inner))));
    }

    /// Publish an event and return its id.
    ///
    /// The id is returned even when backpressure sheds the event; the
    /// persisted row then carries status `Dropped`.
    pub async fn publish(&self, draft: EventDraft) -> EventId {
        self.inner.publish(draft).await
    }

    /// Register `handler` for `topic` (`*` matches every topic).
    pub fn subscribe(
        &self,
        topic: impl Into<String>,
        handler: Handler,
        options: SubscribeOptions,
    ) -> SubscriptionId {
        let topic = topic.into();
        let id = self
            .inner
            .subscriptions
            .write()
            .subscribe(topic.clone(), handler, options);
        debug!(topic = %topic, subscription = id, "handler subscribed");
        id
    }

    /// Remove a registration. False if `id` is not registered under `topic`.
    pub fn unsubscribe(&self, topic: &str, id: SubscriptionId) -> bool {
        self.inner.subscriptions.write().unsubscribe(topic, id)
    }

    /// Add (or replace) a named routing predicate.
    pub fn add_route<F>(&self, name: impl Into<String>, predicate: F)
    where
        F: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        self.inner.router.write().add_route(name, predicate);
    }

    /// Remove a routing predicate.
    pub fn remove_route(&self, name: &str) -> bool {
        self.inner.router.write().remove_route(name)
    }

    /// Install an aggregation rule for one topic.
    pub fn set_aggregation_rule(&self, topic: impl Into<String>, rule: AggregationRule) {
        self.inner.aggregator.lock().set_rule(topic, rule);
    }

    /// Remove the rule for one topic. Events it was holding are flushed as one
    /// aggregated event, which is returned by id.
    pub fn remove_aggregation_rule(&self, topic: &str) -> Option<EventId> {
        let flushed = self.inner.aggregator.lock().remove_rule(topic)?;
        let id = flushed.id;
        self.inner.persist_event(&flushed);
        self.inner.enqueue(flushed);
        Some(id)
    }

    /// Flush every aggregation bucket into the queues now.
    pub fn flush_aggregations(&self) -> usize {
        let flushed = self.inner.aggregator.lock().flush_all();
        let count = flushed.len();
        for event in flushed {
            self.inner.persist_event(&event);
            self.inner.enqueue(event);
        }
        count
    }

    /// Re-enqueue persisted events matching `query` under fresh ids.
    ///
    /// Replayed events bypass backpressure and aggregation and start with a
    /// zero retry count. Events absorbed into an aggregate are skipped, since
    /// the aggregate carries them, unless `query` asks for
    /// `EventStatus::Aggregated` explicitly.
    ///
    /// # Errors
    ///
    /// `EngineError::Store` if the query itself fails.
    pub fn replay(&self, query: &EventQuery) -> Result<usize, EngineError> {
        let records = self.inner.store.query_events(query)?;
        let include_absorbed = query.status == Some(EventStatus::Aggregated);
        let mut count = 0;
        for record in records {
            if record.status == EventStatus::Aggregated && !include_absorbed {
                continue;
            }
            let mut event = record.to_event();
            event.id = uuid::Uuid::new_v4();
            event.metadata.timestamp_ms = now_ms();
            event.metadata.retry_count = 0;
            event.metadata.routes.clear();
            event.status = EventStatus::Pending;
            debug!(original = %record.id, event_id = %event.id, topic = %event.topic, "replaying event");
            self.inner.persist_event(&event);
            self.inner.enqueue(event);
            count += 1;
        }
        self.inner
            .counters
            .replayed
            .fetch_add(u64::try_from(count).unwrap_or(u64::MAX), Ordering::Relaxed);
        info!(count, "events replayed");
        Ok(count)
    }

    /// Counters and gauges.
    #[must_use]
    pub fn get_stats(&self) -> BusStats {
        let c = &self.inner.counters;
        let (queued, overflow) = {
            let q = self.inner.queues.lock();
            (q.depth(), q.overflow.len())
        };
        BusStats {
            published: c.published.load(Ordering::Relaxed),
            dispatched: c.dispatched.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            aggregated: c.aggregated.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            retried: c.retried.load(Ordering::Relaxed),
            replayed: c.replayed.load(Ordering::Relaxed),
            routed: c.routed.load(Ordering::Relaxed),
            handler_invocations: c.handler_invocations.load(Ordering::Relaxed),
            handler_failures: c.handler_failures.load(Ordering::Relaxed),
            queued,
            overflow,
            buffered: self.inner.aggregator.lock().buffered(),
            subscribers: self.inner.subscriptions.read().len(),
        }
    }

    /// Stop dispatching, flush aggregation buckets to the store and release
    /// the handler threads. Queued events stay `Pending` in the store.
    pub async fn shutdown(&self, timeout: Duration) {
        if self.inner.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("shutting down event bus");
        self.inner.wake.notify_one();
        self.inner.space.notify_waiters();

        let handle = self.loop_handle.lock().take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(timeout, &mut handle).await.is_err() {
                warn!("dispatch loop did not stop in time; aborting");
                handle.abort();
            }
        }

        let pending = self.inner.aggregator.lock().flush_all();
        for event in pending {
            self.inner.persist_event(&event);
        }

        let workers = Arc::clone(&self.inner.workers);
        if let Err(e) = tokio::task::spawn_blocking(move || workers.shutdown(true, timeout)).await {
            error!(error = %e, "handler pool shutdown failed");
        }
        info!("event bus shut down");
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        self.inner.shutdown.store(true, Ordering::Release);
        self.inner.wake.notify_one();
    }
}

#[async_trait::async_trait]
impl EventPublisher for EventBus {
    async fn publish(&self, draft: EventDraft) -> EventId {
        self.inner.publish(draft).await
    }
}

impl BusInner {
    async fn publish(&self, draft: EventDraft) -> EventId {
        let mut event = draft.into_event();
        let id = event.id;
        bump(&self.counters.published);

        let Some(slot) = self.admit(&event).await else {
            bump(&self.counters.dropped);
            warn!(event_id = %id, topic = %event.topic, "event dropped by backpressure");
            event.status = EventStatus::Dropped;
            self.persist_event(&event);
            return id;
        };

        // absorbed events are recorded as such so replay skips them
        let (row, emitted) = {
            let mut aggregator = self.aggregator.lock();
            if aggregator.absorbs(&event) {
                event.status = EventStatus::Aggregated;
                (EventRecord::from_event(&event), aggregator.add(event, now_ms()))
            } else {
                (EventRecord::from_event(&event), Some(event))
            }
        };
        self.persist_record(&row);
        match emitted {
            None => {
                bump(&self.counters.aggregated);
                debug!(event_id = %id, "event buffered for aggregation");
                self.queues.lock().release(slot);
                self.space.notify_waiters();
            }
            Some(mut event) => {
                if event.id != id {
                    bump(&self.counters.aggregated);
                    self.persist_event(&event);
                }
                self.route(&mut event);
                self.place(event, slot);
            }
        }
        id
    }

    /// Run the gate and reserve a slot in the same critical section.
    ///
    /// `None` means the event is shed. Stalls while the gate answers `Wait`,
    /// up to the block timeout.
    async fn admit(&self, event: &Event) -> Option<Slot> {
        let deadline = tokio::time::Instant::now() + self.config.block_timeout();
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                return None;
            }
            let space = self.space.notified();
            // `None` while the gate answers `Wait`
            let outcome = {
                let mut q = self.queues.lock();
                let decision = self.gate.evaluate(q.load(), q.overflow_load(), event);
                match decision {
                    BackpressureDecision::Accept => {
                        q.reserved += 1;
                        Some((Some(Slot::Queue), None))
                    }
                    BackpressureDecision::EvictOldest => match q.evict_oldest() {
                        Some(oldest) => {
                            q.reserved += 1;
                            Some((Some(Slot::Queue), Some(oldest)))
                        }
                        // every slot is reserved by publishers still in flight
                        None => Some((None, None)),
                    },
                    BackpressureDecision::Overflow => {
                        q.overflow_reserved += 1;
                        Some((Some(Slot::Overflow), None))
                    }
                    BackpressureDecision::Reject => Some((None, None)),
                    BackpressureDecision::Wait => None,
                }
            };
            match outcome {
                Some((slot, evicted)) => {
                    if let Some(oldest) = evicted {
                        self.drop_evicted(oldest);
                    }
                    return slot;
                }
                None => {
                    if tokio::time::timeout_at(deadline, space).await.is_err() {
                        return None;
                    }
                }
            }
        }
    }

    /// Record matching routes in the event metadata.
    fn route(&self, event: &mut Event) {
        let routes = self.router.read().route(event);
        if !routes.is_empty() {
            bump(&self.counters.routed);
            debug!(event_id = %event.id, routes = ?routes, "event routed");
            event.metadata.routes = routes;
        }
    }

    /// Place a published event into the slot `admit` reserved for it.
    fn place(&self, event: Event, slot: Slot) {
        {
            let mut q = self.queues.lock();
            q.release(slot);
            match slot {
                Slot::Queue => q.push(event),
                Slot::Overflow => q.overflow.push_back(event),
            }
        }
        self.wake.notify_one();
    }

    /// Route and place an event that re-enters the bus: flushed aggregates,
    /// redeliveries and replays. These never pass the gate and are never shed
    /// themselves, though DropOldest may still evict to make room.
    fn enqueue(&self, mut event: Event) {
        self.route(&mut event);
        let evicted = {
            let mut q = self.queues.lock();
            match self.gate.evaluate(q.load(), q.overflow_load(), &event) {
                BackpressureDecision::EvictOldest => {
                    let oldest = q.evict_oldest();
                    q.push(event);
                    oldest
                }
                BackpressureDecision::Overflow => {
                    q.overflow.push_back(event);
                    None
                }
                _ => {
                    q.push(event);
                    None
                }
            }
        };
        if let Some(oldest) = evicted {
            self.drop_evicted(oldest);
        }
        self.wake.notify_one();
    }

    fn drop_evicted(&self, mut oldest: Event) {
        bump(&self.counters.dropped);
        warn!(event_id = %oldest.id, topic = %oldest.topic, "evicted oldest event");
        oldest.status = EventStatus::Dropped;
        self.persist_event(&oldest);
    }

    /// One pass: flush expired windows, refill from overflow, then dispatch
    /// at most one event per level, most urgent first.
    async fn cycle(&self) -> usize {
        let expired = self.aggregator.lock().flush_expired(now_ms());
        for event in expired {
            self.persist_event(&event);
            self.enqueue(event);
        }

        let batch: Vec<Event> = {
            let mut q = self.queues.lock();
            let moved = q.refill(self.config.max_queue_size);
            if moved > 0 {
                debug!(moved, "refilled from overflow buffer");
            }
            q.levels.iter_mut().filter_map(VecDeque::pop_front).collect()
        };
        if !batch.is_empty() {
            self.space.notify_waiters();
        }

        let count = batch.len();
        for event in batch {
            self.dispatch(event).await;
        }
        count
    }

    async fn dispatch(&self, mut event: Event) {
        event.status = EventStatus::Processing;
        self.persist_event(&event);

        let subs = self.subscriptions.read().handlers_for(&event.topic);
        if subs.is_empty() {
            event.status = EventStatus::Completed;
            bump(&self.counters.dispatched);
            debug!(event_id = %event.id, topic = %event.topic, "no subscribers");
            self.persist_event(&event);
            return;
        }

        let fallback = self.config.default_handler_timeout();
        let mut set = JoinSet::new();
        for (idx, sub) in subs.into_iter().enumerate() {
            let event = event.clone();
            let workers = Arc::clone(&self.workers);
            set.spawn(async move { (idx, sub.invoke(&event, &workers, fallback).await) });
        }
        let mut outcomes: Vec<(usize, HandlerOutcome)> = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => error!(event_id = %event.id, error = %e, "handler task failed"),
            }
        }
        outcomes.sort_by_key(|(idx, _)| *idx);

        let mut any_ok = false;
        for (_, outcome) in outcomes {
            bump(&self.counters.handler_invocations);
            let (status, result, error_message) = match outcome.result {
                Ok(value) => {
                    any_ok = true;
                    (EventStatus::Completed, Some(value), None)
                }
                Err(e) => {
                    bump(&self.counters.handler_failures);
                    warn!(
                        event_id = %event.id,
                        handler = %outcome.handler_name,
                        attempts = outcome.attempts,
                        error = %e,
                        "handler failed"
                    );
                    (EventStatus::Failed, None, Some(e.to_string()))
                }
            };
            self.persist_history(EventExecutionRecord {
                id: 0,
                event_id: event.id,
                handler_name: outcome.handler_name,
                status,
                result,
                error_message,
                processing_time_ms: u64::try_from(outcome.elapsed.as_millis()).unwrap_or(u64::MAX),
                created_at_ms: now_ms(),
            });
        }

        if any_ok {
            event.status = EventStatus::Completed;
            bump(&self.counters.dispatched);
        } else if event.metadata.retry_count < event.metadata.max_retries {
            event.metadata.retry_count += 1;
            event.status = EventStatus::Pending;
            bump(&self.counters.retried);
            info!(
                event_id = %event.id,
                retry = event.metadata.retry_count,
                "redelivering failed event"
            );
            self.persist_event(&event);
            self.enqueue(event);
            return;
        } else {
            event.status = EventStatus::Failed;
            bump(&self.counters.failed);
        }
        self.persist_event(&event);
    }

    fn persist_event(&self, event: &Event) {
        if self.config.persist_events {
            self.persist_record(&EventRecord::from_event(event));
        }
    }

    fn persist_record(&self, record: &EventRecord) {
        if !self.config.persist_events {
            return;
        }
        if let Err(e) = self.store.save_event(record) {
            warn!(event_id = %record.id, error = %e, "failed to persist event");
        }
    }

    fn persist_history(&self, record: EventExecutionRecord) {
        if !self.config.persist_events {
            return;
        }
        let event_id = record.event_id;
        if let Err(e) = self.store.append_event_history(record) {
            warn!(event_id = %event_id, error = %e, "failed to persist handler outcome");
        }
    }
}

async fn run_loop(inner: Arc<BusInner>) {
    info!(
        poll_interval_ms = inner.config.poll_interval_ms,
        "event dispatch loop started"
    );
    while !inner.shutdown.load(Ordering::Acquire) {
        if inner.cycle().await == 0 {
            let _ = tokio::time::timeout(inner.config.poll_interval(), inner.wake.notified()).await;
        } else {
            tokio::task::yield_now().await;
        }
    }
    info!("event dispatch loop stopped");
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::*;
    use crate::events::backpressure::BackpressureStrategy;
    use crate::infra::store::InMemoryStore;

    fn bus_with(config: BusConfig) -> (EventBus, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let bus = EventBus::new(
            BusConfig {
                handler_workers: 2,
                poll_interval_ms: 10,
                ..config
            },
            Arc::clone(&store) as Arc<dyn DurableStore>,
        )
        .unwrap();
        (bus, store)
    }

    #[tokio::test]
    async fn drop_oldest_evicts_least_urgent() {
        let (bus, store) = bus_with(BusConfig {
            max_queue_size: 2,
            backpressure: BackpressureStrategy::DropOldest,
            ..BusConfig::default()
        });
        let a = bus
            .publish(EventDraft::new("t").with_priority(Priority::Low))
            .await;
        bus.publish(EventDraft::new("t").with_priority(Priority::Low))
            .await;
        bus.publish(EventDraft::new("t").with_priority(Priority::High))
            .await;

        let stats = bus.get_stats();
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.queued, 2);
        assert_eq!(
            store.get_event(a).unwrap().unwrap().status,
            EventStatus::Dropped
        );
    }

    #[tokio::test]
    async fn drop_newest_rejects_without_queueing() {
        let (bus, store) = bus_with(BusConfig {
            max_queue_size: 1,
            backpressure: BackpressureStrategy::DropNewest,
            ..BusConfig::default()
        });
        bus.publish(EventDraft::new("t")).await;
        let rejected = bus.publish(EventDraft::new("t")).await;
        assert_eq!(bus.get_stats().queued, 1);
        assert_eq!(bus.get_stats().dropped, 1);
        assert_eq!(
            store.get_event(rejected).unwrap().unwrap().status,
            EventStatus::Dropped
        );
    }

    #[tokio::test]
    async fn buffer_overflows_then_refills() {
        let (bus, _store) = bus_with(BusConfig {
            max_queue_size: 1,
            backpressure: BackpressureStrategy::Buffer,
            overflow_capacity: 1,
            ..BusConfig::default()
        });
        for _ in 0..3 {
            bus.publish(EventDraft::new("t")).await;
        }
        let stats = bus.get_stats();
        assert_eq!((stats.queued, stats.overflow, stats.dropped), (1, 1, 1));

        bus.start();
        tokio::time::timeout(Duration::from_secs(5), async {
            while bus.get_stats().dispatched < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(bus.get_stats().overflow, 0);
        bus.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn block_times_out_when_nothing_drains() {
        let (bus, _store) = bus_with(BusConfig {
            max_queue_size: 1,
            backpressure: BackpressureStrategy::Block,
            block_timeout_ms: 30,
            ..BusConfig::default()
        });
        bus.publish(EventDraft::new("t")).await;
        let started = std::time::Instant::now();
        bus.publish(EventDraft::new("t")).await;
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert_eq!(bus.get_stats().dropped, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failed_event_is_redelivered() {
        let (bus, store) = bus_with(BusConfig::default());
        bus.subscribe(
            "t",
            Handler::sync(|_| -> anyhow::Result<Value> { anyhow::bail!("nope") }),
            SubscribeOptions::new().with_name("always-fails"),
        );
        bus.start();
        let id = bus.publish(EventDraft::new("t").with_max_retries(1)).await;

        tokio::time::timeout(Duration::from_secs(5), async {
            while bus.get_stats().failed < 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let stats = bus.get_stats();
        assert_eq!(stats.retried, 1);
        assert_eq!(stats.handler_failures, 2);
        let row = store.get_event(id).unwrap().unwrap();
        assert_eq!(row.status, EventStatus::Failed);
        assert_eq!(row.metadata.retry_count, 1);
        let history = store.event_history(id).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].error_message.as_deref(), Some("nope"));
        bus.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn routes_are_recorded() {
        let (bus, store) = bus_with(BusConfig::default());
        bus.add_route("big", |e: &Event| {
            e.payload.get("amount").and_then(Value::as_u64).unwrap_or(0) > 100
        });
        bus.start();
        let id = bus
            .publish(EventDraft::new("orders").with_field("amount", json!(500)))
            .await;
        tokio::time::timeout(Duration::from_secs(5), async {
            while bus.get_stats().dispatched < 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(bus.get_stats().routed, 1);
        let row = store.get_event(id).unwrap().unwrap();
        assert_eq!(row.metadata.routes, vec!["big".to_string()]);
        assert_eq!(row.status, EventStatus::Completed);
        bus.shutdown(Duration::from_secs(1)).await;
    }
}
