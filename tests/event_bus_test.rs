//! Integration tests for the event bus.
//!
//! These tests validate:
//! 1. Aggregation merges a full batch into exactly one dispatch
//! 2. A failing handler never prevents the others from running
//! 3. Wildcard subscribers see every topic; unsubscribed handlers see nothing
//! 4. Persisted events can be replayed under fresh ids
//! 5. Handler deadlines and event redelivery
//! 6. Concurrent publishers never push the queue past its ceiling

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use prometheus_taskbus::config::BusConfig;
use prometheus_taskbus::events::{
    AggregationRule, BackpressureStrategy, EventBus, EventDraft, EventStatus, Handler,
    SubscribeOptions, AGGREGATED_TAG, WILDCARD,
};
use prometheus_taskbus::infra::store::{DurableStore, EventQuery, InMemoryStore, JsonlStore};
use prometheus_taskbus::util::serde::{EventId, Priority};
use serde_json::{json, Value};

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

fn make_bus(config: BusConfig) -> (EventBus, Arc<InMemoryStore>) {
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

fn counting_handler(calls: &Arc<AtomicU32>) -> Handler {
    let calls = Arc::clone(calls);
    Handler::sync(move |_| {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(Value::Null)
    })
}

async fn wait_for_event(store: &InMemoryStore, id: EventId, status: EventStatus) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if store
                .get_event(id)
                .unwrap()
                .is_some_and(|record| record.status == status)
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("event {id} never reached {status}"));
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never became true");
}

// ============================================================================
// AGGREGATION
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_full_batch_dispatches_once() {
    let (bus, _store) = make_bus(BusConfig::default());
    bus.set_aggregation_rule("x", AggregationRule::new(5, Duration::from_secs(1)));

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    bus.subscribe(
        "x",
        Handler::sync(move |event| {
            sink.lock().push(event.payload.clone());
            Ok(Value::Null)
        }),
        SubscribeOptions::new(),
    );
    bus.start();

    let mut ids = Vec::new();
    for i in 0..5 {
        ids.push(bus.publish(EventDraft::new("x").with_field("n", json!(i))).await);
    }

    wait_until(|| !seen.lock().is_empty()).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let seen = seen.lock();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0]["event_count"], json!(5));
    let expected: Vec<Value> = ids.iter().map(|id| json!(id)).collect();
    assert_eq!(seen[0]["event_ids"], Value::Array(expected));
    assert_eq!(bus.get_stats().aggregated, 5);
    bus.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_window_flushes_partial_batch() {
    let (bus, _store) = make_bus(BusConfig::default());
    bus.set_aggregation_rule("metrics", AggregationRule::new(100, Duration::from_millis(50)));
    let calls = Arc::new(AtomicU32::new(0));
    bus.subscribe("metrics", counting_handler(&calls), SubscribeOptions::new());
    bus.start();

    for _ in 0..3 {
        bus.publish(EventDraft::new("metrics")).await;
    }
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    wait_until(|| calls.load(Ordering::SeqCst) == 1).await;
    assert_eq!(bus.get_stats().buffered, 0);
    bus.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_removing_a_rule_dispatches_its_bucket() {
    let (bus, store) = make_bus(BusConfig::default());
    bus.set_aggregation_rule("x", AggregationRule::new(10, Duration::from_secs(60)));
    let calls = Arc::new(AtomicU32::new(0));
    bus.subscribe("x", counting_handler(&calls), SubscribeOptions::new());
    bus.start();

    for _ in 0..2 {
        bus.publish(EventDraft::new("x")).await;
    }
    assert_eq!(bus.get_stats().buffered, 2);

    let merged = bus.remove_aggregation_rule("x").unwrap();
    wait_for_event(&store, merged, EventStatus::Completed).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(bus.remove_aggregation_rule("x").is_none());

    // without the rule the topic passes straight through
    let plain = bus.publish(EventDraft::new("x")).await;
    wait_for_event(&store, plain, EventStatus::Completed).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(bus.get_stats().buffered, 0);
    bus.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_replaying_an_aggregated_topic_sends_only_the_aggregate() {
    let (bus, store) = make_bus(BusConfig::default());
    bus.set_aggregation_rule("x", AggregationRule::new(5, Duration::from_secs(1)));
    let calls = Arc::new(AtomicU32::new(0));
    bus.subscribe("x", counting_handler(&calls), SubscribeOptions::new());
    bus.start();

    let mut sources = Vec::new();
    for i in 0..5 {
        sources.push(bus.publish(EventDraft::new("x").with_field("n", json!(i))).await);
    }
    wait_until(|| calls.load(Ordering::SeqCst) == 1).await;
    for id in &sources {
        assert_eq!(store.get_event(*id).unwrap().unwrap().status, EventStatus::Aggregated);
    }

    let replayed = bus.replay(&EventQuery::all().with_topics(["x"])).unwrap();
    assert_eq!(replayed, 1);
    wait_until(|| calls.load(Ordering::SeqCst) == 2).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let rows = store.query_events(&EventQuery::all().with_topics(["x"])).unwrap();
    let merged = rows
        .iter()
        .filter(|r| r.metadata.tags.get(AGGREGATED_TAG).map(String::as_str) == Some("true"))
        .count();
    assert_eq!(merged, 2);

    // absorbed events are still reachable when asked for by status
    let absorbed = EventQuery::all()
        .with_topics(["x"])
        .with_status(EventStatus::Aggregated);
    assert_eq!(bus.replay(&absorbed).unwrap(), 5);
    wait_until(|| calls.load(Ordering::SeqCst) == 7).await;
    bus.shutdown(Duration::from_secs(1)).await;
}

// ============================================================================
// BACKPRESSURE
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_publishers_respect_the_ceiling() {
    for strategy in [
        BackpressureStrategy::DropNewest,
        BackpressureStrategy::Sample,
        BackpressureStrategy::Block,
    ] {
        let dir = std::env::temp_dir().join(format!("taskbus-ceiling-{}", uuid::Uuid::new_v4()));
        let store: Arc<dyn DurableStore> = Arc::new(JsonlStore::open(&dir).unwrap());
        let bus = Arc::new(
            EventBus::new(
                BusConfig {
                    max_queue_size: 10,
                    backpressure: strategy,
                    block_timeout_ms: 20,
                    handler_workers: 1,
                    ..BusConfig::default()
                },
                store,
            )
            .unwrap(),
        );

        let barrier = Arc::new(tokio::sync::Barrier::new(8));
        let mut publishers = Vec::new();
        for _ in 0..8 {
            let bus = Arc::clone(&bus);
            let barrier = Arc::clone(&barrier);
            publishers.push(tokio::spawn(async move {
                barrier.wait().await;
                for _ in 0..3 {
                    bus.publish(EventDraft::new("burst").with_priority(Priority::Low))
                        .await;
                }
            }));
        }
        for publisher in publishers {
            publisher.await.unwrap();
        }

        let stats = bus.get_stats();
        assert_eq!(stats.queued, 10, "{strategy:?}");
        assert_eq!(stats.dropped, 14, "{strategy:?}");
        assert_eq!(stats.published, 24, "{strategy:?}");
        bus.shutdown(Duration::from_millis(200)).await;
        std::fs::remove_dir_all(&dir).ok();
    }
}

// ============================================================================
// HANDLERS
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_handler_failures_are_isolated() {
    let (bus, store) = make_bus(BusConfig::default());
    let calls = Arc::new(AtomicU32::new(0));
    bus.subscribe(
        "orders",
        Handler::sync(|_| anyhow::bail!("handler exploded")),
        SubscribeOptions::new()
            .with_name("broken")
            .with_priority(Priority::Critical),
    );
    bus.subscribe(
        "orders",
        Handler::future(|event| async move { Ok(json!({ "seen": event.topic })) }),
        SubscribeOptions::new().with_name("healthy"),
    );
    bus.subscribe(WILDCARD, counting_handler(&calls), SubscribeOptions::new());
    bus.start();

    let id = bus.publish(EventDraft::new("orders")).await;
    wait_for_event(&store, id, EventStatus::Completed).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let history = store.event_history(id).unwrap();
    assert_eq!(history.len(), 3);
    assert_eq!(history[0].handler_name, "broken");
    assert_eq!(history[0].status, EventStatus::Failed);
    assert_eq!(history[0].error_message.as_deref(), Some("handler exploded"));
    assert_eq!(history[1].result, Some(json!({ "seen": "orders" })));

    let stats = bus.get_stats();
    assert_eq!(stats.handler_invocations, 3);
    assert_eq!(stats.handler_failures, 1);
    bus.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_wildcard_and_unsubscribe() {
    let (bus, store) = make_bus(BusConfig::default());
    let wildcard_calls = Arc::new(AtomicU32::new(0));
    let topic_calls = Arc::new(AtomicU32::new(0));
    bus.subscribe(WILDCARD, counting_handler(&wildcard_calls), SubscribeOptions::new());
    let sub = bus.subscribe("a", counting_handler(&topic_calls), SubscribeOptions::new());
    bus.start();

    let first = bus.publish(EventDraft::new("a")).await;
    let second = bus.publish(EventDraft::new("b")).await;
    wait_for_event(&store, first, EventStatus::Completed).await;
    wait_for_event(&store, second, EventStatus::Completed).await;
    assert_eq!(wildcard_calls.load(Ordering::SeqCst), 2);
    assert_eq!(topic_calls.load(Ordering::SeqCst), 1);

    assert!(bus.unsubscribe("a", sub));
    assert!(!bus.unsubscribe("a", sub));
    let third = bus.publish(EventDraft::new("a")).await;
    wait_for_event(&store, third, EventStatus::Completed).await;
    assert_eq!(topic_calls.load(Ordering::SeqCst), 1);
    assert_eq!(wildcard_calls.load(Ordering::SeqCst), 3);
    bus.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_event_without_subscribers_completes() {
    let (bus, store) = make_bus(BusConfig::default());
    bus.start();
    let id = bus.publish(EventDraft::new("nobody.listens")).await;
    wait_for_event(&store, id, EventStatus::Completed).await;
    assert!(store.event_history(id).unwrap().is_empty());
    bus.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_handler_deadline_and_redelivery() {
    let (bus, store) = make_bus(BusConfig::default());
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&attempts);
    bus.subscribe(
        "slow",
        Handler::future(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(Value::Null)
            }
        }),
        SubscribeOptions::new(),
    );
    bus.start();

    let id = bus
        .publish(
            EventDraft::new("slow")
                .with_timeout(Duration::from_millis(30))
                .with_max_retries(1),
        )
        .await;
    wait_for_event(&store, id, EventStatus::Failed).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 2);

    let history = store.event_history(id).unwrap();
    assert_eq!(history.len(), 2);
    assert!(history
        .iter()
        .all(|h| h.error_message.as_deref().is_some_and(|e| e.contains("timed out"))));
    let stats = bus.get_stats();
    assert_eq!(stats.retried, 1);
    assert_eq!(stats.failed, 1);
    bus.shutdown(Duration::from_secs(1)).await;
}

// ============================================================================
// REPLAY
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_replay_reenqueues_under_new_ids() {
    let (bus, store) = make_bus(BusConfig::default());
    let calls = Arc::new(AtomicU32::new(0));
    bus.subscribe("audit", counting_handler(&calls), SubscribeOptions::new());
    bus.start();

    let original = bus
        .publish(EventDraft::new("audit").with_field("user", json!("ada")))
        .await;
    bus.publish(EventDraft::new("other")).await;
    wait_for_event(&store, original, EventStatus::Completed).await;

    let replayed = bus
        .replay(&EventQuery::all().with_topics(["audit"]).with_status(EventStatus::Completed))
        .unwrap();
    assert_eq!(replayed, 1);
    wait_until(|| calls.load(Ordering::SeqCst) == 2).await;

    let audit = store
        .query_events(&EventQuery::all().with_topics(["audit"]))
        .unwrap();
    assert_eq!(audit.len(), 2);
    assert_ne!(audit[0].id, audit[1].id);
    assert_eq!(audit[1].data["user"], json!("ada"));
    assert_eq!(bus.get_stats().replayed, 1);
    bus.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_publish_after_shutdown_is_dropped() {
    let (bus, store) = make_bus(BusConfig::default());
    bus.start();
    bus.shutdown(Duration::from_secs(1)).await;

    let id = bus.publish(EventDraft::new("late")).await;
    let record = store.get_event(id).unwrap().unwrap();
    assert_eq!(record.status, EventStatus::Dropped);
    assert_eq!(bus.get_stats().dropped, 1);
}
