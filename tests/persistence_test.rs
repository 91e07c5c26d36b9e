//! Persistence tests: both store backends behind the same trait, plus the
//! bus writing events, handler outcomes and dropped events.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use prometheus_taskbus::config::{AggregationConfig, BusConfig};
use prometheus_taskbus::core::TaskStatus;
use prometheus_taskbus::events::{
    BackpressureStrategy, EventBus, EventDraft, EventStatus, AGGREGATED_TAG,
};
use prometheus_taskbus::infra::store::{
    DurableStore, EventQuery, InMemoryStore, JsonlStore, TaskExecutionRecord,
};
use prometheus_taskbus::util::clock::now_ms;
use prometheus_taskbus::util::serde::ResourceRequirement;
use serde_json::json;

fn temp_dir(label: &str) -> PathBuf {
    std::env::temp_dir().join(format!("taskbus-{label}-{}", uuid::Uuid::new_v4()))
}

fn history_row(task_id: uuid::Uuid, status: TaskStatus) -> TaskExecutionRecord {
    TaskExecutionRecord {
        id: 0,
        task_id,
        status,
        execution_time_ms: 3,
        resource_usage: ResourceRequirement::cpu(0.5),
        error_message: None,
        created_at_ms: now_ms(),
    }
}

fn exercise_history(store: &dyn DurableStore) {
    let task = uuid::Uuid::new_v4();
    let other = uuid::Uuid::new_v4();
    let first = store.append_task_history(history_row(task, TaskStatus::Retrying)).unwrap();
    store.append_task_history(history_row(other, TaskStatus::Completed)).unwrap();
    let last = store.append_task_history(history_row(task, TaskStatus::Completed)).unwrap();
    assert!(last > first);

    let rows = store.task_history(task).unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].status, TaskStatus::Retrying);
    assert_eq!(rows[1].id, last);
    assert!(store.task_history(uuid::Uuid::new_v4()).unwrap().is_empty());
}

#[test]
fn test_history_ids_increase_for_every_backend() {
    exercise_history(&InMemoryStore::new());

    let dir = temp_dir("history");
    exercise_history(&JsonlStore::open(&dir).unwrap());
    std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dropped_events_are_persisted() {
    let store = Arc::new(InMemoryStore::new());
    let bus = EventBus::new(
        BusConfig {
            max_queue_size: 1,
            backpressure: BackpressureStrategy::DropNewest,
            handler_workers: 1,
            ..BusConfig::default()
        },
        Arc::clone(&store) as Arc<dyn DurableStore>,
    )
    .unwrap();

    let kept = bus.publish(EventDraft::new("burst")).await;
    let shed = bus.publish(EventDraft::new("burst")).await;

    assert_eq!(store.get_event(kept).unwrap().unwrap().status, EventStatus::Pending);
    assert_eq!(store.get_event(shed).unwrap().unwrap().status, EventStatus::Dropped);
    let dropped = store
        .query_events(&EventQuery::all().with_status(EventStatus::Dropped))
        .unwrap();
    assert_eq!(dropped.len(), 1);
    bus.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_flushes_open_aggregation_buckets() {
    let dir = temp_dir("aggregation");
    let store: Arc<dyn DurableStore> = Arc::new(JsonlStore::open(&dir).unwrap());
    let bus = EventBus::new(
        BusConfig {
            handler_workers: 1,
            poll_interval_ms: 10,
            aggregation: AggregationConfig {
                enabled: true,
                max_batch_size: 10,
                window_ms: 60_000,
            },
            ..BusConfig::default()
        },
        Arc::clone(&store),
    )
    .unwrap();
    bus.start();

    for i in 0..3 {
        bus.publish(EventDraft::new("clicks").with_field("i", json!(i))).await;
    }
    assert_eq!(bus.get_stats().buffered, 3);
    bus.shutdown(Duration::from_secs(1)).await;
    drop(bus);
    drop(store);

    let reopened = JsonlStore::open(&dir).unwrap();
    let rows = reopened
        .query_events(&EventQuery::all().with_topics(["clicks"]))
        .unwrap();
    assert_eq!(rows.len(), 4);
    let merged = rows
        .iter()
        .find(|r| r.metadata.tags.get(AGGREGATED_TAG).map(String::as_str) == Some("true"))
        .unwrap();
    assert_eq!(merged.data["event_count"], json!(3));
    std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn test_persist_events_disabled_writes_nothing() {
    let store = Arc::new(InMemoryStore::new());
    let bus = EventBus::new(
        BusConfig {
            persist_events: false,
            handler_workers: 1,
            ..BusConfig::default()
        },
        Arc::clone(&store) as Arc<dyn DurableStore>,
    )
    .unwrap();
    bus.publish(EventDraft::new("ephemeral")).await;
    assert_eq!(store.event_count(), 0);
    assert_eq!(bus.get_stats().queued, 1);
    bus.shutdown(Duration::from_secs(1)).await;
}
