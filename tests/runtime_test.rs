//! End-to-end tests for a runtime built from configuration: the engine
//! publishes lifecycle events on the bus and both share one store.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use prometheus_taskbus::builders::{build_runtime, build_runtime_with, TaskRuntime};
use prometheus_taskbus::config::{RuntimeConfig, StoreBackendConfig};
use prometheus_taskbus::core::{SubmitOptions, TaskStatus, Work};
use prometheus_taskbus::events::{Event, Handler, SubscribeOptions};
use prometheus_taskbus::infra::store::{DurableStore, EventQuery, InMemoryStore, JsonlStore};
use serde_json::{json, Value};

fn fast_config() -> RuntimeConfig {
    let mut cfg = RuntimeConfig::default();
    cfg.engine.worker_count = 2;
    cfg.engine.poll_interval_ms = 10;
    cfg.engine.default_retry_delay_ms = 5;
    cfg.bus.handler_workers = 2;
    cfg.bus.poll_interval_ms = 10;
    cfg
}

fn temp_dir(label: &str) -> PathBuf {
    std::env::temp_dir().join(format!("taskbus-{label}-{}", uuid::Uuid::new_v4()))
}

fn record_topics(runtime: &TaskRuntime, pattern: &str) -> Arc<Mutex<Vec<Event>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    runtime.bus.subscribe(
        pattern,
        Handler::sync(move |event| {
            sink.lock().push(event.clone());
            Ok(Value::Null)
        }),
        SubscribeOptions::new(),
    );
    seen
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

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_lifecycle_events_reach_subscribers() {
    let runtime = build_runtime(&fast_config()).unwrap();
    let completed = record_topics(&runtime, "task.completed");
    let submitted = record_topics(&runtime, "task.submitted");
    runtime.start();

    let id = runtime
        .engine
        .submit(
            Work::sync(|ctx| Ok(json!({ "args": ctx.args.len() }))),
            SubmitOptions::new()
                .with_name("summarize")
                .with_args(vec![json!(1), json!(2)]),
        )
        .await;

    wait_until(|| !completed.lock().is_empty()).await;
    let event = completed.lock()[0].clone();
    assert_eq!(event.payload["task_id"], json!(id));
    assert_eq!(event.payload["name"], json!("summarize"));
    assert_eq!(event.payload["status"], json!("completed"));
    assert_eq!(event.payload["result"], json!({ "args": 2 }));
    assert_eq!(event.metadata.source.as_deref(), Some("task_engine"));
    assert_eq!(event.metadata.correlation_id, Some(id.to_string()));

    wait_until(|| !submitted.lock().is_empty()).await;
    runtime.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failures_and_retries_are_announced() {
    let runtime = build_runtime(&fast_config()).unwrap();
    let retrying = record_topics(&runtime, "task.retrying");
    let failed = record_topics(&runtime, "task.failed");
    runtime.start();

    let id = runtime
        .engine
        .submit(
            Work::sync(|_| anyhow::bail!("model unavailable")),
            SubmitOptions::new().with_retries(1, Duration::from_millis(5)),
        )
        .await;

    wait_until(|| !failed.lock().is_empty() && !retrying.lock().is_empty()).await;
    assert_eq!(retrying.lock()[0].payload["retry_count"], json!(1));
    let event = failed.lock()[0].clone();
    assert_eq!(event.payload["task_id"], json!(id));
    assert_eq!(event.payload["error"], json!("model unavailable"));
    assert_eq!(event.priority(), prometheus_taskbus::util::serde::Priority::High);
    runtime.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_injected_store_is_shared() {
    let store = Arc::new(InMemoryStore::new());
    let shared = Arc::clone(&store);
    let runtime = build_runtime_with(&fast_config(), move |_| {
        Ok(shared as Arc<dyn DurableStore>)
    })
    .unwrap();
    runtime.start();

    let id = runtime
        .engine
        .submit(Work::sync(|_| Ok(json!("ok"))), SubmitOptions::new())
        .await;
    let lifecycle = EventQuery::all().with_topics(["task.submitted", "task.completed"]);
    wait_until(|| store.query_events(&lifecycle).is_ok_and(|events| events.len() == 2)).await;
    runtime.shutdown(Duration::from_secs(1)).await;

    let record = store.get_task(id).unwrap().unwrap();
    assert_eq!(record.status, TaskStatus::Completed);
    let mut names: Vec<String> = store
        .query_events(&lifecycle)
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    names.sort();
    assert_eq!(names, vec!["task.completed", "task.submitted"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_jsonl_runtime_survives_restart() {
    let dir = temp_dir("runtime");
    let mut cfg = fast_config();
    cfg.store = StoreBackendConfig::Jsonl { dir: dir.clone() };

    let runtime = build_runtime(&cfg).unwrap();
    runtime.start();
    let id = runtime
        .engine
        .submit(Work::sync(|_| Ok(json!(7))), SubmitOptions::new())
        .await;
    wait_until(|| runtime.engine.history(id).is_ok_and(|h| !h.is_empty())).await;
    runtime.shutdown(Duration::from_secs(1)).await;
    drop(runtime);

    let reopened = JsonlStore::open(&dir).unwrap();
    let record = reopened.get_task(id).unwrap().unwrap();
    assert_eq!(record.status, TaskStatus::Completed);
    assert_eq!(record.result, Some(json!(7)));
    assert_eq!(reopened.task_history(id).unwrap().len(), 1);
    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_invalid_config_is_rejected() {
    let mut cfg = fast_config();
    cfg.bus.max_queue_size = 0;
    let err = build_runtime(&cfg).err().unwrap();
    assert!(err.to_string().contains("max_queue_size"), "{err}");
}
