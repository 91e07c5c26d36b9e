//! Benchmarks for the scheduling hot paths.
//!
//! Benchmarks cover:
//! - Priority scheduler add/next across levels
//! - Dependency release on completion
//! - Resource ledger allocate/release
//! - Backpressure gate evaluation
//! - End-to-end submission through the engine

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;

use prometheus_taskbus::config::EngineConfig;
use prometheus_taskbus::core::{
    PriorityScheduler, ResourceLedger, RetryPolicy, SubmitOptions, Task, TaskEngine, Work,
};
use prometheus_taskbus::events::{BackpressureGate, BackpressureStrategy, EventDraft};
use prometheus_taskbus::infra::store::{DurableStore, InMemoryStore};
use prometheus_taskbus::util::serde::{Priority, ResourceCapacity, ResourceRequirement, TaskId};

use serde_json::Value;
use tokio::runtime::Runtime;

// ============================================================================
// Helper Functions
// ============================================================================

fn priority_for(i: u64) -> Priority {
    match i % 5 {
        0 => Priority::Critical,
        1 => Priority::High,
        2 => Priority::Normal,
        3 => Priority::Low,
        _ => Priority::Background,
    }
}

fn build_task(priority: Priority, dependencies: Vec<TaskId>) -> Task {
    Task::new(
        Work::sync(|_| Ok(Value::Null)),
        SubmitOptions::new()
            .with_priority(priority)
            .with_dependencies(dependencies),
        None,
        RetryPolicy::new(0, Duration::ZERO),
    )
}

// ============================================================================
// Scheduler Benchmarks
// ============================================================================

fn bench_scheduler_add_next(c: &mut Criterion) {
    let mut group = c.benchmark_group("scheduler_add_next");

    for size in [100, 1_000, 10_000] {
        let tasks: Vec<Task> = (0..size).map(|i| build_task(priority_for(i), vec![])).collect();
        group.throughput(Throughput::Elements(size));
        group.bench_with_input(BenchmarkId::from_parameter(size), &tasks, |b, tasks| {
            b.iter(|| {
                let mut s = PriorityScheduler::new();
                for task in tasks {
                    s.add(task);
                }
                while let Some(id) = s.next() {
                    black_box(id);
                }
            });
        });
    }
    group.finish();
}

fn bench_dependency_release(c: &mut Criterion) {
    let mut group = c.benchmark_group("dependency_release");

    for fan_out in [10, 100, 1_000] {
        let root = build_task(Priority::Normal, vec![]);
        let dependents: Vec<Task> = (0..fan_out)
            .map(|i| build_task(priority_for(i), vec![root.id]))
            .collect();
        group.throughput(Throughput::Elements(fan_out));
        group.bench_with_input(
            BenchmarkId::from_parameter(fan_out),
            &dependents,
            |b, dependents| {
                b.iter(|| {
                    let mut s = PriorityScheduler::new();
                    s.add(&root);
                    for task in dependents {
                        s.add(task);
                    }
                    s.next();
                    black_box(s.complete(root.id));
                });
            },
        );
    }
    group.finish();
}

// ============================================================================
// Ledger Benchmarks
// ============================================================================

fn bench_ledger_allocate_release(c: &mut Criterion) {
    let mut group = c.benchmark_group("ledger_allocate_release");
    let capacity = ResourceCapacity {
        cpu: 64.0,
        memory: 65_536.0,
        disk: 1_000_000.0,
        network: 10_000.0,
        gpu: 8.0,
    };

    for held in [1, 32, 64] {
        group.bench_with_input(BenchmarkId::from_parameter(held), &held, |b, &held| {
            let ledger = ResourceLedger::new(capacity);
            let ids: Vec<TaskId> = (0..held).map(|_| uuid::Uuid::new_v4()).collect();
            let req = ResourceRequirement::cpu(1.0).with_memory(512.0).with_gpu(0.1);
            b.iter(|| {
                for id in &ids {
                    black_box(ledger.allocate(*id, &req));
                }
                black_box(ledger.utilization());
                for id in &ids {
                    ledger.release(*id);
                }
            });
        });
    }
    group.finish();
}

// ============================================================================
// Backpressure Benchmarks
// ============================================================================

fn bench_backpressure_evaluate(c: &mut Criterion) {
    let mut group = c.benchmark_group("backpressure_evaluate");
    let event = EventDraft::new("bench").with_priority(Priority::Low).into_event();

    for strategy in [
        BackpressureStrategy::DropOldest,
        BackpressureStrategy::Buffer,
        BackpressureStrategy::Sample,
    ] {
        let gate = BackpressureGate::new(strategy, 1_000, 100);
        group.bench_function(format!("{strategy:?}"), |b| {
            b.iter(|| {
                for depth in [0, 999, 1_000, 5_000] {
                    black_box(gate.evaluate(black_box(depth), 50, &event));
                }
            });
        });
    }
    group.finish();
}

// ============================================================================
// End-to-End Benchmarks
// ============================================================================

fn bench_engine_submit(c: &mut Criterion) {
    let mut group = c.benchmark_group("engine_submit");

    for task_count in [50u64, 200] {
        group.throughput(Throughput::Elements(task_count));
        group.bench_with_input(
            BenchmarkId::from_parameter(task_count),
            &task_count,
            |b, &task_count| {
                b.to_async(Runtime::new().unwrap()).iter(|| async move {
                    let engine = TaskEngine::new(
                        EngineConfig {
                            worker_count: 2,
                            poll_interval_ms: 1,
                            ..EngineConfig::default()
                        },
                        Arc::new(InMemoryStore::new()) as Arc<dyn DurableStore>,
                        None,
                    )
                    .unwrap();
                    engine.start();
                    for i in 0..task_count {
                        let id = engine
                            .submit(
                                Work::sync(|_| Ok(Value::Null)),
                                SubmitOptions::new()
                                    .with_priority(priority_for(i))
                                    .with_resources(ResourceRequirement::none()),
                            )
                            .await;
                        black_box(id);
                    }
                    engine.shutdown(false, Duration::from_millis(50)).await;
                });
            },
        );
    }
    group.finish();
}

criterion_group!(
    scheduler_benches,
    bench_scheduler_add_next,
    bench_dependency_release
);

criterion_group!(ledger_benches, bench_ledger_allocate_release);

criterion_group!(event_benches, bench_backpressure_evaluate);

criterion_group!(engine_benches, bench_engine_submit);

criterion_main!(scheduler_benches, ledger_benches, event_benches, engine_benches);
