//! Task engine: admission, dispatch, retries, cancellation and persistence.
//!
//! A single coordinating loop pops ready ids from the `PriorityScheduler`,
//! reserves resources in the `ResourceLedger` and hands each admitted task to a
//! runner. Sync bodies execute on the bounded worker pool, async bodies as
//! tokio tasks; the loop itself never waits on a body.
//!
//! State machine:
//!
//! ```text
//! Pending ──deps done──▶ Queued ──admitted──▶ Running ──ok──▶ Completed
//!                          ▲                     │
//!                          └──backoff── Retrying ◀┤ err, retries left
//!                                                ├─ err, none left ─▶ Failed
//!                                                └─ cancel ─────────▶ Cancelled
//! ```
//!
//! When admission fails the id goes back to the head of its level and the
//! loop stops dispatching for that cycle, so a large task is never overtaken
//! by smaller ones of the same or lower priority.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::error::{EngineError, FailureKind};
use super::ledger::{ResourceLedger, ResourceUtilization};
use super::scheduler::{Admission, PriorityScheduler};
use super::task::{with_deadline, CancelFlag, RetryPolicy, SubmitOptions, Task, TaskContext, TaskStatus, Work};
use super::worker_pool::{PoolStats, WorkerPool, WorkerPoolConfig};
use crate::config::EngineConfig;
use crate::events::{EventDraft, EventPublisher};
use crate::infra::store::{DurableStore, TaskExecutionRecord, TaskRecord};
use crate::util::clock::now_ms;
use crate::util::serde::{Priority, TaskId};

/// Topic published when a task is accepted.
pub const TOPIC_SUBMITTED: &str = "task.submitted";
/// Topic published when a task completes.
pub const TOPIC_COMPLETED: &str = "task.completed";
/// Topic published when a failed attempt will be retried.
pub const TOPIC_RETRYING: &str = "task.retrying";
/// Topic published when a task fails for good.
pub const TOPIC_FAILED: &str = "task.failed";
/// Topic published when a task is cancelled.
pub const TOPIC_CANCELLED: &str = "task.cancelled";

/// Snapshot of engine counters, gauges and utilization.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineStats {
    /// Tasks accepted by `submit`.
    pub submitted: u64,
    /// Tasks that reached `Completed`.
    pub completed: u64,
    /// Tasks that reached `Failed`.
    pub failed: u64,
    /// Tasks that reached `Cancelled`.
    pub cancelled: u64,
    /// Retries scheduled.
    pub retried: u64,
    /// Tasks currently executing.
    pub running: usize,
    /// Tasks ready to run.
    pub queued: usize,
    /// Tasks waiting for dependencies.
    pub pending: usize,
    /// Tasks waiting out a retry backoff.
    pub retrying: usize,
    /// Ledger utilization in percent.
    pub utilization: ResourceUtilization,
    /// Worker pool statistics.
    pub workers: PoolStats,
}

#[derive(Debug, Default)]
struct EngineCounters {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    retried: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Scheduler, active task registry and execution handles share one lock.
#[derive(Default)]
struct EngineState {
    scheduler: PriorityScheduler,
    tasks: HashMap<TaskId, Task>,
    handles: HashMap<TaskId, Arc<CancelFlag>>,
}

impl EngineState {
    fn count(&self, status: TaskStatus) -> usize {
        self.tasks.values().filter(|t| t.status == status).count()
    }

    /// Fail every task transitively waiting for `id`.
    fn abandon_dependents(&mut self, id: TaskId) -> Vec<Task> {
        self.scheduler
            .abandon(id)
            .into_iter()
            .filter_map(|dependent| {
                let mut task = self.tasks.remove(&dependent)?;
                task.error = Some(format!("dependency {id} did not complete"));
                task.transition(TaskStatus::Failed);
                Some(task)
            })
            .collect()
    }
}

struct Launch {
    id: TaskId,
    work: Work,
    timeout: Option<Duration>,
    ctx: TaskContext,
    cancel: Arc<CancelFlag>,
}

enum FailureOutcome {
    Retry { task: Task, delay: Duration },
    Failed { task: Task, abandoned: Vec<Task> },
}

struct EngineInner {
    config: EngineConfig,
    state: Mutex<EngineState>,
    ledger: ResourceLedger,
    store: Arc<dyn DurableStore>,
    publisher: Option<Arc<dyn EventPublisher>>,
    workers: Arc<WorkerPool>,
    counters: EngineCounters,
    shutdown: AtomicBool,
    wake: Notify,
}

/// Resource-aware, priority-ordered task executor.
pub struct TaskEngine {
    inner: Arc<EngineInner>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl TaskEngine {
    /// Create an engine persisting to `store` and, when given, announcing
    /// lifecycle changes through `publisher`. Call `start` to begin
    /// dispatching.
    ///
    /// # Errors
    ///
    /// `EngineError::Config` for invalid settings, `EngineError::WorkerPool`
    /// if the worker threads cannot be spawned.
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn DurableStore>,
        publisher: Option<Arc<dyn EventPublisher>>,
    ) -> Result<Self, EngineError> {
        config.validate().map_err(EngineError::Config)?;
        let workers = WorkerPool::new(
            WorkerPoolConfig::new()
                .with_worker_count(config.worker_count)
                .with_max_queue_depth(config.worker_queue_depth)
                .with_thread_name("taskbus-worker"),
        )?;
        let ledger = ResourceLedger::new(config.capacity);
        let retention =
            NonZeroUsize::new(config.completed_retention).unwrap_or(NonZeroUsize::MIN);
        let state = EngineState {
            scheduler: PriorityScheduler::new().with_completed_retention(retention),
            ..EngineState::default()
        };

        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                state: Mutex::new(state),
                ledger,
                store,
                publisher,
                workers: Arc::new(workers),
                counters: EngineCounters::default(),
                shutdown: AtomicBool::new(false),
                wake: Notify::new(),
            }),
            loop_handle: Mutex::new(None),
        })
    }

    /// Spawn the coordinating loop. Calling it again while the loop runs is a
    /// no-op. Must be called from within a tokio runtime.
    pub fn start(&self) {
        if self.inner.shutdown.load(Ordering::Acquire) {
            warn!("task engine already shut down; not starting");
            return;
        }
        let mut handle = self.loop_handle.lock();
        if handle.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        *handle = Some(tokio::spawn(run_loop(Arc::clone(&self.inner))));
    }

    /// Accept a task and return its id.
    ///
    /// Never fails: a task that can never run (its requirement exceeds the
    /// ledger capacity, a dependency already ended without completing, or the
    /// engine is shut down) is recorded as `Failed` straight away.
    pub async fn submit(&self, work: Work, options: SubmitOptions) -> TaskId {
        self.inner.submit(work, options).await
    }

    /// Request cancellation. False if `id` is not an active task.
    ///
    /// Resources are released and the task becomes `Cancelled` immediately; a
    /// running body only stops if it observes its context's cancel flag, and
    /// any late result is discarded.
    pub async fn cancel(&self, id: TaskId) -> bool {
        self.inner.cancel(id).await
    }

    /// Current record of `id`: from memory while active, from the store once
    /// terminal.
    #[must_use]
    pub fn get_status(&self, id: TaskId) -> Option<TaskRecord> {
        if let Some(task) = self.inner.state.lock().tasks.get(&id) {
            return Some(TaskRecord::from_task(task));
        }
        match self.inner.store.get_task(id) {
            Ok(record) => record,
            Err(e) => {
                warn!(task_id = %id, error = %e, "failed to load task record");
                None
            }
        }
    }

    /// Execution history of `id`, oldest first.
    ///
    /// # Errors
    ///
    /// `EngineError::Store` on backend failure.
    pub fn history(&self, id: TaskId) -> Result<Vec<TaskExecutionRecord>, EngineError> {
        Ok(self.inner.store.task_history(id)?)
    }

    /// Counters, gauges and utilization.
    #[must_use]
    pub fn get_stats(&self) -> EngineStats {
        let c = &self.inner.counters;
        let (running, queued, pending, retrying) = {
            let state = self.inner.state.lock();
            (
                state.count(TaskStatus::Running),
                state.scheduler.queued_len(),
                state.scheduler.pending_len(),
                state.count(TaskStatus::Retrying),
            )
        };
        EngineStats {
            submitted: c.submitted.load(Ordering::Relaxed),
            completed: c.completed.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            cancelled: c.cancelled.load(Ordering::Relaxed),
            retried: c.retried.load(Ordering::Relaxed),
            running,
            queued,
            pending,
            retrying,
            utilization: self.inner.ledger.utilization(),
            workers: self.inner.workers.stats(),
        }
    }

    /// Ledger backing admission control.
    #[must_use]
    pub fn ledger(&self) -> &ResourceLedger {
        &self.inner.ledger
    }

    /// Stop the loop, cancel every active task and drain the worker pool.
    ///
    /// With `wait`, worker threads are joined until `timeout` elapses.
    pub async fn shutdown(&self, wait: bool, timeout: Duration) {
        if self.inner.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("shutting down task engine");
        self.inner.wake.notify_one();

        let handle = self.loop_handle.lock().take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(timeout, &mut handle).await.is_err() {
                warn!("scheduling loop did not stop in time; aborting");
                handle.abort();
            }
        }

        let active: Vec<TaskId> = self.inner.state.lock().tasks.keys().copied().collect();
        for id in active {
            self.inner.cancel(id).await;
        }

        let workers = Arc::clone(&self.inner.workers);
        if let Err(e) = tokio::task::spawn_blocking(move || workers.shutdown(wait, timeout)).await {
            error!(error = %e, "worker pool shutdown failed");
        }
        info!("task engine shut down");
    }
}

impl Drop for TaskEngine {
    fn drop(&mut self) {
        self.inner.shutdown.store(true, Ordering::Release);
        self.inner.wake.notify_one();
    }
}

impl EngineInner {
    async fn submit(&self, work: Work, options: SubmitOptions) -> TaskId {
        let mut task = Task::new(
            work,
            options,
            self.config.default_timeout(),
            RetryPolicy::new(
                self.config.default_max_retries,
                self.config.default_retry_delay(),
            ),
        );
        let id = task.id;
        bump(&self.counters.submitted);

        let rejection = if self.shutdown.load(Ordering::Acquire) {
            Some(EngineError::ShutDown.to_string())
        } else if self.ledger.fits_capacity(&task.resources) {
            None
        } else {
            Some("resource requirement exceeds engine capacity".to_string())
        };

        let rejection = match rejection {
            Some(reason) => Some(reason),
            None => self.admit(&mut task).err(),
        };

        if let Some(reason) = rejection {
            warn!(task_id = %id, reason = %reason, "task rejected at submission");
            task.error = Some(reason);
            task.transition(TaskStatus::Failed);
            bump(&self.counters.failed);
            self.persist(&task);
            self.announce(TOPIC_FAILED, Priority::High, &task).await;
            return id;
        }

        info!(
            task_id = %id,
            name = %task.name,
            priority = %task.priority,
            status = %task.status,
            "task submitted"
        );
        self.announce(TOPIC_SUBMITTED, Priority::Low, &task).await;
        self.wake.notify_one();
        id
    }

    /// Register `task` with the scheduler as Queued or Pending.
    ///
    /// A dependency is satisfied when it completed in this process, is still
    /// active, or its persisted record says `Completed`; anything else can
    /// never complete and rejects the task.
    fn admit(&self, task: &mut Task) -> Result<(), String> {
        let mut state = self.state.lock();
        let st = &mut *state;
        for dep in task.dependencies.iter().copied() {
            if st.scheduler.is_complete(dep) || st.tasks.contains_key(&dep) {
                continue;
            }
            match self.store.get_task(dep) {
                Ok(Some(record)) if record.status == TaskStatus::Completed => {
                    st.scheduler.complete(dep);
                }
                _ => return Err(format!("dependency {dep} did not complete")),
            }
        }
        match st.scheduler.add(task) {
            Admission::Queued => task.transition(TaskStatus::Queued),
            Admission::Pending => {
                debug!(
                    task_id = %task.id,
                    blockers = ?st.scheduler.graph().blockers_of(task.id),
                    "waiting for dependencies"
                );
                task.transition(TaskStatus::Pending);
            }
        }
        // written under the lock so a fast first attempt cannot be overwritten
        self.persist(task);
        st.tasks.insert(task.id, task.clone());
        Ok(())
    }

    /// Launch ready tasks until the queue is empty or admission fails.
    fn dispatch_ready(self: &Arc<Self>) {
        loop {
            let launch = {
                let mut state = self.state.lock();
                let st = &mut *state;
                let Some(id) = st.scheduler.next() else {
                    break;
                };
                let Some(task) = st.tasks.get_mut(&id) else {
                    continue;
                };
                if task.status != TaskStatus::Queued {
                    continue;
                }
                if !self.ledger.allocate(id, &task.resources) {
                    debug!(task_id = %id, "insufficient resources; waiting for release");
                    st.scheduler.requeue_front(id, task.priority);
                    break;
                }
                task.transition(TaskStatus::Running);
                self.persist(task);
                let cancel = Arc::new(CancelFlag::default());
                st.handles.insert(id, Arc::clone(&cancel));
                Launch {
                    id,
                    work: task.work.clone(),
                    timeout: task.timeout,
                    ctx: TaskContext::new(task, Arc::clone(&cancel)),
                    cancel,
                }
            };

            info!(task_id = %launch.id, attempt = launch.ctx.attempt, "task started");
            tokio::spawn(run_task(Arc::clone(self), launch));
        }
    }

    async fn complete(&self, id: TaskId, value: Value, elapsed: Duration) {
        let (task, unblocked) = {
            let mut state = self.state.lock();
            let st = &mut *state;
            if st.tasks.get(&id).map(|t| t.status) != Some(TaskStatus::Running) {
                debug!(task_id = %id, "discarding late result");
                return;
            }
            let Some(mut task) = st.tasks.remove(&id) else {
                return;
            };
            st.handles.remove(&id);
            task.result = Some(value);
            task.error = None;
            task.transition(TaskStatus::Completed);
            self.ledger.release(id);

            let unblocked: Vec<TaskId> = st
                .scheduler
                .complete(id)
                .into_iter()
                .filter_map(|dependent| {
                    let t = st.tasks.get_mut(&dependent)?;
                    t.transition(TaskStatus::Queued);
                    self.persist(t);
                    Some(dependent)
                })
                .collect();
            (task, unblocked)
        };

        bump(&self.counters.completed);
        info!(task_id = %id, elapsed_ms = millis(elapsed), "task completed");
        self.persist(&task);
        self.record_attempt(&task, elapsed);
        for dependent in unblocked {
            debug!(task_id = %dependent, dependency = %id, "dependent unblocked");
        }
        self.announce(TOPIC_COMPLETED, Priority::Normal, &task).await;
        self.wake.notify_one();
    }

    async fn fail(self: &Arc<Self>, id: TaskId, failure: FailureKind, elapsed: Duration) {
        let outcome = {
            let mut state = self.state.lock();
            let st = &mut *state;
            if st.tasks.get(&id).map(|t| t.status) != Some(TaskStatus::Running) {
                debug!(task_id = %id, "discarding late failure");
                return;
            }
            st.handles.remove(&id);
            self.ledger.release(id);
            let Some(task) = st.tasks.get_mut(&id) else {
                return;
            };
            task.error = Some(failure.to_string());

            if failure.is_retryable() && task.retry.can_retry() {
                task.retry.retry_count += 1;
                task.transition(TaskStatus::Retrying);
                self.persist(task);
                FailureOutcome::Retry {
                    delay: task.retry.backoff(),
                    task: task.clone(),
                }
            } else {
                let Some(mut task) = st.tasks.remove(&id) else {
                    return;
                };
                task.transition(TaskStatus::Failed);
                FailureOutcome::Failed {
                    abandoned: st.abandon_dependents(id),
                    task,
                }
            }
        };

        match outcome {
            FailureOutcome::Retry { task, delay } => {
                bump(&self.counters.retried);
                warn!(
                    task_id = %id,
                    retry = task.retry.retry_count,
                    max_retries = task.retry.max_retries,
                    delay_ms = millis(delay),
                    error = %failure,
                    "task attempt failed; retrying"
                );
                self.record_attempt(&task, elapsed);
                self.announce(TOPIC_RETRYING, Priority::Normal, &task).await;

                let inner = Arc::clone(self);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    inner.requeue_retry(id);
                });
            }
            FailureOutcome::Failed { task, abandoned } => {
                bump(&self.counters.failed);
                if let FailureKind::Timeout(limit) = failure {
                    warn!(task_id = %id, timeout_ms = millis(limit), "task timed out");
                }
                error!(task_id = %id, error = %failure, "task failed");
                self.persist(&task);
                self.record_attempt(&task, elapsed);
                self.announce(TOPIC_FAILED, Priority::High, &task).await;
                self.fail_abandoned(abandoned).await;
                self.wake.notify_one();
            }
        }
    }

    fn requeue_retry(&self, id: TaskId) {
        {
            let mut state = self.state.lock();
            let st = &mut *state;
            let Some(task) = st.tasks.get_mut(&id) else {
                return;
            };
            if task.status != TaskStatus::Retrying {
                return;
            }
            task.transition(TaskStatus::Queued);
            st.scheduler.requeue(id, task.priority);
            self.persist(task);
        }
        debug!(task_id = %id, "retry queued");
        self.wake.notify_one();
    }

    async fn cancel(&self, id: TaskId) -> bool {
        let (task, abandoned) = {
            let mut state = self.state.lock();
            let st = &mut *state;
            let Some(mut task) = st.tasks.remove(&id) else {
                return false;
            };
            if let Some(flag) = st.handles.remove(&id) {
                flag.cancel();
            }
            st.scheduler.remove(id);
            self.ledger.release(id);
            task.error = Some(FailureKind::Cancelled.to_string());
            task.transition(TaskStatus::Cancelled);
            (task, st.abandon_dependents(id))
        };

        bump(&self.counters.cancelled);
        info!(task_id = %id, "task cancelled");
        self.persist(&task);
        self.announce(TOPIC_CANCELLED, Priority::Normal, &task).await;
        self.fail_abandoned(abandoned).await;
        self.wake.notify_one();
        true
    }

    async fn fail_abandoned(&self, abandoned: Vec<Task>) {
        for task in abandoned {
            bump(&self.counters.failed);
            warn!(task_id = %task.id, error = ?task.error, "dependent task abandoned");
            self.persist(&task);
            self.announce(TOPIC_FAILED, Priority::High, &task).await;
        }
    }

    fn persist(&self, task: &Task) {
        if let Err(e) = self.store.save_task(&TaskRecord::from_task(task)) {
            warn!(task_id = %task.id, error = %e, "failed to persist task");
        }
    }

    fn record_attempt(&self, task: &Task, elapsed: Duration) {
        let record = TaskExecutionRecord {
            id: 0,
            task_id: task.id,
            status: task.status,
            execution_time_ms: millis(elapsed),
            resource_usage: task.resources,
            error_message: task.error.clone(),
            created_at_ms: now_ms(),
        };
        if let Err(e) = self.store.append_task_history(record) {
            warn!(task_id = %task.id, error = %e, "failed to persist execution history");
        }
    }

    async fn announce(&self, topic: &str, priority: Priority, task: &Task) {
        let Some(publisher) = &self.publisher else {
            return;
        };
        let mut payload = json!({
            "task_id": task.id,
            "name": task.name,
            "status": task.status,
            "priority": task.priority,
            "retry_count": task.retry.retry_count,
        });
        if let Some(result) = &task.result {
            payload["result"] = result.clone();
        }
        if let Some(error) = &task.error {
            payload["error"] = Value::String(error.clone());
        }
        publisher
            .publish(
                EventDraft::new(topic)
                    .with_priority(priority)
                    .with_source("task_engine")
                    .with_correlation_id(task.id.to_string())
                    .with_payload(payload),
            )
            .await;
    }
}

async fn run_task(inner: Arc<EngineInner>, launch: Launch) {
    let Launch {
        id,
        work,
        timeout,
        ctx,
        cancel,
    } = launch;
    let started = Instant::now();
    let outcome = tokio::select! {
        biased;
        () = cancel.cancelled() => Err(FailureKind::Cancelled),
        result = execute(&inner.workers, work, ctx, timeout) => result,
    };
    match outcome {
        Ok(value) => inner.complete(id, value, started.elapsed()).await,
        // `cancel` already finalized the task.
        Err(FailureKind::Cancelled) => debug!(task_id = %id, "execution abandoned after cancel"),
        Err(failure) => inner.fail(id, failure, started.elapsed()).await,
    }
}

/// Run one attempt of `work` under `timeout`.
async fn execute(
    workers: &WorkerPool,
    work: Work,
    ctx: TaskContext,
    timeout: Option<Duration>,
) -> Result<Value, FailureKind> {
    match work {
        Work::Sync(f) => {
            let rx = workers
                .run_with_reply(move || f(&ctx))
                .map_err(|e| FailureKind::Raised(format!("task not scheduled: {e}")))?;
            with_deadline(timeout, rx)
                .await?
                .map_err(|_| FailureKind::Raised("task panicked".into()))?
                .map_err(|e| FailureKind::Raised(format!("{e:#}")))
        }
        Work::Async(f) => {
            let mut handle = tokio::spawn(f(ctx));
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
                .map_err(|_| FailureKind::Raised("task panicked".into()))?
                .map_err(|e| FailureKind::Raised(format!("{e:#}")))
        }
    }
}

async fn run_loop(inner: Arc<EngineInner>) {
    info!(
        poll_interval_ms = inner.config.poll_interval_ms,
        "task scheduling loop started"
    );
    while !inner.shutdown.load(Ordering::Acquire) {
        inner.dispatch_ready();
        let _ = tokio::time::timeout(inner.config.poll_interval(), inner.wake.notified()).await;
    }
    info!("task scheduling loop stopped");
}
