//! Bounded pool of dedicated OS threads for blocking task bodies and handlers.
//!
//! Workers block on a bounded `crossbeam-channel`; submission never blocks and
//! fails fast with `PoolError::QueueFull` when the channel is saturated.
//! Dropping the sender on shutdown unblocks every idle worker.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// Unit of work accepted by the pool.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Errors that can occur when using a `WorkerPool`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    /// The job queue is full; no more jobs can be accepted.
    #[error("job queue is full")]
    QueueFull,
    /// The pool has been shut down.
    #[error("pool has been shut down")]
    PoolShutdown,
    /// Configuration validation failed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Internal error (thread spawn failure and similar).
    #[error("internal error: {0}")]
    Internal(String),
}

/// Worker pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    /// Number of worker threads.
    pub worker_count: usize,
    /// Jobs allowed to wait for a free worker.
    pub max_queue_depth: usize,
    /// Stack size per worker thread in bytes.
    pub thread_stack_size: usize,
    /// Worker thread name prefix.
    pub thread_name: String,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            worker_count: num_cpus::get(),
            max_queue_depth: 1024,
            thread_stack_size: 2 * 1024 * 1024,
            thread_name: "taskbus-worker".into(),
        }
    }
}

impl WorkerPoolConfig {
    /// Default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of worker threads.
    #[must_use]
    pub const fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    /// Set the maximum queue depth.
    #[must_use]
    pub const fn with_max_queue_depth(mut self, max_queue_depth: usize) -> Self {
        self.max_queue_depth = max_queue_depth;
        self
    }

    /// Set the worker thread name prefix.
    #[must_use]
    pub fn with_thread_name(mut self, thread_name: impl Into<String>) -> Self {
        self.thread_name = thread_name.into();
        self
    }

    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// Returns a message naming the first invalid field.
    pub fn validate(&self) -> Result<(), String> {
        if self.worker_count == 0 {
            return Err("worker_count must be greater than 0".into());
        }
        if self.max_queue_depth == 0 {
            return Err("max_queue_depth must be greater than 0".into());
        }
        if self.thread_stack_size < 64 * 1024 {
            return Err("thread_stack_size must be at least 64 KiB".into());
        }
        Ok(())
    }
}

/// Statistics about pool utilization.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolStats {
    /// Number of worker threads.
    pub worker_count: usize,
    /// Jobs currently executing.
    pub active_jobs: u64,
    /// Jobs waiting for a worker.
    pub queued_jobs: u64,
    /// Jobs accepted since creation.
    pub submitted_jobs: u64,
    /// Jobs finished (including panicked ones).
    pub completed_jobs: u64,
    /// Jobs that panicked.
    pub panicked_jobs: u64,
}

#[derive(Debug, Default)]
struct PoolCounters {
    active_jobs: AtomicU64,
    queued_jobs: AtomicU64,
    submitted_jobs: AtomicU64,
    completed_jobs: AtomicU64,
    panicked_jobs: AtomicU64,
}

impl PoolCounters {
    fn snapshot(&self, worker_count: usize) -> PoolStats {
        PoolStats {
            worker_count,
            active_jobs: self.active_jobs.load(Ordering::Relaxed),
            queued_jobs: self.queued_jobs.load(Ordering::Relaxed),
            submitted_jobs: self.submitted_jobs.load(Ordering::Relaxed),
            completed_jobs: self.completed_jobs.load(Ordering::Relaxed),
            panicked_jobs: self.panicked_jobs.load(Ordering::Relaxed),
        }
    }
}

/// Worker pool with dedicated OS threads.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    job_tx: Mutex<Option<Sender<Job>>>,
    counters: Arc<PoolCounters>,
    shutdown: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawn `config.worker_count` threads.
    ///
    /// # Errors
    ///
    /// `PoolError::InvalidConfig` for bad configuration, `PoolError::Internal`
    /// if a thread cannot be spawned.
    pub fn new(config: WorkerPoolConfig) -> Result<Self, PoolError> {
        config.validate().map_err(PoolError::InvalidConfig)?;

        let (job_tx, job_rx) = bounded::<Job>(config.max_queue_depth);
        let counters = Arc::new(PoolCounters::default());

        let mut workers = Vec::with_capacity(config.worker_count);
        for worker_id in 0..config.worker_count {
            workers.push(spawn_worker(
                worker_id,
                &config,
                job_rx.clone(),
                Arc::clone(&counters),
            )?);
        }

        info!(
            worker_count = config.worker_count,
            max_queue_depth = config.max_queue_depth,
            name = %config.thread_name,
            "worker pool started"
        );

        Ok(Self {
            config,
            job_tx: Mutex::new(Some(job_tx)),
            counters,
            shutdown: AtomicBool::new(false),
            workers: Mutex::new(workers),
        })
    }

    /// Hand a job to the pool without blocking.
    ///
    /// # Errors
    ///
    /// - `PoolError::QueueFull` if every slot is taken
    /// - `PoolError::PoolShutdown` after shutdown
    pub fn execute(&self, job: Job) -> Result<(), PoolError> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(PoolError::PoolShutdown);
        }
        let guard = self.job_tx.lock();
        let Some(tx) = guard.as_ref() else {
            return Err(PoolError::PoolShutdown);
        };
        // Counted before the send so a fast worker never decrements first.
        self.counters.queued_jobs.fetch_add(1, Ordering::Relaxed);
        match tx.try_send(job) {
            Ok(()) => {
                self.counters.submitted_jobs.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(err) => {
                self.counters.queued_jobs.fetch_sub(1, Ordering::Relaxed);
                if let TrySendError::Full(_) = err {
                    warn!(pool = %self.config.thread_name, "worker pool queue is full");
                    Err(PoolError::QueueFull)
                } else {
                    Err(PoolError::PoolShutdown)
                }
            }
        }
    }

    /// Run `f` on a worker and deliver its output through a oneshot channel.
    ///
    /// The receiver resolves to `Err` if the job panicked, since the sender is
    /// dropped during unwinding.
    ///
    /// # Errors
    ///
    /// Same as `execute`.
    pub fn run_with_reply<T, F>(&self, f: F) -> Result<oneshot::Receiver<T>, PoolError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.execute(Box::new(move || {
            let _ = tx.send(f());
        }))?;
        Ok(rx)
    }

    /// Current statistics.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        self.counters.snapshot(self.config.worker_count)
    }

    /// Whether `shutdown` has been called.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Stop accepting jobs. With `wait`, join workers until `timeout` elapses;
    /// workers still busy after that are detached.
    pub fn shutdown(&self, wait: bool, timeout: Duration) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(pool = %self.config.thread_name, "shutting down worker pool");
        self.job_tx.lock().take();

        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        if !wait {
            debug!(count = workers.len(), "detaching workers");
            return;
        }

        let deadline = Instant::now() + timeout;
        for (idx, worker) in workers.into_iter().enumerate() {
            while !worker.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(5));
            }
            if worker.is_finished() {
                if worker.join().is_err() {
                    warn!(worker_id = idx, "worker panicked");
                }
            } else {
                warn!(worker_id = idx, "worker did not exit within timeout - detaching");
            }
        }
        info!(pool = %self.config.thread_name, "worker pool shut down complete");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if !self.shutdown.swap(true, Ordering::AcqRel) {
            self.job_tx.lock().take();
            debug!("worker pool dropped without explicit shutdown - workers will be detached");
        }
    }
}

fn spawn_worker(
    worker_id: usize,
    config: &WorkerPoolConfig,
    job_rx: Receiver<Job>,
    counters: Arc<PoolCounters>,
) -> Result<JoinHandle<()>, PoolError> {
    thread::Builder::new()
        .name(format!("{}-{worker_id}", config.thread_name))
        .stack_size(config.thread_stack_size)
        .spawn(move || {
            debug!(worker_id, "worker thread started");
            // recv fails once the sender is dropped, which is the exit signal.
            while let Ok(job) = job_rx.recv() {
                counters.queued_jobs.fetch_sub(1, Ordering::Relaxed);
                counters.active_jobs.fetch_add(1, Ordering::Relaxed);

                if catch_unwind(AssertUnwindSafe(job)).is_err() {
                    error!(worker_id, "job panicked");
                    counters.panicked_jobs.fetch_add(1, Ordering::Relaxed);
                }

                counters.active_jobs.fetch_sub(1, Ordering::Relaxed);
                counters.completed_jobs.fetch_add(1, Ordering::Relaxed);
            }
            debug!(worker_id, "worker thread exiting");
        })
        .map_err(|e| PoolError::Internal(format!("failed to spawn worker thread: {e}")))
}
