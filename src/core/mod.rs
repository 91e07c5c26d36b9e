//! Task model, scheduling, resource accounting and the engine that drives them.

pub mod engine;
pub mod error;
pub mod ledger;
pub mod scheduler;
pub mod task;
pub mod worker_pool;

pub use engine::{EngineStats, TaskEngine};
pub use error::{AppResult, EngineError, FailureKind};
pub use ledger::{ResourceLedger, ResourceUtilization};
pub use scheduler::{Admission, DependencyGraph, PriorityScheduler};
pub use task::{
    BoxFuture, CancelFlag, RetryPolicy, SubmitOptions, Task, TaskContext, TaskStatus, Work,
};
pub use worker_pool::{PoolError, PoolStats, WorkerPool, WorkerPoolConfig};
