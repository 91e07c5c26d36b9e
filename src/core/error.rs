//! Error types for engine and execution failures.

use std::time::Duration;

use thiserror::Error;

use crate::core::worker_pool::PoolError;
use crate::infra::store::StoreError;

/// Errors produced while constructing or driving the engine and the bus.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Configuration rejected by validation.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// Worker pool could not be created or rejected work.
    #[error("worker pool error: {0}")]
    WorkerPool(#[from] PoolError),
    /// Durable store failure surfaced to the caller.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    /// The component has been shut down.
    #[error("engine has been shut down")]
    ShutDown,
}

/// Why a single execution attempt did not produce a result.
///
/// Retry decisions switch on this value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FailureKind {
    /// The attempt exceeded its deadline.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    /// The body returned an error or panicked.
    #[error("{0}")]
    Raised(String),
    /// Cancellation was requested while the attempt was in flight.
    #[error("cancelled")]
    Cancelled,
}

impl FailureKind {
    /// Cancelled attempts are final; everything else consults the retry policy.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        !matches!(self, Self::Cancelled)
    }
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;
