//! Engine, bus and store configuration structures.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::scheduler::DEFAULT_COMPLETED_RETENTION;
use crate::events::backpressure::BackpressureStrategy;
use crate::util::serde::ResourceCapacity;

/// Prefix of environment variables read by `RuntimeConfig::from_env`.
pub const ENV_PREFIX: &str = "TASKBUS_";

/// Durable store backend selection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum StoreBackendConfig {
    /// Map-backed store; nothing survives a restart.
    #[default]
    InMemory,
    /// JSON-lines files under `dir`.
    Jsonl {
        /// Directory holding one file per table.
        dir: PathBuf,
    },
}

/// Task engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Threads executing sync task bodies.
    pub worker_count: usize,
    /// Jobs that may wait for a worker thread.
    pub worker_queue_depth: usize,
    /// Scheduling loop cadence in milliseconds.
    pub poll_interval_ms: u64,
    /// Resource budget enforced by the ledger.
    pub capacity: ResourceCapacity,
    /// Deadline applied to tasks submitted without one.
    pub default_timeout_secs: Option<u64>,
    /// Retries applied to tasks submitted without a value.
    pub default_max_retries: u32,
    /// Base retry delay applied to tasks submitted without a value.
    pub default_retry_delay_ms: u64,
    /// Completed task ids the scheduler keeps for dependency checks.
    pub completed_retention: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_count: num_cpus::get(),
            worker_queue_depth: 1024,
            poll_interval_ms: 100,
            capacity: ResourceCapacity::default(),
            default_timeout_secs: None,
            default_max_retries: 3,
            default_retry_delay_ms: 1000,
            completed_retention: DEFAULT_COMPLETED_RETENTION,
        }
    }
}

impl EngineConfig {
    /// Scheduling loop cadence.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Default per-attempt deadline.
    #[must_use]
    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_secs.map(Duration::from_secs)
    }

    /// Default base retry delay.
    #[must_use]
    pub const fn default_retry_delay(&self) -> Duration {
        Duration::from_millis(self.default_retry_delay_ms)
    }

    /// Validate engine configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.worker_count == 0 {
            return Err("worker_count must be greater than 0".into());
        }
        if self.worker_queue_depth == 0 {
            return Err("worker_queue_depth must be greater than 0".into());
        }
        if self.poll_interval_ms == 0 {
            return Err("poll_interval_ms must be greater than 0".into());
        }
        if self.completed_retention == 0 {
            return Err("completed_retention must be greater than 0".into());
        }
        if self.default_timeout_secs == Some(0) {
            return Err("default_timeout_secs must be greater than 0 when set".into());
        }
        if self
            .capacity
            .as_array()
            .iter()
            .any(|v| !v.is_finite() || *v < 0.0)
        {
            return Err("capacity values must be finite and non-negative".into());
        }
        Ok(())
    }
}

/// Time/count thresholds for merging same-topic events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    /// Apply aggregation to every topic without its own rule.
    pub enabled: bool,
    /// Flush once a bucket holds this many events.
    pub max_batch_size: usize,
    /// Flush once a bucket has been open this long, in milliseconds.
    pub window_ms: u64,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_batch_size: 100,
            window_ms: 1000,
        }
    }
}

impl AggregationConfig {
    /// Aggregation window.
    #[must_use]
    pub const fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// Validate aggregation values.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_batch_size == 0 {
            return Err("max_batch_size must be greater than 0".into());
        }
        if self.window_ms == 0 {
            return Err("window_ms must be greater than 0".into());
        }
        Ok(())
    }
}

/// Event bus configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Queued events at which backpressure engages.
    pub max_queue_size: usize,
    /// What happens at the ceiling.
    pub backpressure: BackpressureStrategy,
    /// Ceiling of the overflow buffer used by `Buffer`.
    pub overflow_capacity: usize,
    /// How long a `Block` publisher waits for space, in milliseconds.
    pub block_timeout_ms: u64,
    /// Dispatch loop cadence in milliseconds.
    pub poll_interval_ms: u64,
    /// Threads executing sync handlers.
    pub handler_workers: usize,
    /// Deadline for handlers when neither the subscription nor the event sets one.
    pub default_handler_timeout_ms: Option<u64>,
    /// Write events and handler outcomes to the durable store.
    pub persist_events: bool,
    /// Global aggregation settings.
    pub aggregation: AggregationConfig,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 10_000,
            backpressure: BackpressureStrategy::default(),
            overflow_capacity: 1_000,
            block_timeout_ms: 5_000,
            poll_interval_ms: 100,
            handler_workers: num_cpus::get().max(2),
            default_handler_timeout_ms: Some(30_000),
            persist_events: true,
            aggregation: AggregationConfig::default(),
        }
    }
}

impl BusConfig {
    /// Dispatch loop cadence.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Block-strategy wait limit.
    #[must_use]
    pub const fn block_timeout(&self) -> Duration {
        Duration::from_millis(self.block_timeout_ms)
    }

    /// Fallback handler deadline.
    #[must_use]
    pub fn default_handler_timeout(&self) -> Option<Duration> {
        self.default_handler_timeout_ms.map(Duration::from_millis)
    }

    /// Validate bus configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_queue_size == 0 {
            return Err("max_queue_size must be greater than 0".into());
        }
        if self.backpressure == BackpressureStrategy::Buffer && self.overflow_capacity == 0 {
            return Err("overflow_capacity must be greater than 0 with buffer backpressure".into());
        }
        if self.poll_interval_ms == 0 {
            return Err("poll_interval_ms must be greater than 0".into());
        }
        if self.handler_workers == 0 {
            return Err("handler_workers must be greater than 0".into());
        }
        if self.default_handler_timeout_ms == Some(0) {
            return Err("default_handler_timeout_ms must be greater than 0 when set".into());
        }
        self.aggregation
            .validate()
            .map_err(|e| format!("aggregation invalid: {e}"))
    }
}

/// Root configuration for a task engine paired with an event bus.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Task engine settings.
    pub engine: EngineConfig,
    /// Event bus settings.
    pub bus: BusConfig,
    /// Durable store backend.
    pub store: StoreBackendConfig,
}

impl RuntimeConfig {
    /// Validate every section.
    pub fn validate(&self) -> Result<(), String> {
        self.engine
            .validate()
            .map_err(|e| format!("engine invalid: {e}"))?;
        self.bus.validate().map_err(|e| format!("bus invalid: {e}"))?;
        if let StoreBackendConfig::Jsonl { dir } = &self.store {
            if dir.as_os_str().is_empty() {
                return Err("store invalid: jsonl dir must not be empty".into());
            }
        }
        Ok(())
    }

    /// Parse runtime configuration from a JSON string and validate.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Defaults overridden by `TASKBUS_*` variables, after loading `.env` if
    /// one exists.
    ///
    /// Recognised: `TASKBUS_WORKER_COUNT`, `TASKBUS_POLL_INTERVAL_MS`,
    /// `TASKBUS_DEFAULT_TIMEOUT_SECS`, `TASKBUS_DEFAULT_MAX_RETRIES`,
    /// `TASKBUS_DEFAULT_RETRY_DELAY_MS`, `TASKBUS_CPU_CAPACITY`,
    /// `TASKBUS_MEMORY_CAPACITY`, `TASKBUS_GPU_CAPACITY`,
    /// `TASKBUS_MAX_QUEUE_SIZE`, `TASKBUS_BACKPRESSURE`,
    /// `TASKBUS_BLOCK_TIMEOUT_MS`, `TASKBUS_HANDLER_WORKERS`,
    /// `TASKBUS_PERSIST_EVENTS`, `TASKBUS_STORE_DIR`.
    pub fn from_env() -> Result<Self, String> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as `from_env` with an explicit variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));
        let mut cfg = Self::default();

        if let Some(v) = get("WORKER_COUNT") {
            cfg.engine.worker_count = parse_var("WORKER_COUNT", &v)?;
        }
        if let Some(v) = get("POLL_INTERVAL_MS") {
            let ms = parse_var("POLL_INTERVAL_MS", &v)?;
            cfg.engine.poll_interval_ms = ms;
            cfg.bus.poll_interval_ms = ms;
        }
        if let Some(v) = get("DEFAULT_TIMEOUT_SECS") {
            cfg.engine.default_timeout_secs = Some(parse_var("DEFAULT_TIMEOUT_SECS", &v)?);
        }
        if let Some(v) = get("DEFAULT_MAX_RETRIES") {
            cfg.engine.default_max_retries = parse_var("DEFAULT_MAX_RETRIES", &v)?;
        }
        if let Some(v) = get("DEFAULT_RETRY_DELAY_MS") {
            cfg.engine.default_retry_delay_ms = parse_var("DEFAULT_RETRY_DELAY_MS", &v)?;
        }
        if let Some(v) = get("CPU_CAPACITY") {
            cfg.engine.capacity.cpu = parse_var("CPU_CAPACITY", &v)?;
        }
        if let Some(v) = get("MEMORY_CAPACITY") {
            cfg.engine.capacity.memory = parse_var("MEMORY_CAPACITY", &v)?;
        }
        if let Some(v) = get("GPU_CAPACITY") {
            cfg.engine.capacity.gpu = parse_var("GPU_CAPACITY", &v)?;
        }
        if let Some(v) = get("MAX_QUEUE_SIZE") {
            cfg.bus.max_queue_size = parse_var("MAX_QUEUE_SIZE", &v)?;
        }
        if let Some(v) = get("BACKPRESSURE") {
            cfg.bus.backpressure = serde_json::from_value(serde_json::Value::String(v.clone()))
                .map_err(|_| format!("{ENV_PREFIX}BACKPRESSURE: unknown strategy `{v}`"))?;
        }
        if let Some(v) = get("BLOCK_TIMEOUT_MS") {
            cfg.bus.block_timeout_ms = parse_var("BLOCK_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = get("HANDLER_WORKERS") {
            cfg.bus.handler_workers = parse_var("HANDLER_WORKERS", &v)?;
        }
        if let Some(v) = get("PERSIST_EVENTS") {
            cfg.bus.persist_events = parse_var("PERSIST_EVENTS", &v)?;
        }
        if let Some(v) = get("STORE_DIR") {
            cfg.store = StoreBackendConfig::Jsonl { dir: v.into() };
        }

        cfg.validate()?;
        Ok(cfg)
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, String>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| format!("{ENV_PREFIX}{name}: {e}"))
}
