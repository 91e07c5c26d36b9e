//! Builders wiring a task engine, an event bus and a durable store from
//! configuration.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::config::{RuntimeConfig, StoreBackendConfig};
use crate::core::{EngineError, TaskEngine};
use crate::events::{EventBus, EventPublisher};
use crate::infra::store::{DurableStore, InMemoryStore, JsonlStore};

/// Engine and bus sharing one store, with the engine publishing its
/// lifecycle events on the bus.
pub struct TaskRuntime {
    /// Task engine.
    pub engine: Arc<TaskEngine>,
    /// Event bus receiving `task.*` notifications.
    pub bus: Arc<EventBus>,
    /// Store shared by both.
    pub store: Arc<dyn DurableStore>,
}

impl TaskRuntime {
    /// Start the bus dispatch loop, then the engine scheduling loop.
    pub fn start(&self) {
        self.bus.start();
        self.engine.start();
    }

    /// Shut the engine down first so its final notifications reach the bus,
    /// then the bus.
    pub async fn shutdown(&self, timeout: Duration) {
        self.engine.shutdown(true, timeout).await;
        self.bus.shutdown(timeout).await;
    }
}

/// Open the store described by `cfg`.
///
/// # Errors
///
/// `EngineError::Store` if a file-backed store cannot be opened.
pub fn build_store(cfg: &StoreBackendConfig) -> Result<Arc<dyn DurableStore>, EngineError> {
    Ok(match cfg {
        StoreBackendConfig::InMemory => Arc::new(InMemoryStore::new()),
        StoreBackendConfig::Jsonl { dir } => Arc::new(JsonlStore::open(dir)?),
    })
}

/// Build a runtime from configuration, opening the configured store.
///
/// # Errors
///
/// Invalid configuration, store failures and worker pool failures.
pub fn build_runtime(cfg: &RuntimeConfig) -> Result<TaskRuntime, EngineError> {
    build_runtime_with(cfg, build_store)
}

/// Build a runtime from configuration using `store_factory` for the store.
///
/// # Errors
///
/// Invalid configuration, or whatever the factory and component constructors
/// report.
pub fn build_runtime_with<FS>(cfg: &RuntimeConfig, store_factory: FS) -> Result<TaskRuntime, EngineError>
where
    FS: FnOnce(&StoreBackendConfig) -> Result<Arc<dyn DurableStore>, EngineError>,
{
    cfg.validate().map_err(EngineError::Config)?;

    let store = store_factory(&cfg.store)?;
    let bus = Arc::new(EventBus::new(cfg.bus.clone(), Arc::clone(&store))?);
    let publisher: Arc<dyn EventPublisher> = Arc::clone(&bus) as Arc<dyn EventPublisher>;
    let engine = Arc::new(TaskEngine::new(
        cfg.engine.clone(),
        Arc::clone(&store),
        Some(publisher),
    )?);

    info!(
        workers = cfg.engine.worker_count,
        handler_workers = cfg.bus.handler_workers,
        store = ?cfg.store,
        "task runtime built"
    );
    Ok(TaskRuntime { engine, bus, store })
}
