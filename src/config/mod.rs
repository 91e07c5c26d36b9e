//! Configuration models for the engine, the bus and the durable store.

pub mod runtime;

pub use runtime::{AggregationConfig, BusConfig, EngineConfig, RuntimeConfig, StoreBackendConfig};
