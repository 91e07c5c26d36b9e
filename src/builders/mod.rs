//! Builders to construct runtime components from configuration.

pub mod runtime_builder;

pub use runtime_builder::{build_runtime, build_runtime_with, build_store, TaskRuntime};
