//! # Prometheus Taskbus
//!
//! An in-process priority task engine paired with a topic-based event bus,
//! sharing a durable record store.
//!
//! ## Task engine
//!
//! Tasks are queued by priority (Critical, High, Normal, Low, Background),
//! held back until their dependencies complete, and admitted only when a
//! five-dimension resource ledger (CPU, memory, disk, network, GPU) has room
//! for them. Failed attempts are retried with linear backoff; each attempt can
//! carry a deadline; cancellation is cooperative.
//!
//! ## Event bus
//!
//! Events are published on topics and delivered to every subscriber of the
//! topic plus wildcard (`*`) subscribers. A bounded, priority-ordered queue
//! applies a configurable backpressure strategy, optional aggregation merges
//! bursts of same-topic events, and handlers run isolated from each other with
//! their own deadlines and retries.
//!
//! ## Wiring
//!
//! ```rust,ignore
//! use std::time::Duration;
//! use prometheus_taskbus::builders::build_runtime;
//! use prometheus_taskbus::config::RuntimeConfig;
//! use prometheus_taskbus::core::{SubmitOptions, Work};
//! use prometheus_taskbus::events::{Handler, SubscribeOptions};
//!
//! let runtime = build_runtime(&RuntimeConfig::from_env()?)?;
//! runtime.bus.subscribe(
//!     "task.completed",
//!     Handler::sync(|event| Ok(event.payload["task_id"].clone())),
//!     SubscribeOptions::new(),
//! );
//! runtime.start();
//!
//! let id = runtime
//!     .engine
//!     .submit(Work::sync(|_| Ok(serde_json::json!(42))), SubmitOptions::new())
//!     .await;
//! runtime.shutdown(Duration::from_secs(5)).await;
//! ```

#![deny(warnings)]
#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Task model, scheduler, resource ledger and the task engine.
pub mod core;
/// Event model, handlers, backpressure, aggregation, routing and the bus.
pub mod events;
/// Configuration models for the engine, the bus and the store.
pub mod config;
/// Builders to construct a runtime from configuration.
pub mod builders;
/// Durable storage backends.
pub mod infra;
/// Shared utilities.
pub mod util;
