//! Topic-addressed event distribution: model, handlers, admission policy,
//! aggregation, routing and the bus that ties them together.

pub mod aggregator;
pub mod backpressure;
pub mod bus;
pub mod event;
pub mod handler;
pub mod router;

use async_trait::async_trait;

pub use aggregator::{default_synthesis, AggregationRule, EventAggregator, AGGREGATED_TAG};
pub use backpressure::{BackpressureDecision, BackpressureGate, BackpressureStrategy};
pub use bus::{BusStats, EventBus};
pub use event::{Event, EventDraft, EventMetadata, EventStatus};
pub use handler::{Handler, HandlerOutcome, SubscribeOptions, SubscriptionId, WILDCARD};
pub use router::Router;

use crate::util::serde::EventId;

/// Sink for notifications produced by other components.
///
/// The task engine publishes its lifecycle events through this trait so it
/// never depends on a concrete bus.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish `draft` and return the new event's id.
    async fn publish(&self, draft: EventDraft) -> EventId;
}
