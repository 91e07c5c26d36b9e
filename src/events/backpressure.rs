//! Admission policy applied when the bus queue reaches its ceiling.

use serde::{Deserialize, Serialize};

use super::event::Event;
use crate::util::serde::Priority;

/// What to do with new events once the queue is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressureStrategy {
    /// Accept the new event and evict the oldest one of the least urgent
    /// non-empty level.
    #[default]
    DropOldest,
    /// Reject the new event.
    DropNewest,
    /// Stall the publisher until space frees or the block timeout elapses.
    Block,
    /// Park the event in a bounded overflow buffer.
    Buffer,
    /// Keep only Critical and High events.
    Sample,
}

/// Outcome of evaluating one event against the current depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpressureDecision {
    /// Below the ceiling.
    Accept,
    /// Shed the event.
    Reject,
    /// Accept after evicting the oldest least-urgent event.
    EvictOldest,
    /// Accept into the overflow buffer.
    Overflow,
    /// Wait for space, then evaluate again.
    Wait,
}

impl BackpressureDecision {
    /// Whether the event may enter the bus right now.
    #[must_use]
    pub const fn admits(self) -> bool {
        matches!(self, Self::Accept | Self::EvictOldest | Self::Overflow)
    }
}

/// Stateless gate combining a strategy with the queue ceilings.
#[derive(Debug, Clone, Copy)]
pub struct BackpressureGate {
    strategy: BackpressureStrategy,
    max_queue_size: usize,
    overflow_capacity: usize,
}

impl BackpressureGate {
    /// Gate for `strategy` with the given ceilings.
    #[must_use]
    pub const fn new(
        strategy: BackpressureStrategy,
        max_queue_size: usize,
        overflow_capacity: usize,
    ) -> Self {
        Self {
            strategy,
            max_queue_size,
            overflow_capacity,
        }
    }

    /// Configured strategy.
    #[must_use]
    pub const fn strategy(&self) -> BackpressureStrategy {
        self.strategy
    }

    /// Queue ceiling.
    #[must_use]
    pub const fn max_queue_size(&self) -> usize {
        self.max_queue_size
    }

    /// Decide what happens to `event` given the current depths.
    #[must_use]
    pub fn evaluate(
        &self,
        queue_depth: usize,
        overflow_depth: usize,
        event: &Event,
    ) -> BackpressureDecision {
        if queue_depth < self.max_queue_size {
            return BackpressureDecision::Accept;
        }
        match self.strategy {
            BackpressureStrategy::DropNewest => BackpressureDecision::Reject,
            BackpressureStrategy::Sample => {
                if matches!(event.priority(), Priority::Critical | Priority::High) {
                    BackpressureDecision::Accept
                } else {
                    BackpressureDecision::Reject
                }
            }
            BackpressureStrategy::DropOldest => BackpressureDecision::EvictOldest,
            BackpressureStrategy::Buffer => {
                if overflow_depth < self.overflow_capacity {
                    BackpressureDecision::Overflow
                } else {
                    BackpressureDecision::Reject
                }
            }
            BackpressureStrategy::Block => BackpressureDecision::Wait,
        }
    }

    /// Whether `event` is admitted at `queue_depth` without waiting.
    #[must_use]
    pub fn accept(&self, queue_depth: usize, event: &Event) -> bool {
        self.evaluate(queue_depth, 0, event).admits()
    }
}
