//! Predicate-based routing.
//!
//! Routes are informational: matching destination names are recorded on the
//! event and logged, while delivery still follows topic subscriptions.

use std::fmt;
use std::sync::Arc;

use super::event::Event;

/// Decides whether an event belongs to a destination.
pub type RoutePredicate = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

/// Ordered set of named predicates.
#[derive(Default)]
pub struct Router {
    routes: Vec<(String, RoutePredicate)>,
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("routes", &self.route_names())
            .finish()
    }
}

impl Router {
    /// Router with no routes.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a destination, replacing any route with the same name.
    pub fn add_route<F>(&mut self, name: impl Into<String>, predicate: F)
    where
        F: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        let name = name.into();
        let predicate: RoutePredicate = Arc::new(predicate);
        if let Some(slot) = self.routes.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = predicate;
        } else {
            self.routes.push((name, predicate));
        }
    }

    /// Remove a destination. False if unknown.
    pub fn remove_route(&mut self, name: &str) -> bool {
        let before = self.routes.len();
        self.routes.retain(|(n, _)| n != name);
        self.routes.len() != before
    }

    /// Names of destinations whose predicate matches, in registration order.
    #[must_use]
    pub fn route(&self, event: &Event) -> Vec<String> {
        self.routes
            .iter()
            .filter(|(_, predicate)| predicate(event))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Registered destination names.
    #[must_use]
    pub fn route_names(&self) -> Vec<&str> {
        self.routes.iter().map(|(n, _)| n.as_str()).collect()
    }

    /// Number of routes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Whether no routes are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
