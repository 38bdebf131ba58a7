//! Destination lookup for outbox events.

use std::collections::HashMap;

use crate::OutboxEvent;

/// Default destination used when no route matches.
pub const DEFAULT_TOPIC: &str = "default-topic";

/// Maps outbox events to broker destinations.
///
/// Resolution order: the event's explicit destination, then a route
/// registered for its event type, then the default topic. Resolution is a
/// pure function of the event and the routing table.
#[derive(Debug, Clone)]
pub struct TopicRouter {
    routes: HashMap<String, String>,
    default_topic: String,
}

impl TopicRouter {
    /// Creates a router that sends everything to `default_topic`.
    pub fn new(default_topic: impl Into<String>) -> Self {
        Self {
            routes: HashMap::new(),
            default_topic: default_topic.into(),
        }
    }

    /// Adds a route from an event type to a destination.
    pub fn route(mut self, event_type: impl Into<String>, destination: impl Into<String>) -> Self {
        self.routes.insert(event_type.into(), destination.into());
        self
    }

    /// Returns the default topic.
    pub fn default_topic(&self) -> &str {
        &self.default_topic
    }

    /// Resolves the destination for an event.
    pub fn resolve(&self, event: &OutboxEvent) -> String {
        if let Some(ref destination) = event.destination {
            return destination.clone();
        }
        self.routes
            .get(&event.event_type)
            .cloned()
            .unwrap_or_else(|| self.default_topic.clone())
    }
}

impl Default for TopicRouter {
    fn default() -> Self {
        Self::new(DEFAULT_TOPIC)
    }
}
