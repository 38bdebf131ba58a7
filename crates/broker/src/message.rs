use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Header carrying the outbox event identifier.
pub const EVENT_ID_HEADER: &str = "outbox-event-id";

/// Header carrying the domain event type.
pub const EVENT_TYPE_HEADER: &str = "outbox-event-type";

/// Header carrying the application ordering key of the event.
pub const EVENT_KEY_HEADER: &str = "outbox-event-key";

/// Where a message landed on the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeliveryPosition {
    /// Partition the message was routed to.
    pub partition: u32,
    /// Offset of the message within its partition.
    pub offset: u64,
}

impl std::fmt::Display for DeliveryPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.partition, self.offset)
    }
}

/// Result of a successful publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReceipt {
    /// Where the message landed.
    pub position: DeliveryPosition,
    /// How many attempts it took, counting the successful one.
    pub attempts: u32,
}

/// A message on its way to the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxMessage {
    /// Partition/ordering key.
    pub key: String,
    /// Message body.
    pub value: String,
    /// Message headers.
    pub headers: BTreeMap<String, String>,
}

impl OutboxMessage {
    /// Creates a message with no headers.
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            headers: BTreeMap::new(),
        }
    }

    /// Adds a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Returns a header value.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

/// A message received from a broker channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    /// Channel (topic) the message was read from.
    pub channel: String,
    /// Message key, if any.
    pub key: Option<String>,
    /// Message body.
    pub value: String,
    /// Message headers.
    pub headers: BTreeMap<String, String>,
    /// Position of the message on the channel.
    pub position: DeliveryPosition,
    /// How many times this message has been handed to a consumer.
    pub delivery_count: u32,
}

impl IncomingMessage {
    /// Creates a message as a consumer would see it on first delivery.
    pub fn new(channel: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            key: None,
            value: value.into(),
            headers: BTreeMap::new(),
            position: DeliveryPosition {
                partition: 0,
                offset: 0,
            },
            delivery_count: 1,
        }
    }

    /// Sets the message key.
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Returns a header value.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}
