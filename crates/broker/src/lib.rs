//! Broker abstraction and retrying delivery for outbox events.
//!
//! - [`MessageBroker`], [`MessageConsumer`], and [`AckHandle`] are the seams a
//!   concrete broker client plugs into
//! - [`RetryingPublisher`] applies a [`RetryPolicy`] on top of any broker
//! - [`InMemoryBroker`] is a partitioned in-process broker for tests

pub mod broker;
pub mod error;
pub mod memory;
pub mod message;
pub mod publisher;
pub mod retry;

pub use broker::{AckHandle, Delivery, MessageBroker, MessageConsumer};
pub use error::{BrokerError, DeliveryError};
pub use memory::{DEFAULT_MAX_DELIVERIES, InMemoryBroker, InMemorySubscription};
pub use message::{
    DeliveryPosition, DeliveryReceipt, EVENT_ID_HEADER, EVENT_KEY_HEADER, EVENT_TYPE_HEADER,
    IncomingMessage, OutboxMessage,
};
pub use publisher::RetryingPublisher;
pub use retry::{DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_DELAY, RetryPolicy};
