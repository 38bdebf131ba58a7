//! Broker client seams.
//!
//! The outbox depends only on these traits; concrete broker clients live in
//! the host application.

use async_trait::async_trait;

use crate::{BrokerError, DeliveryPosition, IncomingMessage, OutboxMessage};

/// Sends messages to named destinations.
#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Sends a single message, returning where it landed.
    ///
    /// Messages sharing a key must land on the same partition so their
    /// relative order is preserved.
    async fn send(
        &self,
        destination: &str,
        message: &OutboxMessage,
    ) -> Result<DeliveryPosition, BrokerError>;
}

/// Acknowledges a received message so the broker will not redeliver it.
#[async_trait]
pub trait AckHandle: Send + Sync {
    async fn acknowledge(&self) -> Result<(), BrokerError>;
}

/// A received message together with its acknowledgment handle.
pub struct Delivery {
    pub message: IncomingMessage,
    pub ack: Box<dyn AckHandle>,
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}

/// Pulls messages from a broker subscription.
///
/// A message that is not acknowledged before the next call is redelivered
/// by the broker at some later point.
#[async_trait]
pub trait MessageConsumer: Send {
    /// Waits for the next delivery. Returns `None` once the subscription is
    /// closed and drained.
    async fn next_delivery(&mut self) -> Option<Delivery>;
}
