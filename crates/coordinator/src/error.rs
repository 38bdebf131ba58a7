//! Outbox error types.

use broker::{BrokerError, DeliveryError};
use common::OutboxEventId;
use outbox_store::OutboxStoreError;
use thiserror::Error;

/// Errors surfaced by the outbox coordinator and its unit of work.
#[derive(Debug, Error)]
pub enum OutboxError {
    /// The outbox event could not be written inside the host transaction.
    /// The transaction must not commit.
    #[error("Failed to persist outbox event: {0}")]
    Persistence(#[source] OutboxStoreError),

    /// Opening, committing, or rolling back the host transaction failed.
    #[error("Transaction error: {0}")]
    Transaction(#[source] OutboxStoreError),

    /// Delivery to the broker failed after every allowed attempt.
    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Logging or metrics could not be installed.
    #[error("Telemetry error: {0}")]
    Telemetry(String),
}

/// Errors raised while applying a confirmation message.
///
/// A malformed message is acknowledged and discarded by the reconciler. The
/// other errors leave the message unacknowledged, so the broker redelivers it.
#[derive(Debug, Error)]
pub enum ReconciliationError {
    /// The message does not reference an outbox event in a known form.
    #[error("Malformed confirmation on '{channel}': {reason}")]
    MalformedMessage { channel: String, reason: String },

    /// The store rejected or failed the status update.
    #[error("Failed to update status of {event_id}: {source}")]
    StatusUpdate {
        event_id: OutboxEventId,
        #[source]
        source: OutboxStoreError,
    },

    /// The update succeeded but the acknowledgment did not.
    #[error("Failed to acknowledge confirmation: {0}")]
    Acknowledge(#[source] BrokerError),
}

/// Convenience type alias for outbox results.
pub type Result<T> = std::result::Result<T, OutboxError>;
