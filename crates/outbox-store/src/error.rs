use thiserror::Error;

use crate::{OutboxEventId, OutboxStatus};

/// Errors that can occur when interacting with the outbox state store.
#[derive(Debug, Error)]
pub enum OutboxStoreError {
    /// No outbox event exists with the given ID.
    #[error("Outbox event not found: {0}")]
    EventNotFound(OutboxEventId),

    /// An outbox event with the same ID was already saved.
    #[error("Duplicate outbox event: {0}")]
    DuplicateEvent(OutboxEventId),

    /// The requested status change is not allowed from the current status.
    #[error("Invalid status transition for outbox event {event_id}: {from} -> {to}")]
    InvalidTransition {
        event_id: OutboxEventId,
        from: OutboxStatus,
        to: OutboxStatus,
    },

    /// A status value read from storage is not recognised.
    #[error("Invalid outbox status: {0}")]
    InvalidStatus(String),

    /// The store could not be reached or refused the operation.
    #[error("Outbox store unavailable: {0}")]
    Unavailable(String),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl OutboxStoreError {
    /// Returns true if the error reports a conflicting terminal status rather
    /// than a failure to reach or update the store.
    pub fn is_invalid_transition(&self) -> bool {
        matches!(self, OutboxStoreError::InvalidTransition { .. })
    }
}

/// Result type for outbox store operations.
pub type Result<T> = std::result::Result<T, OutboxStoreError>;
