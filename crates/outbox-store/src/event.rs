use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{CorrelationContext, OutboxEventId, OutboxStoreError};

/// Delivery status of an outbox event.
///
/// State transitions:
/// ```text
/// Pending ──┬──► Processed
///           └──► Failed
/// ```
/// Both terminal states are final. Re-applying the status an event already
/// has is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
    /// Saved with the host transaction, not yet confirmed delivered.
    #[default]
    Pending,

    /// Delivered to the broker (terminal state).
    Processed,

    /// Delivery retries exhausted (terminal state).
    Failed,
}

/// Result of applying a status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusUpdate {
    /// The status changed.
    Applied,
    /// The event already had the requested status; nothing changed.
    Unchanged,
}

impl StatusUpdate {
    /// Returns true if the status actually changed.
    pub fn is_applied(&self) -> bool {
        matches!(self, StatusUpdate::Applied)
    }
}

/// A status change that the state machine does not allow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: OutboxStatus,
    pub to: OutboxStatus,
}

impl OutboxStatus {
    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, OutboxStatus::Processed | OutboxStatus::Failed)
    }

    /// Returns true if moving to `to` would change the status.
    pub fn can_transition_to(&self, to: OutboxStatus) -> bool {
        matches!(self, OutboxStatus::Pending) && to.is_terminal()
    }

    /// Checks a status change against the state machine.
    pub fn transition(&self, to: OutboxStatus) -> Result<StatusUpdate, InvalidTransition> {
        if *self == to {
            Ok(StatusUpdate::Unchanged)
        } else if self.can_transition_to(to) {
            Ok(StatusUpdate::Applied)
        } else {
            Err(InvalidTransition { from: *self, to })
        }
    }

    /// Returns the status name as stored and transmitted.
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "PENDING",
            OutboxStatus::Processed => "PROCESSED",
            OutboxStatus::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutboxStatus {
    type Err = OutboxStoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Ok(OutboxStatus::Pending),
            "PROCESSED" => Ok(OutboxStatus::Processed),
            "FAILED" => Ok(OutboxStatus::Failed),
            other => Err(OutboxStoreError::InvalidStatus(other.to_string())),
        }
    }
}

/// A domain event recorded in the outbox, plus its delivery bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEvent {
    /// Unique identifier for this outbox event.
    pub id: OutboxEventId,

    /// The type of the domain event (e.g., "order-created").
    pub event_type: String,

    /// The serialized domain event.
    pub payload: serde_json::Value,

    /// Destination requested when the event was captured. When absent the
    /// store's topic router picks one from the event type.
    pub destination: Option<String>,

    /// Partition/ordering key. Defaults to the string form of `id`.
    pub key: String,

    /// Current delivery status.
    pub status: OutboxStatus,

    /// When the event was captured.
    pub created_at: DateTime<Utc>,

    /// When the event reached a terminal status.
    pub processed_at: Option<DateTime<Utc>>,

    /// Trace context of the capture, propagated to the broker.
    pub correlation: CorrelationContext,

    /// Cause recorded when the event was marked failed.
    pub last_error: Option<String>,
}

impl OutboxEvent {
    /// Creates a new pending event keyed by its own ID.
    pub fn pending(
        event_type: impl Into<String>,
        payload: serde_json::Value,
        correlation: CorrelationContext,
    ) -> Self {
        let id = OutboxEventId::new();
        Self {
            id,
            event_type: event_type.into(),
            payload,
            destination: None,
            key: id.to_string(),
            status: OutboxStatus::Pending,
            created_at: Utc::now(),
            processed_at: None,
            correlation,
            last_error: None,
        }
    }

    /// Sets an explicit destination.
    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    /// Overrides the partition key.
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    /// Returns true if the event has reached a terminal status.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Applies a status change, stamping `processed_at` (and `last_error`
    /// for failures) when it takes effect.
    pub fn apply_status(
        &mut self,
        to: OutboxStatus,
        at: DateTime<Utc>,
        reason: Option<&str>,
    ) -> Result<StatusUpdate, InvalidTransition> {
        let update = self.status.transition(to)?;
        if update.is_applied() {
            self.status = to;
            self.processed_at = Some(at);
            if to == OutboxStatus::Failed {
                self.last_error = reason.map(str::to_string);
            }
        }
        Ok(update)
    }
}
