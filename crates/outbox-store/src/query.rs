use chrono::{DateTime, Utc};

use crate::{OutboxEvent, OutboxStatus};

/// Builder for constructing outbox queries.
///
/// Used by operators and by recovery sweeps looking for events that never
/// left the `Pending` state.
#[derive(Debug, Clone, Default)]
pub struct OutboxQuery {
    /// Filter by status.
    pub status: Option<OutboxStatus>,

    /// Filter by event type.
    pub event_type: Option<String>,

    /// Only events created strictly before this timestamp.
    pub created_before: Option<DateTime<Utc>>,

    /// Maximum number of events to return.
    pub limit: Option<usize>,
}

impl OutboxQuery {
    /// Creates a new empty query.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a query for pending events created before `cutoff`.
    pub fn stuck_pending(cutoff: DateTime<Utc>) -> Self {
        Self {
            status: Some(OutboxStatus::Pending),
            created_before: Some(cutoff),
            ..Default::default()
        }
    }

    /// Filters by status.
    pub fn status(mut self, status: OutboxStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Filters by event type.
    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    /// Filters to events created before the given time.
    pub fn created_before(mut self, cutoff: DateTime<Utc>) -> Self {
        self.created_before = Some(cutoff);
        self
    }

    /// Limits the number of results.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Returns true if the event satisfies every filter of this query.
    pub fn matches(&self, event: &OutboxEvent) -> bool {
        if let Some(status) = self.status
            && event.status != status
        {
            return false;
        }
        if let Some(ref event_type) = self.event_type
            && &event.event_type != event_type
        {
            return false;
        }
        if let Some(cutoff) = self.created_before
            && event.created_at >= cutoff
        {
            return false;
        }
        true
    }
}
