use async_trait::async_trait;

use crate::{OutboxEvent, OutboxEventId, OutboxQuery, OutboxStatus, Result, StatusUpdate};

/// A store that can open, commit, and roll back transactions.
///
/// The transaction handle is owned by the host application while its
/// business writes are in progress; outbox writes made through the handle
/// become visible only when the handle is committed.
#[async_trait]
pub trait Transactional: Send + Sync {
    /// Transaction handle type.
    type Tx: Send;

    /// Opens a new transaction.
    async fn begin(&self) -> Result<Self::Tx>;

    /// Commits the transaction, making its writes visible.
    async fn commit(&self, tx: Self::Tx) -> Result<()>;

    /// Rolls the transaction back, discarding its writes.
    async fn rollback(&self, tx: Self::Tx) -> Result<()>;
}

/// Durable record of outbox events and their delivery status.
///
/// Implementations must be safe to share between many concurrent dispatch
/// tasks.
#[async_trait]
pub trait OutboxStateStore: Transactional {
    /// Inserts a new event as part of the caller's transaction.
    ///
    /// The event is invisible to every other operation until `tx` commits
    /// and is discarded if `tx` rolls back.
    async fn save(&self, tx: &mut Self::Tx, event: &OutboxEvent) -> Result<()>;

    /// Marks an event processed in its own atomic operation.
    ///
    /// Returns `StatusUpdate::Unchanged` if the event is already processed.
    /// Fails with `InvalidTransition` if the event already failed.
    async fn mark_processed(&self, id: OutboxEventId) -> Result<StatusUpdate>;

    /// Marks an event failed in its own atomic operation, recording `reason`.
    ///
    /// Returns `StatusUpdate::Unchanged` if the event is already failed.
    /// Fails with `InvalidTransition` if the event was already processed.
    async fn mark_failed(&self, id: OutboxEventId, reason: &str) -> Result<StatusUpdate>;

    /// Resolves the destination an event should be published to.
    ///
    /// Pure lookup with no side effects.
    fn resolve_topic(&self, event: &OutboxEvent) -> String;

    /// Retrieves a committed event by ID.
    async fn get_event(&self, id: OutboxEventId) -> Result<Option<OutboxEvent>>;

    /// Retrieves committed events matching a query, oldest first.
    async fn query_events(&self, query: OutboxQuery) -> Result<Vec<OutboxEvent>>;
}

/// Extension trait providing convenience methods for outbox stores.
#[async_trait]
pub trait OutboxStateStoreExt: OutboxStateStore {
    /// Applies a terminal status through the matching mark operation.
    async fn mark(
        &self,
        id: OutboxEventId,
        status: OutboxStatus,
        reason: Option<&str>,
    ) -> Result<StatusUpdate> {
        match status {
            OutboxStatus::Processed => self.mark_processed(id).await,
            OutboxStatus::Failed => self.mark_failed(id, reason.unwrap_or_default()).await,
            OutboxStatus::Pending => {
                // Nothing moves an event back to pending; report against the
                // event's current status.
                let current = self
                    .get_event(id)
                    .await?
                    .ok_or(crate::OutboxStoreError::EventNotFound(id))?;
                match current.status.transition(OutboxStatus::Pending) {
                    Ok(update) => Ok(update),
                    Err(e) => Err(crate::OutboxStoreError::InvalidTransition {
                        event_id: id,
                        from: e.from,
                        to: e.to,
                    }),
                }
            }
        }
    }

    /// Saves a single event in a transaction of its own.
    async fn save_committed(&self, event: &OutboxEvent) -> Result<()> {
        let mut tx = self.begin().await?;
        if let Err(e) = self.save(&mut tx, event).await {
            if let Err(rollback_err) = self.rollback(tx).await {
                tracing::warn!(error = %rollback_err, "rollback after failed save also failed");
            }
            return Err(e);
        }
        self.commit(tx).await
    }

    /// Returns pending events, oldest first.
    async fn pending_events(&self, limit: usize) -> Result<Vec<OutboxEvent>> {
        self.query_events(OutboxQuery::new().status(OutboxStatus::Pending).limit(limit))
            .await
    }
}

// Blanket implementation for all OutboxStateStore implementations
impl<T: OutboxStateStore + ?Sized> OutboxStateStoreExt for T {}
