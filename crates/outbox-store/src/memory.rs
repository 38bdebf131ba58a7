use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::{
    OutboxEvent, OutboxEventId, OutboxQuery, OutboxStatus, OutboxStoreError, Result, StatusUpdate,
    TopicRouter,
    store::{OutboxStateStore, Transactional},
};

/// Transaction handle for [`InMemoryOutboxStore`].
///
/// Saved events are staged here and only reach the store on commit.
#[derive(Debug, Default)]
pub struct InMemoryTransaction {
    staged: Vec<OutboxEvent>,
}

impl InMemoryTransaction {
    /// Returns the number of events staged in this transaction.
    pub fn staged_count(&self) -> usize {
        self.staged.len()
    }
}

#[derive(Debug, Default)]
struct Faults {
    fail_on_save: AtomicBool,
    fail_on_commit: AtomicBool,
    failing_status_updates: AtomicUsize,
}

impl Faults {
    fn take_status_update_failure(&self) -> bool {
        self.failing_status_updates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// In-memory outbox store for testing and embedding.
///
/// This implementation keeps all events in memory and honours the same
/// transactional contract as the PostgreSQL implementation. Failure knobs
/// let tests simulate an unavailable store.
#[derive(Clone, Default)]
pub struct InMemoryOutboxStore {
    events: Arc<RwLock<HashMap<OutboxEventId, OutboxEvent>>>,
    router: TopicRouter,
    faults: Arc<Faults>,
}

impl InMemoryOutboxStore {
    /// Creates a new empty store routing everything to the default topic.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new empty store with the given topic router.
    pub fn with_router(router: TopicRouter) -> Self {
        Self {
            router,
            ..Self::default()
        }
    }

    /// Returns the number of committed events.
    pub async fn event_count(&self) -> usize {
        self.events.read().await.len()
    }

    /// Returns the committed events, oldest first.
    pub async fn all_events(&self) -> Vec<OutboxEvent> {
        let mut events: Vec<_> = self.events.read().await.values().cloned().collect();
        events.sort_by_key(|e| e.created_at);
        events
    }

    /// Makes every subsequent `save` fail until reset.
    pub fn set_fail_on_save(&self, fail: bool) {
        self.faults.fail_on_save.store(fail, Ordering::SeqCst);
    }

    /// Makes every subsequent `commit` fail until reset.
    pub fn set_fail_on_commit(&self, fail: bool) {
        self.faults.fail_on_commit.store(fail, Ordering::SeqCst);
    }

    /// Makes the next `count` status updates fail.
    pub fn fail_next_status_updates(&self, count: usize) {
        self.faults
            .failing_status_updates
            .store(count, Ordering::SeqCst);
    }

    /// Clears all events.
    pub async fn clear(&self) {
        self.events.write().await.clear();
    }

    async fn apply_status(
        &self,
        id: OutboxEventId,
        to: OutboxStatus,
        reason: Option<&str>,
    ) -> Result<StatusUpdate> {
        if self.faults.take_status_update_failure() {
            return Err(OutboxStoreError::Unavailable(format!(
                "simulated failure marking {id} {to}"
            )));
        }

        let mut events = self.events.write().await;
        let event = events
            .get_mut(&id)
            .ok_or(OutboxStoreError::EventNotFound(id))?;
        event
            .apply_status(to, Utc::now(), reason)
            .map_err(|e| OutboxStoreError::InvalidTransition {
                event_id: id,
                from: e.from,
                to: e.to,
            })
    }
}

#[async_trait]
impl Transactional for InMemoryOutboxStore {
    type Tx = InMemoryTransaction;

    async fn begin(&self) -> Result<Self::Tx> {
        Ok(InMemoryTransaction::default())
    }

    async fn commit(&self, tx: Self::Tx) -> Result<()> {
        if self.faults.fail_on_commit.load(Ordering::SeqCst) {
            return Err(OutboxStoreError::Unavailable(
                "simulated commit failure".to_string(),
            ));
        }

        let mut events = self.events.write().await;

        // Check the whole batch before applying any of it
        if let Some(dup) = tx.staged.iter().find(|e| events.contains_key(&e.id)) {
            return Err(OutboxStoreError::DuplicateEvent(dup.id));
        }

        for event in tx.staged {
            events.insert(event.id, event);
        }
        Ok(())
    }

    async fn rollback(&self, tx: Self::Tx) -> Result<()> {
        drop(tx);
        Ok(())
    }
}

#[async_trait]
impl OutboxStateStore for InMemoryOutboxStore {
    async fn save(&self, tx: &mut Self::Tx, event: &OutboxEvent) -> Result<()> {
        if self.faults.fail_on_save.load(Ordering::SeqCst) {
            return Err(OutboxStoreError::Unavailable(
                "simulated save failure".to_string(),
            ));
        }
        if tx.staged.iter().any(|e| e.id == event.id) {
            return Err(OutboxStoreError::DuplicateEvent(event.id));
        }
        tx.staged.push(event.clone());
        Ok(())
    }

    async fn mark_processed(&self, id: OutboxEventId) -> Result<StatusUpdate> {
        self.apply_status(id, OutboxStatus::Processed, None).await
    }

    async fn mark_failed(&self, id: OutboxEventId, reason: &str) -> Result<StatusUpdate> {
        self.apply_status(id, OutboxStatus::Failed, Some(reason))
            .await
    }

    fn resolve_topic(&self, event: &OutboxEvent) -> String {
        self.router.resolve(event)
    }

    async fn get_event(&self, id: OutboxEventId) -> Result<Option<OutboxEvent>> {
        Ok(self.events.read().await.get(&id).cloned())
    }

    async fn query_events(&self, query: OutboxQuery) -> Result<Vec<OutboxEvent>> {
        let events = self.events.read().await;
        let mut matching: Vec<_> = events
            .values()
            .filter(|e| query.matches(e))
            .cloned()
            .collect();
        matching.sort_by_key(|e| e.created_at);

        if let Some(limit) = query.limit {
            matching.truncate(limit);
        }
        Ok(matching)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CorrelationContext;
    use crate::store::OutboxStateStoreExt;

    fn create_test_event(event_type: &str) -> OutboxEvent {
        OutboxEvent::pending(
            event_type,
            serde_json::json!({"orderId": 42}),
            CorrelationContext::new_root(),
        )
    }

    #[tokio::test]
    async fn saved_event_is_invisible_until_commit() {
        let store = InMemoryOutboxStore::new();
        let event = create_test_event("order-created");

        let mut tx = store.begin().await.unwrap();
        store.save(&mut tx, &event).await.unwrap();
        assert_eq!(tx.staged_count(), 1);
        assert!(store.get_event(event.id).await.unwrap().is_none());

        store.commit(tx).await.unwrap();
        let stored = store.get_event(event.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OutboxStatus::Pending);
    }

    #[tokio::test]
    async fn rollback_discards_saved_events() {
        let store = InMemoryOutboxStore::new();
        let event = create_test_event("order-created");

        let mut tx = store.begin().await.unwrap();
        store.save(&mut tx, &event).await.unwrap();
        store.rollback(tx).await.unwrap();

        assert_eq!(store.event_count().await, 0);
    }

    #[tokio::test]
    async fn failed_commit_discards_saved_events() {
        let store = InMemoryOutboxStore::new();
        store.set_fail_on_commit(true);

        let mut tx = store.begin().await.unwrap();
        store
            .save(&mut tx, &create_test_event("order-created"))
            .await
            .unwrap();
        assert!(store.commit(tx).await.is_err());
        assert_eq!(store.event_count().await, 0);
    }

    #[tokio::test]
    async fn save_failure_is_reported() {
        let store = InMemoryOutboxStore::new();
        store.set_fail_on_save(true);

        let mut tx = store.begin().await.unwrap();
        let result = store.save(&mut tx, &create_test_event("order-created")).await;
        assert!(matches!(result, Err(OutboxStoreError::Unavailable(_))));
    }

    #[tokio::test]
    async fn duplicate_save_in_one_transaction_is_rejected() {
        let store = InMemoryOutboxStore::new();
        let event = create_test_event("order-created");

        let mut tx = store.begin().await.unwrap();
        store.save(&mut tx, &event).await.unwrap();
        let result = store.save(&mut tx, &event).await;
        assert!(matches!(result, Err(OutboxStoreError::DuplicateEvent(id)) if id == event.id));
    }

    #[tokio::test]
    async fn duplicate_across_transactions_is_rejected_on_commit() {
        let store = InMemoryOutboxStore::new();
        let event = create_test_event("order-created");
        store.save_committed(&event).await.unwrap();

        let result = store.save_committed(&event).await;
        assert!(matches!(result, Err(OutboxStoreError::DuplicateEvent(_))));
        assert_eq!(store.event_count().await, 1);
    }

    #[tokio::test]
    async fn mark_processed_twice_is_idempotent() {
        let store = InMemoryOutboxStore::new();
        let event = create_test_event("order-created");
        store.save_committed(&event).await.unwrap();

        let first = store.mark_processed(event.id).await.unwrap();
        let second = store.mark_processed(event.id).await.unwrap();
        assert_eq!(first, StatusUpdate::Applied);
        assert_eq!(second, StatusUpdate::Unchanged);

        let stored = store.get_event(event.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OutboxStatus::Processed);
        assert!(stored.processed_at.is_some());
    }

    #[tokio::test]
    async fn mark_failed_records_reason_and_is_idempotent() {
        let store = InMemoryOutboxStore::new();
        let event = create_test_event("order-created");
        store.save_committed(&event).await.unwrap();

        store.mark_failed(event.id, "broker down").await.unwrap();
        let again = store.mark_failed(event.id, "broker down").await.unwrap();
        assert_eq!(again, StatusUpdate::Unchanged);

        let stored = store.get_event(event.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OutboxStatus::Failed);
        assert_eq!(stored.last_error.as_deref(), Some("broker down"));
    }

    #[tokio::test]
    async fn conflicting_terminal_status_is_rejected() {
        let store = InMemoryOutboxStore::new();
        let event = create_test_event("order-created");
        store.save_committed(&event).await.unwrap();
        store.mark_processed(event.id).await.unwrap();

        let result = store.mark_failed(event.id, "late failure").await;
        assert!(matches!(
            result,
            Err(OutboxStoreError::InvalidTransition {
                from: OutboxStatus::Processed,
                to: OutboxStatus::Failed,
                ..
            })
        ));
        let stored = store.get_event(event.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OutboxStatus::Processed);
    }

    #[tokio::test]
    async fn marking_unknown_event_fails() {
        let store = InMemoryOutboxStore::new();
        let result = store.mark_processed(OutboxEventId::new()).await;
        assert!(matches!(result, Err(OutboxStoreError::EventNotFound(_))));
    }

    #[tokio::test]
    async fn injected_status_update_failures_are_consumed() {
        let store = InMemoryOutboxStore::new();
        let event = create_test_event("order-created");
        store.save_committed(&event).await.unwrap();
        store.fail_next_status_updates(1);

        assert!(store.mark_processed(event.id).await.is_err());
        assert!(store.mark_processed(event.id).await.is_ok());
    }

    #[tokio::test]
    async fn resolve_topic_uses_router() {
        let store =
            InMemoryOutboxStore::with_router(TopicRouter::new("events").route("order-created", "orders"));
        assert_eq!(
            store.resolve_topic(&create_test_event("order-created")),
            "orders"
        );
        assert_eq!(store.resolve_topic(&create_test_event("other")), "events");
    }

    #[tokio::test]
    async fn query_pending_events() {
        let store = InMemoryOutboxStore::new();
        let e1 = create_test_event("a");
        let e2 = create_test_event("b");
        let e3 = create_test_event("c");
        for e in [&e1, &e2, &e3] {
            store.save_committed(e).await.unwrap();
        }
        store.mark_processed(e2.id).await.unwrap();

        let pending = store.pending_events(10).await.unwrap();
        let ids: Vec<_> = pending.iter().map(|e| e.id).collect();
        assert_eq!(pending.len(), 2);
        assert!(ids.contains(&e1.id));
        assert!(ids.contains(&e3.id));

        let limited = store.pending_events(1).await.unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn mark_via_extension_dispatches_on_status() {
        let store = InMemoryOutboxStore::new();
        let event = create_test_event("a");
        store.save_committed(&event).await.unwrap();

        store
            .mark(event.id, OutboxStatus::Failed, Some("nope"))
            .await
            .unwrap();
        let stored = store.get_event(event.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OutboxStatus::Failed);

        let back = store.mark(event.id, OutboxStatus::Pending, None).await;
        assert!(matches!(
            back,
            Err(OutboxStoreError::InvalidTransition { .. })
        ));
    }
}
