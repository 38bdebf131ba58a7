//! Capture and dispatch of outbox events.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use async_trait::async_trait;
use broker::{
    DeliveryError, DeliveryPosition, EVENT_ID_HEADER, EVENT_KEY_HEADER, EVENT_TYPE_HEADER,
    MessageBroker, OutboxMessage, RetryingPublisher,
};
use common::{CorrelationContext, OutboxEventId};
use outbox_store::{OutboxEvent, OutboxStateStore, StatusUpdate};
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::error::{OutboxError, Result};
use crate::unit_of_work::{BeforeCommit, UnitOfWork};

/// A domain event raised by business code, before it enters the outbox.
#[derive(Debug, Clone, PartialEq)]
pub struct DomainEvent {
    pub event_type: String,
    pub payload: serde_json::Value,
    /// Application ordering key, stored on the outbox row and sent in the
    /// `outbox-event-key` header. Defaults to the outbox event id. The broker
    /// message key is always the event id.
    pub key: Option<String>,
    /// Explicit destination. Defaults to the store's routing.
    pub destination: Option<String>,
    /// Trace context of the operation raising the event.
    pub correlation: Option<CorrelationContext>,
}

impl DomainEvent {
    pub fn new(event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            key: None,
            destination: None,
            correlation: None,
        }
    }

    /// Serializes `payload` into a new event.
    pub fn from_serializable<T: Serialize>(
        event_type: impl Into<String>,
        payload: &T,
    ) -> Result<Self> {
        Ok(Self::new(event_type, serde_json::to_value(payload)?))
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    pub fn with_correlation(mut self, correlation: CorrelationContext) -> Self {
        self.correlation = Some(correlation);
        self
    }
}

/// How a dispatch ended.
#[derive(Debug, Clone)]
pub enum DispatchOutcome {
    Delivered {
        position: DeliveryPosition,
        attempts: u32,
    },
    Failed {
        error: DeliveryError,
    },
}

/// Summary of one dispatch, returned from the spawned task.
#[derive(Debug, Clone)]
pub struct DispatchReport {
    pub event_id: OutboxEventId,
    pub destination: String,
    pub outcome: DispatchOutcome,
    /// Whether the terminal status reached the store. When false the event
    /// stays pending until a confirmation or an external sweep settles it.
    pub status_recorded: bool,
}

impl DispatchReport {
    pub fn is_delivered(&self) -> bool {
        matches!(self.outcome, DispatchOutcome::Delivered { .. })
    }

    pub fn attempts(&self) -> u32 {
        match &self.outcome {
            DispatchOutcome::Delivered { attempts, .. } => *attempts,
            DispatchOutcome::Failed { error } => error.attempts,
        }
    }

    /// Returns where the event landed, or the delivery error.
    pub fn into_result(self) -> Result<DeliveryPosition> {
        match self.outcome {
            DispatchOutcome::Delivered { position, .. } => Ok(position),
            DispatchOutcome::Failed { error } => Err(OutboxError::Delivery(error)),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Captures domain events into the outbox inside the host transaction and
/// publishes them once the transaction has committed.
///
/// Delivery is at-least-once. If the process stops between commit and
/// dispatch, the event stays pending; finding such events is left to a
/// sweep built on [`OutboxStateStore::query_events`] and [`Self::dispatch`].
pub struct TransactionalOutboxCoordinator<S, B>
where
    S: OutboxStateStore + Clone + 'static,
    B: MessageBroker + 'static,
{
    store: S,
    publisher: RetryingPublisher<B>,
    in_flight: Arc<Mutex<HashSet<OutboxEventId>>>,
    idle: Arc<Notify>,
}

impl<S, B> Clone for TransactionalOutboxCoordinator<S, B>
where
    S: OutboxStateStore + Clone + 'static,
    B: MessageBroker + 'static,
{
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            publisher: self.publisher.clone(),
            in_flight: Arc::clone(&self.in_flight),
            idle: Arc::clone(&self.idle),
        }
    }
}

impl<S, B> TransactionalOutboxCoordinator<S, B>
where
    S: OutboxStateStore + Clone + 'static,
    B: MessageBroker + 'static,
{
    pub fn new(store: S, publisher: RetryingPublisher<B>) -> Self {
        Self {
            store,
            publisher,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            idle: Arc::new(Notify::new()),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Writes `event` to the outbox on the caller's transaction.
    ///
    /// The stored event is pending and carries a child of the event's
    /// correlation context, or a fresh root context when none was given.
    /// A store failure is returned as [`OutboxError::Persistence`] and the
    /// caller must not commit.
    pub async fn capture(&self, event: DomainEvent, tx: &mut S::Tx) -> Result<OutboxEvent> {
        let correlation = event
            .correlation
            .as_ref()
            .map(CorrelationContext::child)
            .unwrap_or_else(CorrelationContext::new_root);

        let mut outbox_event = OutboxEvent::pending(event.event_type, event.payload, correlation);
        if let Some(key) = event.key {
            outbox_event = outbox_event.with_key(key);
        }
        if let Some(destination) = event.destination {
            outbox_event = outbox_event.with_destination(destination);
        }

        let span = tracing::info_span!(
            "outbox.capture",
            event_id = %outbox_event.id,
            event_type = %outbox_event.event_type,
            trace_id = %outbox_event.correlation.trace_id,
            span_id = %outbox_event.correlation.span_id,
        );

        async {
            if let Err(e) = self.store.save(tx, &outbox_event).await {
                tracing::error!(error = %e, "Failed to capture outbox event");
                return Err(OutboxError::Persistence(e));
            }
            metrics::counter!("outbox_events_captured_total").increment(1);
            tracing::debug!("Outbox event captured");
            Ok(())
        }
        .instrument(span)
        .await?;

        Ok(outbox_event)
    }

    /// Publishes a committed event on a spawned task and records its
    /// terminal status.
    ///
    /// Returns immediately. Returns `None` if the same event is already
    /// being dispatched. Delivery and status-update failures are logged and
    /// counted, never returned to the caller.
    pub fn dispatch(&self, event: OutboxEvent) -> Option<JoinHandle<DispatchReport>> {
        if !lock(&self.in_flight).insert(event.id) {
            tracing::warn!(event_id = %event.id, "Outbox event is already being dispatched");
            return None;
        }

        let guard = InFlightGuard {
            event_id: event.id,
            in_flight: Arc::clone(&self.in_flight),
            idle: Arc::clone(&self.idle),
        };
        let this = self.clone();

        Some(tokio::spawn(async move {
            let report = this.deliver(event).await;
            drop(guard);
            report
        }))
    }

    /// Registers `event` on `uow`: captured inside its transaction before
    /// commit, dispatched once the commit succeeds.
    pub fn raise(&self, uow: &mut UnitOfWork<S>, event: DomainEvent) {
        let captured = Arc::new(Mutex::new(None));

        uow.register_before_commit(CaptureHook {
            coordinator: self.clone(),
            event,
            captured: Arc::clone(&captured),
        });

        let coordinator = self.clone();
        uow.register_after_commit(move || {
            if let Some(event) = lock(&captured).take() {
                let _ = coordinator.dispatch(event);
            }
        });
    }

    /// Number of dispatches currently running.
    pub fn in_flight_count(&self) -> usize {
        lock(&self.in_flight).len()
    }

    /// Resolves once no dispatch is running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if lock(&self.in_flight).is_empty() {
                return;
            }
            notified.await;
        }
    }

    async fn deliver(&self, event: OutboxEvent) -> DispatchReport {
        let destination = self.store.resolve_topic(&event);
        let span = tracing::info_span!(
            "outbox.dispatch",
            event_id = %event.id,
            event_type = %event.event_type,
            destination = %destination,
            trace_id = %event.correlation.trace_id,
            span_id = %event.correlation.span_id,
        );

        async {
            let started = Instant::now();
            let message = OutboxMessage::new(event.id.to_string(), event.payload.to_string())
                .with_header(EVENT_ID_HEADER, event.id.to_string())
                .with_header(EVENT_TYPE_HEADER, event.event_type.clone())
                .with_header(EVENT_KEY_HEADER, event.key.clone());

            let (outcome, status_recorded) = match self
                .publisher
                .publish_message(&destination, message, &event.correlation)
                .await
            {
                Ok(receipt) => {
                    tracing::info!(
                        partition = receipt.position.partition,
                        offset = receipt.position.offset,
                        attempts = receipt.attempts,
                        "Outbox event delivered"
                    );
                    metrics::counter!("outbox_events_processed_total").increment(1);
                    let recorded =
                        log_status_update(event.id, self.store.mark_processed(event.id).await);
                    (
                        DispatchOutcome::Delivered {
                            position: receipt.position,
                            attempts: receipt.attempts,
                        },
                        recorded,
                    )
                }
                Err(error) => {
                    tracing::error!(
                        error = %error,
                        attempts = error.attempts,
                        "Outbox event delivery failed"
                    );
                    metrics::counter!("outbox_events_failed_total").increment(1);
                    let recorded = log_status_update(
                        event.id,
                        self.store.mark_failed(event.id, &error.to_string()).await,
                    );
                    (DispatchOutcome::Failed { error }, recorded)
                }
            };

            metrics::histogram!("outbox_dispatch_duration_seconds")
                .record(started.elapsed().as_secs_f64());

            DispatchReport {
                event_id: event.id,
                destination: destination.clone(),
                outcome,
                status_recorded,
            }
        }
        .instrument(span)
        .await
    }
}

fn log_status_update(
    event_id: OutboxEventId,
    result: outbox_store::Result<StatusUpdate>,
) -> bool {
    match result {
        Ok(StatusUpdate::Applied) => true,
        Ok(StatusUpdate::Unchanged) => {
            tracing::debug!(%event_id, "Outbox event already had this status");
            true
        }
        Err(e) => {
            tracing::error!(%event_id, error = %e, "Failed to record outbox event status");
            false
        }
    }
}

/// Removes an event from the in-flight set when its dispatch task ends,
/// including by panic.
struct InFlightGuard {
    event_id: OutboxEventId,
    in_flight: Arc<Mutex<HashSet<OutboxEventId>>>,
    idle: Arc<Notify>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut in_flight = lock(&self.in_flight);
        in_flight.remove(&self.event_id);
        if in_flight.is_empty() {
            self.idle.notify_waiters();
        }
    }
}

struct CaptureHook<S, B>
where
    S: OutboxStateStore + Clone + 'static,
    B: MessageBroker + 'static,
{
    coordinator: TransactionalOutboxCoordinator<S, B>,
    event: DomainEvent,
    captured: Arc<Mutex<Option<OutboxEvent>>>,
}

#[async_trait]
impl<S, B> BeforeCommit<S::Tx> for CaptureHook<S, B>
where
    S: OutboxStateStore + Clone + 'static,
    B: MessageBroker + 'static,
{
    async fn before_commit(&self, tx: &mut S::Tx) -> Result<()> {
        let event = self.coordinator.capture(self.event.clone(), tx).await?;
        *lock(&self.captured) = Some(event);
        Ok(())
    }
}
