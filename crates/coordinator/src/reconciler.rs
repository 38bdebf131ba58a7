//! Applies delivery confirmations from the broker to the outbox.
//!
//! Confirmations arrive on channels whose name ends with a fixed suffix.
//! A confirmation names an outbox event in one of three ways, tried in
//! order:
//!
//! 1. a JSON body `{"event_id": "<uuid>", "status": "PROCESSED" | "FAILED"}`
//! 2. a body holding only the event id
//! 3. the message key holding the event id, also used when a JSON body
//!    carries a status but no `event_id`
//!
//! A valid confirmation is acknowledged only after the store accepts the
//! update, so a failed update is redelivered by the broker. A malformed one
//! can never apply; it is logged and acknowledged so it does not block the
//! channel.

use broker::{AckHandle, IncomingMessage, MessageConsumer};
use common::OutboxEventId;
use outbox_store::{OutboxStateStore, OutboxStateStoreExt, OutboxStatus, StatusUpdate};
use serde::Deserialize;
use tracing::Instrument;

use crate::error::ReconciliationError;

/// Suffix identifying confirmation channels when none is configured.
pub const DEFAULT_CONFIRMATION_SUFFIX: &str = ".outbox";

const CONFIRMED_FAILURE_REASON: &str = "reported failed by confirmation";

/// Result of handling one confirmation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The status update was applied, or the event already had it.
    Updated(StatusUpdate),
    /// The event already reached the opposite terminal status. Acknowledged,
    /// since redelivery cannot change that.
    Conflict,
    /// The message names no event or no terminal status. Acknowledged.
    Malformed,
    /// The channel is not a confirmation channel. Not acknowledged.
    Ignored,
}

impl ReconcileOutcome {
    fn label(&self) -> &'static str {
        match self {
            ReconcileOutcome::Updated(StatusUpdate::Applied) => "applied",
            ReconcileOutcome::Updated(StatusUpdate::Unchanged) => "unchanged",
            ReconcileOutcome::Conflict => "conflict",
            ReconcileOutcome::Malformed => "malformed",
            ReconcileOutcome::Ignored => "ignored",
        }
    }
}

/// Counts of what [`StatusReconciler::run`] did before its consumer closed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    pub applied: usize,
    pub unchanged: usize,
    pub conflicts: usize,
    pub malformed: usize,
    pub ignored: usize,
    pub errors: usize,
}

impl ReconcileStats {
    fn record(&mut self, outcome: ReconcileOutcome) {
        match outcome {
            ReconcileOutcome::Updated(StatusUpdate::Applied) => self.applied += 1,
            ReconcileOutcome::Updated(StatusUpdate::Unchanged) => self.unchanged += 1,
            ReconcileOutcome::Conflict => self.conflicts += 1,
            ReconcileOutcome::Malformed => self.malformed += 1,
            ReconcileOutcome::Ignored => self.ignored += 1,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ConfirmationBody {
    #[serde(default)]
    event_id: Option<OutboxEventId>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

/// A parsed confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Confirmation {
    event_id: OutboxEventId,
    status: OutboxStatus,
    reason: Option<String>,
}

/// Consumes confirmation messages and records the terminal status they
/// report.
#[derive(Clone)]
pub struct StatusReconciler<S: OutboxStateStore> {
    store: S,
    suffix: String,
}

impl<S: OutboxStateStore> StatusReconciler<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            suffix: DEFAULT_CONFIRMATION_SUFFIX.to_string(),
        }
    }

    pub fn with_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = suffix.into();
        self
    }

    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    pub fn is_confirmation_channel(&self, channel: &str) -> bool {
        channel.ends_with(&self.suffix)
    }

    /// Applies one confirmation and acknowledges it on success.
    ///
    /// Messages on other channels are ignored and left unacknowledged.
    /// Malformed confirmations are acknowledged and reported as
    /// [`ReconcileOutcome::Malformed`]. Store errors are returned without
    /// acknowledging; nothing is retried here.
    pub async fn on_message(
        &self,
        message: &IncomingMessage,
        ack: &dyn AckHandle,
    ) -> Result<ReconcileOutcome, ReconciliationError> {
        if !self.is_confirmation_channel(&message.channel) {
            tracing::debug!(channel = %message.channel, "Ignoring message on non-confirmation channel");
            return Ok(ReconcileOutcome::Ignored);
        }

        let span = tracing::info_span!(
            "outbox.reconcile",
            channel = %message.channel,
            partition = message.position.partition,
            offset = message.position.offset,
            delivery_count = message.delivery_count,
            event_id = tracing::field::Empty,
        );

        async {
            let confirmation = match parse_confirmation(message) {
                Ok(confirmation) => confirmation,
                Err(e) => {
                    tracing::error!(error = %e, "Discarding malformed confirmation");
                    return self.settle(ack, ReconcileOutcome::Malformed).await;
                }
            };
            tracing::Span::current().record("event_id", tracing::field::display(confirmation.event_id));

            let result = self
                .store
                .mark(
                    confirmation.event_id,
                    confirmation.status,
                    Some(
                        confirmation
                            .reason
                            .as_deref()
                            .unwrap_or(CONFIRMED_FAILURE_REASON),
                    ),
                )
                .await;

            let outcome = match result {
                Ok(update) => ReconcileOutcome::Updated(update),
                Err(e) if e.is_invalid_transition() => {
                    tracing::warn!(error = %e, "Confirmation conflicts with recorded status");
                    ReconcileOutcome::Conflict
                }
                Err(source) => {
                    tracing::error!(error = %source, "Failed to apply confirmation");
                    return Err(ReconciliationError::StatusUpdate {
                        event_id: confirmation.event_id,
                        source,
                    });
                }
            };

            tracing::info!(status = %confirmation.status, outcome = outcome.label(), "Confirmation applied");
            self.settle(ack, outcome).await
        }
        .instrument(span)
        .await
    }

    async fn settle(
        &self,
        ack: &dyn AckHandle,
        outcome: ReconcileOutcome,
    ) -> Result<ReconcileOutcome, ReconciliationError> {
        ack.acknowledge()
            .await
            .map_err(ReconciliationError::Acknowledge)?;

        metrics::counter!("outbox_confirmations_total", "outcome" => outcome.label()).increment(1);
        Ok(outcome)
    }

    /// Handles deliveries from `consumer` until it closes.
    ///
    /// Per-message errors are logged and the message is left
    /// unacknowledged for redelivery. How often it comes back is up to the
    /// consumer's redelivery limit.
    pub async fn run<C: MessageConsumer + ?Sized>(&self, consumer: &mut C) -> ReconcileStats {
        let mut stats = ReconcileStats::default();

        while let Some(delivery) = consumer.next_delivery().await {
            match self.on_message(&delivery.message, delivery.ack.as_ref()).await {
                Ok(outcome) => stats.record(outcome),
                Err(e) => {
                    stats.errors += 1;
                    tracing::error!(
                        channel = %delivery.message.channel,
                        error = %e,
                        "Confirmation left unacknowledged"
                    );
                }
            }
        }

        tracing::info!(?stats, "Confirmation consumer closed");
        stats
    }
}

fn parse_confirmation(message: &IncomingMessage) -> Result<Confirmation, ReconciliationError> {
    let malformed = |reason: String| ReconciliationError::MalformedMessage {
        channel: message.channel.clone(),
        reason,
    };

    let key_id = || {
        message
            .key
            .as_deref()
            .and_then(|key| key.trim().parse::<OutboxEventId>().ok())
    };
    let body = message.value.trim();

    if body.starts_with('{') {
        let parsed: ConfirmationBody =
            serde_json::from_str(body).map_err(|e| malformed(e.to_string()))?;
        let status = match parsed.status.as_deref() {
            None => OutboxStatus::Processed,
            Some(raw) => raw.parse().map_err(|_| malformed(format!("unknown status '{raw}'")))?,
        };
        if !status.is_terminal() {
            return Err(malformed(format!("status '{status}' is not terminal")));
        }
        let event_id = parsed
            .event_id
            .or_else(key_id)
            .ok_or_else(|| malformed("no event id in body or key".to_string()))?;
        return Ok(Confirmation {
            event_id,
            status,
            reason: parsed.reason,
        });
    }

    let event_id = body
        .trim_matches('"')
        .parse::<OutboxEventId>()
        .ok()
        .or_else(key_id)
        .ok_or_else(|| malformed("no event id in body or key".to_string()))?;

    Ok(Confirmation {
        event_id,
        status: OutboxStatus::Processed,
        reason: None,
    })
}
