use std::sync::Arc;

use common::{CorrelationContext, TRACEPARENT_HEADER};
use tracing::Instrument;

use crate::{
    BrokerError, DeliveryError, DeliveryReceipt, MessageBroker, OutboxMessage, RetryPolicy,
};

/// Sends messages to a broker, retrying transient failures according to a
/// [`RetryPolicy`].
///
/// Each attempt runs in its own child span of the caller's correlation
/// context, and the attempt's `traceparent` is written onto the message so
/// consumers can continue the trace.
pub struct RetryingPublisher<B: MessageBroker> {
    broker: Arc<B>,
    policy: RetryPolicy,
}

impl<B: MessageBroker> Clone for RetryingPublisher<B> {
    fn clone(&self) -> Self {
        Self {
            broker: Arc::clone(&self.broker),
            policy: self.policy.clone(),
        }
    }
}

impl<B: MessageBroker> RetryingPublisher<B> {
    pub fn new(broker: Arc<B>, policy: RetryPolicy) -> Self {
        Self { broker, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn broker(&self) -> &Arc<B> {
        &self.broker
    }

    /// Publishes `payload` under `key` to `destination`.
    pub async fn publish(
        &self,
        destination: &str,
        key: &str,
        payload: &str,
        correlation: &CorrelationContext,
    ) -> Result<DeliveryReceipt, DeliveryError> {
        self.publish_message(destination, OutboxMessage::new(key, payload), correlation)
            .await
    }

    /// Publishes a prepared message, adding the `traceparent` header per
    /// attempt.
    ///
    /// Retries only transient broker errors. Sleeps between attempts as the
    /// policy dictates; the final failure is returned with the number of
    /// attempts made.
    pub async fn publish_message(
        &self,
        destination: &str,
        mut message: OutboxMessage,
        correlation: &CorrelationContext,
    ) -> Result<DeliveryReceipt, DeliveryError> {
        let max_attempts = self.policy.max_attempts();
        let mut attempt = 1;

        loop {
            let attempt_context = correlation.child();
            message.headers.insert(
                TRACEPARENT_HEADER.to_string(),
                attempt_context.to_traceparent(),
            );

            let span = tracing::info_span!(
                "outbox.publish.attempt",
                destination = %destination,
                key = %message.key,
                attempt,
                trace_id = %attempt_context.trace_id,
                span_id = %attempt_context.span_id,
            );

            metrics::counter!("outbox_publish_attempts_total").increment(1);

            let result = self
                .broker
                .send(destination, &message)
                .instrument(span.clone())
                .await;

            match result {
                Ok(position) => {
                    span.in_scope(|| {
                        tracing::info!(
                            partition = position.partition,
                            offset = position.offset,
                            "Message delivered"
                        );
                    });
                    return Ok(DeliveryReceipt {
                        position,
                        attempts: attempt,
                    });
                }
                Err(error) if error.is_transient() && attempt < max_attempts => {
                    let delay = self.policy.delay_after(attempt);
                    span.in_scope(|| {
                        tracing::warn!(
                            error = %error,
                            retry_in_ms = delay.as_millis() as u64,
                            "Delivery attempt failed, retrying"
                        );
                    });
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => {
                    span.in_scope(|| log_final_failure(&error, attempt));
                    return Err(DeliveryError {
                        destination: destination.to_string(),
                        attempts: attempt,
                        source: error,
                    });
                }
            }
        }
    }
}

fn log_final_failure(error: &BrokerError, attempts: u32) {
    if error.is_transient() {
        tracing::warn!(error = %error, attempts, "Delivery retries exhausted");
    } else {
        tracing::warn!(error = %error, attempts, "Delivery failed with non-retryable error");
    }
}
