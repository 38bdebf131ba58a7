use thiserror::Error;

/// Errors reported by a message broker for a single operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    /// The broker could not be reached.
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    /// The broker did not confirm the write in time.
    #[error("Broker timed out: {0}")]
    Timeout(String),

    /// The broker refused the message (e.g., too large, not authorized).
    #[error("Message rejected by broker: {0}")]
    Rejected(String),

    /// The destination does not exist on the broker.
    #[error("Unknown destination: {0}")]
    UnknownDestination(String),

    /// The broker client has been shut down.
    #[error("Broker client closed")]
    Closed,
}

impl BrokerError {
    /// Returns true if retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, BrokerError::Unavailable(_) | BrokerError::Timeout(_))
    }
}

/// A message could not be delivered within the retry budget.
#[derive(Debug, Clone, Error)]
#[error("Delivery to '{destination}' failed after {attempts} attempt(s): {source}")]
pub struct DeliveryError {
    /// The destination the message was addressed to.
    pub destination: String,

    /// Number of attempts made.
    pub attempts: u32,

    /// The failure reported by the last attempt.
    #[source]
    pub source: BrokerError,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(BrokerError::Unavailable("down".into()).is_transient());
        assert!(BrokerError::Timeout("slow".into()).is_transient());
        assert!(!BrokerError::Rejected("too big".into()).is_transient());
        assert!(!BrokerError::UnknownDestination("x".into()).is_transient());
        assert!(!BrokerError::Closed.is_transient());
    }

    #[test]
    fn delivery_error_mentions_destination_and_attempts() {
        let err = DeliveryError {
            destination: "orders".into(),
            attempts: 3,
            source: BrokerError::Unavailable("connection refused".into()),
        };
        let text = err.to_string();
        assert!(text.contains("'orders'"));
        assert!(text.contains("3 attempt(s)"));
        assert!(text.contains("connection refused"));
    }
}
