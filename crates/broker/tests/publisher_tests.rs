use std::sync::Arc;
use std::time::Duration;

use broker::{
    BrokerError, InMemoryBroker, OutboxMessage, RetryPolicy, RetryingPublisher,
};
use common::{CorrelationContext, TRACEPARENT_HEADER};
use tokio::time::Instant;

fn publisher(broker: &InMemoryBroker, policy: RetryPolicy) -> RetryingPublisher<InMemoryBroker> {
    RetryingPublisher::new(Arc::new(broker.clone()), policy)
}

#[tokio::test(start_paused = true)]
async fn succeeds_on_third_attempt_after_two_transient_failures() {
    let broker = InMemoryBroker::new();
    broker.fail_next("orders", 2, BrokerError::Unavailable("leader election".into()));
    let publisher = publisher(&broker, RetryPolicy::default());

    let started = Instant::now();
    let receipt = publisher
        .publish("orders", "42", r#"{"orderId":42}"#, &CorrelationContext::new_root())
        .await
        .unwrap();

    assert_eq!(receipt.attempts, 3);
    assert_eq!(broker.send_attempts("orders"), 3);
    assert_eq!(broker.records("orders").len(), 1);
    // Two fixed 5s pauses between three attempts
    assert!(started.elapsed() >= Duration::from_secs(10));
}

#[tokio::test(start_paused = true)]
async fn gives_up_after_max_attempts() {
    let broker = InMemoryBroker::new();
    broker.fail_always("orders", BrokerError::Timeout("no ack".into()));
    let publisher = publisher(&broker, RetryPolicy::fixed(3, Duration::from_secs(5)));

    let err = publisher
        .publish("orders", "42", "{}", &CorrelationContext::new_root())
        .await
        .unwrap_err();

    assert_eq!(err.attempts, 3);
    assert_eq!(err.destination, "orders");
    assert_eq!(err.source, BrokerError::Timeout("no ack".into()));
    assert_eq!(broker.send_attempts("orders"), 3);
    assert!(broker.records("orders").is_empty());
}

#[tokio::test(start_paused = true)]
async fn permanent_error_is_not_retried() {
    let broker = InMemoryBroker::new();
    broker.fail_always("orders", BrokerError::Rejected("message too large".into()));
    let publisher = publisher(&broker, RetryPolicy::default());

    let started = Instant::now();
    let err = publisher
        .publish("orders", "42", "{}", &CorrelationContext::new_root())
        .await
        .unwrap_err();

    assert_eq!(err.attempts, 1);
    assert_eq!(broker.send_attempts("orders"), 1);
    assert_eq!(started.elapsed(), Duration::ZERO);
}

#[tokio::test(start_paused = true)]
async fn no_retry_policy_makes_one_attempt() {
    let broker = InMemoryBroker::new();
    broker.fail_next("orders", 1, BrokerError::Unavailable("down".into()));
    let publisher = publisher(&broker, RetryPolicy::None);

    let err = publisher
        .publish("orders", "42", "{}", &CorrelationContext::new_root())
        .await
        .unwrap_err();

    assert_eq!(err.attempts, 1);
    assert_eq!(broker.send_attempts("orders"), 1);
}

#[tokio::test(start_paused = true)]
async fn exponential_backoff_waits_longer_each_time() {
    let broker = InMemoryBroker::new();
    broker.fail_next("orders", 3, BrokerError::Unavailable("down".into()));
    let policy = RetryPolicy::exponential(4, Duration::from_millis(100), Duration::from_secs(10));
    let publisher = publisher(&broker, policy);

    let started = Instant::now();
    let receipt = publisher
        .publish("orders", "42", "{}", &CorrelationContext::new_root())
        .await
        .unwrap();

    assert_eq!(receipt.attempts, 4);
    // 100ms + 200ms + 400ms
    assert!(started.elapsed() >= Duration::from_millis(700));
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn traceparent_belongs_to_the_callers_trace() {
    let broker = InMemoryBroker::new();
    let publisher = publisher(&broker, RetryPolicy::default());
    let correlation = CorrelationContext::new_root();

    publisher
        .publish_message(
            "orders",
            OutboxMessage::new("42", "{}").with_header("outbox-event-type", "order-created"),
            &correlation,
        )
        .await
        .unwrap();

    let record = &broker.records("orders")[0];
    let traceparent = record.header(TRACEPARENT_HEADER).unwrap();
    let propagated = CorrelationContext::from_traceparent(traceparent).unwrap();

    assert_eq!(propagated.trace_id, correlation.trace_id);
    assert_ne!(propagated.span_id, correlation.span_id);
    assert_eq!(record.header("outbox-event-type"), Some("order-created"));
    assert_eq!(record.key.as_deref(), Some("42"));
}

#[tokio::test]
async fn same_key_keeps_order_across_publishes() {
    let broker = InMemoryBroker::with_partitions(4);
    let publisher = publisher(&broker, RetryPolicy::default());
    let correlation = CorrelationContext::new_root();

    let mut receipts = Vec::new();
    for i in 0..3 {
        receipts.push(
            publisher
                .publish("orders", "customer-7", &i.to_string(), &correlation)
                .await
                .unwrap(),
        );
    }

    assert!(receipts
        .windows(2)
        .all(|w| w[0].position.partition == w[1].position.partition
            && w[0].position.offset < w[1].position.offset));
}
