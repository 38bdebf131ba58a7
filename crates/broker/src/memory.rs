//! In-process broker used by tests and local runs.
//!
//! Keeps a partitioned log per destination, supports scripted send
//! failures, and hands out subscriptions that redeliver anything left
//! unacknowledged, up to a delivery cap after which the message is moved to
//! the broker's dead letters.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::{
    AckHandle, BrokerError, Delivery, DeliveryPosition, IncomingMessage, MessageBroker,
    MessageConsumer, OutboxMessage,
};

/// Deliveries of one message a subscription makes before dead-lettering it.
pub const DEFAULT_MAX_DELIVERIES: u32 = 5;

enum FailureRule {
    Next { remaining: usize, error: BrokerError },
    Always(BrokerError),
}

struct Subscriber {
    suffix: String,
    queue: Mutex<VecDeque<IncomingMessage>>,
    notify: Notify,
}

impl Subscriber {
    fn push(&self, message: IncomingMessage) {
        lock(&self.queue).push_back(message);
        self.notify.notify_one();
    }
}

struct BrokerState {
    partitions: u32,
    logs: BTreeMap<String, Vec<Vec<IncomingMessage>>>,
    failures: HashMap<String, FailureRule>,
    attempts: HashMap<String, usize>,
    subscribers: Vec<Arc<Subscriber>>,
    dead_letters: Vec<IncomingMessage>,
}

struct Shared {
    state: Mutex<BrokerState>,
    closed: AtomicBool,
    acks: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory [`MessageBroker`] with a partitioned log per destination.
#[derive(Clone)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    /// Creates a broker with a single partition per destination.
    pub fn new() -> Self {
        Self::with_partitions(1)
    }

    /// Creates a broker with `partitions` partitions per destination.
    pub fn with_partitions(partitions: u32) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BrokerState {
                    partitions: partitions.max(1),
                    logs: BTreeMap::new(),
                    failures: HashMap::new(),
                    attempts: HashMap::new(),
                    subscribers: Vec::new(),
                    dead_letters: Vec::new(),
                }),
                closed: AtomicBool::new(false),
                acks: AtomicUsize::new(0),
            }),
        }
    }

    /// Makes the next `count` sends to `destination` fail with `error`.
    pub fn fail_next(&self, destination: &str, count: usize, error: BrokerError) {
        lock(&self.shared.state).failures.insert(
            destination.to_string(),
            FailureRule::Next {
                remaining: count,
                error,
            },
        );
    }

    /// Makes every send to `destination` fail with `error`.
    pub fn fail_always(&self, destination: &str, error: BrokerError) {
        lock(&self.shared.state)
            .failures
            .insert(destination.to_string(), FailureRule::Always(error));
    }

    pub fn clear_failures(&self) {
        lock(&self.shared.state).failures.clear();
    }

    /// Number of send attempts made to `destination`, including failed ones.
    pub fn send_attempts(&self, destination: &str) -> usize {
        lock(&self.shared.state)
            .attempts
            .get(destination)
            .copied()
            .unwrap_or(0)
    }

    /// Records stored on `destination`, ordered by partition then offset.
    pub fn records(&self, destination: &str) -> Vec<IncomingMessage> {
        lock(&self.shared.state)
            .logs
            .get(destination)
            .map(|partitions| partitions.iter().flatten().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of acknowledgments received across all subscriptions.
    pub fn acknowledged_count(&self) -> usize {
        self.shared.acks.load(Ordering::SeqCst)
    }

    /// Messages dropped by subscriptions after reaching their delivery cap.
    pub fn dead_letters(&self) -> Vec<IncomingMessage> {
        lock(&self.shared.state).dead_letters.clone()
    }

    /// Shuts the broker down. Sends fail with [`BrokerError::Closed`] and
    /// subscriptions end once drained.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        for subscriber in &lock(&self.shared.state).subscribers {
            subscriber.notify.notify_one();
        }
    }

    /// Subscribes to every destination whose name ends with `suffix`.
    ///
    /// Records already on matching destinations are replayed first.
    pub fn subscribe_suffix(&self, suffix: impl Into<String>) -> InMemorySubscription {
        let subscriber = Arc::new(Subscriber {
            suffix: suffix.into(),
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        });

        let mut state = lock(&self.shared.state);
        for (destination, partitions) in &state.logs {
            if destination.ends_with(&subscriber.suffix) {
                for record in partitions.iter().flatten() {
                    subscriber.push(record.clone());
                }
            }
        }
        state.subscribers.push(Arc::clone(&subscriber));

        InMemorySubscription {
            broker: Arc::clone(&self.shared),
            subscriber,
            in_flight: None,
            max_deliveries: DEFAULT_MAX_DELIVERIES,
        }
    }

    fn partition_for(key: &str, partitions: u32) -> u32 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % u64::from(partitions)) as u32
    }
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    async fn send(
        &self,
        destination: &str,
        message: &OutboxMessage,
    ) -> Result<DeliveryPosition, BrokerError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }

        let mut state = lock(&self.shared.state);
        *state.attempts.entry(destination.to_string()).or_default() += 1;

        match state.failures.get_mut(destination) {
            Some(FailureRule::Always(error)) => return Err(error.clone()),
            Some(FailureRule::Next { remaining, error }) if *remaining > 0 => {
                *remaining -= 1;
                return Err(error.clone());
            }
            _ => {}
        }

        let partition_count = state.partitions;
        let partition = Self::partition_for(&message.key, partition_count);
        let partitions = state
            .logs
            .entry(destination.to_string())
            .or_insert_with(|| vec![Vec::new(); partition_count as usize]);
        let log = &mut partitions[partition as usize];
        let position = DeliveryPosition {
            partition,
            offset: log.len() as u64,
        };

        let record = IncomingMessage {
            channel: destination.to_string(),
            key: Some(message.key.clone()),
            value: message.value.clone(),
            headers: message.headers.clone(),
            position,
            delivery_count: 1,
        };
        log.push(record.clone());

        for subscriber in &state.subscribers {
            if destination.ends_with(&subscriber.suffix) {
                subscriber.push(record.clone());
            }
        }

        Ok(position)
    }
}

/// Subscription handed out by [`InMemoryBroker::subscribe_suffix`].
///
/// A delivery that has not been acknowledged by the time the next one is
/// requested goes back to the front of the queue, unless it has already been
/// delivered `max_deliveries` times; then it is dead-lettered.
pub struct InMemorySubscription {
    broker: Arc<Shared>,
    subscriber: Arc<Subscriber>,
    in_flight: Option<(IncomingMessage, Arc<AtomicBool>)>,
    max_deliveries: u32,
}

impl InMemorySubscription {
    /// Sets how many times one message is delivered before it is
    /// dead-lettered. At least one delivery is always made.
    pub fn with_max_deliveries(mut self, max_deliveries: u32) -> Self {
        self.max_deliveries = max_deliveries.max(1);
        self
    }

    /// Number of messages waiting to be delivered.
    pub fn backlog(&self) -> usize {
        lock(&self.subscriber.queue).len()
    }

    fn requeue_unacked(&mut self) {
        let Some((mut message, acked)) = self.in_flight.take() else {
            return;
        };
        if acked.load(Ordering::SeqCst) {
            return;
        }

        if message.delivery_count >= self.max_deliveries {
            tracing::warn!(
                channel = %message.channel,
                partition = message.position.partition,
                offset = message.position.offset,
                delivery_count = message.delivery_count,
                "Dead-lettering unacknowledged message"
            );
            lock(&self.broker.state).dead_letters.push(message);
            return;
        }

        message.delivery_count += 1;
        lock(&self.subscriber.queue).push_front(message);
    }
}

#[async_trait]
impl MessageConsumer for InMemorySubscription {
    async fn next_delivery(&mut self) -> Option<Delivery> {
        self.requeue_unacked();

        loop {
            let next = lock(&self.subscriber.queue).pop_front();
            if let Some(message) = next {
                let acked = Arc::new(AtomicBool::new(false));
                self.in_flight = Some((message.clone(), Arc::clone(&acked)));
                return Some(Delivery {
                    message,
                    ack: Box::new(InMemoryAck {
                        acked,
                        broker: Arc::clone(&self.broker),
                    }),
                });
            }

            if self.broker.closed.load(Ordering::SeqCst) {
                return None;
            }

            self.subscriber.notify.notified().await;
        }
    }
}

struct InMemoryAck {
    acked: Arc<AtomicBool>,
    broker: Arc<Shared>,
}

#[async_trait]
impl AckHandle for InMemoryAck {
    async fn acknowledge(&self) -> Result<(), BrokerError> {
        if !self.acked.swap(true, Ordering::SeqCst) {
            self.broker.acks.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(key: &str, value: &str) -> OutboxMessage {
        OutboxMessage::new(key, value)
    }

    #[tokio::test]
    async fn offsets_grow_per_partition() {
        let broker = InMemoryBroker::new();

        let first = broker.send("orders", &message("a", "1")).await.unwrap();
        let second = broker.send("orders", &message("b", "2")).await.unwrap();

        assert_eq!(first, DeliveryPosition { partition: 0, offset: 0 });
        assert_eq!(second, DeliveryPosition { partition: 0, offset: 1 });
        assert_eq!(broker.records("orders").len(), 2);
        assert_eq!(broker.send_attempts("orders"), 2);
    }

    #[tokio::test]
    async fn same_key_lands_on_same_partition_in_order() {
        let broker = InMemoryBroker::with_partitions(8);

        let mut positions = Vec::new();
        for i in 0..5 {
            positions.push(
                broker
                    .send("orders", &message("order-42", &i.to_string()))
                    .await
                    .unwrap(),
            );
        }

        let partition = positions[0].partition;
        assert!(positions.iter().all(|p| p.partition == partition));
        let offsets: Vec<_> = positions.iter().map(|p| p.offset).collect();
        assert_eq!(offsets, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn scripted_failures_run_out() {
        let broker = InMemoryBroker::new();
        broker.fail_next("orders", 2, BrokerError::Unavailable("down".into()));

        assert!(broker.send("orders", &message("k", "v")).await.is_err());
        assert!(broker.send("orders", &message("k", "v")).await.is_err());
        assert!(broker.send("orders", &message("k", "v")).await.is_ok());
        assert_eq!(broker.send_attempts("orders"), 3);
        assert_eq!(broker.records("orders").len(), 1);
    }

    #[tokio::test]
    async fn fail_always_until_cleared() {
        let broker = InMemoryBroker::new();
        broker.fail_always("orders", BrokerError::Rejected("nope".into()));

        for _ in 0..3 {
            assert_eq!(
                broker.send("orders", &message("k", "v")).await,
                Err(BrokerError::Rejected("nope".into()))
            );
        }

        broker.clear_failures();
        assert!(broker.send("orders", &message("k", "v")).await.is_ok());
    }

    #[tokio::test]
    async fn closed_broker_rejects_sends() {
        let broker = InMemoryBroker::new();
        broker.close();

        assert_eq!(
            broker.send("orders", &message("k", "v")).await,
            Err(BrokerError::Closed)
        );
    }

    #[tokio::test]
    async fn subscription_replays_then_follows() {
        let broker = InMemoryBroker::new();
        broker.send("orders.outbox", &message("k", "old")).await.unwrap();
        broker.send("orders", &message("k", "ignored")).await.unwrap();

        let mut sub = broker.subscribe_suffix(".outbox");
        broker.send("payments.outbox", &message("k", "new")).await.unwrap();

        let first = sub.next_delivery().await.unwrap();
        assert_eq!(first.message.value, "old");
        first.ack.acknowledge().await.unwrap();

        let second = sub.next_delivery().await.unwrap();
        assert_eq!(second.message.value, "new");
        assert_eq!(second.message.channel, "payments.outbox");
        second.ack.acknowledge().await.unwrap();

        assert_eq!(sub.backlog(), 0);
        assert_eq!(broker.acknowledged_count(), 2);
    }

    #[tokio::test]
    async fn unacked_delivery_is_redelivered() {
        let broker = InMemoryBroker::new();
        let mut sub = broker.subscribe_suffix(".outbox");
        broker.send("orders.outbox", &message("k", "v")).await.unwrap();

        let first = sub.next_delivery().await.unwrap();
        assert_eq!(first.message.delivery_count, 1);
        drop(first);

        let again = sub.next_delivery().await.unwrap();
        assert_eq!(again.message.value, "v");
        assert_eq!(again.message.delivery_count, 2);
        again.ack.acknowledge().await.unwrap();
        // Double ack counts once
        again.ack.acknowledge().await.unwrap();

        assert_eq!(broker.acknowledged_count(), 1);
    }

    #[tokio::test]
    async fn message_is_dead_lettered_after_max_deliveries() {
        let broker = InMemoryBroker::new();
        let mut sub = broker.subscribe_suffix(".outbox").with_max_deliveries(3);
        broker.send("orders.outbox", &message("k", "poison")).await.unwrap();
        broker.send("orders.outbox", &message("k", "next")).await.unwrap();
        broker.close();

        for expected in 1..=3 {
            let delivery = sub.next_delivery().await.unwrap();
            assert_eq!(delivery.message.value, "poison");
            assert_eq!(delivery.message.delivery_count, expected);
        }

        let next = sub.next_delivery().await.unwrap();
        assert_eq!(next.message.value, "next");
        next.ack.acknowledge().await.unwrap();
        assert!(sub.next_delivery().await.is_none());

        let dead = broker.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].value, "poison");
        assert_eq!(broker.acknowledged_count(), 1);
    }

    #[tokio::test]
    async fn subscription_ends_after_close_and_drain() {
        let broker = InMemoryBroker::new();
        let mut sub = broker.subscribe_suffix(".outbox");
        broker.send("orders.outbox", &message("k", "v")).await.unwrap();
        broker.close();

        let delivery = sub.next_delivery().await.unwrap();
        delivery.ack.acknowledge().await.unwrap();
        assert!(sub.next_delivery().await.is_none());
    }

    #[tokio::test]
    async fn waiting_subscription_wakes_on_send() {
        let broker = InMemoryBroker::new();
        let mut sub = broker.subscribe_suffix(".outbox");

        let receiver = tokio::spawn(async move { sub.next_delivery().await.map(|d| d.message) });
        tokio::task::yield_now().await;
        broker.send("orders.outbox", &message("k", "late")).await.unwrap();

        let received = receiver.await.unwrap().unwrap();
        assert_eq!(received.value, "late");
    }
}
