//! In-memory event bus for tests.
//!
//! Messages are kept in one append-only log. Each topic gets its own offsets, and a
//! subscription replays every unacknowledged message of its topics in publish order
//! before waiting for new ones, which mimics a consumer group whose committed
//! position is the acknowledged set.

use eventing_core::event::EventEnvelope;
use eventing_core::event_bus::{
    AckFuture, Acknowledge, Delivery, EventBus, EventBusError, MessageStream,
};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;

/// A message as the producer handed it to the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    /// Topic
    pub topic: String,
    /// Partition key
    pub key: String,
    /// Raw bytes
    pub payload: Vec<u8>,
    /// Offset within the topic
    pub offset: i64,
}

impl PublishedMessage {
    /// Decode the payload as an envelope.
    ///
    /// # Errors
    ///
    /// Returns the decode error if the bytes are not an envelope.
    pub fn envelope(&self) -> Result<EventEnvelope, eventing_core::event::EventError> {
        EventEnvelope::from_bytes(&self.payload)
    }
}

#[derive(Default)]
struct BusState {
    log: Vec<PublishedMessage>,
    next_offset: HashMap<String, i64>,
    acked: HashSet<(String, i64)>,
    fail_publishes: usize,
    fail_subscribes: usize,
}

#[derive(Default)]
struct Shared {
    state: Mutex<BusState>,
    published: Notify,
    acked: Notify,
}

impl Shared {
    fn lock(&self) -> std::sync::MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// In-memory [`EventBus`].
///
/// Clones share the same log.
///
/// # Example
///
/// ```
/// use eventing_core::event_bus::EventBus;
/// use eventing_testing::event_bus::InMemoryEventBus;
///
/// # tokio_test::block_on(async {
/// let bus = InMemoryEventBus::new();
/// bus.publish("customer-events", "cust-1", b"{}").await.unwrap();
/// assert_eq!(bus.published().len(), 1);
/// # });
/// ```
#[derive(Clone, Default)]
pub struct InMemoryEventBus {
    shared: Arc<Shared>,
}

impl InMemoryEventBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` publishes fail as if the broker were unreachable.
    pub fn fail_next_publishes(&self, count: usize) {
        self.shared.lock().fail_publishes = count;
    }

    /// Make the next `count` subscribe calls fail.
    pub fn fail_next_subscribes(&self, count: usize) {
        self.shared.lock().fail_subscribes = count;
    }

    /// Encode and publish an envelope, keyed by its resource id.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::PublishFailed`] when a failure was injected or the
    /// envelope cannot be encoded.
    pub async fn publish_envelope(&self, envelope: &EventEnvelope) -> Result<(), EventBusError> {
        let bytes = envelope
            .to_bytes()
            .map_err(|err| EventBusError::PublishFailed {
                topic: envelope.topic.clone(),
                reason: err.to_string(),
            })?;
        self.publish(&envelope.topic, &envelope.resource_id, &bytes)
            .await
    }

    /// Every message accepted so far, in publish order.
    #[must_use]
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.shared.lock().log.clone()
    }

    /// Messages accepted on `topic`, in offset order.
    #[must_use]
    pub fn published_on(&self, topic: &str) -> Vec<PublishedMessage> {
        self.shared
            .lock()
            .log
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    /// Number of acknowledged messages.
    #[must_use]
    pub fn acked_count(&self) -> usize {
        self.shared.lock().acked.len()
    }

    /// Whether the message at `topic`/`offset` was acknowledged.
    #[must_use]
    pub fn is_acked(&self, topic: &str, offset: i64) -> bool {
        self.shared.lock().acked.contains(&(topic.to_string(), offset))
    }

    /// Messages published but not yet acknowledged.
    #[must_use]
    pub fn unacked(&self) -> Vec<PublishedMessage> {
        let state = self.shared.lock();
        state
            .log
            .iter()
            .filter(|m| !state.acked.contains(&(m.topic.clone(), m.offset)))
            .cloned()
            .collect()
    }

    /// Wait until at least `count` messages are acknowledged.
    ///
    /// Returns `false` if `timeout` elapsed first.
    pub async fn wait_for_acks(&self, count: usize, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.shared.acked.notified();
                if self.acked_count() >= count {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }
}

struct MemoryAck {
    shared: Arc<Shared>,
    topic: String,
    offset: i64,
}

impl Acknowledge for MemoryAck {
    fn ack(self: Box<Self>) -> AckFuture {
        Box::pin(async move {
            self.shared.lock().acked.insert((self.topic, self.offset));
            self.shared.acked.notify_waiters();
            Ok(())
        })
    }
}

impl EventBus for InMemoryEventBus {
    fn publish(
        &self,
        topic: &str,
        key: &str,
        payload: &[u8],
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>> {
        let topic = topic.to_string();
        let key = key.to_string();
        let payload = payload.to_vec();

        Box::pin(async move {
            {
                let mut state = self.shared.lock();
                if state.fail_publishes > 0 {
                    state.fail_publishes -= 1;
                    return Err(EventBusError::PublishFailed {
                        topic,
                        reason: "broker unavailable (injected)".to_string(),
                    });
                }

                let next = state.next_offset.entry(topic.clone()).or_insert(0);
                let offset = *next;
                *next += 1;
                state.log.push(PublishedMessage {
                    topic,
                    key,
                    payload,
                    offset,
                });
            }
            self.shared.published.notify_waiters();
            Ok(())
        })
    }

    fn subscribe(
        &self,
        topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<MessageStream, EventBusError>> + Send + '_>> {
        let topics: HashSet<String> = topics.iter().map(|t| (*t).to_string()).collect();

        Box::pin(async move {
            {
                let mut state = self.shared.lock();
                if state.fail_subscribes > 0 {
                    state.fail_subscribes -= 1;
                    return Err(EventBusError::SubscriptionFailed {
                        topics: topics.into_iter().collect(),
                        reason: "broker unavailable (injected)".to_string(),
                    });
                }
            }

            let shared = Arc::clone(&self.shared);
            let stream = async_stream::stream! {
                let mut cursor = 0;
                while !topics.is_empty() {
                    let notified = shared.published.notified();
                    let batch: Vec<PublishedMessage> = {
                        let state = shared.lock();
                        let batch = state.log[cursor..]
                            .iter()
                            .filter(|m| topics.contains(&m.topic))
                            .filter(|m| !state.acked.contains(&(m.topic.clone(), m.offset)))
                            .cloned()
                            .collect();
                        cursor = state.log.len();
                        batch
                    };

                    if batch.is_empty() {
                        notified.await;
                        continue;
                    }

                    for message in batch {
                        let ack = MemoryAck {
                            shared: Arc::clone(&shared),
                            topic: message.topic.clone(),
                            offset: message.offset,
                        };
                        yield Ok(Delivery::new(
                            message.topic,
                            Some(message.key),
                            message.payload,
                            0,
                            message.offset,
                            Box::new(ack),
                        ));
                    }
                }
            };

            Ok(Box::pin(stream) as MessageStream)
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can use unwrap
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn offsets_are_per_topic() {
        let bus = InMemoryEventBus::new();
        bus.publish("a", "k", b"1").await.unwrap();
        bus.publish("b", "k", b"2").await.unwrap();
        bus.publish("a", "k", b"3").await.unwrap();

        let offsets: Vec<_> = bus.published_on("a").iter().map(|m| m.offset).collect();
        assert_eq!(offsets, vec![0, 1]);
        assert_eq!(bus.published_on("b")[0].offset, 0);
    }

    #[tokio::test]
    async fn injected_failures_surface_as_errors() {
        let bus = InMemoryEventBus::new();
        bus.fail_next_publishes(1);

        assert!(matches!(
            bus.publish("a", "k", b"1").await,
            Err(EventBusError::PublishFailed { .. })
        ));
        bus.publish("a", "k", b"1").await.unwrap();
        assert_eq!(bus.published().len(), 1);
    }

    #[tokio::test]
    async fn subscription_replays_only_unacked_messages() {
        let bus = InMemoryEventBus::new();
        bus.publish("a", "k", b"1").await.unwrap();
        bus.publish("a", "k", b"2").await.unwrap();

        let mut stream = bus.subscribe(&["a"]).await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.payload, b"1".to_vec());
        first.ack().await.unwrap();
        drop(stream);

        let mut stream = bus.subscribe(&["a"]).await.unwrap();
        let redelivered = stream.next().await.unwrap().unwrap();
        assert_eq!(redelivered.payload, b"2".to_vec());
        assert_eq!(redelivered.offset, 1);
        assert!(bus.is_acked("a", 0));
        assert!(!bus.is_acked("a", 1));
    }

    #[tokio::test]
    async fn subscription_sees_later_publishes() {
        let bus = InMemoryEventBus::new();
        let mut stream = bus.subscribe(&["a"]).await.unwrap();

        let publisher = bus.clone();
        tokio::spawn(async move {
            publisher.publish("b", "k", b"other").await.unwrap();
            publisher.publish("a", "k", b"mine").await.unwrap();
        });

        let delivery = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(delivery.topic, "a");
        assert_eq!(delivery.payload, b"mine".to_vec());
    }

    #[tokio::test]
    async fn subscription_without_topics_ends() {
        let bus = InMemoryEventBus::new();
        bus.publish("a", "k", b"1").await.unwrap();

        let mut stream = bus.subscribe(&[]).await.unwrap();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn wait_for_acks_times_out() {
        let bus = InMemoryEventBus::new();
        assert!(!bus.wait_for_acks(1, Duration::from_millis(20)).await);
        assert!(bus.wait_for_acks(0, Duration::from_millis(20)).await);
    }
}
