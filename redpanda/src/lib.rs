//! Redpanda event bus for the event core.
//!
//! This crate provides a Kafka-protocol implementation of the [`EventBus`] trait
//! from `eventing-core`, built on rdkafka. It works against Redpanda, Apache Kafka
//! or any other Kafka-compatible broker.
//!
//! # Architecture
//!
//! ```text
//!   outbox relay                              dispatcher workers
//!        │ publish(topic, resource_id, bytes)        ▲      │ ack
//!        ▼                                            │      ▼
//! ┌──────────────┐     ┌──────────┐     ┌─────────────────────────┐
//! │ FutureProducer│──▶ │ Redpanda │ ──▶ │ consumer task            │
//! └──────────────┘     └──────────┘     │  StreamConsumer          │
//!                                       │  OffsetTracker ─▶ commit │
//!                                       └─────────────────────────┘
//! ```
//!
//! # Delivery Semantics
//!
//! **At-least-once delivery** with manual offset commits:
//! - Auto-commit is disabled; offsets are committed only after the dispatcher
//!   acknowledges the delivery
//! - Acks from parallel workers arrive out of order, so the commit position of a
//!   partition only moves past the contiguous acknowledged prefix (see
//!   [`offsets::OffsetTracker`])
//! - A message that is never acknowledged is redelivered after a restart or rebalance
//! - Ordering is guaranteed within a partition; publishers key by resource id
//!
//! **Configuration options**:
//! - `consumer_group`: Explicit consumer group for load balancing
//! - `buffer_size`: Delivery buffer (default: 1000) for handling bursts
//! - `auto_offset_reset`: Where to start reading (default: "latest")
//!
//! # Example
//!
//! ```no_run
//! use eventing_redpanda::RedpandaEventBus;
//! use eventing_core::event_bus::EventBus;
//! use futures::StreamExt;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let event_bus = RedpandaEventBus::new("localhost:9092")?;
//!
//! event_bus.publish("customer-events", "cust-123", br#"{"id":"..."}"#).await?;
//!
//! let mut stream = event_bus.subscribe(&["customer-events"]).await?;
//! while let Some(result) = stream.next().await {
//!     let delivery = result?;
//!     println!("Received {} bytes", delivery.payload.len());
//!     delivery.ack().await?;
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Commit-position tracking
pub mod offsets;

use eventing_core::event_bus::{
    AckFuture, Acknowledge, Delivery, EventBus, EventBusError, MessageStream,
};
use futures::StreamExt;
use offsets::OffsetTracker;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaResult;
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::topic_partition_list::{Offset, TopicPartitionList};
use rdkafka::util::Timeout;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::mpsc;

/// Redpanda event bus implementation.
///
/// This implementation uses rdkafka (Kafka-compatible client) to provide
/// production-ready event streaming with:
///
/// - **At-least-once delivery**: Messages may be delivered multiple times
/// - **Ordering within partition**: Messages sharing a key keep their order
/// - **Consumer groups**: Multiple instances of a service share the workload
///
/// # Configuration
///
/// - **Broker addresses**: Bootstrap servers (required)
/// - **Producer settings**: Acks, compression, timeout
/// - **Consumer group**: Explicit ID or derived from the topics
/// - **Buffer size**: Delivery buffer capacity (default: 1000)
/// - **Offset reset**: Where new groups start reading (default: "latest")
///
/// # Example
///
/// ```no_run
/// use eventing_redpanda::RedpandaEventBus;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// // Basic configuration
/// let event_bus = RedpandaEventBus::new("localhost:9092")?;
///
/// // Custom configuration
/// let event_bus = RedpandaEventBus::builder()
///     .brokers("localhost:9092,localhost:9093")
///     .producer_acks("all")  // Wait for all replicas
///     .compression("lz4")
///     .consumer_group("customer-service")
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct RedpandaEventBus {
    /// Kafka producer for publishing messages
    producer: FutureProducer,
    /// Broker addresses (for creating consumers)
    brokers: String,
    /// Producer timeout
    timeout: Duration,
    /// Consumer group ID (if explicitly set)
    consumer_group: Option<String>,
    /// Delivery buffer size for subscribers
    buffer_size: usize,
    /// Auto offset reset policy
    auto_offset_reset: String,
}

impl RedpandaEventBus {
    /// Create a new Redpanda event bus with default configuration.
    ///
    /// # Parameters
    ///
    /// - `brokers`: Comma-separated list of broker addresses (e.g., "localhost:9092")
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::ConnectionFailed`] if the producer cannot be created.
    pub fn new(brokers: &str) -> Result<Self, EventBusError> {
        Self::builder().brokers(brokers).build()
    }

    /// Create a new builder for configuring the event bus.
    #[must_use]
    pub fn builder() -> RedpandaEventBusBuilder {
        RedpandaEventBusBuilder::default()
    }

    /// Get a reference to the brokers string.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }

    /// Consumer group used for `topics`: the configured one, or one derived from
    /// the sorted topic names.
    #[must_use]
    pub fn consumer_group_for(&self, topics: &[String]) -> String {
        self.consumer_group.clone().unwrap_or_else(|| {
            let mut sorted = topics.to_vec();
            sorted.sort();
            format!("eventing-{}", sorted.join("-"))
        })
    }
}

/// Builder for configuring a [`RedpandaEventBus`].
///
/// Provides a fluent API for setting producer and consumer configuration.
#[derive(Default)]
pub struct RedpandaEventBusBuilder {
    brokers: Option<String>,
    producer_acks: Option<String>,
    compression: Option<String>,
    timeout: Option<Duration>,
    consumer_group: Option<String>,
    buffer_size: Option<usize>,
    auto_offset_reset: Option<String>,
}

impl RedpandaEventBusBuilder {
    /// Set the broker addresses.
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Set the producer acknowledgment mode.
    ///
    /// - `acks`: "0" (no acks), "1" (leader ack), "all" (all replicas ack)
    ///
    /// Default: "all"
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// Set the compression codec: "none", "gzip", "snappy", "lz4", "zstd".
    ///
    /// Default: "none"
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// Set the producer send timeout.
    ///
    /// Default: 5 seconds
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the consumer group ID for subscriptions.
    ///
    /// If not set, the consumer group is derived from the subscribed topics.
    /// Instances sharing a group split the partitions between them.
    #[must_use]
    pub fn consumer_group(mut self, consumer_group: impl Into<String>) -> Self {
        self.consumer_group = Some(consumer_group.into());
        self
    }

    /// Set how many deliveries may be buffered between the consumer and the
    /// subscriber. Values below 1 are raised to 1.
    ///
    /// Default: 1000
    #[must_use]
    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = Some(buffer_size.max(1));
        self
    }

    /// Set the auto offset reset policy for new consumer groups.
    ///
    /// - `"earliest"`: Start from the beginning of the topic
    /// - `"latest"`: Start from the end (only new messages)
    /// - `"error"`: Fail if no offset exists
    ///
    /// Default: "latest"
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Build the [`RedpandaEventBus`].
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::ConnectionFailed`] if:
    /// - Brokers not set
    /// - Cannot create producer
    /// - Invalid configuration
    pub fn build(self) -> Result<RedpandaEventBus, EventBusError> {
        let brokers = self.brokers.ok_or_else(|| {
            EventBusError::ConnectionFailed("Brokers not configured".to_string())
        })?;
        let acks = self.producer_acks.as_deref().unwrap_or("all");
        let compression = self.compression.as_deref().unwrap_or("none");
        let timeout = self.timeout.unwrap_or(Duration::from_secs(5));

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", timeout.as_millis().to_string())
            .set("acks", acks)
            .set("enable.idempotence", if acks == "all" { "true" } else { "false" })
            .set("compression.type", compression)
            .create()
            .map_err(|e| {
                EventBusError::ConnectionFailed(format!("Failed to create producer: {e}"))
            })?;

        tracing::info!(
            brokers = %brokers,
            acks,
            compression,
            buffer_size = self.buffer_size.unwrap_or(1000),
            auto_offset_reset = self.auto_offset_reset.as_deref().unwrap_or("latest"),
            "RedpandaEventBus created"
        );

        Ok(RedpandaEventBus {
            producer,
            brokers,
            timeout,
            consumer_group: self.consumer_group,
            buffer_size: self.buffer_size.unwrap_or(1000),
            auto_offset_reset: self
                .auto_offset_reset
                .unwrap_or_else(|| "latest".to_string()),
        })
    }
}

impl EventBus for RedpandaEventBus {
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
            let record = FutureRecord::to(&topic).payload(&payload).key(&key);

            match self.producer.send(record, Timeout::After(self.timeout)).await {
                Ok((partition, offset)) => {
                    tracing::debug!(
                        topic = %topic,
                        key = %key,
                        partition,
                        offset,
                        "Message published"
                    );
                    Ok(())
                }
                Err((kafka_error, _)) => {
                    tracing::error!(
                        topic = %topic,
                        key = %key,
                        error = %kafka_error,
                        "Failed to publish message"
                    );
                    Err(EventBusError::PublishFailed {
                        topic,
                        reason: kafka_error.to_string(),
                    })
                }
            }
        })
    }

    fn subscribe(
        &self,
        topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<MessageStream, EventBusError>> + Send + '_>> {
        let topics: Vec<String> = topics.iter().map(|s| (*s).to_string()).collect();

        Box::pin(async move {
            let consumer_group_id = self.consumer_group_for(&topics);

            // Manual commit for at-least-once
            let consumer: StreamConsumer = ClientConfig::new()
                .set("bootstrap.servers", &self.brokers)
                .set("group.id", &consumer_group_id)
                .set("enable.auto.commit", "false")
                .set("auto.offset.reset", &self.auto_offset_reset)
                .set("session.timeout.ms", "6000")
                .set("enable.partition.eof", "false")
                .create()
                .map_err(|e| EventBusError::SubscriptionFailed {
                    topics: topics.clone(),
                    reason: format!("Failed to create consumer: {e}"),
                })?;

            let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
            consumer
                .subscribe(&topic_refs)
                .map_err(|e| EventBusError::SubscriptionFailed {
                    topics: topics.clone(),
                    reason: format!("Failed to subscribe to topics: {e}"),
                })?;

            tracing::info!(
                topics = ?topics,
                consumer_group = %consumer_group_id,
                buffer_size = self.buffer_size,
                auto_offset_reset = %self.auto_offset_reset,
                "Subscribed to topics"
            );

            let (tx, rx) = mpsc::channel(self.buffer_size);
            let (ack_tx, ack_rx) = mpsc::unbounded_channel();
            tokio::spawn(consume(consumer, tx, ack_tx, ack_rx));

            let stream = async_stream::stream! {
                let mut rx = rx;
                while let Some(result) = rx.recv().await {
                    yield result;
                }
            };

            Ok(Box::pin(stream) as MessageStream)
        })
    }
}

/// Acknowledgement of one consumed message, sent back to the consumer task.
#[derive(Debug)]
struct AckRequest {
    topic: String,
    partition: i32,
    offset: i64,
}

struct KafkaAck {
    acks: mpsc::UnboundedSender<AckRequest>,
    request: AckRequest,
}

impl Acknowledge for KafkaAck {
    fn ack(self: Box<Self>) -> AckFuture {
        let Self { acks, request } = *self;
        Box::pin(async move {
            let (topic, partition, offset) = (request.topic.clone(), request.partition, request.offset);
            acks.send(request).map_err(|_| EventBusError::AcknowledgeFailed {
                topic,
                partition,
                offset,
                reason: "consumer is no longer running".to_string(),
            })
        })
    }
}

/// Owns the consumer: forwards messages to the subscriber and commits acked offsets.
///
/// Exits when the subscriber drops its stream.
async fn consume(
    consumer: StreamConsumer,
    tx: mpsc::Sender<Result<Delivery, EventBusError>>,
    ack_tx: mpsc::UnboundedSender<AckRequest>,
    mut ack_rx: mpsc::UnboundedReceiver<AckRequest>,
) {
    let mut tracker = OffsetTracker::new();
    let mut stream = consumer.stream();

    loop {
        tokio::select! {
            () = tx.closed() => break,
            Some(ack) = ack_rx.recv() => commit_ack(&consumer, &mut tracker, &ack),
            next = stream.next() => {
                // The borrowed message must not live across the send below
                let Some(item) = next.map(|result| receive(result, &ack_tx, &mut tracker)) else {
                    break;
                };
                if tx.send(item).await.is_err() {
                    break;
                }
            }
        }
    }

    // Commit whatever was acked before the subscriber went away
    drop(stream);
    while let Ok(ack) = ack_rx.try_recv() {
        commit_ack(&consumer, &mut tracker, &ack);
    }
    tracing::debug!(in_flight = tracker.in_flight(), "Consumer task exiting");
}

fn receive(
    result: KafkaResult<BorrowedMessage<'_>>,
    acks: &mpsc::UnboundedSender<AckRequest>,
    tracker: &mut OffsetTracker,
) -> Result<Delivery, EventBusError> {
    let message = result.map_err(|e| {
        EventBusError::TransportError(format!("Failed to receive message: {e}"))
    })?;
    tracker.delivered(message.topic(), message.partition(), message.offset());
    Ok(to_delivery(&message, acks))
}

fn to_delivery(message: &BorrowedMessage<'_>, acks: &mpsc::UnboundedSender<AckRequest>) -> Delivery {
    let key = message
        .key()
        .map(|bytes| String::from_utf8_lossy(bytes).into_owned());
    let payload = message.payload().map(<[u8]>::to_vec).unwrap_or_default();

    tracing::trace!(
        topic = message.topic(),
        partition = message.partition(),
        offset = message.offset(),
        "Received message"
    );

    Delivery::new(
        message.topic(),
        key,
        payload,
        message.partition(),
        message.offset(),
        Box::new(KafkaAck {
            acks: acks.clone(),
            request: AckRequest {
                topic: message.topic().to_string(),
                partition: message.partition(),
                offset: message.offset(),
            },
        }),
    )
}

fn commit_ack(consumer: &StreamConsumer, tracker: &mut OffsetTracker, ack: &AckRequest) {
    let Some(position) = tracker.acked(&ack.topic, ack.partition, ack.offset) else {
        return;
    };

    let mut offsets = TopicPartitionList::new();
    if let Err(e) = offsets.add_partition_offset(&ack.topic, ack.partition, Offset::Offset(position)) {
        tracing::warn!(topic = %ack.topic, partition = ack.partition, error = %e, "Invalid commit offset");
        return;
    }
    if let Err(e) = consumer.commit(&offsets, CommitMode::Async) {
        // A later commit covers this one; a crash before then means redelivery
        tracing::warn!(
            topic = %ack.topic,
            partition = ack.partition,
            offset = position,
            error = %e,
            "Failed to commit offset (messages may be redelivered)"
        );
    } else {
        tracing::trace!(topic = %ack.topic, partition = ack.partition, offset = position, "Committed offset");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can use unwrap
mod tests {
    use super::*;

    #[test]
    fn redpanda_event_bus_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<RedpandaEventBus>();
        assert_sync::<RedpandaEventBus>();
    }

    #[test]
    fn build_without_brokers_fails() {
        assert!(matches!(
            RedpandaEventBus::builder().build(),
            Err(EventBusError::ConnectionFailed(_))
        ));
    }

    #[test]
    fn consumer_group_is_derived_from_sorted_topics() {
        let bus = RedpandaEventBus::new("localhost:9092").unwrap();
        let topics = vec!["order-events".to_string(), "customer-events".to_string()];
        assert_eq!(
            bus.consumer_group_for(&topics),
            "eventing-customer-events-order-events"
        );

        let bus = RedpandaEventBus::builder()
            .brokers("localhost:9092")
            .consumer_group("customer-service")
            .build()
            .unwrap();
        assert_eq!(bus.consumer_group_for(&topics), "customer-service");
    }

    #[tokio::test]
    async fn ack_after_consumer_exit_fails() {
        let (acks, rx) = mpsc::unbounded_channel();
        drop(rx);
        let ack = Box::new(KafkaAck {
            acks,
            request: AckRequest {
                topic: "customer-events".to_string(),
                partition: 0,
                offset: 7,
            },
        });

        assert!(matches!(
            ack.ack().await,
            Err(EventBusError::AcknowledgeFailed { offset: 7, .. })
        ));
    }
}
