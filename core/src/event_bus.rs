//! Event bus abstraction over a message broker.
//!
//! The bus moves opaque bytes between services. It knows nothing about event types:
//! producers hand it an encoded [`EventEnvelope`](crate::event::EventEnvelope) plus a
//! partition key, consumers receive [`Delivery`] values and acknowledge them once
//! processing is finished.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────┐      ┌──────────────┐      ┌────────────────┐
//! │  Outbox relay  │─────▶│   Event bus  │─────▶│   Dispatcher   │
//! │ publish(topic, │      │ (partitioned │      │ ack / retry /  │
//! │   key, bytes)  │      │    topics)   │      │  dead-letter   │
//! └────────────────┘      └──────────────┘      └────────────────┘
//! ```
//!
//! # Key Principles
//!
//! - **Surface transport failures**: `publish` returns an error when the broker is
//!   unreachable or the topic is missing; nothing is dropped silently
//! - **At-least-once delivery**: a delivery that is never acknowledged is delivered
//!   again after a restart or rebalance
//! - **Ordered within partition**: messages with the same key keep their order
//! - **No global order**: there is no ordering guarantee across topics
//!
//! # Implementations
//!
//! - `InMemoryEventBus` (`eventing-testing`) - For tests
//! - `RedpandaEventBus` (`eventing-redpanda`) - Kafka-compatible, for production

use futures::Stream;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur during event bus operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventBusError {
    /// Failed to connect to the event bus
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to publish a message to a topic
    #[error("Publish failed for topic '{topic}': {reason}")]
    PublishFailed {
        /// The topic that failed
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to subscribe to topics
    #[error("Subscription failed for topics {topics:?}: {reason}")]
    SubscriptionFailed {
        /// The topics that failed to subscribe
        topics: Vec<String>,
        /// The reason for failure
        reason: String,
    },

    /// Failed to acknowledge a delivery
    #[error("Acknowledge failed for {topic}[{partition}]@{offset}: {reason}")]
    AcknowledgeFailed {
        /// Topic of the delivery
        topic: String,
        /// Partition of the delivery
        partition: i32,
        /// Offset of the delivery
        offset: i64,
        /// The reason for failure
        reason: String,
    },

    /// Topic not found or invalid
    #[error("Invalid topic: {0}")]
    InvalidTopic(String),

    /// Network or transport error
    #[error("Transport error: {0}")]
    TransportError(String),
}

/// Future returned by acknowledgement handles.
pub type AckFuture = Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send>>;

/// Broker-specific acknowledgement of a single delivery.
///
/// Implementations mark the message as processed for the consumer group so it is not
/// delivered again.
pub trait Acknowledge: Send + Sync {
    /// Acknowledge the delivery this handle belongs to.
    fn ack(self: Box<Self>) -> AckFuture;
}

/// A message received from the bus.
///
/// Dropping a delivery without calling [`Delivery::ack`] leaves it unacknowledged:
/// the broker will hand it out again after a restart or a consumer-group rebalance.
pub struct Delivery {
    /// Topic the message was read from
    pub topic: String,
    /// Partition key the producer used, if any
    pub key: Option<String>,
    /// Raw message bytes
    pub payload: Vec<u8>,
    /// Partition the message was read from
    pub partition: i32,
    /// Offset of the message within its partition
    pub offset: i64,
    acknowledger: Option<Box<dyn Acknowledge>>,
}

impl Delivery {
    /// Create a delivery with an acknowledgement handle.
    #[must_use]
    pub fn new(
        topic: impl Into<String>,
        key: Option<String>,
        payload: Vec<u8>,
        partition: i32,
        offset: i64,
        acknowledger: Box<dyn Acknowledge>,
    ) -> Self {
        Self {
            topic: topic.into(),
            key,
            payload,
            partition,
            offset,
            acknowledger: Some(acknowledger),
        }
    }

    /// Create a delivery that needs no acknowledgement (e.g. a manual replay).
    #[must_use]
    pub fn unacknowledged(
        topic: impl Into<String>,
        key: Option<String>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            topic: topic.into(),
            key,
            payload,
            partition: 0,
            offset: 0,
            acknowledger: None,
        }
    }

    /// Key used to route this delivery to a worker: the partition key, or the topic
    /// when the producer did not set one.
    #[must_use]
    pub fn routing_key(&self) -> &str {
        self.key.as_deref().unwrap_or(&self.topic)
    }

    /// Acknowledge the delivery.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::AcknowledgeFailed`] (or a transport error) if the
    /// broker could not record the acknowledgement. The message may be redelivered.
    pub async fn ack(mut self) -> Result<(), EventBusError> {
        match self.acknowledger.take() {
            Some(acknowledger) => acknowledger.ack().await,
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("topic", &self.topic)
            .field("key", &self.key)
            .field("partition", &self.partition)
            .field("offset", &self.offset)
            .field("payload_len", &self.payload.len())
            .finish_non_exhaustive()
    }
}

/// Stream of deliveries from a subscription.
pub type MessageStream = Pin<Box<dyn Stream<Item = Result<Delivery, EventBusError>> + Send>>;

/// Trait for event bus implementations.
///
/// # Thread Safety
///
/// All implementations must be `Send + Sync` so one bus can be shared by the outbox
/// relay and the dispatcher.
///
/// # Dyn Compatibility
///
/// This trait uses explicit `Pin<Box<dyn Future>>` returns instead of `async fn`
/// so it can be used as `Arc<dyn EventBus>`.
pub trait EventBus: Send + Sync {
    /// Publish a message to a topic.
    ///
    /// The `key` selects the partition; messages sharing a key keep their order.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::PublishFailed`] if the broker did not accept the
    /// message, [`EventBusError::InvalidTopic`] if the topic does not exist.
    fn publish(
        &self,
        topic: &str,
        key: &str,
        payload: &[u8],
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>>;

    /// Subscribe to one or more topics and receive a stream of deliveries.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::SubscriptionFailed`] if subscription fails.
    fn subscribe(
        &self,
        topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<MessageStream, EventBusError>> + Send + '_>>;
}
