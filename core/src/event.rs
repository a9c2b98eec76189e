//! Event contract and the envelope that carries it across the wire.
//!
//! An [`Event`] is an immutable fact raised by a domain service. Each concrete event
//! type declares a stable type tag and the canonical topic it is published to; both
//! are compile-time constants so the topic is always derived from the type.
//!
//! Events travel inside an [`EventEnvelope`], which adds the identity, routing and
//! correlation data every consumer needs regardless of the concrete type.
//!
//! # Design
//!
//! Payloads and envelopes are encoded as JSON. Decoding ignores unknown fields, so a
//! producer can add fields to its payload without breaking consumers that are still
//! on the previous schema.
//!
//! # Example
//!
//! ```
//! use eventing_core::event::{Event, EventEnvelope};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
//! struct OrderPlaced {
//!     order_id: String,
//!     total_cents: i64,
//! }
//!
//! impl Event for OrderPlaced {
//!     const EVENT_TYPE: &'static str = "OrderPlaced.v1";
//!     const TOPIC: &'static str = "order-events";
//!
//!     fn resource_id(&self) -> String {
//!         self.order_id.clone()
//!     }
//! }
//!
//! let event = OrderPlaced { order_id: "order-1".to_string(), total_cents: 4200 };
//! let envelope = EventEnvelope::from_event(&event).unwrap();
//! assert_eq!(envelope.topic, "order-events");
//! assert_eq!(envelope.decode::<OrderPlaced>().unwrap(), event);
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Metadata key linking events that belong to the same business flow.
pub const CORRELATION_ID: &str = "correlation_id";

/// Metadata key naming the event (or command) that caused this one.
pub const CAUSATION_ID: &str = "causation_id";

/// Error types for event operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    /// Failed to serialize event to bytes.
    #[error("Failed to serialize event: {0}")]
    SerializationError(String),

    /// Failed to deserialize event from bytes.
    #[error("Failed to deserialize event: {0}")]
    DeserializationError(String),

    /// The envelope holds a different event type than the one requested.
    #[error("Event type mismatch: expected '{expected}', found '{actual}'")]
    TypeMismatch {
        /// The type tag of the requested event
        expected: String,
        /// The type tag carried by the envelope
        actual: String,
    },
}

/// A typed domain event.
///
/// Implementors are plain serde structs. The capability set is deliberately small:
/// a type tag, a canonical topic, the id of the resource the event is about, and
/// payload (de)serialization with JSON defaults.
///
/// # Naming Convention
///
/// Type tags carry a version suffix so schemas can evolve:
///
/// - `"CustomerCreated.v1"`
/// - `"CustomerUpdated.v2"` (after an incompatible change)
///
/// # Thread Safety
///
/// Events are `Send + Sync + 'static` so they can cross task boundaries inside the
/// dispatcher's worker pool. They are `Clone` because a recoverable handler failure
/// re-runs the handler with the same value.
pub trait Event: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Stable type tag, unique across the whole system.
    const EVENT_TYPE: &'static str;

    /// Canonical topic for this event type.
    const TOPIC: &'static str;

    /// Identifier of the resource (aggregate) this event is about.
    ///
    /// Used as the partition key, which keeps events for the same resource ordered.
    fn resource_id(&self) -> String;

    /// Returns the type tag of this event.
    fn event_type(&self) -> &'static str {
        Self::EVENT_TYPE
    }

    /// Returns the canonical topic of this event.
    fn topic(&self) -> &'static str {
        Self::TOPIC
    }

    /// Serialize this event into its JSON payload.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::SerializationError`] if the event cannot be represented
    /// as JSON (for example a map with non-string keys).
    fn to_payload(&self) -> Result<serde_json::Value, EventError> {
        serde_json::to_value(self).map_err(|e| EventError::SerializationError(e.to_string()))
    }

    /// Rebuild an event from its JSON payload.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::DeserializationError`] if required fields are missing or
    /// have the wrong shape. Unknown fields are ignored.
    fn from_payload(payload: &serde_json::Value) -> Result<Self, EventError>
    where
        Self: Sized,
    {
        Self::deserialize(payload).map_err(|e| EventError::DeserializationError(e.to_string()))
    }
}

/// The wire representation of an event.
///
/// This is what the outbox stores and what the broker carries. The `event_type` tag
/// selects the factory that turns `payload` back into a typed value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique event identifier. Doubles as the outbox record id.
    pub id: Uuid,

    /// The event type identifier (e.g., `"CustomerCreated.v1"`).
    pub event_type: String,

    /// Topic the event is published to.
    pub topic: String,

    /// Resource the event is about; used as the partition key.
    pub resource_id: String,

    /// JSON payload owned by the event type.
    pub payload: serde_json::Value,

    /// When the event was raised.
    pub timestamp: DateTime<Utc>,

    /// Free-form string metadata.
    ///
    /// Common keys:
    /// - `correlation_id`: Links related events across services
    /// - `causation_id`: The event or command that caused this one
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl EventEnvelope {
    /// Wrap a typed event in a new envelope with a fresh id and the current time.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::SerializationError`] if the payload cannot be serialized.
    pub fn from_event<E: Event>(event: &E) -> Result<Self, EventError> {
        Ok(Self {
            id: Uuid::new_v4(),
            event_type: E::EVENT_TYPE.to_string(),
            topic: E::TOPIC.to_string(),
            resource_id: event.resource_id(),
            payload: event.to_payload()?,
            timestamp: Utc::now(),
            metadata: BTreeMap::new(),
        })
    }

    /// Replace the generated id.
    #[must_use]
    pub const fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    /// Replace the creation timestamp.
    #[must_use]
    pub const fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Attach a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Attach a correlation id.
    #[must_use]
    pub fn with_correlation_id(self, correlation_id: impl Into<String>) -> Self {
        self.with_metadata(CORRELATION_ID, correlation_id)
    }

    /// Correlation id used in logs: the `correlation_id` metadata entry, or the
    /// event id when none was set.
    #[must_use]
    pub fn correlation_id(&self) -> String {
        self.metadata
            .get(CORRELATION_ID)
            .cloned()
            .unwrap_or_else(|| self.id.to_string())
    }

    /// Decode the payload as `E`.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::TypeMismatch`] if the envelope carries a different type
    /// tag, or [`EventError::DeserializationError`] if the payload is malformed.
    pub fn decode<E: Event>(&self) -> Result<E, EventError> {
        if self.event_type != E::EVENT_TYPE {
            return Err(EventError::TypeMismatch {
                expected: E::EVENT_TYPE.to_string(),
                actual: self.event_type.clone(),
            });
        }
        E::from_payload(&self.payload)
    }

    /// Encode the envelope for the broker.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::SerializationError`] if encoding fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, EventError> {
        serde_json::to_vec(self).map_err(|e| EventError::SerializationError(e.to_string()))
    }

    /// Decode an envelope received from the broker.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::DeserializationError`] if the bytes are not an envelope.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EventError> {
        serde_json::from_slice(bytes).map_err(|e| EventError::DeserializationError(e.to_string()))
    }
}

impl fmt::Display for EventEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "EventEnvelope {{ id: {}, type: {}, topic: {}, resource: {} }}",
            self.id, self.event_type, self.topic, self.resource_id
        )
    }
}
