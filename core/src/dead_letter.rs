//! Dead letters: messages the dispatcher gave up on.
//!
//! A dead letter keeps the raw bytes of the delivery so it can be inspected and
//! replayed even when the bytes never decoded into an envelope.

use crate::event::EventEnvelope;
use crate::event_bus::Delivery;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;
use uuid::Uuid;

/// Where in the processing pipeline the message failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    /// Bytes were not an envelope, or the payload did not fit its type.
    Decode,
    /// No handler is registered for the type tag.
    UnknownEventType,
    /// The envelope failed structural validation.
    Validation,
    /// The handler returned a fatal error.
    Handler,
    /// The handler kept failing recoverably until the attempt limit.
    RetriesExhausted,
}

impl FailureStage {
    /// Stable string form, used in storage and metric labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Decode => "decode",
            Self::UnknownEventType => "unknown_event_type",
            Self::Validation => "validation",
            Self::Handler => "handler",
            Self::RetriesExhausted => "retries_exhausted",
        }
    }

    /// Parse the string form produced by [`FailureStage::as_str`].
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "decode" => Some(Self::Decode),
            "unknown_event_type" => Some(Self::UnknownEventType),
            "validation" => Some(Self::Validation),
            "handler" => Some(Self::Handler),
            "retries_exhausted" => Some(Self::RetriesExhausted),
            _ => None,
        }
    }
}

impl fmt::Display for FailureStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message that could not be processed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// Dead letter id
    pub id: Uuid,
    /// Topic the message came from
    pub topic: String,
    /// Partition key, if the producer set one
    pub key: Option<String>,
    /// Raw message bytes
    pub payload: Vec<u8>,
    /// Type tag, when the envelope decoded
    pub event_type: Option<String>,
    /// Event id, when the envelope decoded
    pub event_id: Option<Uuid>,
    /// Resource id, when the envelope decoded
    pub resource_id: Option<String>,
    /// Failure stage
    pub stage: FailureStage,
    /// Last error message
    pub error: String,
    /// Processing attempts made
    pub attempts: u32,
    /// When the message was dead-lettered
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    /// Build a dead letter for `delivery`.
    ///
    /// `envelope` is `None` when the bytes could not be decoded.
    #[must_use]
    pub fn from_delivery(
        delivery: &Delivery,
        envelope: Option<&EventEnvelope>,
        stage: FailureStage,
        error: impl Into<String>,
        attempts: u32,
        failed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic: delivery.topic.clone(),
            key: delivery.key.clone(),
            payload: delivery.payload.clone(),
            event_type: envelope.map(|e| e.event_type.clone()),
            event_id: envelope.map(|e| e.id),
            resource_id: envelope.map(|e| e.resource_id.clone()),
            stage,
            error: error.into(),
            attempts,
            failed_at,
        }
    }
}

/// Errors from dead-letter storage.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeadLetterError {
    /// The backing store failed.
    #[error("Dead letter storage error: {0}")]
    Storage(String),

    /// The queue is full. The message is not stored.
    #[error("Dead letter queue is full (capacity {capacity})")]
    CapacityExceeded {
        /// Configured capacity
        capacity: usize,
    },

    /// No dead letter with this id.
    #[error("Dead letter {0} not found")]
    NotFound(Uuid),
}

/// Somewhere to put dead letters.
///
/// The dispatcher acknowledges a dead-lettered message only after `record` succeeds.
pub trait DeadLetterSink: Send + Sync {
    /// Store a dead letter.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError`] if the letter could not be stored.
    fn record(
        &self,
        letter: DeadLetter,
    ) -> Pin<Box<dyn Future<Output = Result<(), DeadLetterError>> + Send + '_>>;
}
