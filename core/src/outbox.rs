//! Transactional outbox records and the store the relay drains.
//!
//! Services never publish to the bus directly. They write an [`OutboxRecord`] in the
//! same transaction as their business change; a relay later claims due records,
//! publishes them, and marks them published. A crash at any point leaves the record
//! in the store, so nothing is lost (at the cost of a possible duplicate publish).
//!
//! ```text
//!            ┌──────────────── retry (attempts + 1, next_attempt_at = now + backoff)
//!            ▼          │
//! insert ─▶ Pending ────┴──▶ Published
//!            │
//!            └─ attempts == max ─▶ DeadLettered
//! ```

use crate::event::EventEnvelope;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Lifecycle state of an outbox record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    /// Waiting to be published.
    Pending,
    /// Accepted by the bus. Terminal.
    Published,
    /// Gave up after too many failed publishes. Terminal.
    DeadLettered,
}

impl OutboxStatus {
    /// Stable string form used in storage.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Published => "published",
            Self::DeadLettered => "dead_lettered",
        }
    }

    /// Parse the string form produced by [`OutboxStatus::as_str`].
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "published" => Some(Self::Published),
            "dead_lettered" => Some(Self::DeadLettered),
            _ => None,
        }
    }

    /// Whether no further transitions are possible.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event waiting in the outbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxRecord {
    /// Record id; equal to the envelope id
    pub id: Uuid,
    /// The event to publish
    pub envelope: EventEnvelope,
    /// When the record was written
    pub created_at: DateTime<Utc>,
    /// When the bus accepted the event
    pub published_at: Option<DateTime<Utc>>,
    /// Failed publish attempts so far
    pub attempts: u32,
    /// Earliest time of the next attempt; `None` means immediately
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// Error from the last failed attempt
    pub last_error: Option<String>,
    /// Lifecycle state
    pub status: OutboxStatus,
}

impl OutboxRecord {
    /// Create a pending record for `envelope`.
    #[must_use]
    pub fn new(envelope: EventEnvelope, created_at: DateTime<Utc>) -> Self {
        Self {
            id: envelope.id,
            envelope,
            created_at,
            published_at: None,
            attempts: 0,
            next_attempt_at: None,
            last_error: None,
            status: OutboxStatus::Pending,
        }
    }

    /// Whether the relay may publish this record at `now`.
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == OutboxStatus::Pending && self.next_attempt_at.is_none_or(|at| at <= now)
    }
}

/// Errors from outbox storage.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OutboxError {
    /// The backing store failed.
    #[error("Outbox storage error: {0}")]
    Storage(String),

    /// The stored envelope could not be (de)serialized.
    #[error("Outbox serialization error: {0}")]
    Serialization(String),

    /// No record with this id.
    #[error("Outbox record {0} not found")]
    NotFound(Uuid),
}

/// Future returned by [`OutboxStore`] methods.
pub type OutboxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, OutboxError>> + Send + 'a>>;

/// Storage drained by the outbox relay.
///
/// # Claiming
///
/// `claim_due` hands out each due record to at most one caller at a time. A claim is
/// a lease: if the caller neither marks the record published nor failed before the
/// lease expires, the record becomes claimable again.
///
/// Only the oldest pending record of each resource is claimable. A record waiting
/// on backoff or held by another caller keeps every later record of its resource
/// back, so a resource's events reach the bus in the order they were written.
pub trait OutboxStore: Send + Sync {
    /// Claim up to `limit` due records, oldest first, for `lease`. At most one
    /// record per resource is returned.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Storage`] if the store is unreachable.
    fn claim_due(&self, limit: usize, lease: Duration) -> OutboxFuture<'_, Vec<OutboxRecord>>;

    /// Mark a record published and release its claim.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::NotFound`] for an unknown id.
    fn mark_published(&self, id: Uuid) -> OutboxFuture<'_, ()>;

    /// Record a failed publish: increment attempts and schedule the next one.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::NotFound`] for an unknown id.
    fn mark_failed(
        &self,
        id: Uuid,
        error: String,
        next_attempt_at: DateTime<Utc>,
    ) -> OutboxFuture<'_, ()>;

    /// Give up on a record.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::NotFound`] for an unknown id.
    fn mark_dead_lettered(&self, id: Uuid, error: String) -> OutboxFuture<'_, ()>;

    /// Number of pending records, due or not.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Storage`] if the store is unreachable.
    fn pending_count(&self) -> OutboxFuture<'_, u64>;
}
