//! Typed event handlers and the cross-cutting wrapper every dispatch goes through.
//!
//! Concrete handlers only contain business logic. Structural validation, correlation
//! logging and metrics are applied uniformly by [`handle_event_with_validation`],
//! regardless of the concrete event type.
//!
//! # Example
//!
//! ```
//! use eventing_core::event::{Event, EventEnvelope};
//! use eventing_core::handler::{HandlerError, handle_event_with_validation};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Clone, Debug, Serialize, Deserialize)]
//! struct StockReserved { sku: String }
//!
//! impl Event for StockReserved {
//!     const EVENT_TYPE: &'static str = "StockReserved.v1";
//!     const TOPIC: &'static str = "inventory-events";
//!     fn resource_id(&self) -> String { self.sku.clone() }
//! }
//!
//! # tokio_test::block_on(async {
//! let envelope = EventEnvelope::from_event(&StockReserved { sku: "sku-1".into() }).unwrap();
//! let result = handle_event_with_validation(&envelope, StockReserved::TOPIC, || async {
//!     Ok::<(), HandlerError>(())
//! })
//! .await;
//! assert!(result.is_ok());
//! # });
//! ```

use crate::error::ProcessingError;
use crate::event::{Event, EventEnvelope};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;
use std::time::Instant;
use thiserror::Error;
use tracing::Instrument;
use uuid::Uuid;

/// Error returned by business handlers.
///
/// The handler decides whether a failure is worth retrying.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// Transient failure (downstream dependency unavailable, lock timeout, ...).
    /// The dispatcher retries with backoff.
    #[error("Recoverable handler failure: {0}")]
    Recoverable(String),

    /// Permanent failure (invariant violation, malformed business data).
    /// The dispatcher dead-letters the message without retrying.
    #[error("Fatal handler failure: {0}")]
    Fatal(String),
}

impl HandlerError {
    /// Create a recoverable failure.
    #[must_use]
    pub fn recoverable(reason: impl Into<String>) -> Self {
        Self::Recoverable(reason.into())
    }

    /// Create a fatal failure.
    #[must_use]
    pub fn fatal(reason: impl Into<String>) -> Self {
        Self::Fatal(reason.into())
    }

    /// Whether the dispatcher should retry after this failure.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::Recoverable(_))
    }
}

/// Outcome of a single handler invocation; drives the acknowledgement policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// Acknowledge the message.
    Success,
    /// Retry with backoff.
    RecoverableFailure,
    /// Dead-letter without further retries.
    FatalFailure,
}

impl HandlerOutcome {
    /// Classify the result of [`handle_event_with_validation`].
    #[must_use]
    pub const fn of(result: &Result<(), ProcessingError>) -> Self {
        match result {
            Ok(()) => Self::Success,
            Err(err) if err.is_retryable() => Self::RecoverableFailure,
            Err(_) => Self::FatalFailure,
        }
    }

    /// Label used in logs and metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::RecoverableFailure => "recoverable_failure",
            Self::FatalFailure => "fatal_failure",
        }
    }
}

/// A structurally invalid envelope.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// The envelope id is the nil UUID.
    #[error("Event id is missing")]
    MissingEventId,

    /// The type tag is empty.
    #[error("Event type is missing")]
    MissingEventType,

    /// The resource id is empty.
    #[error("Resource id is missing for event {event_id}")]
    MissingResourceId {
        /// Offending event
        event_id: Uuid,
    },

    /// The payload is `null`.
    #[error("Payload is missing for event {event_id}")]
    MissingPayload {
        /// Offending event
        event_id: Uuid,
    },

    /// The envelope was published to a topic other than its type's canonical topic.
    #[error("Event type '{event_type}' belongs on topic '{expected}', found '{actual}'")]
    TopicMismatch {
        /// Type tag of the event
        event_type: String,
        /// Canonical topic of the type
        expected: String,
        /// Topic carried by the envelope
        actual: String,
    },
}

/// Check the structural invariants every envelope must satisfy.
///
/// # Errors
///
/// Returns the first [`ValidationError`] found: missing id, type, resource id or
/// payload, or a topic that differs from `expected_topic`.
pub fn validate_envelope(
    envelope: &EventEnvelope,
    expected_topic: &str,
) -> Result<(), ValidationError> {
    if envelope.id.is_nil() {
        return Err(ValidationError::MissingEventId);
    }
    if envelope.event_type.trim().is_empty() {
        return Err(ValidationError::MissingEventType);
    }
    if envelope.resource_id.trim().is_empty() {
        return Err(ValidationError::MissingResourceId {
            event_id: envelope.id,
        });
    }
    if envelope.payload.is_null() {
        return Err(ValidationError::MissingPayload {
            event_id: envelope.id,
        });
    }
    if envelope.topic != expected_topic {
        return Err(ValidationError::TopicMismatch {
            event_type: envelope.event_type.clone(),
            expected: expected_topic.to_string(),
            actual: envelope.topic.clone(),
        });
    }
    Ok(())
}

/// Per-invocation context handed to handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerContext {
    /// Event id (idempotency key for handlers)
    pub event_id: Uuid,
    /// Event type tag
    pub event_type: String,
    /// Resource the event is about
    pub resource_id: String,
    /// Correlation id for logs
    pub correlation_id: String,
    /// When the event was raised
    pub occurred_at: DateTime<Utc>,
    /// 1-based attempt number
    pub attempt: u32,
}

impl HandlerContext {
    /// Build the context for `attempt` of `envelope`.
    #[must_use]
    pub fn from_envelope(envelope: &EventEnvelope, attempt: u32) -> Self {
        Self {
            event_id: envelope.id,
            event_type: envelope.event_type.clone(),
            resource_id: envelope.resource_id.clone(),
            correlation_id: envelope.correlation_id(),
            occurred_at: envelope.timestamp,
            attempt,
        }
    }

    /// Whether this is a redelivery or retry rather than the first attempt.
    #[must_use]
    pub const fn is_retry(&self) -> bool {
        self.attempt > 1
    }
}

/// Future returned by handlers.
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'a>>;

/// Business logic for one event type.
///
/// Handlers must be idempotent: delivery is at-least-once, so the same event id can
/// arrive more than once.
///
/// # Example
///
/// ```
/// use eventing_core::event::Event;
/// use eventing_core::handler::{EventHandler, HandlerContext, HandlerFuture};
/// # use serde::{Deserialize, Serialize};
/// # #[derive(Clone, Debug, Serialize, Deserialize)]
/// # struct StockReserved { sku: String }
/// # impl Event for StockReserved {
/// #     const EVENT_TYPE: &'static str = "StockReserved.v1";
/// #     const TOPIC: &'static str = "inventory-events";
/// #     fn resource_id(&self) -> String { self.sku.clone() }
/// # }
///
/// struct ReservationLogger;
///
/// impl EventHandler<StockReserved> for ReservationLogger {
///     fn handle<'a>(&'a self, event: StockReserved, ctx: &'a HandlerContext) -> HandlerFuture<'a> {
///         Box::pin(async move {
///             tracing::info!(sku = %event.sku, event_id = %ctx.event_id, "stock reserved");
///             Ok(())
///         })
///     }
/// }
/// ```
pub trait EventHandler<E: Event>: Send + Sync + 'static {
    /// Handle one decoded event.
    fn handle<'a>(&'a self, event: E, ctx: &'a HandlerContext) -> HandlerFuture<'a>;
}

/// Adapter turning an async closure into an [`EventHandler`].
pub struct FnHandler<F> {
    f: F,
}

impl<F> FnHandler<F> {
    /// Wrap a closure.
    #[must_use]
    pub const fn new(f: F) -> Self {
        Self { f }
    }
}

impl<E, F, Fut> EventHandler<E> for FnHandler<F>
where
    E: Event,
    F: Fn(E, HandlerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    fn handle<'a>(&'a self, event: E, ctx: &'a HandlerContext) -> HandlerFuture<'a> {
        Box::pin((self.f)(event, ctx.clone()))
    }
}

/// Validate `envelope`, then run `business_fn` with correlation logging and metrics.
///
/// Validation failures short-circuit: `business_fn` is not called and the result is
/// [`ProcessingError::Validation`]. Business failures come back as
/// [`ProcessingError::Business`].
///
/// # Errors
///
/// Returns the validation error or the handler's error.
pub async fn handle_event_with_validation<F, Fut>(
    envelope: &EventEnvelope,
    expected_topic: &str,
    business_fn: F,
) -> Result<(), ProcessingError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<(), HandlerError>>,
{
    if let Err(err) = validate_envelope(envelope, expected_topic) {
        tracing::warn!(
            event_id = %envelope.id,
            event_type = %envelope.event_type,
            resource_id = %envelope.resource_id,
            topic = %envelope.topic,
            error = %err,
            "Event failed validation"
        );
        metrics::counter!(
            "eventing_handler_validation_failures_total",
            "event_type" => envelope.event_type.clone()
        )
        .increment(1);
        return Err(ProcessingError::Validation(err));
    }

    let span = tracing::info_span!(
        "handle_event",
        event_id = %envelope.id,
        event_type = %envelope.event_type,
        resource_id = %envelope.resource_id,
        correlation_id = %envelope.correlation_id(),
    );

    let started = Instant::now();
    let result = business_fn()
        .instrument(span.clone())
        .await
        .map_err(ProcessingError::Business);
    let outcome = HandlerOutcome::of(&result);

    span.in_scope(|| match &result {
        Ok(()) => tracing::debug!(
            elapsed_ms = started.elapsed().as_millis(),
            "Event handled"
        ),
        Err(err) => tracing::warn!(
            outcome = outcome.as_str(),
            error = %err,
            "Event handler failed"
        ),
    });

    metrics::counter!(
        "eventing_handler_invocations_total",
        "event_type" => envelope.event_type.clone(),
        "outcome" => outcome.as_str()
    )
    .increment(1);
    metrics::histogram!(
        "eventing_handler_duration_seconds",
        "event_type" => envelope.event_type.clone()
    )
    .record(started.elapsed().as_secs_f64());

    result
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct PaymentCaptured {
        payment_id: String,
        amount_cents: i64,
    }

    impl Event for PaymentCaptured {
        const EVENT_TYPE: &'static str = "PaymentCaptured.v1";
        const TOPIC: &'static str = "payment-events";

        fn resource_id(&self) -> String {
            self.payment_id.clone()
        }
    }

    fn envelope() -> EventEnvelope {
        EventEnvelope::from_event(&PaymentCaptured {
            payment_id: "pay-1".to_string(),
            amount_cents: 500,
        })
        .expect("serialization should succeed")
    }

    #[test]
    fn valid_envelope_passes() {
        assert_eq!(validate_envelope(&envelope(), "payment-events"), Ok(()));
    }

    #[test]
    fn nil_id_is_rejected() {
        let envelope = envelope().with_id(Uuid::nil());
        assert_eq!(
            validate_envelope(&envelope, "payment-events"),
            Err(ValidationError::MissingEventId)
        );
    }

    #[test]
    fn blank_resource_id_is_rejected() {
        let mut envelope = envelope();
        envelope.resource_id = "  ".to_string();
        assert!(matches!(
            validate_envelope(&envelope, "payment-events"),
            Err(ValidationError::MissingResourceId { .. })
        ));
    }

    #[test]
    fn null_payload_is_rejected() {
        let mut envelope = envelope();
        envelope.payload = serde_json::Value::Null;
        assert!(matches!(
            validate_envelope(&envelope, "payment-events"),
            Err(ValidationError::MissingPayload { .. })
        ));
    }

    #[test]
    fn topic_must_match_canonical_topic() {
        let mut envelope = envelope();
        envelope.topic = "order-events".to_string();
        assert_eq!(
            validate_envelope(&envelope, "payment-events"),
            Err(ValidationError::TopicMismatch {
                event_type: "PaymentCaptured.v1".to_string(),
                expected: "payment-events".to_string(),
                actual: "order-events".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn validation_failure_skips_business_logic() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut envelope = envelope();
        envelope.topic = "wrong-topic".to_string();

        let counter = Arc::clone(&calls);
        let result = handle_event_with_validation(&envelope, "payment-events", || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await;

        assert!(matches!(result, Err(ProcessingError::Validation(_))));
        assert_eq!(HandlerOutcome::of(&result), HandlerOutcome::FatalFailure);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn business_errors_keep_their_classification() {
        let recoverable = handle_event_with_validation(&envelope(), "payment-events", || async {
            Err(HandlerError::recoverable("ledger unavailable"))
        })
        .await;
        let fatal = handle_event_with_validation(&envelope(), "payment-events", || async {
            Err(HandlerError::fatal("negative amount"))
        })
        .await;

        assert_eq!(HandlerOutcome::of(&recoverable), HandlerOutcome::RecoverableFailure);
        assert_eq!(HandlerOutcome::of(&fatal), HandlerOutcome::FatalFailure);
    }

    #[tokio::test]
    async fn fn_handler_receives_event_and_context() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler = FnHandler::new(move |event: PaymentCaptured, ctx: HandlerContext| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().unwrap().push((event.amount_cents, ctx.attempt));
                Ok(())
            }
        });

        let envelope = envelope();
        let ctx = HandlerContext::from_envelope(&envelope, 2);
        let event = envelope.decode::<PaymentCaptured>().unwrap();
        handler.handle(event, &ctx).await.unwrap();

        assert!(ctx.is_retry());
        assert_eq!(*seen.lock().unwrap(), vec![(500, 2)]);
    }
}
