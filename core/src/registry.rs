//! Event type registry: maps type tags to payload factories and typed handlers.
//!
//! The registry is built once at startup and shared with the dispatcher through an
//! `Arc`. It owns the only mapping from a wire-level `event_type` string to Rust types,
//! so an unknown tag can be detected before any business code runs.
//!
//! ```text
//! bytes ─▶ EventEnvelope ─▶ registry.decode() ─▶ DecodedEvent ─▶ registry.dispatch()
//!                              │                                     │
//!                     factory(event_type)                 handler for event_type
//! ```

use crate::event::{Event, EventEnvelope, EventError};
use crate::handler::{EventHandler, FnHandler, HandlerContext, HandlerError, HandlerFuture};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use thiserror::Error;

/// Errors raised while building a registry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// A handler is already registered for this type tag.
    #[error("Event type '{0}' is already registered")]
    DuplicateEventType(String),
}

/// Errors raised while turning bytes into a typed event.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The bytes are not an event envelope.
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// No factory is registered for the type tag.
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),

    /// The payload does not match the registered type's schema.
    #[error("Malformed payload for '{event_type}': {reason}")]
    MalformedPayload {
        /// Type tag of the envelope
        event_type: String,
        /// Deserializer message
        reason: String,
    },
}

/// A type-erased payload factory.
pub type EventFactory =
    dyn Fn(&serde_json::Value) -> Result<Box<dyn Any + Send + Sync>, EventError> + Send + Sync;

trait ErasedHandler: Send + Sync {
    fn call<'a>(
        &'a self,
        event: &(dyn Any + Send + Sync),
        ctx: &'a HandlerContext,
    ) -> HandlerFuture<'a>;
}

struct TypedHandler<E, H> {
    handler: H,
    _event: PhantomData<fn() -> E>,
}

impl<E, H> ErasedHandler for TypedHandler<E, H>
where
    E: Event,
    H: EventHandler<E>,
{
    fn call<'a>(
        &'a self,
        event: &(dyn Any + Send + Sync),
        ctx: &'a HandlerContext,
    ) -> HandlerFuture<'a> {
        match event.downcast_ref::<E>() {
            Some(event) => self.handler.handle(event.clone(), ctx),
            None => {
                let reason = format!("decoded value is not a {}", E::EVENT_TYPE);
                Box::pin(async move { Err(HandlerError::fatal(reason)) })
            }
        }
    }
}

/// One registered event type: its tag, canonical topic, factory and handler.
pub struct HandlerRegistration {
    /// Type tag
    pub event_type: &'static str,
    /// Canonical topic
    pub topic: &'static str,
    factory: Box<EventFactory>,
    handler: Box<dyn ErasedHandler>,
}

impl fmt::Debug for HandlerRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistration")
            .field("event_type", &self.event_type)
            .field("topic", &self.topic)
            .finish_non_exhaustive()
    }
}

/// A payload decoded into its registered Rust type.
pub struct DecodedEvent {
    event_type: &'static str,
    value: Box<dyn Any + Send + Sync>,
}

impl DecodedEvent {
    /// Type tag of the decoded event.
    #[must_use]
    pub const fn event_type(&self) -> &'static str {
        self.event_type
    }

    /// Borrow the decoded value as `E`, if that is its type.
    #[must_use]
    pub fn downcast_ref<E: Event>(&self) -> Option<&E> {
        self.value.downcast_ref::<E>()
    }
}

impl fmt::Debug for DecodedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodedEvent")
            .field("event_type", &self.event_type)
            .finish_non_exhaustive()
    }
}

/// Registry of event types and their handlers.
///
/// # Example
///
/// ```
/// use eventing_core::event::Event;
/// use eventing_core::handler::HandlerContext;
/// use eventing_core::registry::EventRegistry;
/// # use serde::{Deserialize, Serialize};
/// # #[derive(Clone, Debug, Serialize, Deserialize)]
/// # struct StockReserved { sku: String }
/// # impl Event for StockReserved {
/// #     const EVENT_TYPE: &'static str = "StockReserved.v1";
/// #     const TOPIC: &'static str = "inventory-events";
/// #     fn resource_id(&self) -> String { self.sku.clone() }
/// # }
///
/// let mut registry = EventRegistry::new();
/// registry
///     .register_fn(|_event: StockReserved, _ctx: HandlerContext| async { Ok(()) })
///     .unwrap();
///
/// assert!(registry.contains("StockReserved.v1"));
/// assert_eq!(registry.topics(), vec!["inventory-events"]);
/// assert!(registry.register_fn(|_e: StockReserved, _c: HandlerContext| async { Ok(()) }).is_err());
/// ```
#[derive(Default)]
pub struct EventRegistry {
    registrations: HashMap<&'static str, HandlerRegistration>,
}

impl EventRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for events of type `E`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::DuplicateEventType`] if `E::EVENT_TYPE` is already
    /// registered. The existing registration is left untouched.
    pub fn register<E, H>(&mut self, handler: H) -> Result<&mut Self, RegistryError>
    where
        E: Event,
        H: EventHandler<E>,
    {
        if self.registrations.contains_key(E::EVENT_TYPE) {
            return Err(RegistryError::DuplicateEventType(E::EVENT_TYPE.to_string()));
        }

        let factory: Box<EventFactory> = Box::new(|payload: &serde_json::Value| {
            E::from_payload(payload).map(|event| Box::new(event) as Box<dyn Any + Send + Sync>)
        });
        let handler = TypedHandler {
            handler,
            _event: PhantomData::<fn() -> E>,
        };

        self.registrations.insert(
            E::EVENT_TYPE,
            HandlerRegistration {
                event_type: E::EVENT_TYPE,
                topic: E::TOPIC,
                factory,
                handler: Box::new(handler),
            },
        );

        tracing::debug!(event_type = E::EVENT_TYPE, topic = E::TOPIC, "Registered event handler");
        Ok(self)
    }

    /// Register an async closure as the handler for `E`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::DuplicateEventType`] if `E::EVENT_TYPE` is already
    /// registered.
    pub fn register_fn<E, F, Fut>(&mut self, f: F) -> Result<&mut Self, RegistryError>
    where
        E: Event,
        F: Fn(E, HandlerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.register::<E, _>(FnHandler::new(f))
    }

    /// Whether a handler is registered for `event_type`.
    #[must_use]
    pub fn contains(&self, event_type: &str) -> bool {
        self.registrations.contains_key(event_type)
    }

    /// Number of registered event types.
    #[must_use]
    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    /// Whether nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Registered type tags, sorted.
    #[must_use]
    pub fn event_types(&self) -> Vec<&'static str> {
        let mut types: Vec<_> = self.registrations.keys().copied().collect();
        types.sort_unstable();
        types
    }

    /// Distinct canonical topics of all registrations, sorted.
    #[must_use]
    pub fn topics(&self) -> Vec<&'static str> {
        let mut topics: Vec<_> = self.registrations.values().map(|r| r.topic).collect();
        topics.sort_unstable();
        topics.dedup();
        topics
    }

    /// Canonical topic for `event_type`.
    #[must_use]
    pub fn expected_topic(&self, event_type: &str) -> Option<&'static str> {
        self.registrations.get(event_type).map(|r| r.topic)
    }

    /// Payload factory for `event_type`.
    #[must_use]
    pub fn factory(&self, event_type: &str) -> Option<&EventFactory> {
        self.registrations.get(event_type).map(|r| r.factory.as_ref())
    }

    /// All registrations, in no particular order.
    pub fn registrations(&self) -> impl Iterator<Item = &HandlerRegistration> {
        self.registrations.values()
    }

    /// Decode the envelope's payload into its registered type.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::UnknownEventType`] when no factory matches the type tag,
    /// [`DecodeError::MalformedPayload`] when the payload does not fit the schema.
    pub fn decode(&self, envelope: &EventEnvelope) -> Result<DecodedEvent, DecodeError> {
        let registration = self
            .registrations
            .get(envelope.event_type.as_str())
            .ok_or_else(|| DecodeError::UnknownEventType(envelope.event_type.clone()))?;

        let value = (registration.factory)(&envelope.payload).map_err(|err| {
            DecodeError::MalformedPayload {
                event_type: envelope.event_type.clone(),
                reason: err.to_string(),
            }
        })?;

        Ok(DecodedEvent {
            event_type: registration.event_type,
            value,
        })
    }

    /// Run the registered handler for a decoded event.
    ///
    /// An event decoded by a different registry whose type is not registered here
    /// fails with a fatal [`HandlerError`].
    pub fn dispatch<'a>(
        &'a self,
        decoded: &'a DecodedEvent,
        ctx: &'a HandlerContext,
    ) -> HandlerFuture<'a> {
        match self.registrations.get(decoded.event_type) {
            Some(registration) => registration.handler.call(decoded.value.as_ref(), ctx),
            None => {
                let reason = format!("no handler registered for {}", decoded.event_type);
                Box::pin(async move { Err(HandlerError::fatal(reason)) })
            }
        }
    }
}

impl fmt::Debug for EventRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventRegistry")
            .field("event_types", &self.event_types())
            .finish()
    }
}
