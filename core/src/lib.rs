//! # Eventing Core
//!
//! Contracts shared by every service of the shopping platform's event pipeline.
//!
//! This crate holds no I/O. It defines what an event is, how it travels, how it is
//! decoded back into a Rust type and handed to business logic, and what the outbox
//! and dead-letter stores must provide. Broker and database adapters live in
//! `eventing-redpanda` and `eventing-postgres`; the background relay and dispatcher
//! live in `eventing-runtime`.
//!
//! ## Core Concepts
//!
//! - **Event**: A typed domain fact with a type tag, canonical topic and resource id
//! - **Envelope**: The wire form of an event (JSON, forward compatible)
//! - **Event bus**: Topic-addressed publish/subscribe with acknowledgements
//! - **Outbox**: Events written in the business transaction, published later
//! - **Registry**: Type tag → factory + handler, built once at startup
//! - **Dead letter**: A message kept aside for manual reprocessing
//!
//! ## Example
//!
//! ```
//! use eventing_core::event::{Event, EventEnvelope};
//! use eventing_core::handler::HandlerContext;
//! use eventing_core::registry::EventRegistry;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Clone, Debug, Serialize, Deserialize)]
//! struct CartCheckedOut { cart_id: String }
//!
//! impl Event for CartCheckedOut {
//!     const EVENT_TYPE: &'static str = "CartCheckedOut.v1";
//!     const TOPIC: &'static str = "cart-events";
//!     fn resource_id(&self) -> String { self.cart_id.clone() }
//! }
//!
//! let mut registry = EventRegistry::new();
//! registry
//!     .register_fn(|event: CartCheckedOut, _ctx: HandlerContext| async move {
//!         tracing::info!(cart_id = %event.cart_id, "checked out");
//!         Ok(())
//!     })
//!     .unwrap();
//!
//! let envelope = EventEnvelope::from_event(&CartCheckedOut { cart_id: "c-1".into() }).unwrap();
//! let decoded = registry.decode(&envelope).unwrap();
//! assert_eq!(decoded.event_type(), "CartCheckedOut.v1");
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod dead_letter;
pub mod environment;
pub mod error;
pub mod event;
pub mod event_bus;
pub mod handler;
pub mod outbox;
pub mod partition;
pub mod registry;

pub use dead_letter::{DeadLetter, DeadLetterError, DeadLetterSink, FailureStage};
pub use environment::{Clock, SystemClock};
pub use error::ProcessingError;
pub use event::{Event, EventEnvelope, EventError};
pub use event_bus::{Acknowledge, Delivery, EventBus, EventBusError, MessageStream};
pub use handler::{
    EventHandler, FnHandler, HandlerContext, HandlerError, HandlerOutcome, ValidationError,
    handle_event_with_validation, validate_envelope,
};
pub use outbox::{OutboxError, OutboxRecord, OutboxStatus, OutboxStore};
pub use registry::{DecodeError, DecodedEvent, EventRegistry, RegistryError};
