//! # Customer Service
//!
//! A domain service plugged into the event core:
//!
//! - [`repository`]: writes customers and their events in one transaction
//! - [`handlers`]: idempotent projection of customer activity
//! - [`app`]: starts the outbox relay and the dispatcher, and stops them gracefully
//! - [`config`]: environment-driven configuration
//!
//! ## Event Flow
//!
//! ```text
//! create_customer ─▶ customers + event_outbox (one transaction)
//!                          │
//!                     outbox relay ─▶ customer-events ─▶ dispatcher ─▶ CustomerActivityHandler
//! ```
//!
//! ## Writers and the worker
//!
//! The `customer-service` binary is the worker half: it drains the outbox and runs
//! the projection, but writes no customers itself. Writers (an API process, an
//! import job) link this library and call [`CustomerRepository`] against the same
//! database; the worker picks their events up once their transactions commit.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Service lifecycle
pub mod app;

/// Configuration from the environment
pub mod config;

/// Customer events
pub mod events;

/// Customer event handlers
pub mod handlers;

/// Customer persistence
pub mod repository;

pub use app::{Backends, CustomerService};
pub use config::Config;
pub use events::{CUSTOMER_TOPIC, CustomerCreated, CustomerDeleted, CustomerUpdated};
pub use handlers::{CustomerActivityHandler, CustomerView};
pub use repository::{Customer, CustomerRepository, RepositoryError};
