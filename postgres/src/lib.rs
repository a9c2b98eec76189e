//! `PostgreSQL` storage for the event core.
//!
//! This crate provides the relational side of the pipeline:
//!
//! - [`PostgresOutbox`]: transactional outbox writes and the relay's
//!   `FOR UPDATE SKIP LOCKED` claim query
//! - [`PostgresDeadLetterQueue`]: the `failed_events` table, with a resolution
//!   workflow and reprocessing
//! - [`schema::migrate`]: idempotent DDL for both tables
//!
//! # Example
//!
//! ```ignore
//! use eventing_postgres::{PostgresDeadLetterQueue, PostgresOutbox, schema};
//!
//! let pool = sqlx::PgPool::connect("postgres://localhost/shop").await?;
//! schema::migrate(&pool).await?;
//!
//! let outbox = PostgresOutbox::new(pool.clone());
//! let dead_letters = PostgresDeadLetterQueue::new(pool);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Dead letter table
pub mod dead_letter;

/// Transactional outbox
pub mod outbox;

/// Schema bootstrap
pub mod schema;

pub use dead_letter::{DLQStatus, FailedEvent, PostgresDeadLetterQueue};
pub use outbox::PostgresOutbox;
