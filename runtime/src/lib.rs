//! # Eventing Runtime
//!
//! Background machinery that moves events through the pipeline.
//!
//! ## Core Components
//!
//! - **Outbox relay**: Publishes committed outbox records to the event bus
//! - **Dispatcher**: Subscribes to the bus and runs registered handlers with
//!   per-resource ordering, retries and dead-lettering
//! - **Retry**: Exponential backoff policy and the per-message `Backoff` state machine
//! - **Dead letters**: Bounded in-memory dead-letter queue
//! - **Health / metrics**: Health reports and the Prometheus exporter
//!
//! ## Example
//!
//! ```ignore
//! use eventing_runtime::dispatcher::{Dispatcher, DispatcherConfig};
//! use eventing_runtime::relay::{OutboxRelay, RelayConfig};
//!
//! let relay = OutboxRelay::new(store, Arc::clone(&bus), RelayConfig::default()).spawn();
//! let dispatcher = Dispatcher::new(registry, bus, dead_letters, DispatcherConfig::default())
//!     .spawn()?;
//!
//! // ... on shutdown
//! dispatcher.shutdown(Duration::from_secs(30)).await?;
//! relay.shutdown(Duration::from_secs(30)).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// In-memory dead letter queue
pub mod dead_letter;

/// Event dispatcher (reader + worker pool)
pub mod dispatcher;

/// Health checks and reports
pub mod health;

/// Prometheus metrics for observability
pub mod metrics;

/// Outbox relay
pub mod relay;

/// Retry logic with exponential backoff
pub mod retry;

/// Shutdown signalling
pub mod shutdown;

pub use dead_letter::InMemoryDeadLetterQueue;
pub use dispatcher::{
    DispatchOutcome, Dispatcher, DispatcherConfig, DispatcherError, DispatcherHandle,
    DispatcherStats, ShutdownReport, StatsSnapshot,
};
pub use health::{HealthCheck, HealthReport, HealthStatus};
pub use relay::{OutboxRelay, RelayConfig, RelayError, RelayHandle, RelayReport};
pub use retry::{Backoff, RetryDecision, RetryPolicy};
