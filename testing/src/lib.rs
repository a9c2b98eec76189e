//! # Eventing Testing
//!
//! Test doubles for the eventing workspace.
//!
//! This crate provides:
//! - Deterministic clocks ([`mocks::FixedClock`], [`mocks::MockClock`])
//! - An in-memory event bus with acknowledgement tracking and failure injection
//! - An in-memory outbox store with lease-based claiming
//! - Fixture events and a tracing initializer for tests
//!
//! ## Example
//!
//! ```
//! use eventing_core::outbox::OutboxStore;
//! use eventing_testing::fixtures::CustomerCreated;
//! use eventing_testing::outbox::InMemoryOutboxStore;
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let store = InMemoryOutboxStore::new();
//! store.publish_event(&CustomerCreated::new("cust-123", "Alice")).unwrap();
//!
//! let claimed = store.claim_due(10, Duration::from_secs(30)).await.unwrap();
//! assert_eq!(claimed[0].envelope.resource_id, "cust-123");
//! # });
//! ```

use chrono::{DateTime, Utc};
use eventing_core::environment::Clock;

/// In-memory event bus
pub mod event_bus;

/// Fixture events
pub mod fixtures;

/// In-memory outbox store
pub mod outbox;

pub use event_bus::InMemoryEventBus;
pub use outbox::InMemoryOutboxStore;

/// Mock implementations of Environment traits
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use std::sync::{Mutex, PoisonError};
    use std::time::Duration;

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use eventing_testing::mocks::FixedClock;
    /// use eventing_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2); // Always the same!
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }

    /// Clock that only moves when told to.
    ///
    /// Used to step through retry schedules without sleeping.
    ///
    /// ```
    /// use eventing_testing::mocks::MockClock;
    /// use eventing_core::environment::Clock;
    /// use chrono::Utc;
    /// use std::time::Duration;
    ///
    /// let clock = MockClock::new(Utc::now());
    /// let before = clock.now();
    /// clock.advance(Duration::from_secs(5));
    /// assert_eq!((clock.now() - before).num_seconds(), 5);
    /// ```
    #[derive(Debug)]
    pub struct MockClock {
        time: Mutex<DateTime<Utc>>,
    }

    impl MockClock {
        /// Start the clock at `time`.
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Mutex::new(time),
            }
        }

        /// Move the clock forward.
        pub fn advance(&self, by: Duration) {
            let by = chrono::TimeDelta::from_std(by).unwrap_or(chrono::TimeDelta::MAX);
            let mut time = self.time.lock().unwrap_or_else(PoisonError::into_inner);
            *time = time.checked_add_signed(by).unwrap_or(DateTime::<Utc>::MAX_UTC);
        }

        /// Jump to `time`.
        pub fn set(&self, time: DateTime<Utc>) {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner) = time;
        }
    }

    impl Clock for MockClock {
        fn now(&self) -> DateTime<Utc> {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }
}

/// Install a test subscriber that honours `RUST_LOG`.
///
/// Safe to call from every test; only the first call installs anything.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}
