//! Outbox relay: moves committed outbox records onto the event bus.
//!
//! The relay claims a batch of due records, publishes each one keyed by its resource
//! id, and marks it published only once the bus accepted it. Failed publishes are
//! rescheduled with exponential backoff until `retry.max_attempts` is reached, after
//! which the record is dead-lettered in the store.
//!
//! Several relay instances may drain one store: claims are leases, so a record is
//! published by one relay at a time and a crashed relay's records become due again
//! when the lease expires. Delivery is at-least-once.
//!
//! Records of one resource reach the bus in write order: the store only hands out
//! the oldest pending record of each resource, and a resource whose record failed
//! publishes nothing more in that pass.

use crate::metrics::RelayMetrics;
use crate::retry::RetryPolicy;
use crate::shutdown::{deadline_after, join_until, wait_for_shutdown};
use chrono::{DateTime, TimeDelta, Utc};
use eventing_core::environment::{Clock, SystemClock};
use eventing_core::event_bus::EventBus;
use eventing_core::outbox::{OutboxError, OutboxRecord, OutboxStore};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;

/// Errors from a relay pass.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// The outbox store failed; the pass was cut short.
    #[error(transparent)]
    Store(#[from] OutboxError),

    /// The relay task did not stop before the grace deadline and was aborted.
    #[error("Outbox relay shutdown timed out")]
    ShutdownTimeout,
}

/// Relay configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayConfig {
    /// Name used in logs
    pub name: String,
    /// Maximum records claimed per pass
    pub batch_size: usize,
    /// Wait between passes when the outbox is drained
    pub poll_interval: Duration,
    /// How long a claim is held before another relay may take the record
    pub lease: Duration,
    /// Backoff between failed publishes and the attempt limit
    pub retry: RetryPolicy,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            name: "outbox-relay".to_string(),
            batch_size: 100,
            poll_interval: Duration::from_millis(500),
            lease: Duration::from_secs(30),
            retry: RetryPolicy::builder()
                .max_attempts(10)
                .initial_delay(Duration::from_secs(1))
                .max_delay(Duration::from_secs(300))
                .build(),
        }
    }
}

impl RelayConfig {
    /// Set the name used in logs.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the batch size (at least 1).
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Set the poll interval.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the claim lease.
    #[must_use]
    pub const fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    /// Set the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Summary of one relay pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayReport {
    /// Records claimed
    pub claimed: usize,
    /// Records accepted by the bus
    pub published: usize,
    /// Records rescheduled after a failed publish
    pub retried: usize,
    /// Records given up on
    pub dead_lettered: usize,
}

impl RelayReport {
    /// Whether the pass found nothing to do.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.claimed == 0
    }
}

/// Background publisher for the transactional outbox.
#[derive(Clone)]
pub struct OutboxRelay {
    store: Arc<dyn OutboxStore>,
    bus: Arc<dyn EventBus>,
    clock: Arc<dyn Clock>,
    config: RelayConfig,
}

impl OutboxRelay {
    /// Create a relay.
    #[must_use]
    pub fn new(store: Arc<dyn OutboxStore>, bus: Arc<dyn EventBus>, config: RelayConfig) -> Self {
        Self {
            store,
            bus,
            clock: Arc::new(SystemClock),
            config,
        }
    }

    /// Use `clock` to schedule retries.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Claim one batch and publish it.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Store`] if the store fails. Records already processed in
    /// this pass keep their new state; the rest are picked up again once their lease
    /// expires.
    pub async fn run_once(&self) -> Result<RelayReport, RelayError> {
        let records = self
            .store
            .claim_due(self.config.batch_size, self.config.lease)
            .await?;

        let mut report = RelayReport {
            claimed: records.len(),
            ..RelayReport::default()
        };
        if records.is_empty() {
            return Ok(report);
        }
        RelayMetrics::record_claimed(records.len());

        // A resource whose record failed keeps its later records until the next pass
        let mut blocked: HashSet<String> = HashSet::new();
        for record in records {
            if blocked.contains(&record.envelope.resource_id) {
                tracing::debug!(
                    relay = %self.config.name,
                    event_id = %record.id,
                    resource_id = %record.envelope.resource_id,
                    "Holding back outbox record behind a failed one"
                );
                continue;
            }
            match self.publish(&record).await {
                Ok(()) => {
                    self.store.mark_published(record.id).await?;
                    report.published += 1;
                }
                Err(reason) => {
                    blocked.insert(record.envelope.resource_id.clone());
                    let failures = record.attempts.saturating_add(1);
                    RelayMetrics::record_failure(&record.envelope.topic);

                    if failures >= self.config.retry.max_attempts {
                        tracing::error!(
                            relay = %self.config.name,
                            event_id = %record.id,
                            event_type = %record.envelope.event_type,
                            topic = %record.envelope.topic,
                            attempts = failures,
                            error = %reason,
                            "Giving up on outbox record"
                        );
                        self.store.mark_dead_lettered(record.id, reason).await?;
                        RelayMetrics::record_dead_lettered(&record.envelope.topic);
                        report.dead_lettered += 1;
                    } else {
                        let next_attempt_at = self.next_attempt_at(failures);
                        tracing::warn!(
                            relay = %self.config.name,
                            event_id = %record.id,
                            topic = %record.envelope.topic,
                            attempts = failures,
                            next_attempt_at = %next_attempt_at,
                            error = %reason,
                            "Publish failed, rescheduling outbox record"
                        );
                        self.store
                            .mark_failed(record.id, reason, next_attempt_at)
                            .await?;
                        report.retried += 1;
                    }
                }
            }
        }

        match self.store.pending_count().await {
            Ok(pending) => RelayMetrics::record_pending(pending),
            Err(err) => tracing::warn!(relay = %self.config.name, error = %err, "Failed to count pending records"),
        }

        tracing::debug!(
            relay = %self.config.name,
            claimed = report.claimed,
            published = report.published,
            retried = report.retried,
            dead_lettered = report.dead_lettered,
            "Outbox relay pass finished"
        );
        Ok(report)
    }

    async fn publish(&self, record: &OutboxRecord) -> Result<(), String> {
        let envelope = &record.envelope;
        let bytes = envelope.to_bytes().map_err(|err| err.to_string())?;

        let started = Instant::now();
        self.bus
            .publish(&envelope.topic, &envelope.resource_id, &bytes)
            .await
            .map_err(|err| err.to_string())?;

        RelayMetrics::record_published(&envelope.topic, started.elapsed());
        tracing::debug!(
            relay = %self.config.name,
            event_id = %envelope.id,
            event_type = %envelope.event_type,
            topic = %envelope.topic,
            resource_id = %envelope.resource_id,
            "Published outbox record"
        );
        Ok(())
    }

    fn next_attempt_at(&self, failures: u32) -> DateTime<Utc> {
        let now = self.clock.now();
        let delay = TimeDelta::from_std(self.config.retry.delay_for_attempt(failures))
            .unwrap_or(TimeDelta::MAX);
        now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Run passes until `shutdown` fires.
    ///
    /// A pass that published something or claimed a full batch is followed
    /// immediately by another pass; otherwise the relay waits `poll_interval`. The pass in progress always completes before this returns.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            relay = %self.config.name,
            batch_size = self.config.batch_size,
            poll_interval_ms = self.config.poll_interval.as_millis(),
            "Outbox relay started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let drained = match self.run_once().await {
                // Later records of a resource become claimable once its head is out
                Ok(report) => report.published == 0 && report.claimed < self.config.batch_size,
                Err(err) => {
                    tracing::error!(relay = %self.config.name, error = %err, "Outbox relay pass failed");
                    true
                }
            };

            if drained {
                tokio::select! {
                    biased;
                    () = wait_for_shutdown(&mut shutdown) => break,
                    () = sleep(self.config.poll_interval) => {}
                }
            }
        }

        tracing::info!(relay = %self.config.name, "Outbox relay stopped");
    }

    /// Run the relay as a background task.
    #[must_use]
    pub fn spawn(self) -> RelayHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        RelayHandle {
            shutdown: shutdown_tx,
            task: tokio::spawn(self.run(shutdown_rx)),
        }
    }
}

/// Handle to a running relay. Dropping it stops the relay.
pub struct RelayHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl RelayHandle {
    /// Signal shutdown and wait up to `grace` for the current pass to finish.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::ShutdownTimeout`] if the task had to be aborted.
    pub async fn shutdown(self, grace: Duration) -> Result<(), RelayError> {
        self.shutdown.send_replace(true);
        if join_until([self.task], deadline_after(grace)).await > 0 {
            return Err(RelayError::ShutdownTimeout);
        }
        Ok(())
    }
}
