//! Event dispatcher: reads deliveries from the bus and runs them through the registry.
//!
//! # Per-message state machine
//!
//! ```text
//! received ─▶ decoded ─▶ validated ─▶ handled ─┬─▶ acknowledged
//!    │           │           │           │     │
//!    │           │           │           │     └─▶ retried (recoverable, with backoff)
//!    └───────────┴───────────┴───────────┴──────▶ dead-lettered, then acknowledged
//! ```
//!
//! # Concurrency
//!
//! The reader task routes each delivery to one of `workers` bounded queues by a
//! stable hash of its partition key. Events about one resource therefore always land
//! on the same worker and are handled in order; different resources run in
//! parallel. A worker finishes one message before pulling the next.
//!
//! # Shutdown
//!
//! [`DispatcherHandle::shutdown`] stops the reader, lets each worker finish the
//! message it is working on, and drops whatever is still queued without
//! acknowledging it (the broker redelivers it later). Workers still running at the
//! grace deadline are aborted.

use crate::metrics::DispatcherMetrics;
use crate::retry::{Backoff, RetryDecision, RetryPolicy};
use crate::shutdown::{deadline_after, join_until, wait_for_shutdown};
use eventing_core::dead_letter::{DeadLetter, DeadLetterSink, FailureStage};
use eventing_core::environment::{Clock, SystemClock};
use eventing_core::error::ProcessingError;
use eventing_core::event::EventEnvelope;
use eventing_core::event_bus::{Delivery, EventBus};
use eventing_core::handler::{HandlerContext, handle_event_with_validation};
use eventing_core::partition::partition_for;
use eventing_core::registry::{DecodeError, EventRegistry};
use futures::StreamExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;

/// Errors from starting or stopping a dispatcher.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatcherError {
    /// The registry has no event types, so there is nothing to subscribe to.
    #[error("Dispatcher has no registered event types")]
    NoTopics,

    /// Some tasks were still running at the grace deadline and were aborted.
    #[error("Dispatcher shutdown timed out; {aborted} task(s) aborted")]
    ShutdownTimeout {
        /// Number of aborted tasks
        aborted: usize,
    },
}

/// Dispatcher configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatcherConfig {
    /// Name used in logs
    pub name: String,
    /// Number of parallel workers
    pub workers: usize,
    /// Capacity of each worker's queue
    pub queue_capacity: usize,
    /// Retry policy for recoverable handler failures
    pub retry: RetryPolicy,
    /// Delay before resubscribing after the stream ends or subscription fails
    pub resubscribe_delay: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            name: "dispatcher".to_string(),
            workers: 4,
            queue_capacity: 64,
            retry: RetryPolicy::default(),
            resubscribe_delay: Duration::from_secs(5),
        }
    }
}

impl DispatcherConfig {
    /// Set the name used in logs.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the number of workers (at least 1).
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Set the per-worker queue capacity (at least 1).
    #[must_use]
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    /// Set the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the resubscribe delay.
    #[must_use]
    pub const fn with_resubscribe_delay(mut self, delay: Duration) -> Self {
        self.resubscribe_delay = delay;
        self
    }
}

/// What happened to one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Handled and acknowledged.
    Acknowledged {
        /// Handler attempts made (1 = no retry)
        attempts: u32,
    },
    /// Recorded in the dead-letter sink and acknowledged.
    DeadLettered {
        /// Where processing failed
        stage: FailureStage,
        /// Handler attempts made (0 when no handler ran)
        attempts: u32,
    },
    /// Left unacknowledged; the broker will redeliver it.
    Unacknowledged {
        /// Why it was not acknowledged
        reason: String,
    },
}

/// Dispatcher counters.
#[derive(Debug, Default)]
pub struct DispatcherStats {
    received: AtomicU64,
    acknowledged: AtomicU64,
    retries: AtomicU64,
    dead_lettered: AtomicU64,
    unacknowledged: AtomicU64,
}

/// Point-in-time copy of [`DispatcherStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Deliveries received
    pub received: u64,
    /// Deliveries acknowledged after successful handling
    pub acknowledged: u64,
    /// Handler retries
    pub retries: u64,
    /// Deliveries dead-lettered
    pub dead_lettered: u64,
    /// Deliveries left for redelivery
    pub unacknowledged: u64,
}

impl DispatcherStats {
    /// Deliveries received.
    #[must_use]
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    /// Deliveries acknowledged after successful handling.
    #[must_use]
    pub fn acknowledged(&self) -> u64 {
        self.acknowledged.load(Ordering::Relaxed)
    }

    /// Handler retries.
    #[must_use]
    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    /// Deliveries dead-lettered.
    #[must_use]
    pub fn dead_lettered(&self) -> u64 {
        self.dead_lettered.load(Ordering::Relaxed)
    }

    /// Deliveries left for redelivery.
    #[must_use]
    pub fn unacknowledged(&self) -> u64 {
        self.unacknowledged.load(Ordering::Relaxed)
    }

    /// Copy all counters.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received(),
            acknowledged: self.acknowledged(),
            retries: self.retries(),
            dead_lettered: self.dead_lettered(),
            unacknowledged: self.unacknowledged(),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Result of a clean shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Counters at the time the last task stopped
    pub stats: StatsSnapshot,
}

/// Reads deliveries, decodes them through the registry and runs the handlers.
///
/// Cheap to clone; clones share the registry, sinks and counters.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<EventRegistry>,
    bus: Arc<dyn EventBus>,
    dead_letters: Arc<dyn DeadLetterSink>,
    clock: Arc<dyn Clock>,
    config: DispatcherConfig,
    stats: Arc<DispatcherStats>,
}

impl Dispatcher {
    /// Create a dispatcher.
    #[must_use]
    pub fn new(
        registry: Arc<EventRegistry>,
        bus: Arc<dyn EventBus>,
        dead_letters: Arc<dyn DeadLetterSink>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            registry,
            bus,
            dead_letters,
            clock: Arc::new(SystemClock),
            config,
            stats: Arc::new(DispatcherStats::default()),
        }
    }

    /// Use `clock` for dead-letter timestamps.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Counters shared by all clones of this dispatcher.
    #[must_use]
    pub fn stats(&self) -> &DispatcherStats {
        &self.stats
    }

    /// Topics the dispatcher subscribes to.
    #[must_use]
    pub fn topics(&self) -> Vec<&'static str> {
        self.registry.topics()
    }

    /// Process one delivery to completion.
    ///
    /// Recoverable failures and dead letter writes are retried in place with backoff,
    /// so this can take as long as the retry policy allows. A dead letter the sink
    /// still rejects after the policy's attempts leaves the delivery unacknowledged.
    pub async fn process(&self, delivery: Delivery) -> DispatchOutcome {
        self.process_until(delivery, None).await
    }

    async fn process_until(
        &self,
        delivery: Delivery,
        mut shutdown: Option<&mut watch::Receiver<bool>>,
    ) -> DispatchOutcome {
        DispatcherStats::bump(&self.stats.received);
        DispatcherMetrics::record_received(&delivery.topic);

        let envelope = match EventEnvelope::from_bytes(&delivery.payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                let error = ProcessingError::Decode(DecodeError::MalformedEnvelope(err.to_string()));
                return self
                    .dead_letter(delivery, None, &error, FailureStage::Decode, 0, shutdown)
                    .await;
            }
        };

        let decoded = match self.registry.decode(&envelope) {
            Ok(decoded) => decoded,
            Err(err) => {
                let error = ProcessingError::Decode(err);
                let stage = error.failure_stage();
                return self
                    .dead_letter(delivery, Some(&envelope), &error, stage, 0, shutdown)
                    .await;
            }
        };

        let expected_topic = self
            .registry
            .expected_topic(&envelope.event_type)
            .unwrap_or(envelope.topic.as_str());

        let mut backoff = Backoff::new(self.config.retry.clone());
        loop {
            let attempt = backoff.begin_attempt();
            let ctx = HandlerContext::from_envelope(&envelope, attempt);
            let result = handle_event_with_validation(&envelope, expected_topic, || {
                self.registry.dispatch(&decoded, &ctx)
            })
            .await;

            let error = match result {
                Ok(()) => return self.acknowledge(delivery, attempt).await,
                Err(error) => error,
            };

            if !error.is_retryable() {
                let stage = error.failure_stage();
                let attempts = if stage == FailureStage::Validation { 0 } else { attempt };
                return self
                    .dead_letter(delivery, Some(&envelope), &error, stage, attempts, shutdown)
                    .await;
            }

            match backoff.next_decision() {
                RetryDecision::RetryAfter(delay) => {
                    DispatcherStats::bump(&self.stats.retries);
                    DispatcherMetrics::record_retry(&envelope.event_type);
                    tracing::warn!(
                        dispatcher = %self.config.name,
                        event_id = %envelope.id,
                        event_type = %envelope.event_type,
                        resource_id = %envelope.resource_id,
                        attempt,
                        delay_ms = delay.as_millis(),
                        error = %error,
                        "Handler failed, retrying"
                    );
                    if !backoff_sleep(delay, shutdown.as_deref_mut()).await {
                        return self.leave_unacknowledged(
                            &delivery,
                            "shutdown requested during retry backoff",
                        );
                    }
                }
                RetryDecision::Exhausted => {
                    return self
                        .dead_letter(
                            delivery,
                            Some(&envelope),
                            &error,
                            FailureStage::RetriesExhausted,
                            attempt,
                            shutdown,
                        )
                        .await;
                }
            }
        }
    }

    async fn acknowledge(&self, delivery: Delivery, attempts: u32) -> DispatchOutcome {
        let topic = delivery.topic.clone();
        let (partition, offset) = (delivery.partition, delivery.offset);
        match delivery.ack().await {
            Ok(()) => {
                DispatcherStats::bump(&self.stats.acknowledged);
                DispatcherMetrics::record_acknowledged(&topic);
                DispatchOutcome::Acknowledged { attempts }
            }
            Err(err) => {
                DispatcherStats::bump(&self.stats.unacknowledged);
                DispatcherMetrics::record_unacknowledged(&topic);
                tracing::warn!(
                    dispatcher = %self.config.name,
                    topic = %topic,
                    partition,
                    offset,
                    error = %err,
                    "Failed to acknowledge delivery; it will be redelivered"
                );
                DispatchOutcome::Unacknowledged {
                    reason: err.to_string(),
                }
            }
        }
    }

    async fn dead_letter(
        &self,
        delivery: Delivery,
        envelope: Option<&EventEnvelope>,
        error: &ProcessingError,
        stage: FailureStage,
        attempts: u32,
        mut shutdown: Option<&mut watch::Receiver<bool>>,
    ) -> DispatchOutcome {
        tracing::error!(
            dispatcher = %self.config.name,
            topic = %delivery.topic,
            partition = delivery.partition,
            offset = delivery.offset,
            key = ?delivery.key,
            event_id = ?envelope.map(|e| e.id),
            event_type = ?envelope.map(|e| e.event_type.as_str()),
            resource_id = ?envelope.map(|e| e.resource_id.as_str()),
            stage = %stage,
            attempts,
            error = %error,
            "Dead-lettering message"
        );

        let letter = DeadLetter::from_delivery(
            &delivery,
            envelope,
            stage,
            error.to_string(),
            attempts,
            self.clock.now(),
        );
        // The bus will not hand this delivery out again while the subscription lives,
        // so a running worker holds it until the sink takes it
        let mut backoff = Backoff::new(self.config.retry.clone());
        loop {
            let attempt = backoff.begin_attempt();
            let Err(err) = self.dead_letters.record(letter.clone()).await else {
                break;
            };

            let delay = match backoff.next_decision() {
                RetryDecision::RetryAfter(delay) => delay,
                RetryDecision::Exhausted if shutdown.is_some() => self.config.retry.max_delay,
                RetryDecision::Exhausted => {
                    tracing::error!(
                        dispatcher = %self.config.name,
                        topic = %delivery.topic,
                        offset = delivery.offset,
                        attempt,
                        error = %err,
                        "Dead letter sink rejected message"
                    );
                    return self.leave_unacknowledged(&delivery, &err.to_string());
                }
            };
            tracing::warn!(
                dispatcher = %self.config.name,
                topic = %delivery.topic,
                offset = delivery.offset,
                attempt,
                delay_ms = delay.as_millis(),
                error = %err,
                "Dead letter sink rejected message, retrying"
            );
            if !backoff_sleep(delay, shutdown.as_deref_mut()).await {
                return self.leave_unacknowledged(
                    &delivery,
                    "shutdown requested while the dead letter sink was failing",
                );
            }
        }

        DispatcherStats::bump(&self.stats.dead_lettered);
        DispatcherMetrics::record_dead_lettered(&delivery.topic, stage);

        let topic = delivery.topic.clone();
        if let Err(err) = delivery.ack().await {
            // Recorded already; a redelivery produces a second dead letter
            tracing::warn!(
                dispatcher = %self.config.name,
                topic = %topic,
                error = %err,
                "Failed to acknowledge dead-lettered delivery"
            );
        }
        DispatchOutcome::DeadLettered { stage, attempts }
    }

    fn leave_unacknowledged(&self, delivery: &Delivery, reason: &str) -> DispatchOutcome {
        DispatcherStats::bump(&self.stats.unacknowledged);
        DispatcherMetrics::record_unacknowledged(&delivery.topic);
        tracing::warn!(
            dispatcher = %self.config.name,
            topic = %delivery.topic,
            partition = delivery.partition,
            offset = delivery.offset,
            reason,
            "Leaving delivery unacknowledged"
        );
        DispatchOutcome::Unacknowledged {
            reason: reason.to_string(),
        }
    }

    /// Start the reader and worker tasks.
    ///
    /// # Errors
    ///
    /// Returns [`DispatcherError::NoTopics`] if the registry is empty.
    pub fn spawn(self) -> Result<DispatcherHandle, DispatcherError> {
        let topics: Vec<String> = self.topics().into_iter().map(str::to_string).collect();
        if topics.is_empty() {
            return Err(DispatcherError::NoTopics);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker_count = self.config.workers.max(1);
        let capacity = self.config.queue_capacity.max(1);

        let mut queues = Vec::with_capacity(worker_count);
        let mut workers = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            let (tx, rx) = mpsc::channel(capacity);
            queues.push(tx);
            workers.push(tokio::spawn(self.clone().worker_loop(
                index,
                rx,
                shutdown_rx.clone(),
            )));
        }

        let stats = Arc::clone(&self.stats);
        let reader = tokio::spawn(self.read_loop(topics, queues, shutdown_rx));

        Ok(DispatcherHandle {
            shutdown: shutdown_tx,
            reader,
            workers,
            stats,
        })
    }

    /// Subscribe-route-resubscribe loop.
    async fn read_loop(
        self,
        topics: Vec<String>,
        queues: Vec<mpsc::Sender<Delivery>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let name = self.config.name.clone();
        let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
        tracing::info!(dispatcher = %name, topics = ?topics, workers = queues.len(), "Dispatcher started");

        'subscribe: loop {
            let subscription = tokio::select! {
                biased;
                () = wait_for_shutdown(&mut shutdown) => break 'subscribe,
                result = self.bus.subscribe(&topic_refs) => result,
            };

            match subscription {
                Ok(mut stream) => {
                    tracing::info!(dispatcher = %name, topics = ?topics, "Subscribed to event bus");
                    loop {
                        let next = tokio::select! {
                            biased;
                            () = wait_for_shutdown(&mut shutdown) => break 'subscribe,
                            next = stream.next() => next,
                        };

                        match next {
                            Some(Ok(delivery)) => {
                                let slot = partition_for(delivery.routing_key(), queues.len());
                                let Some(queue) = queues.get(slot) else {
                                    break 'subscribe;
                                };
                                let sent = tokio::select! {
                                    biased;
                                    () = wait_for_shutdown(&mut shutdown) => break 'subscribe,
                                    sent = queue.send(delivery) => sent,
                                };
                                if sent.is_err() {
                                    tracing::error!(dispatcher = %name, worker = slot, "Worker queue closed");
                                    break 'subscribe;
                                }
                            }
                            Some(Err(err)) => {
                                tracing::error!(dispatcher = %name, error = %err, "Error receiving from event bus");
                            }
                            None => {
                                tracing::warn!(dispatcher = %name, "Event stream ended");
                                break;
                            }
                        }
                    }
                }
                Err(err) => {
                    tracing::error!(
                        dispatcher = %name,
                        error = %err,
                        "Failed to subscribe to event bus, retrying in {:?}",
                        self.config.resubscribe_delay
                    );
                }
            }

            tokio::select! {
                biased;
                () = wait_for_shutdown(&mut shutdown) => break 'subscribe,
                () = sleep(self.config.resubscribe_delay) => {}
            }
        }

        tracing::info!(dispatcher = %name, "Dispatcher reader stopped");
    }

    async fn worker_loop(
        self,
        index: usize,
        mut queue: mpsc::Receiver<Delivery>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut retry_shutdown = shutdown.clone();
        loop {
            let next = tokio::select! {
                biased;
                () = wait_for_shutdown(&mut shutdown) => None,
                next = queue.recv() => next,
            };
            let Some(delivery) = next else { break };
            self.process_until(delivery, Some(&mut retry_shutdown)).await;
        }

        queue.close();
        let mut dropped = 0_usize;
        while queue.try_recv().is_ok() {
            dropped += 1;
        }
        tracing::info!(
            dispatcher = %self.config.name,
            worker = index,
            dropped,
            "Dispatcher worker stopped"
        );
    }
}

/// Handle to a running dispatcher.
///
/// Dropping the handle also stops the dispatcher, without waiting.
pub struct DispatcherHandle {
    shutdown: watch::Sender<bool>,
    reader: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
    stats: Arc<DispatcherStats>,
}

impl DispatcherHandle {
    /// Live counters.
    #[must_use]
    pub fn stats(&self) -> &DispatcherStats {
        &self.stats
    }

    /// Stop reading, finish in-flight messages, and wait up to `grace`.
    ///
    /// # Errors
    ///
    /// Returns [`DispatcherError::ShutdownTimeout`] if tasks had to be aborted.
    pub async fn shutdown(self, grace: Duration) -> Result<ShutdownReport, DispatcherError> {
        self.shutdown.send_replace(true);
        let deadline = deadline_after(grace);
        let aborted = join_until(std::iter::once(self.reader).chain(self.workers), deadline).await;

        let stats = self.stats.snapshot();
        if aborted > 0 {
            tracing::warn!(aborted, "Dispatcher shutdown timed out");
            return Err(DispatcherError::ShutdownTimeout { aborted });
        }
        tracing::info!(
            received = stats.received,
            acknowledged = stats.acknowledged,
            dead_lettered = stats.dead_lettered,
            "Dispatcher stopped"
        );
        Ok(ShutdownReport { stats })
    }
}

/// Sleep for `delay`; returns `false` if shutdown was requested first.
async fn backoff_sleep(delay: Duration, shutdown: Option<&mut watch::Receiver<bool>>) -> bool {
    match shutdown {
        Some(shutdown) => tokio::select! {
            biased;
            () = wait_for_shutdown(shutdown) => false,
            () = sleep(delay) => true,
        },
        None => {
            sleep(delay).await;
            true
        }
    }
}
