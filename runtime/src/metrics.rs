//! Prometheus metrics for the event pipeline.
//!
//! Metric names are described here once; the components record them through the
//! small recorder types below (or the `metrics` macros directly):
//! - Outbox relay (claims, publishes, backlog)
//! - Dispatcher (received, acknowledged, retried, dead-lettered)
//! - Handlers (invocations, latency; recorded in `eventing-core`)
//! - Dead-letter queue size
//!
//! # Example
//!
//! ```rust,no_run
//! use eventing_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Start metrics server on port 9090
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! // Metrics available at http://localhost:9090/metrics
//! # Ok(())
//! # }
//! ```

use eventing_core::dead_letter::FailureStage;
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

// Re-export metrics macros for use in other modules
pub use metrics::{counter, gauge, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics server.
///
/// Installs the global recorder and serves `/metrics` on `addr` for scraping.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server.
    ///
    /// # Arguments
    ///
    /// * `addr` - Socket address to bind to (e.g., `0.0.0.0:9090`)
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Install the recorder and spawn the HTTP exporter on the current Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::Build`] if the exporter cannot be configured or bound.
    ///
    /// # Note
    ///
    /// If a recorder is already installed (e.g., by another test), the existing one is
    /// kept and this server has no handle.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let (recorder, exporter) = PrometheusBuilder::new()
            .with_http_listener(self.addr)
            // Histogram buckets for latency measurements
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        let handle = recorder.handle();
        if metrics::set_global_recorder(recorder).is_err() {
            tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
            return Ok(());
        }

        tokio::spawn(async move {
            // ExporterError has no Debug impl
            if exporter.await.is_err() {
                tracing::error!("Metrics exporter stopped");
            }
        });

        self.handle = Some(handle);
        tracing::info!(
            addr = %self.addr,
            "Metrics server started - available at http://{}/metrics",
            self.addr
        );
        Ok(())
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if this server did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Describe every metric the pipeline emits.
pub fn register_metrics() {
    // Handler metrics
    describe_counter!(
        "eventing_handler_invocations_total",
        "Handler invocations by event type and outcome"
    );
    describe_counter!(
        "eventing_handler_validation_failures_total",
        "Envelopes rejected by structural validation"
    );
    describe_histogram!(
        "eventing_handler_duration_seconds",
        "Time spent in business handlers"
    );

    // Dispatcher metrics
    describe_counter!(
        "eventing_dispatcher_received_total",
        "Deliveries received from the event bus"
    );
    describe_counter!(
        "eventing_dispatcher_acknowledged_total",
        "Deliveries acknowledged after processing"
    );
    describe_counter!(
        "eventing_dispatcher_retries_total",
        "Handler retries after recoverable failures"
    );
    describe_counter!(
        "eventing_dispatcher_dead_lettered_total",
        "Deliveries dead-lettered, by failure stage"
    );
    describe_counter!(
        "eventing_dispatcher_unacknowledged_total",
        "Deliveries left unacknowledged for redelivery"
    );

    // Outbox relay metrics
    describe_counter!(
        "eventing_outbox_claimed_total",
        "Outbox records claimed by the relay"
    );
    describe_counter!(
        "eventing_outbox_published_total",
        "Outbox records published to the event bus"
    );
    describe_counter!(
        "eventing_outbox_publish_failures_total",
        "Failed publish attempts"
    );
    describe_counter!(
        "eventing_outbox_dead_lettered_total",
        "Outbox records given up after too many failed publishes"
    );
    describe_gauge!("eventing_outbox_pending", "Pending outbox records");
    describe_histogram!(
        "eventing_outbox_publish_duration_seconds",
        "Time taken to publish one outbox record"
    );

    // Dead-letter metrics
    describe_gauge!(
        "eventing_dead_letter_queue_size",
        "Dead letters held in memory"
    );
    describe_counter!(
        "eventing_dead_letters_recorded_total",
        "Dead letters written to a sink"
    );
}

/// Dispatcher metrics recorder.
pub struct DispatcherMetrics;

impl DispatcherMetrics {
    /// Record a delivery received from the bus.
    pub fn record_received(topic: &str) {
        counter!("eventing_dispatcher_received_total", "topic" => topic.to_string()).increment(1);
    }

    /// Record an acknowledged delivery.
    pub fn record_acknowledged(topic: &str) {
        counter!("eventing_dispatcher_acknowledged_total", "topic" => topic.to_string())
            .increment(1);
    }

    /// Record a retry of a recoverable failure.
    pub fn record_retry(event_type: &str) {
        counter!("eventing_dispatcher_retries_total", "event_type" => event_type.to_string())
            .increment(1);
    }

    /// Record a dead-lettered delivery.
    pub fn record_dead_lettered(topic: &str, stage: FailureStage) {
        counter!(
            "eventing_dispatcher_dead_lettered_total",
            "topic" => topic.to_string(),
            "stage" => stage.as_str()
        )
        .increment(1);
    }

    /// Record a delivery left for redelivery.
    pub fn record_unacknowledged(topic: &str) {
        counter!("eventing_dispatcher_unacknowledged_total", "topic" => topic.to_string())
            .increment(1);
    }
}

/// Outbox relay metrics recorder.
pub struct RelayMetrics;

impl RelayMetrics {
    /// Record a claimed batch.
    pub fn record_claimed(count: usize) {
        counter!("eventing_outbox_claimed_total").increment(count as u64);
    }

    /// Record a successful publish.
    pub fn record_published(topic: &str, duration: Duration) {
        counter!("eventing_outbox_published_total", "topic" => topic.to_string()).increment(1);
        histogram!("eventing_outbox_publish_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a failed publish.
    pub fn record_failure(topic: &str) {
        counter!("eventing_outbox_publish_failures_total", "topic" => topic.to_string())
            .increment(1);
    }

    /// Record a record given up on.
    pub fn record_dead_lettered(topic: &str) {
        counter!("eventing_outbox_dead_lettered_total", "topic" => topic.to_string()).increment(1);
    }

    /// Record the outbox backlog.
    pub fn record_pending(pending: u64) {
        #[allow(clippy::cast_precision_loss)] // Backlog sizes are far below 2^52
        gauge!("eventing_outbox_pending").set(pending as f64);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can use unwrap
mod tests {
    use super::*;

    #[test]
    fn server_has_no_handle_before_start() {
        let server = MetricsServer::new("127.0.0.1:0".parse().unwrap());
        assert!(server.handle().is_none());
        assert!(server.render().is_none());
    }

    #[test]
    fn recorders_work_without_an_installed_exporter() {
        register_metrics();
        DispatcherMetrics::record_received("customer-events");
        DispatcherMetrics::record_dead_lettered("customer-events", FailureStage::Validation);
        RelayMetrics::record_published("customer-events", Duration::from_millis(3));
        RelayMetrics::record_pending(7);
    }
}
