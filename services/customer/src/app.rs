//! Service lifecycle: start the relay and dispatcher, report health, shut down.
//!
//! Shutdown stops the outbox relay first (nothing new is published), then the
//! dispatcher, which finishes in-flight messages and leaves queued ones
//! unacknowledged for redelivery.

use crate::config::Config;
use crate::handlers::CustomerActivityHandler;
use eventing_core::dead_letter::DeadLetterSink;
use eventing_core::event_bus::EventBus;
use eventing_core::outbox::OutboxStore;
use eventing_core::registry::{EventRegistry, RegistryError};
use eventing_runtime::dispatcher::{Dispatcher, DispatcherError, DispatcherHandle, ShutdownReport};
use eventing_runtime::health::{HealthCheck, HealthReport};
use eventing_runtime::relay::{OutboxRelay, RelayError, RelayHandle};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors from starting or stopping the service.
#[derive(Error, Debug)]
pub enum AppError {
    /// Handler registration failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// The dispatcher could not start or stop cleanly.
    #[error(transparent)]
    Dispatcher(#[from] DispatcherError),

    /// The relay did not stop within the grace period.
    #[error(transparent)]
    Relay(#[from] RelayError),
}

/// The backends the service runs against.
#[derive(Clone)]
pub struct Backends {
    /// Outbox drained by the relay
    pub outbox: Arc<dyn OutboxStore>,
    /// Broker for publishing and subscribing
    pub bus: Arc<dyn EventBus>,
    /// Where the dispatcher puts messages it gives up on
    pub dead_letters: Arc<dyn DeadLetterSink>,
}

/// Registry with every customer handler.
///
/// # Errors
///
/// Returns [`RegistryError`] if a customer event type is registered twice.
pub fn build_registry(handler: &CustomerActivityHandler) -> Result<EventRegistry, RegistryError> {
    let mut registry = EventRegistry::new();
    handler.register(&mut registry)?;
    Ok(registry)
}

/// A running customer service.
pub struct CustomerService {
    relay: RelayHandle,
    dispatcher: DispatcherHandle,
    activity: CustomerActivityHandler,
    outbox: Arc<dyn OutboxStore>,
}

impl CustomerService {
    /// Register the handlers and spawn the relay and dispatcher.
    ///
    /// # Errors
    ///
    /// Returns [`AppError`] if registration fails or the dispatcher cannot start.
    pub fn start(backends: Backends, config: &Config) -> Result<Self, AppError> {
        let activity = CustomerActivityHandler::new();
        let registry = build_registry(&activity)?;

        let relay = OutboxRelay::new(
            Arc::clone(&backends.outbox),
            Arc::clone(&backends.bus),
            config.relay_config(),
        )
        .spawn();

        let dispatcher = Dispatcher::new(
            Arc::new(registry),
            backends.bus,
            backends.dead_letters,
            config.dispatcher_config(),
        )
        .spawn()?;

        tracing::info!("Customer service started");
        Ok(Self {
            relay,
            dispatcher,
            activity,
            outbox: backends.outbox,
        })
    }

    /// The customer activity projection fed by the dispatcher.
    #[must_use]
    pub const fn activity(&self) -> &CustomerActivityHandler {
        &self.activity
    }

    /// Current health: outbox backlog and waiting dead letters.
    pub async fn health(&self, dead_letters_waiting: usize, max_backlog: u64) -> HealthReport {
        HealthReport::new(vec![
            HealthCheck::outbox(self.outbox.as_ref(), max_backlog).await,
            HealthCheck::dead_letters(dead_letters_waiting),
            HealthCheck::healthy("dispatcher").with_metadata(
                "acknowledged",
                self.dispatcher.stats().acknowledged().to_string(),
            ),
        ])
    }

    /// Stop the relay, then the dispatcher, each within `grace`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError`] if a component had to be aborted. The dispatcher is
    /// still stopped when the relay times out.
    pub async fn shutdown(self, grace: Duration) -> Result<ShutdownReport, AppError> {
        tracing::info!(grace_secs = grace.as_secs(), "Shutting down customer service");
        let relay = self.relay.shutdown(grace).await;
        let report = self.dispatcher.shutdown(grace).await?;
        relay?;
        Ok(report)
    }
}

/// Wait for Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => tracing::info!("Received Ctrl+C"),
                    _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
                }
                return;
            }
            Err(error) => {
                tracing::warn!(%error, "Failed to register SIGTERM handler, waiting for Ctrl+C only");
            }
        }
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Received Ctrl+C"),
        Err(error) => tracing::error!(%error, "Failed to wait for Ctrl+C"),
    }
}
