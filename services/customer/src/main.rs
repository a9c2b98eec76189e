//! Customer service process.
//!
//! Relays the customer outbox to Redpanda and projects customer events until
//! Ctrl+C or SIGTERM. Customers are written by processes that use
//! `CustomerRepository` on the same database.

use anyhow::Context;
use customer_service::app::{Backends, CustomerService, shutdown_signal};
use customer_service::config::Config;
use customer_service::repository;
use eventing_postgres::{PostgresDeadLetterQueue, PostgresOutbox, schema};
use eventing_redpanda::RedpandaEventBus;
use eventing_runtime::metrics::MetricsServer;
use eventing_runtime::retry::{RetryPolicy, retry_with_backoff};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = Config::from_env().context("Invalid configuration")?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.server.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(
        redpanda_brokers = %config.redpanda.brokers,
        consumer_group = %config.redpanda.consumer_group,
        workers = config.dispatcher.workers,
        "Starting customer service"
    );

    let mut metrics = MetricsServer::new(config.metrics_addr()?);
    metrics.start().context("Failed to start metrics server")?;

    // The database may still be starting next to us
    info!("Connecting to database...");
    let connect_policy = RetryPolicy::builder()
        .max_attempts(10)
        .initial_delay(Duration::from_millis(500))
        .max_delay(Duration::from_secs(10))
        .build();
    let pool = retry_with_backoff(connect_policy, || {
        PgPoolOptions::new()
            .max_connections(config.postgres.max_connections)
            .min_connections(config.postgres.min_connections)
            .acquire_timeout(Duration::from_secs(config.postgres.connect_timeout))
            .connect(&config.postgres.url)
    })
    .await
    .context("Failed to connect to database")?;

    schema::migrate(&pool).await.context("Failed to create event tables")?;
    repository::migrate(&pool).await.context("Failed to create customers table")?;
    info!("Database ready");

    let bus = RedpandaEventBus::builder()
        .brokers(&config.redpanda.brokers)
        .consumer_group(&config.redpanda.consumer_group)
        .auto_offset_reset(&config.redpanda.auto_offset_reset)
        .producer_acks(&config.redpanda.producer_acks)
        .compression(&config.redpanda.compression)
        .build()
        .context("Failed to create event bus")?;

    let dead_letters = Arc::new(PostgresDeadLetterQueue::new(pool.clone()));
    let service = CustomerService::start(
        Backends {
            outbox: Arc::new(PostgresOutbox::new(pool.clone())),
            bus: Arc::new(bus),
            dead_letters: dead_letters.clone(),
        },
        &config,
    )?;

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    let mut health_interval =
        tokio::time::interval(Duration::from_secs(config.server.health_interval.max(1)));

    loop {
        tokio::select! {
            () = &mut shutdown => break,
            _ = health_interval.tick() => {
                let waiting = match dead_letters.count_pending().await {
                    Ok(count) => usize::try_from(count).unwrap_or(usize::MAX),
                    Err(error) => {
                        warn!(%error, "Failed to count dead letters");
                        0
                    }
                };
                let report = service.health(waiting, config.server.max_outbox_backlog).await;
                if report.is_healthy() {
                    info!(status = ?report.status, "Health check");
                } else {
                    warn!(status = ?report.status, checks = ?report.checks, "Health check");
                }
            }
        }
    }

    let report = service.shutdown(config.shutdown_grace()).await?;
    info!(
        acknowledged = report.stats.acknowledged,
        dead_lettered = report.stats.dead_lettered,
        "Customer service stopped"
    );
    pool.close().await;
    Ok(())
}
