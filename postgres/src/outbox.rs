//! `PostgreSQL` transactional outbox.
//!
//! Writers insert into `event_outbox` inside their own transaction, so the event
//! exists if and only if the business change committed. The relay side implements
//! [`OutboxStore`] with a `FOR UPDATE SKIP LOCKED` claim that stamps a
//! `claimed_until` lease: concurrent relays skip each other's rows, and a row whose
//! relay died becomes claimable again once the lease passes.

use chrono::{DateTime, Utc};
use eventing_core::event::{Event, EventEnvelope};
use eventing_core::outbox::{OutboxError, OutboxFuture, OutboxRecord, OutboxStatus, OutboxStore};
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::time::Duration;
use uuid::Uuid;

type PgQuery<'q> = sqlx::query::Query<'q, Postgres, PgArguments>;

fn storage(context: &str) -> impl FnOnce(sqlx::Error) -> OutboxError + '_ {
    move |e| OutboxError::Storage(format!("{context}: {e}"))
}

/// Outbox backed by the `event_outbox` table.
///
/// # Example
///
/// ```no_run
/// use eventing_postgres::PostgresOutbox;
/// # use eventing_core::event::Event;
/// # #[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
/// # struct CustomerCreated { customer_id: String }
/// # impl Event for CustomerCreated {
/// #     const EVENT_TYPE: &'static str = "CustomerCreated";
/// #     const TOPIC: &'static str = "customer-events";
/// #     fn resource_id(&self) -> String { self.customer_id.clone() }
/// # }
///
/// # async fn example(pool: sqlx::PgPool) -> Result<(), Box<dyn std::error::Error>> {
/// let mut tx = pool.begin().await?;
/// // ... business writes on `tx` ...
/// PostgresOutbox::publish_event(&mut tx, &CustomerCreated { customer_id: "cust-1".into() })
///     .await?;
/// tx.commit().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct PostgresOutbox {
    pool: PgPool,
}

impl PostgresOutbox {
    /// Create an outbox over an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get the underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Wrap `event` in an envelope and insert it using the caller's transaction.
    ///
    /// Returns the envelope id. The event becomes visible to the relay when the
    /// caller commits.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Serialization`] if the event cannot be serialized and
    /// [`OutboxError::Storage`] if the insert fails.
    pub async fn publish_event<E: Event>(
        tx: &mut Transaction<'_, Postgres>,
        event: &E,
    ) -> Result<Uuid, OutboxError> {
        let envelope = EventEnvelope::from_event(event)
            .map_err(|e| OutboxError::Serialization(e.to_string()))?;
        Self::enqueue(tx, &envelope).await?;
        Ok(envelope.id)
    }

    /// Insert an already built envelope using the caller's transaction.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Serialization`] if the envelope cannot be serialized and
    /// [`OutboxError::Storage`] if the insert fails.
    pub async fn enqueue(
        tx: &mut Transaction<'_, Postgres>,
        envelope: &EventEnvelope,
    ) -> Result<(), OutboxError> {
        let document = serde_json::to_value(envelope)
            .map_err(|e| OutboxError::Serialization(e.to_string()))?;

        sqlx::query(
            r"
            INSERT INTO event_outbox (id, event_type, topic, resource_id, envelope, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ",
        )
        .bind(envelope.id)
        .bind(&envelope.event_type)
        .bind(&envelope.topic)
        .bind(&envelope.resource_id)
        .bind(document)
        .bind(envelope.timestamp)
        .execute(&mut **tx)
        .await
        .map_err(storage("Failed to insert outbox record"))?;

        tracing::debug!(
            event_id = %envelope.id,
            event_type = %envelope.event_type,
            topic = %envelope.topic,
            resource_id = %envelope.resource_id,
            "Event written to outbox"
        );
        metrics::counter!("eventing_outbox_enqueued_total", "topic" => envelope.topic.clone())
            .increment(1);
        Ok(())
    }

    /// Load one record, or `None` if the id is unknown.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Storage`] if the query fails.
    pub async fn get(&self, id: Uuid) -> Result<Option<OutboxRecord>, OutboxError> {
        let row = sqlx::query(
            r"
            SELECT id, envelope, created_at, published_at, attempts,
                   next_attempt_at, last_error, status
            FROM event_outbox
            WHERE id = $1
            ",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage("Failed to load outbox record"))?;

        row.as_ref().map(row_to_record).transpose()
    }

    async fn update(&self, id: Uuid, query: PgQuery<'_>) -> Result<(), OutboxError> {
        let result = query
            .execute(&self.pool)
            .await
            .map_err(storage("Failed to update outbox record"))?;
        if result.rows_affected() == 0 {
            return Err(OutboxError::NotFound(id));
        }
        Ok(())
    }
}

impl OutboxStore for PostgresOutbox {
    fn claim_due(&self, limit: usize, lease: Duration) -> OutboxFuture<'_, Vec<OutboxRecord>> {
        Box::pin(async move {
            #[allow(clippy::cast_possible_wrap)] // Batch sizes are small
            let limit = limit as i64;

            let rows = sqlx::query(
                r"
                UPDATE event_outbox
                SET claimed_until = now() + make_interval(secs => $2)
                WHERE id IN (
                    SELECT e.id
                    FROM event_outbox e
                    WHERE e.status = 'pending'
                      AND (e.next_attempt_at IS NULL OR e.next_attempt_at <= now())
                      AND (e.claimed_until IS NULL OR e.claimed_until <= now())
                      AND NOT EXISTS (
                          SELECT 1
                          FROM event_outbox o2
                          WHERE o2.resource_id = e.resource_id
                            AND o2.status = 'pending'
                            AND (o2.created_at, o2.seq) < (e.created_at, e.seq)
                      )
                    ORDER BY e.created_at, e.seq
                    LIMIT $1
                    FOR UPDATE SKIP LOCKED
                )
                RETURNING id, envelope, created_at, published_at, attempts,
                          next_attempt_at, last_error, status
                ",
            )
            .bind(limit)
            .bind(lease.as_secs_f64())
            .fetch_all(&self.pool)
            .await
            .map_err(storage("Failed to claim outbox records"))?;

            // RETURNING does not preserve the subquery order
            let mut records = rows.iter().map(row_to_record).collect::<Result<Vec<_>, _>>()?;
            records.sort_by_key(|record| record.created_at);
            Ok(records)
        })
    }

    fn mark_published(&self, id: Uuid) -> OutboxFuture<'_, ()> {
        Box::pin(async move {
            self.update(
                id,
                sqlx::query(
                    r"
                    UPDATE event_outbox
                    SET status = 'published', published_at = now(), claimed_until = NULL
                    WHERE id = $1
                    ",
                )
                .bind(id),
            )
            .await
        })
    }

    fn mark_failed(
        &self,
        id: Uuid,
        error: String,
        next_attempt_at: DateTime<Utc>,
    ) -> OutboxFuture<'_, ()> {
        Box::pin(async move {
            self.update(
                id,
                sqlx::query(
                    r"
                    UPDATE event_outbox
                    SET attempts = attempts + 1,
                        last_error = $2,
                        next_attempt_at = $3,
                        claimed_until = NULL
                    WHERE id = $1
                    ",
                )
                .bind(id)
                .bind(error)
                .bind(next_attempt_at),
            )
            .await
        })
    }

    fn mark_dead_lettered(&self, id: Uuid, error: String) -> OutboxFuture<'_, ()> {
        Box::pin(async move {
            self.update(
                id,
                sqlx::query(
                    r"
                    UPDATE event_outbox
                    SET status = 'dead_lettered',
                        attempts = attempts + 1,
                        last_error = $2,
                        claimed_until = NULL
                    WHERE id = $1
                    ",
                )
                .bind(id)
                .bind(error),
            )
            .await?;

            tracing::error!(event_id = %id, "Outbox record dead-lettered");
            Ok(())
        })
    }

    fn pending_count(&self) -> OutboxFuture<'_, u64> {
        Box::pin(async move {
            let (count,): (i64,) =
                sqlx::query_as("SELECT COUNT(*) FROM event_outbox WHERE status = 'pending'")
                    .fetch_one(&self.pool)
                    .await
                    .map_err(storage("Failed to count pending outbox records"))?;
            Ok(u64::try_from(count).unwrap_or_default())
        })
    }
}

fn row_to_record(row: &PgRow) -> Result<OutboxRecord, OutboxError> {
    let column = |e: sqlx::Error| OutboxError::Storage(format!("Bad outbox row: {e}"));

    let document: serde_json::Value = row.try_get("envelope").map_err(column)?;
    let envelope: EventEnvelope = serde_json::from_value(document)
        .map_err(|e| OutboxError::Serialization(e.to_string()))?;

    let status: String = row.try_get("status").map_err(column)?;
    let status = OutboxStatus::parse(&status)
        .ok_or_else(|| OutboxError::Storage(format!("Invalid outbox status: {status}")))?;
    let attempts: i32 = row.try_get("attempts").map_err(column)?;

    Ok(OutboxRecord {
        id: row.try_get("id").map_err(column)?,
        envelope,
        created_at: row.try_get("created_at").map_err(column)?,
        published_at: row.try_get("published_at").map_err(column)?,
        attempts: u32::try_from(attempts).unwrap_or_default(),
        next_attempt_at: row.try_get("next_attempt_at").map_err(column)?,
        last_error: row.try_get("last_error").map_err(column)?,
        status,
    })
}
