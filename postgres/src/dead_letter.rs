//! Dead Letter Queue (DLQ) for messages the dispatcher gave up on.
//!
//! Provides persistent storage and management of messages that failed processing
//! (undecodable, unknown type, invalid, fatal handler error or retries exhausted).
//! Enables observability, incident response, and manual reprocessing workflows.

use chrono::{DateTime, Utc};
use eventing_core::dead_letter::{DeadLetter, DeadLetterError, DeadLetterSink, FailureStage};
use eventing_core::event_bus::EventBus;
use sqlx::{PgPool, Row};
use std::future::Future;
use std::pin::Pin;
use uuid::Uuid;

/// Status of a failed event in the Dead Letter Queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DLQStatus {
    /// Event is pending investigation/reprocessing
    Pending,
    /// Event is currently being processed
    Processing,
    /// Event was successfully reprocessed
    Resolved,
    /// Event was permanently discarded (cannot be fixed)
    Discarded,
}

impl DLQStatus {
    /// Convert status to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Resolved => "resolved",
            Self::Discarded => "discarded",
        }
    }

    /// Parse status from database string.
    ///
    /// # Errors
    ///
    /// Returns error if the string doesn't match a known status.
    pub fn parse(s: &str) -> Result<Self, DeadLetterError> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "resolved" => Ok(Self::Resolved),
            "discarded" => Ok(Self::Discarded),
            _ => Err(DeadLetterError::Storage(format!("Invalid DLQ status: {s}"))),
        }
    }
}

/// An entry in the Dead Letter Queue.
///
/// The dead letter itself plus the resolution workflow state.
#[derive(Debug, Clone)]
pub struct FailedEvent {
    /// The message and its failure context
    pub letter: DeadLetter,

    /// Current processing status
    pub status: DLQStatus,

    /// When the failure was resolved (if applicable)
    pub resolved_at: Option<DateTime<Utc>>,

    /// Who/what resolved the failure
    pub resolved_by: Option<String>,

    /// Notes about the resolution
    pub resolution_notes: Option<String>,
}

fn database(e: sqlx::Error) -> DeadLetterError {
    DeadLetterError::Storage(e.to_string())
}

/// `PostgreSQL`-based Dead Letter Queue for failed events.
///
/// Provides persistent storage for messages that failed processing, enabling:
/// - Incident investigation and debugging
/// - Manual reprocessing workflows
/// - Failure trend analysis
///
/// # Example
///
/// ```no_run
/// use eventing_postgres::{DLQStatus, PostgresDeadLetterQueue};
///
/// # async fn example(pool: sqlx::PgPool) -> Result<(), Box<dyn std::error::Error>> {
/// let dlq = PostgresDeadLetterQueue::new(pool);
///
/// // List pending failures
/// let pending = dlq.list_pending(100).await?;
/// println!("Pending failures: {}", pending.len());
///
/// // Mark one as processing
/// dlq.update_status(pending[0].letter.id, DLQStatus::Processing).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct PostgresDeadLetterQueue {
    pool: PgPool,
}

impl PostgresDeadLetterQueue {
    /// Create a new Dead Letter Queue with the given connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Add a dead letter to the DLQ.
    ///
    /// Inserting the same letter twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::Storage`] if the insert fails.
    pub async fn add_entry(&self, letter: &DeadLetter) -> Result<Uuid, DeadLetterError> {
        #[allow(clippy::cast_possible_wrap)] // Attempt counts are small
        let attempts = letter.attempts as i32;

        sqlx::query(
            r"
            INSERT INTO failed_events (
                id, topic, message_key, payload, event_type, event_id, resource_id,
                stage, error_message, attempts, failed_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (id) DO NOTHING
            ",
        )
        .bind(letter.id)
        .bind(&letter.topic)
        .bind(letter.key.as_deref())
        .bind(&letter.payload)
        .bind(letter.event_type.as_deref())
        .bind(letter.event_id)
        .bind(letter.resource_id.as_deref())
        .bind(letter.stage.as_str())
        .bind(&letter.error)
        .bind(attempts)
        .bind(letter.failed_at)
        .execute(&self.pool)
        .await
        .map_err(database)?;

        tracing::warn!(
            dlq_id = %letter.id,
            topic = %letter.topic,
            event_type = ?letter.event_type,
            event_id = ?letter.event_id,
            stage = %letter.stage,
            error = %letter.error,
            attempts = letter.attempts,
            "Message added to Dead Letter Queue"
        );

        metrics::counter!(
            "eventing_dlq_added_total",
            "topic" => letter.topic.clone(),
            "stage" => letter.stage.as_str()
        )
        .increment(1);

        Ok(letter.id)
    }

    /// List pending failed events.
    ///
    /// Returns events in order of oldest first (FIFO processing).
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::Storage`] if the query fails.
    pub async fn list_pending(&self, limit: usize) -> Result<Vec<FailedEvent>, DeadLetterError> {
        self.list_by_status(DLQStatus::Pending, limit).await
    }

    /// List failed events by status.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::Storage`] if the query fails.
    pub async fn list_by_status(
        &self,
        status: DLQStatus,
        limit: usize,
    ) -> Result<Vec<FailedEvent>, DeadLetterError> {
        #[allow(clippy::cast_possible_wrap)] // Limit is reasonable size, i64 is safe
        let rows = sqlx::query(
            r"
            SELECT
                id, topic, message_key, payload, event_type, event_id, resource_id,
                stage, error_message, attempts, failed_at, status,
                resolved_at, resolved_by, resolution_notes
            FROM failed_events
            WHERE status = $1
            ORDER BY failed_at ASC
            LIMIT $2
            ",
        )
        .bind(status.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(database)?;

        rows.iter().map(Self::row_to_failed_event).collect()
    }

    /// Get a specific failed event by ID.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::NotFound`] for an unknown id and
    /// [`DeadLetterError::Storage`] if the query fails.
    pub async fn get_by_id(&self, id: Uuid) -> Result<FailedEvent, DeadLetterError> {
        let row = sqlx::query(
            r"
            SELECT
                id, topic, message_key, payload, event_type, event_id, resource_id,
                stage, error_message, attempts, failed_at, status,
                resolved_at, resolved_by, resolution_notes
            FROM failed_events
            WHERE id = $1
            ",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(database)?
        .ok_or(DeadLetterError::NotFound(id))?;

        Self::row_to_failed_event(&row)
    }

    /// Update the status of a failed event.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::NotFound`] for an unknown id and
    /// [`DeadLetterError::Storage`] if the update fails.
    pub async fn update_status(&self, id: Uuid, status: DLQStatus) -> Result<(), DeadLetterError> {
        let result = sqlx::query("UPDATE failed_events SET status = $1 WHERE id = $2")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(database)?;
        if result.rows_affected() == 0 {
            return Err(DeadLetterError::NotFound(id));
        }

        tracing::info!(dlq_id = %id, status = status.as_str(), "DLQ entry status updated");

        Ok(())
    }

    /// Mark a failed event as resolved.
    ///
    /// # Arguments
    ///
    /// * `id` - The DLQ entry ID
    /// * `resolved_by` - Who/what resolved it (e.g., username, service name)
    /// * `notes` - Resolution notes (what was done, why it worked)
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::NotFound`] for an unknown id and
    /// [`DeadLetterError::Storage`] if the update fails.
    pub async fn mark_resolved(
        &self,
        id: Uuid,
        resolved_by: &str,
        notes: Option<&str>,
    ) -> Result<(), DeadLetterError> {
        let result = sqlx::query(
            r"
            UPDATE failed_events
            SET status = 'resolved',
                resolved_at = NOW(),
                resolved_by = $1,
                resolution_notes = $2
            WHERE id = $3
            ",
        )
        .bind(resolved_by)
        .bind(notes)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(database)?;
        if result.rows_affected() == 0 {
            return Err(DeadLetterError::NotFound(id));
        }

        tracing::info!(dlq_id = %id, resolved_by, "DLQ entry marked as resolved");

        metrics::counter!("eventing_dlq_resolved_total").increment(1);

        Ok(())
    }

    /// Mark a failed event as discarded (permanently failed).
    ///
    /// Use this when a failure cannot be fixed (e.g., corrupt payload, retired event type).
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::NotFound`] for an unknown id and
    /// [`DeadLetterError::Storage`] if the update fails.
    pub async fn mark_discarded(&self, id: Uuid, reason: &str) -> Result<(), DeadLetterError> {
        let result = sqlx::query(
            r"
            UPDATE failed_events
            SET status = 'discarded',
                resolved_at = NOW(),
                resolution_notes = $1
            WHERE id = $2
            ",
        )
        .bind(reason)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(database)?;
        if result.rows_affected() == 0 {
            return Err(DeadLetterError::NotFound(id));
        }

        tracing::warn!(dlq_id = %id, reason, "DLQ entry marked as discarded");

        metrics::counter!("eventing_dlq_discarded_total").increment(1);

        Ok(())
    }

    /// Publish a dead letter's original bytes back to its topic and mark it resolved.
    ///
    /// The entry is moved to `processing` first so two operators cannot replay it at
    /// the same time. If the publish fails it goes back to `pending`.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::NotFound`] if the entry is unknown or not pending,
    /// and [`DeadLetterError::Storage`] if the database or the bus fails.
    pub async fn reprocess(
        &self,
        id: Uuid,
        bus: &dyn EventBus,
        resolved_by: &str,
    ) -> Result<(), DeadLetterError> {
        let claimed = sqlx::query(
            "UPDATE failed_events SET status = 'processing' WHERE id = $1 AND status = 'pending'",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(database)?;
        if claimed.rows_affected() == 0 {
            return Err(DeadLetterError::NotFound(id));
        }

        let entry = self.get_by_id(id).await?;
        let letter = &entry.letter;
        let key = letter
            .key
            .as_deref()
            .or(letter.resource_id.as_deref())
            .unwrap_or(&letter.topic);

        if let Err(err) = bus.publish(&letter.topic, key, &letter.payload).await {
            self.update_status(id, DLQStatus::Pending).await?;
            return Err(DeadLetterError::Storage(format!("Republish failed: {err}")));
        }

        self.mark_resolved(id, resolved_by, Some("republished to original topic"))
            .await?;
        tracing::info!(dlq_id = %id, topic = %letter.topic, "DLQ entry republished");
        Ok(())
    }

    /// Get count of pending failures.
    ///
    /// Useful for monitoring and health checks.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::Storage`] if the query fails.
    pub async fn count_pending(&self) -> Result<u64, DeadLetterError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM failed_events WHERE status = 'pending'")
                .fetch_one(&self.pool)
                .await
                .map_err(database)?;

        Ok(u64::try_from(count).unwrap_or_default())
    }

    /// Convert a database row to a `FailedEvent`.
    fn row_to_failed_event(row: &sqlx::postgres::PgRow) -> Result<FailedEvent, DeadLetterError> {
        let stage: String = row.try_get("stage").map_err(database)?;
        let stage = FailureStage::parse(&stage)
            .ok_or_else(|| DeadLetterError::Storage(format!("Invalid failure stage: {stage}")))?;

        let status: String = row.try_get("status").map_err(database)?;
        let status = DLQStatus::parse(&status)?;
        let attempts: i32 = row.try_get("attempts").map_err(database)?;

        Ok(FailedEvent {
            letter: DeadLetter {
                id: row.try_get("id").map_err(database)?,
                topic: row.try_get("topic").map_err(database)?,
                key: row.try_get("message_key").map_err(database)?,
                payload: row.try_get("payload").map_err(database)?,
                event_type: row.try_get("event_type").map_err(database)?,
                event_id: row.try_get("event_id").map_err(database)?,
                resource_id: row.try_get("resource_id").map_err(database)?,
                stage,
                error: row.try_get("error_message").map_err(database)?,
                attempts: u32::try_from(attempts).unwrap_or_default(),
                failed_at: row.try_get("failed_at").map_err(database)?,
            },
            status,
            resolved_at: row.try_get("resolved_at").map_err(database)?,
            resolved_by: row.try_get("resolved_by").map_err(database)?,
            resolution_notes: row.try_get("resolution_notes").map_err(database)?,
        })
    }
}

impl DeadLetterSink for PostgresDeadLetterQueue {
    fn record(
        &self,
        letter: DeadLetter,
    ) -> Pin<Box<dyn Future<Output = Result<(), DeadLetterError>> + Send + '_>> {
        Box::pin(async move { self.add_entry(&letter).await.map(|_| ()) })
    }
}
