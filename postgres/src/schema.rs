//! Tables owned by the event core.
//!
//! Every statement is idempotent, so [`migrate`] can run on each start.

use sqlx::PgPool;

const STATEMENTS: &[&str] = &[
    r"
    CREATE TABLE IF NOT EXISTS event_outbox (
        id UUID PRIMARY KEY,
        seq BIGSERIAL,
        event_type TEXT NOT NULL,
        topic TEXT NOT NULL,
        resource_id TEXT NOT NULL,
        envelope JSONB NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        published_at TIMESTAMPTZ,
        attempts INTEGER NOT NULL DEFAULT 0,
        next_attempt_at TIMESTAMPTZ,
        claimed_until TIMESTAMPTZ,
        last_error TEXT,
        status TEXT NOT NULL DEFAULT 'pending'
    )
    ",
    r"
    CREATE INDEX IF NOT EXISTS idx_event_outbox_pending
        ON event_outbox (created_at)
        WHERE status = 'pending'
    ",
    r"
    ALTER TABLE event_outbox ADD COLUMN IF NOT EXISTS seq BIGSERIAL
    ",
    r"
    CREATE INDEX IF NOT EXISTS idx_event_outbox_pending_resource
        ON event_outbox (resource_id, created_at, seq)
        WHERE status = 'pending'
    ",
    r"
    CREATE TABLE IF NOT EXISTS failed_events (
        id UUID PRIMARY KEY,
        topic TEXT NOT NULL,
        message_key TEXT,
        payload BYTEA NOT NULL,
        event_type TEXT,
        event_id UUID,
        resource_id TEXT,
        stage TEXT NOT NULL,
        error_message TEXT NOT NULL,
        attempts INTEGER NOT NULL,
        failed_at TIMESTAMPTZ NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        resolved_at TIMESTAMPTZ,
        resolved_by TEXT,
        resolution_notes TEXT
    )
    ",
    r"
    CREATE INDEX IF NOT EXISTS idx_failed_events_status
        ON failed_events (status, failed_at)
    ",
];

/// Create the `event_outbox` and `failed_events` tables if they do not exist.
///
/// # Errors
///
/// Returns the database error of the first statement that fails.
pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::Error> {
    for statement in STATEMENTS {
        sqlx::query(statement).execute(pool).await?;
    }
    tracing::info!("Event core schema is up to date");
    Ok(())
}
