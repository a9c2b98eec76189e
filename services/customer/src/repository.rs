//! Customer persistence.
//!
//! Every write changes the `customers` row and inserts the matching event into the
//! outbox inside one transaction: either both are committed or neither is.

use crate::events::{CustomerCreated, CustomerDeleted, CustomerUpdated, is_valid_email};
use chrono::{DateTime, Utc};
use eventing_core::outbox::OutboxError;
use eventing_postgres::PostgresOutbox;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use thiserror::Error;
use uuid::Uuid;

/// Errors from customer writes and reads.
#[derive(Error, Debug)]
pub enum RepositoryError {
    /// No live customer with this id.
    #[error("Customer {0} not found")]
    NotFound(String),

    /// Input rejected before touching the database.
    #[error("Invalid customer data: {0}")]
    Invalid(String),

    /// The outbox insert failed; the transaction was rolled back.
    #[error("Outbox write failed: {0}")]
    Outbox(#[from] OutboxError),

    /// Database error.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// A stored customer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Customer {
    /// Customer id
    pub customer_id: String,
    /// Display name
    pub name: String,
    /// Contact email
    pub email: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last change
    pub updated_at: DateTime<Utc>,
}

/// Create the `customers` table if it does not exist.
///
/// # Errors
///
/// Returns the database error if the statement fails.
pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS customers (
            customer_id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            email TEXT,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            deleted_at TIMESTAMPTZ
        )
        ",
    )
    .execute(pool)
    .await?;
    Ok(())
}

fn validate(name: &str, email: Option<&str>) -> Result<(), RepositoryError> {
    if name.trim().is_empty() {
        return Err(RepositoryError::Invalid("name must not be empty".to_string()));
    }
    if let Some(email) = email.filter(|e| !is_valid_email(e)) {
        return Err(RepositoryError::Invalid(format!("malformed email address '{email}'")));
    }
    Ok(())
}

fn row_to_customer(row: &PgRow) -> Result<Customer, sqlx::Error> {
    Ok(Customer {
        customer_id: row.try_get("customer_id")?,
        name: row.try_get("name")?,
        email: row.try_get("email")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Customer repository over `PostgreSQL`.
#[derive(Clone)]
pub struct CustomerRepository {
    pool: PgPool,
}

impl CustomerRepository {
    /// Create a repository over an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert a customer and its `CustomerCreated` event.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::Invalid`] for an empty name or malformed email,
    /// otherwise the database or outbox error. Nothing is written on error.
    pub async fn create_customer(
        &self,
        name: &str,
        email: Option<&str>,
    ) -> Result<Customer, RepositoryError> {
        validate(name, email)?;
        let customer_id = format!("cust-{}", Uuid::new_v4());

        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            r"
            INSERT INTO customers (customer_id, name, email)
            VALUES ($1, $2, $3)
            RETURNING customer_id, name, email, created_at, updated_at
            ",
        )
        .bind(&customer_id)
        .bind(name)
        .bind(email)
        .fetch_one(&mut *tx)
        .await?;
        let customer = row_to_customer(&row)?;

        let event_id = PostgresOutbox::publish_event(
            &mut tx,
            &CustomerCreated {
                customer_id: customer.customer_id.clone(),
                name: customer.name.clone(),
                email: customer.email.clone(),
            },
        )
        .await?;
        tx.commit().await?;

        tracing::info!(customer_id = %customer.customer_id, event_id = %event_id, "Customer created");
        Ok(customer)
    }

    /// Change a customer's profile and record `CustomerUpdated`.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::NotFound`] if the customer does not exist or was
    /// deleted, [`RepositoryError::Invalid`] for bad input.
    pub async fn update_customer(
        &self,
        customer_id: &str,
        name: &str,
        email: Option<&str>,
    ) -> Result<Customer, RepositoryError> {
        validate(name, email)?;

        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            r"
            UPDATE customers
            SET name = $2, email = $3, updated_at = now()
            WHERE customer_id = $1 AND deleted_at IS NULL
            RETURNING customer_id, name, email, created_at, updated_at
            ",
        )
        .bind(customer_id)
        .bind(name)
        .bind(email)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| RepositoryError::NotFound(customer_id.to_string()))?;
        let customer = row_to_customer(&row)?;

        let event_id = PostgresOutbox::publish_event(
            &mut tx,
            &CustomerUpdated {
                customer_id: customer.customer_id.clone(),
                name: customer.name.clone(),
                email: customer.email.clone(),
            },
        )
        .await?;
        tx.commit().await?;

        tracing::info!(customer_id, event_id = %event_id, "Customer updated");
        Ok(customer)
    }

    /// Soft-delete a customer and record `CustomerDeleted`.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::NotFound`] if the customer does not exist or was
    /// already deleted.
    pub async fn delete_customer(&self, customer_id: &str) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r"
            UPDATE customers
            SET deleted_at = now(), updated_at = now()
            WHERE customer_id = $1 AND deleted_at IS NULL
            ",
        )
        .bind(customer_id)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(customer_id.to_string()));
        }

        let event_id = PostgresOutbox::publish_event(
            &mut tx,
            &CustomerDeleted {
                customer_id: customer_id.to_string(),
            },
        )
        .await?;
        tx.commit().await?;

        tracing::info!(customer_id, event_id = %event_id, "Customer deleted");
        Ok(())
    }

    /// Look up a live customer.
    ///
    /// # Errors
    ///
    /// Returns the database error if the query fails.
    pub async fn get_customer(&self, customer_id: &str) -> Result<Option<Customer>, RepositoryError> {
        let row = sqlx::query(
            r"
            SELECT customer_id, name, email, created_at, updated_at
            FROM customers
            WHERE customer_id = $1 AND deleted_at IS NULL
            ",
        )
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(row_to_customer).transpose()?)
    }
}
