//! Repository for the per-attempt delivery audit trail.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::{
    error::Result,
    models::{DeliveryStatus, WebhookDelivery},
};

/// Repository for webhook delivery audit rows.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Inserts a delivery row, normally in `pending` status.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails.
    pub async fn create(&self, delivery: &WebhookDelivery) -> Result<Uuid> {
        let id = sqlx::query_scalar(
            r#"
            INSERT INTO webhook_deliveries (
                id, webhook_id, event_id, operation, status, attempt_number,
                response_status, error_message, created_at, completed_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10
            )
            RETURNING id
            "#,
        )
        .bind(delivery.id)
        .bind(delivery.webhook_id)
        .bind(delivery.event_id)
        .bind(delivery.operation.as_str())
        .bind(delivery.status.to_string())
        .bind(delivery.attempt_number)
        .bind(delivery.response_status)
        .bind(&delivery.error_message)
        .bind(delivery.created_at)
        .bind(delivery.completed_at)
        .fetch_one(&*self.pool)
        .await?;

        Ok(id)
    }

    /// Records the outcome of a delivery attempt.
    ///
    /// # Errors
    ///
    /// Returns error if update fails.
    pub async fn complete(
        &self,
        id: Uuid,
        status: DeliveryStatus,
        response_status: Option<i32>,
        error_message: Option<&str>,
        completed_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE webhook_deliveries
            SET status = $2, response_status = $3, error_message = $4, completed_at = $5
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status.to_string())
        .bind(response_status)
        .bind(error_message)
        .bind(completed_at)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }
}
