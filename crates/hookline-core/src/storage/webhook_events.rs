//! Repository for queued change events.
//!
//! An event's retry state lives entirely in its row: `processed`,
//! `attempts`, `next_retry_at` and `error_message`. A row is due when it is
//! unprocessed and either never attempted (`attempts = 0` and no
//! `next_retry_at`) or its `next_retry_at` has passed. A row with
//! `attempts > 0` and no `next_retry_at` is terminal and never due again.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{Executor, PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::{
    error::Result,
    models::{EventId, WebhookEvent, WebhookId},
};

const COLUMNS: &str = "id, webhook_id, operation, table_schema, table_name, record_id, \
                       old_data, new_data, processed, attempts, last_attempt_at, \
                       next_retry_at, error_message, created_at";

/// Repository for webhook event rows.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Creates events atomically: either every row is inserted or none.
    ///
    /// # Errors
    ///
    /// Returns error if any insert fails or a webhook does not exist.
    pub async fn create_many(&self, events: &[WebhookEvent]) -> Result<Vec<EventId>> {
        let mut tx = self.pool.begin().await?;
        let mut ids = Vec::with_capacity(events.len());
        for event in events {
            ids.push(self.create_in_tx(&mut tx, event).await?);
        }
        tx.commit().await?;
        Ok(ids)
    }

    /// Creates an event within a transaction.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails.
    pub async fn create_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event: &WebhookEvent,
    ) -> Result<EventId> {
        self.create_impl(&mut **tx, event).await
    }

    async fn create_impl<'e, E>(&self, executor: E, event: &WebhookEvent) -> Result<EventId>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO webhook_events (
                id, webhook_id, operation, table_schema, table_name, record_id,
                old_data, new_data, processed, attempts, last_attempt_at,
                next_retry_at, error_message, created_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14
            )
            RETURNING id
            "#,
        )
        .bind(event.id)
        .bind(event.webhook_id)
        .bind(event.operation.as_str())
        .bind(&event.table_schema)
        .bind(&event.table_name)
        .bind(&event.record_id)
        .bind(&event.old_data)
        .bind(&event.new_data)
        .bind(event.processed)
        .bind(event.attempts)
        .bind(event.last_attempt_at)
        .bind(event.next_retry_at)
        .bind(&event.error_message)
        .bind(event.created_at)
        .fetch_one(executor)
        .await?;

        Ok(EventId(id))
    }

    /// Fetches up to `limit` due events for one webhook, oldest first.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn fetch_due(
        &self,
        webhook_id: WebhookId,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<WebhookEvent>> {
        let events = sqlx::query_as::<_, WebhookEvent>(&format!(
            r#"
            SELECT {COLUMNS} FROM webhook_events
            WHERE webhook_id = $1
              AND processed = FALSE
              AND ((next_retry_at IS NULL AND attempts = 0) OR next_retry_at <= $2)
            ORDER BY created_at ASC
            LIMIT $3
            "#
        ))
        .bind(webhook_id)
        .bind(now)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await?;

        Ok(events)
    }

    /// Returns up to `limit` distinct webhook ids that have due events.
    ///
    /// Never-attempted rows count as due so events queued before a crash
    /// are picked up after restart.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_webhooks_with_due_events(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<WebhookId>> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT webhook_id FROM (
                SELECT webhook_id, MIN(COALESCE(next_retry_at, created_at)) AS due_at
                FROM webhook_events
                WHERE processed = FALSE
                  AND ((next_retry_at IS NULL AND attempts = 0) OR next_retry_at <= $1)
                GROUP BY webhook_id
            ) due
            ORDER BY due_at ASC
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await?;

        Ok(ids.into_iter().map(WebhookId).collect())
    }

    /// Marks an event as delivered.
    ///
    /// # Errors
    ///
    /// Returns error if update fails.
    pub async fn mark_processed(&self, id: EventId, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE webhook_events
            SET processed = TRUE, last_attempt_at = $2, next_retry_at = NULL,
                error_message = NULL
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Records a failed attempt.
    ///
    /// `next_retry_at = None` makes the event terminal.
    ///
    /// # Errors
    ///
    /// Returns error if update fails.
    pub async fn record_failure(
        &self,
        id: EventId,
        attempts: i32,
        next_retry_at: Option<DateTime<Utc>>,
        error_message: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE webhook_events
            SET attempts = $2, next_retry_at = $3, error_message = $4, last_attempt_at = $5
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(attempts)
        .bind(next_retry_at)
        .bind(error_message)
        .bind(now)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Pushes `next_retry_at` forward without consuming an attempt.
    ///
    /// # Errors
    ///
    /// Returns error if update fails.
    pub async fn reschedule(&self, id: EventId, next_retry_at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE webhook_events SET next_retry_at = $2 WHERE id = $1")
            .bind(id)
            .bind(next_retry_at)
            .execute(&*self.pool)
            .await?;

        Ok(())
    }

    /// Deletes processed events created before `cutoff`.
    ///
    /// Returns the number of rows removed.
    ///
    /// # Errors
    ///
    /// Returns error if delete fails.
    pub async fn delete_processed_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM webhook_events WHERE processed = TRUE AND created_at < $1")
                .bind(cutoff)
                .execute(&*self.pool)
                .await?;

        Ok(result.rows_affected())
    }
}
