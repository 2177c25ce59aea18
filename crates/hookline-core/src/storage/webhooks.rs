//! Repository for webhook configuration.
//!
//! The engine only reads webhooks; they are managed elsewhere.

use std::sync::Arc;

use sqlx::PgPool;

use crate::{
    error::Result,
    models::{Webhook, WebhookId},
};

const COLUMNS: &str = "id, name, url, secret, headers, events, max_retries, \
                       retry_backoff_seconds, timeout_seconds, enabled, created_at, updated_at";

/// Repository for webhook configuration rows.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Finds a webhook by id.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_id(&self, id: WebhookId) -> Result<Option<Webhook>> {
        let webhook = sqlx::query_as::<_, Webhook>(&format!(
            "SELECT {COLUMNS} FROM webhooks WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(webhook)
    }

    /// Lists all enabled webhooks.
    ///
    /// Used by change dispatch to find subscribers.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_enabled(&self) -> Result<Vec<Webhook>> {
        let webhooks = sqlx::query_as::<_, Webhook>(&format!(
            "SELECT {COLUMNS} FROM webhooks WHERE enabled = TRUE ORDER BY created_at ASC"
        ))
        .fetch_all(&*self.pool)
        .await?;

        Ok(webhooks)
    }
}
