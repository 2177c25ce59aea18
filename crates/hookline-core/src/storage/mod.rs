//! Database access layer for webhooks, queued events and delivery audit rows.
//!
//! Every query the engine issues lives in these repositories. Callers above
//! this layer work only with domain models from [`crate::models`].

use std::sync::Arc;

use sqlx::PgPool;

pub mod webhook_deliveries;
pub mod webhook_events;
pub mod webhooks;

use crate::error::Result;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS webhooks (
        id UUID PRIMARY KEY,
        name TEXT NOT NULL,
        url TEXT NOT NULL,
        secret TEXT,
        headers JSONB NOT NULL DEFAULT '{}'::jsonb,
        events JSONB NOT NULL DEFAULT '[]'::jsonb,
        max_retries INTEGER NOT NULL DEFAULT 3,
        retry_backoff_seconds INTEGER NOT NULL DEFAULT 60,
        timeout_seconds INTEGER NOT NULL DEFAULT 30,
        enabled BOOLEAN NOT NULL DEFAULT TRUE,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS webhook_events (
        id UUID PRIMARY KEY,
        webhook_id UUID NOT NULL REFERENCES webhooks(id) ON DELETE CASCADE,
        operation TEXT NOT NULL,
        table_schema TEXT NOT NULL,
        table_name TEXT NOT NULL,
        record_id TEXT,
        old_data JSONB,
        new_data JSONB,
        processed BOOLEAN NOT NULL DEFAULT FALSE,
        attempts INTEGER NOT NULL DEFAULT 0,
        last_attempt_at TIMESTAMPTZ,
        next_retry_at TIMESTAMPTZ,
        error_message TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_webhook_events_due
        ON webhook_events (webhook_id, processed, next_retry_at)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_webhook_events_created
        ON webhook_events (created_at)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS webhook_deliveries (
        id UUID PRIMARY KEY,
        webhook_id UUID NOT NULL REFERENCES webhooks(id) ON DELETE CASCADE,
        event_id UUID NOT NULL REFERENCES webhook_events(id) ON DELETE CASCADE,
        operation TEXT NOT NULL,
        status TEXT NOT NULL,
        attempt_number INTEGER NOT NULL,
        response_status INTEGER,
        error_message TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        completed_at TIMESTAMPTZ
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_webhook_deliveries_event
        ON webhook_deliveries (event_id)
    "#,
];

/// Container for all repository instances sharing one connection pool.
#[derive(Clone)]
pub struct Storage {
    /// Webhook configuration (read-mostly).
    pub webhooks: Arc<webhooks::Repository>,

    /// Queued change events and their retry state.
    pub webhook_events: Arc<webhook_events::Repository>,

    /// Per-attempt audit rows.
    pub webhook_deliveries: Arc<webhook_deliveries::Repository>,

    pool: Arc<PgPool>,
}

impl Storage {
    /// Creates a new storage instance with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        let pool = Arc::new(pool);

        Self {
            webhooks: Arc::new(webhooks::Repository::new(pool.clone())),
            webhook_events: Arc::new(webhook_events::Repository::new(pool.clone())),
            webhook_deliveries: Arc::new(webhook_deliveries::Repository::new(pool.clone())),
            pool,
        }
    }

    /// Verifies database connectivity with a trivial query.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the connection is unhealthy.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&*self.pool).await?;

        Ok(())
    }

    /// Creates tables and indexes if they do not exist.
    ///
    /// Safe to run on every startup.
    ///
    /// # Errors
    ///
    /// Returns error if any DDL statement fails.
    pub async fn ensure_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&*self.pool).await?;
        }

        Ok(())
    }
}
