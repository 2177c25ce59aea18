//! Hookline webhook delivery service.
//!
//! Boots the event store, subscribes to change notifications, runs the
//! delivery engine and a health server, and shuts everything down on
//! SIGINT or SIGTERM.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use hookline_core::{storage::Storage, RealClock};
use hookline_delivery::{
    notify::PgNotificationSource, storage::PostgresDeliveryStorage, TriggerService,
};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod config;
mod health;

use config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;

    info!("starting hookline webhook delivery service");

    let config = Config::load()?;
    info!(
        database_url = %config.database_url_masked(),
        worker_count = config.worker_count,
        channel = %config.notification_channel,
        allow_private_destinations = config.allow_private_destinations,
        "configuration loaded"
    );
    if config.allow_private_destinations {
        warn!("SSRF protection disabled by configuration");
    }

    let pool = create_database_pool(&config).await?;
    info!("database connection pool established");

    let storage = Arc::new(Storage::new(pool.clone()));
    storage.ensure_schema().await.context("failed to bootstrap event store schema")?;
    info!("event store schema ready");

    let service = Arc::new(
        TriggerService::new(
            Arc::new(PostgresDeliveryStorage::new(storage.clone())),
            Arc::new(PgNotificationSource::new(pool.clone(), config.notification_channel.clone())),
            config.trigger_config(),
        )
        .context("failed to build trigger service")?,
    );

    let health_shutdown = CancellationToken::new();
    let health_handle = tokio::spawn({
        let state = health::AppState {
            storage: storage.clone(),
            service: service.clone(),
            clock: Arc::new(RealClock::new()),
        };
        let addr = config.health_addr()?;
        let shutdown = health_shutdown.clone();
        async move {
            if let Err(e) = health::serve(state, addr, shutdown).await {
                error!(error = %e, "health server failed");
            }
        }
    });

    if let Err(e) = service.start().await {
        error!(error = %e, "trigger service failed to start");
        health_shutdown.cancel();
        let _ = health_handle.await;
        pool.close().await;
        return Err(e).context("failed to start trigger service");
    }
    info!(workers = service.worker_count(), "hookline is delivering webhooks");

    shutdown_signal().await;
    info!("shutdown signal received, starting graceful shutdown");

    if let Err(e) = service.stop().await {
        warn!(error = %e, "trigger service did not stop cleanly");
    }

    health_shutdown.cancel();
    if tokio::time::timeout(Duration::from_secs(5), health_handle).await.is_err() {
        warn!("health server did not stop in time");
    }

    pool.close().await;
    info!("hookline shutdown complete");
    Ok(())
}

/// Initializes tracing from `RUST_LOG`, defaulting to debug for hookline.
fn init_tracing() -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info,hookline=debug,tower_http=debug"))
        .context("invalid RUST_LOG filter")?;

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .context("failed to install tracing subscriber")
}

/// Connects to PostgreSQL, retrying while the database comes up.
async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);
    let mut retries = 0;

    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(config.database_min_connections)
            .acquire_timeout(Duration::from_secs(config.database_connection_timeout))
            .idle_timeout(Duration::from_secs(config.database_idle_timeout))
            .max_lifetime(Duration::from_secs(config.database_max_lifetime))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => {
                sqlx::query("SELECT 1")
                    .execute(&pool)
                    .await
                    .context("failed to verify database connection")?;
                return Ok(pool);
            },
            Err(e) if retries < MAX_RETRIES => {
                retries += 1;
                warn!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    error = %e,
                    "database connection failed, retrying"
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("failed to create database connection pool after retries");
            },
        }
    }
}

/// Waits for CTRL+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received CTRL+C"),
        () = terminate => info!("received SIGTERM"),
    }
}
