//! Health endpoints for orchestration probes.
//!
//! `/live` only proves the process answers. `/ready` requires the
//! notification subscription to be established and the database to
//! respond. `/health` reports both plus the engine counters.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use hookline_core::{storage::Storage, Clock};
use hookline_delivery::{EngineStats, ReadyState, TriggerService};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{debug, info, instrument, warn};

/// Shared state for the health handlers.
#[derive(Clone)]
pub struct AppState {
    /// Event store, probed for connectivity.
    pub storage: Arc<Storage>,
    /// The running engine.
    pub service: Arc<TriggerService>,
    /// Time source for response timestamps.
    pub clock: Arc<dyn Clock>,
}

/// Component status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    /// Working.
    Up,
    /// Not yet available.
    Pending,
    /// Failed.
    Down,
}

#[derive(Debug, Serialize)]
struct ComponentHealth {
    status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: ComponentStatus,
    timestamp: DateTime<Utc>,
    version: &'static str,
    service_state: String,
    database: ComponentHealth,
    subscription: ComponentHealth,
    stats: EngineStats,
}

/// Builds the health router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/live", get(live))
        .layer(TimeoutLayer::new(Duration::from_secs(10)))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves the health router until `shutdown` is cancelled.
pub async fn serve(
    state: AppState,
    addr: SocketAddr,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "health server listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    info!("health server stopped");
    Ok(())
}

fn subscription_health(state: ReadyState) -> ComponentHealth {
    match state {
        ReadyState::Ready => ComponentHealth { status: ComponentStatus::Up, message: None },
        ReadyState::Pending => ComponentHealth {
            status: ComponentStatus::Pending,
            message: Some("subscribing to notifications".to_string()),
        },
        ReadyState::Failed => ComponentHealth {
            status: ComponentStatus::Down,
            message: Some("notification subscription failed".to_string()),
        },
    }
}

async fn database_health(storage: &Storage) -> ComponentHealth {
    match storage.health_check().await {
        Ok(()) => ComponentHealth { status: ComponentStatus::Up, message: None },
        Err(e) => {
            warn!(error = %e, "database health check failed");
            ComponentHealth {
                status: ComponentStatus::Down,
                message: Some(format!("database connection failed: {e}")),
            }
        },
    }
}

#[instrument(name = "health_check", skip(state))]
async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let subscription = subscription_health(state.service.readiness().state());
    let database = database_health(&state.storage).await;

    let status = match (database.status, subscription.status) {
        (ComponentStatus::Up, ComponentStatus::Up) => ComponentStatus::Up,
        (ComponentStatus::Down, _) | (_, ComponentStatus::Down) => ComponentStatus::Down,
        _ => ComponentStatus::Pending,
    };
    let code =
        if status == ComponentStatus::Up { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };

    let response = HealthResponse {
        status,
        timestamp: state.clock.now_utc(),
        version: env!("CARGO_PKG_VERSION"),
        service_state: state.service.state().to_string(),
        database,
        subscription,
        stats: state.service.stats().await,
    };
    debug!(status = ?response.status, "health check completed");

    (code, Json(response))
}

#[instrument(name = "readiness_check", skip(state))]
async fn ready(State(state): State<AppState>) -> impl IntoResponse {
    let subscription = subscription_health(state.service.readiness().state());
    if subscription.status != ComponentStatus::Up {
        return (StatusCode::SERVICE_UNAVAILABLE, Json(subscription));
    }

    let database = database_health(&state.storage).await;
    let code = if database.status == ComponentStatus::Up {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(database))
}

async fn live(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "alive",
        "timestamp": state.clock.now_utc(),
        "service": "hookline",
    }))
}
