//! Webhook delivery engine.
//!
//! Turns queued row-change events into signed HTTP callbacks with
//! at-least-once semantics, using only the event store and in-process
//! coordination.
//!
//! # Architecture
//!
//! ```text
//! notification source ─► listener ─┐
//! backlog ticker ──────────────────┼─► bounded queue ─► N workers
//! dispatch_change ─────────────────┘         │
//!                                            ▼
//!               fetch due batch ─► rate limiter ─► sign + POST ─► write back
//! ```
//!
//! Workers receive webhook ids, not events: each id triggers a fetch of up
//! to `batch_size` due events for that webhook in creation order. Retry
//! state lives on the event row, so a crash loses nothing; the backlog
//! ticker re-enqueues whatever is due.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use hookline_core::storage::Storage;
//! use hookline_delivery::{
//!     notify::PgNotificationSource, storage::PostgresDeliveryStorage, DeliveryError,
//!     TriggerConfig, TriggerService,
//! };
//! use sqlx::PgPool;
//!
//! # async fn example(pool: PgPool) -> Result<(), DeliveryError> {
//! let storage = Arc::new(PostgresDeliveryStorage::new(Arc::new(Storage::new(pool.clone()))));
//! let source = Arc::new(PgNotificationSource::new(pool, "webhook_events"));
//! let service = TriggerService::new(storage, source, TriggerConfig::default())?;
//!
//! service.start().await?;
//! // ...
//! service.stop().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod client;
pub mod error;
mod listener;
pub mod notify;
pub mod payload;
pub mod rate_limit;
pub mod readiness;
pub mod retry;
mod scheduler;
pub mod service;
pub mod signing;
pub mod storage;
pub mod url_guard;
mod worker;
mod worker_pool;

pub use client::{ClientConfig, DeliveryClient, DeliveryResponse};
pub use error::{DeliveryError, ErrorCategory, Result};
pub use listener::SubscribeRetry;
pub use payload::WebhookPayload;
pub use rate_limit::EndpointRateLimiter;
pub use readiness::{ReadyState, Readiness};
pub use retry::{RetryContext, RetryDecision, RetryPolicy};
pub use service::{ServiceState, TriggerConfig, TriggerService, DEFAULT_WORKER_COUNT};
pub use url_guard::UrlGuard;
pub use worker::{AttemptOutcome, BatchSummary, EngineStats};
