//! Core domain models, clock abstraction and persistence for hookline.
//!
//! Defines the webhook configuration and change-event records the delivery
//! engine reads and writes, strongly-typed identifiers, and the PostgreSQL
//! repositories backing the event store. Every other crate builds on these
//! types.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod models;
pub mod storage;
pub mod time;

pub use error::{CoreError, Result};
pub use models::{
    DeliveryStatus, EventId, EventSubscription, Operation, RowChange, Webhook, WebhookDelivery,
    WebhookEvent, WebhookId,
};
pub use time::{Clock, RealClock, TestClock};
