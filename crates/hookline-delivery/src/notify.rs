//! Change-notification sources.
//!
//! A subscription yields webhook ids whose events need attention. When it
//! returns `None` the connection is gone and the service resubscribes;
//! nothing is lost because the events themselves are durable.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use async_trait::async_trait;
use hookline_core::WebhookId;
use serde::Deserialize;
use sqlx::{postgres::PgListener, PgPool};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::error::{DeliveryError, Result};

/// Default `LISTEN` channel.
pub const DEFAULT_CHANNEL: &str = "webhook_events";

/// Something the service can subscribe to for webhook ids.
#[async_trait]
pub trait NotificationSource: Send + Sync + 'static {
    /// Opens a new subscription.
    async fn subscribe(&self) -> Result<Box<dyn Subscription>>;
}

/// A live subscription.
#[async_trait]
pub trait Subscription: Send {
    /// Next webhook id, or `None` when the subscription has ended.
    async fn next(&mut self) -> Option<WebhookId>;
}

#[derive(Deserialize)]
struct NotificationPayload {
    webhook_id: WebhookId,
}

/// Parses a notification payload: a bare UUID or `{"webhook_id": "..."}`.
pub fn parse_payload(payload: &str) -> Option<WebhookId> {
    let trimmed = payload.trim();
    if let Ok(id) = trimmed.parse::<WebhookId>() {
        return Some(id);
    }
    serde_json::from_str::<NotificationPayload>(trimmed).ok().map(|p| p.webhook_id)
}

/// PostgreSQL `LISTEN`/`NOTIFY` source.
pub struct PgNotificationSource {
    pool: PgPool,
    channel: String,
}

impl PgNotificationSource {
    /// Listens on `channel` using connections from `pool`.
    pub fn new(pool: PgPool, channel: impl Into<String>) -> Self {
        Self { pool, channel: channel.into() }
    }
}

#[async_trait]
impl NotificationSource for PgNotificationSource {
    async fn subscribe(&self) -> Result<Box<dyn Subscription>> {
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(|e| DeliveryError::database(format!("listener connect: {e}")))?;
        listener
            .listen(&self.channel)
            .await
            .map_err(|e| DeliveryError::database(format!("LISTEN {}: {e}", self.channel)))?;

        debug!(channel = %self.channel, "listening for notifications");
        Ok(Box::new(PgSubscription { listener, channel: self.channel.clone() }))
    }
}

struct PgSubscription {
    listener: PgListener,
    channel: String,
}

#[async_trait]
impl Subscription for PgSubscription {
    async fn next(&mut self) -> Option<WebhookId> {
        loop {
            match self.listener.try_recv().await {
                Ok(Some(notification)) => match parse_payload(notification.payload()) {
                    Some(id) => return Some(id),
                    None => {
                        warn!(
                            channel = %self.channel,
                            payload = notification.payload(),
                            "ignoring malformed notification"
                        );
                    },
                },
                Ok(None) => {
                    warn!(channel = %self.channel, "notification connection lost");
                    return None;
                },
                Err(e) => {
                    warn!(channel = %self.channel, error = %e, "notification receive failed");
                    return None;
                },
            }
        }
    }
}

type SharedReceiver = std::sync::Arc<Mutex<mpsc::Receiver<WebhookId>>>;

/// In-process source fed through channels.
///
/// Subscriptions are handed one channel each, in order; once the channels
/// run out every further subscription shares the last one. Dropping a
/// channel's sender ends the subscription reading it. Subscribing can be
/// made to fail a set number of times.
pub struct ChannelNotificationSource {
    receivers: Vec<SharedReceiver>,
    subscribed: AtomicUsize,
    failures_remaining: AtomicU32,
}

impl ChannelNotificationSource {
    /// Creates a source and the sender feeding it.
    pub fn new(capacity: usize) -> (Self, mpsc::Sender<WebhookId>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::from_receivers(vec![rx]), tx)
    }

    /// Creates a source that hands each of the first `subscriptions`
    /// subscriptions its own channel, returning the senders in order.
    pub fn reconnectable(
        capacity: usize,
        subscriptions: usize,
    ) -> (Self, Vec<mpsc::Sender<WebhookId>>) {
        let (senders, receivers): (Vec<_>, Vec<_>) =
            (0..subscriptions.max(1)).map(|_| mpsc::channel(capacity.max(1))).unzip();
        (Self::from_receivers(receivers), senders)
    }

    fn from_receivers(receivers: Vec<mpsc::Receiver<WebhookId>>) -> Self {
        Self {
            receivers: receivers.into_iter().map(|rx| std::sync::Arc::new(Mutex::new(rx))).collect(),
            subscribed: AtomicUsize::new(0),
            failures_remaining: AtomicU32::new(0),
        }
    }

    /// Makes the next `count` subscribe calls fail.
    #[must_use]
    pub fn failing(self, count: u32) -> Self {
        self.failures_remaining.store(count, Ordering::Release);
        self
    }
}

#[async_trait]
impl NotificationSource for ChannelNotificationSource {
    async fn subscribe(&self) -> Result<Box<dyn Subscription>> {
        let failed = self
            .failures_remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(DeliveryError::network("notification source unavailable"));
        }

        let index = self.subscribed.fetch_add(1, Ordering::AcqRel);
        let rx = self
            .receivers
            .get(index)
            .or_else(|| self.receivers.last())
            .ok_or_else(|| DeliveryError::internal("notification source has no channels"))?;
        Ok(Box::new(ChannelSubscription { rx: rx.clone() }))
    }
}

struct ChannelSubscription {
    rx: SharedReceiver,
}

#[async_trait]
impl Subscription for ChannelSubscription {
    async fn next(&mut self) -> Option<WebhookId> {
        self.rx.lock().await.recv().await
    }
}
