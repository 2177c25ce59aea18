//! Periodic reconciliation tasks: backlog recovery and retention cleanup.
//!
//! Both loops sleep on tokio time and stop as soon as the cancellation token
//! fires. A failed tick is logged and retried on the next one.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use hookline_core::{Clock, WebhookId};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    rate_limit::EndpointRateLimiter,
    storage::DeliveryStorage,
    worker::EngineStats,
};

/// Pushes `id` onto the queue, waiting for room unless cancelled.
///
/// Returns false if cancelled or the queue is closed.
pub(crate) async fn enqueue(
    queue: &mpsc::Sender<WebhookId>,
    id: WebhookId,
    cancel: &CancellationToken,
    stats: &RwLock<EngineStats>,
) -> bool {
    let sent = tokio::select! {
        biased;
        () = cancel.cancelled() => false,
        result = queue.send(id) => result.is_ok(),
    };
    if sent {
        stats.write().await.webhooks_enqueued += 1;
    }
    sent
}

/// Re-enqueues webhooks with due events on an adjustable interval.
pub(crate) struct BacklogTicker {
    pub storage: Arc<dyn DeliveryStorage>,
    pub clock: Arc<dyn Clock>,
    pub queue: mpsc::Sender<WebhookId>,
    pub interval_ms: Arc<AtomicU64>,
    pub batch_size: usize,
    pub stats: Arc<RwLock<EngineStats>>,
    pub cancellation_token: CancellationToken,
}

impl BacklogTicker {
    /// Runs one scan immediately, then one per interval.
    ///
    /// The interval is re-read before every sleep, so changes apply from the
    /// next tick.
    pub async fn run(self) {
        loop {
            self.tick().await;

            let interval = Duration::from_millis(self.interval_ms.load(Ordering::Acquire));
            tokio::select! {
                () = tokio::time::sleep(interval) => {},
                () = self.cancellation_token.cancelled() => break,
            }
        }
        debug!("backlog ticker stopped");
    }

    /// Enqueues up to `batch_size` webhooks with due events.
    pub async fn tick(&self) -> usize {
        let ids = match self
            .storage
            .find_webhooks_with_due_events(self.batch_size, self.clock.now_utc())
            .await
        {
            Ok(ids) => ids,
            Err(e) => {
                warn!(error = %e, "backlog scan failed");
                return 0;
            },
        };

        self.stats.write().await.backlog_runs += 1;

        let mut enqueued = 0;
        for id in ids {
            if !enqueue(&self.queue, id, &self.cancellation_token, &self.stats).await {
                break;
            }
            enqueued += 1;
        }

        if enqueued > 0 {
            debug!(enqueued, "backlog webhooks re-enqueued");
        }
        enqueued
    }
}

/// Deletes processed events past retention and prunes idle limiter keys.
pub(crate) struct CleanupTicker {
    pub storage: Arc<dyn DeliveryStorage>,
    pub clock: Arc<dyn Clock>,
    pub rate_limiter: Arc<EndpointRateLimiter>,
    pub interval: Duration,
    pub retention: Duration,
    pub stats: Arc<RwLock<EngineStats>>,
    pub cancellation_token: CancellationToken,
}

impl CleanupTicker {
    /// Runs one cleanup per interval, starting after the first interval.
    pub async fn run(self) {
        loop {
            tokio::select! {
                () = tokio::time::sleep(self.interval) => {},
                () = self.cancellation_token.cancelled() => break,
            }
            self.tick().await;
        }
        debug!("cleanup ticker stopped");
    }

    /// Performs one cleanup pass. Returns the rows removed.
    pub async fn tick(&self) -> u64 {
        self.rate_limiter.prune();

        let Ok(retention) = chrono::Duration::from_std(self.retention) else {
            warn!("retention period out of range, skipping cleanup");
            return 0;
        };
        let cutoff = self.clock.now_utc() - retention;

        match self.storage.delete_processed_before(cutoff).await {
            Ok(removed) => {
                if removed > 0 {
                    info!(removed, cutoff = %cutoff, "removed processed events past retention");
                }
                self.stats.write().await.events_cleaned += removed;
                removed
            },
            Err(e) => {
                warn!(error = %e, "retention cleanup failed");
                0
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use hookline_core::{Operation, RowChange, TestClock, Webhook, WebhookEvent};

    use super::*;
    use crate::storage::mock::MockDeliveryStorage;

    fn change() -> RowChange {
        RowChange {
            operation: Operation::Delete,
            schema: "public".to_string(),
            table: "orders".to_string(),
            record_id: Some("9".to_string()),
            old_record: Some(serde_json::json!({"id": 9})),
            new_record: None,
        }
    }

    #[tokio::test]
    async fn backlog_tick_enqueues_only_webhooks_with_due_events() {
        let storage = MockDeliveryStorage::new();
        let clock = TestClock::new();
        let due = Webhook::new("due", "https://a.example");
        let waiting = Webhook::new("waiting", "https://b.example");
        storage.add_webhook(due.clone()).await;
        storage.add_webhook(waiting.clone()).await;

        storage.add_event(WebhookEvent::from_change(due.id, &change(), clock.now_utc())).await;
        let mut later = WebhookEvent::from_change(waiting.id, &change(), clock.now_utc());
        later.attempts = 1;
        later.next_retry_at = Some(clock.now_utc() + chrono::Duration::seconds(60));
        storage.add_event(later).await;

        let (tx, mut rx) = mpsc::channel(8);
        let stats = Arc::new(RwLock::new(EngineStats::default()));
        let ticker = BacklogTicker {
            storage: Arc::new(storage),
            clock: Arc::new(clock.clone()),
            queue: tx,
            interval_ms: Arc::new(AtomicU64::new(1000)),
            batch_size: 50,
            stats: stats.clone(),
            cancellation_token: CancellationToken::new(),
        };

        assert_eq!(ticker.tick().await, 1);
        assert_eq!(rx.try_recv().ok(), Some(due.id));
        assert!(rx.try_recv().is_err());

        clock.advance(Duration::from_secs(60));
        assert_eq!(ticker.tick().await, 2);
        assert_eq!(stats.read().await.backlog_runs, 2);
        assert_eq!(stats.read().await.webhooks_enqueued, 3);
    }

    #[tokio::test]
    async fn cleanup_tick_removes_only_old_processed_events() {
        let storage = MockDeliveryStorage::new();
        let clock = TestClock::new();
        let webhook = Webhook::new("hook", "https://a.example");
        storage.add_webhook(webhook.clone()).await;

        let mut old = WebhookEvent::from_change(webhook.id, &change(), clock.now_utc());
        old.processed = true;
        let pending = WebhookEvent::from_change(webhook.id, &change(), clock.now_utc());
        storage.add_event(old).await;
        storage.add_event(pending.clone()).await;

        clock.advance(Duration::from_secs(8 * 24 * 3600));
        let stats = Arc::new(RwLock::new(EngineStats::default()));
        let ticker = CleanupTicker {
            storage: Arc::new(storage.clone()),
            clock: Arc::new(clock.clone()),
            rate_limiter: Arc::new(EndpointRateLimiter::new(60, Arc::new(clock))),
            interval: Duration::from_secs(3600),
            retention: Duration::from_secs(7 * 24 * 3600),
            stats: stats.clone(),
            cancellation_token: CancellationToken::new(),
        };

        assert_eq!(ticker.tick().await, 1);
        assert_eq!(stats.read().await.events_cleaned, 1);
        let remaining = storage.events_for(webhook.id).await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, pending.id);
    }

    #[tokio::test]
    async fn enqueue_gives_up_when_cancelled_on_full_queue() {
        let (tx, _rx) = mpsc::channel(1);
        let stats = RwLock::new(EngineStats::default());
        let cancel = CancellationToken::new();

        assert!(enqueue(&tx, WebhookId::new(), &cancel, &stats).await);
        cancel.cancel();
        assert!(!enqueue(&tx, WebhookId::new(), &cancel, &stats).await);
        assert_eq!(stats.read().await.webhooks_enqueued, 1);
    }
}
