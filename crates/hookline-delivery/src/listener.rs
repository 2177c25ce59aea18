//! Notification listener: subscribes, forwards webhook ids to the work
//! queue, and resubscribes when the subscription drops.

use std::{sync::Arc, time::Duration};

use hookline_core::WebhookId;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    error::{DeliveryError, Result},
    notify::{NotificationSource, Subscription},
    scheduler::enqueue,
    worker::EngineStats,
};

/// Bounded exponential retry for subscribing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscribeRetry {
    /// Attempts per round.
    pub attempts: u32,
    /// Delay after the first failure.
    pub initial_backoff: Duration,
    /// Upper bound for the doubling delay.
    pub max_backoff: Duration,
}

impl Default for SubscribeRetry {
    fn default() -> Self {
        Self {
            attempts: 5,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl SubscribeRetry {
    /// Delay after failed attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_backoff.saturating_mul(factor).min(self.max_backoff)
    }
}

/// Subscribes, retrying up to `retry.attempts` times.
///
/// # Errors
///
/// `SubscriptionFailed` once attempts are exhausted, `Cancelled` if `cancel`
/// fires while waiting.
pub(crate) async fn subscribe_with_retry(
    source: &dyn NotificationSource,
    retry: SubscribeRetry,
    cancel: &CancellationToken,
) -> Result<Box<dyn Subscription>> {
    let attempts = retry.attempts.max(1);
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        if cancel.is_cancelled() {
            return Err(DeliveryError::Cancelled);
        }

        match source.subscribe().await {
            Ok(subscription) => {
                debug!(attempt, "notification subscription established");
                return Ok(subscription);
            },
            Err(e) => {
                warn!(attempt, max_attempts = attempts, error = %e, "subscribe failed");
                last_error = e.to_string();
            },
        }

        if attempt < attempts {
            tokio::select! {
                () = tokio::time::sleep(retry.backoff(attempt)) => {},
                () = cancel.cancelled() => return Err(DeliveryError::Cancelled),
            }
        }
    }

    Err(DeliveryError::SubscriptionFailed { attempts, message: last_error })
}

/// Task forwarding notifications into the work queue.
pub(crate) struct Listener {
    pub source: Arc<dyn NotificationSource>,
    pub retry: SubscribeRetry,
    pub queue: mpsc::Sender<WebhookId>,
    pub stats: Arc<RwLock<EngineStats>>,
    pub cancellation_token: CancellationToken,
}

impl Listener {
    /// Runs until cancelled, starting from an established subscription.
    pub async fn run(self, mut subscription: Box<dyn Subscription>) {
        loop {
            let next = tokio::select! {
                biased;
                () = self.cancellation_token.cancelled() => break,
                next = subscription.next() => next,
            };

            match next {
                Some(webhook_id) => {
                    debug!(webhook_id = %webhook_id, "notification received");
                    if !enqueue(&self.queue, webhook_id, &self.cancellation_token, &self.stats).await
                    {
                        break;
                    }
                },
                None => match self.reconnect().await {
                    Some(fresh) => subscription = fresh,
                    None => break,
                },
            }
        }
        debug!("notification listener stopped");
    }

    /// Resubscribes in rounds until it succeeds or is cancelled.
    async fn reconnect(&self) -> Option<Box<dyn Subscription>> {
        warn!("notification subscription ended, reconnecting");
        tokio::select! {
            () = tokio::time::sleep(self.retry.initial_backoff) => {},
            () = self.cancellation_token.cancelled() => return None,
        }
        loop {
            match subscribe_with_retry(self.source.as_ref(), self.retry, &self.cancellation_token)
                .await
            {
                Ok(subscription) => {
                    self.stats.write().await.subscription_reconnects += 1;
                    info!("notification subscription re-established");
                    return Some(subscription);
                },
                Err(DeliveryError::Cancelled) => return None,
                Err(e) => {
                    error!(error = %e, "reconnect round failed; backlog recovery continues");
                    tokio::select! {
                        () = tokio::time::sleep(self.retry.max_backoff) => {},
                        () = self.cancellation_token.cancelled() => return None,
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::ChannelNotificationSource;

    #[test]
    fn backoff_doubles_and_caps() {
        let retry = SubscribeRetry::default();
        assert_eq!(retry.backoff(1), Duration::from_millis(200));
        assert_eq!(retry.backoff(2), Duration::from_millis(400));
        assert_eq!(retry.backoff(3), Duration::from_millis(800));
        assert_eq!(retry.backoff(4), Duration::from_millis(1600));
        assert_eq!(retry.backoff(5), Duration::from_secs(2));
        assert_eq!(retry.backoff(40), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn subscribe_retries_until_success() {
        let (source, _tx) = ChannelNotificationSource::new(1);
        let source = source.failing(3);

        let result =
            subscribe_with_retry(&source, SubscribeRetry::default(), &CancellationToken::new())
                .await;
        assert!(result.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn subscribe_gives_up_after_bounded_attempts() {
        let (source, _tx) = ChannelNotificationSource::new(1);
        let source = source.failing(10);

        let err = subscribe_with_retry(&source, SubscribeRetry::default(), &CancellationToken::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, DeliveryError::SubscriptionFailed { attempts: 5, .. }));
    }

    #[tokio::test]
    async fn subscribe_honours_cancellation() {
        let (source, _tx) = ChannelNotificationSource::new(1);
        let source = source.failing(10);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = subscribe_with_retry(&source, SubscribeRetry::default(), &cancel)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, DeliveryError::Cancelled));
    }
}
