//! Per-webhook batch processing.
//!
//! A worker receives a webhook id, loads up to `batch_size` due events for
//! it in creation order, and attempts each one. Every attempt ends in an
//! [`AttemptOutcome`] that decides the bookkeeping written back to the
//! event row. Failures are recorded on the row and never abort the batch.

use std::{sync::Arc, time::Duration};

use hookline_core::{Clock, DeliveryStatus, Webhook, WebhookDelivery, WebhookEvent, WebhookId};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{
    client::DeliveryClient,
    error::{DeliveryError, ErrorCategory, Result},
    payload::WebhookPayload,
    rate_limit::EndpointRateLimiter,
    retry::{RetryContext, RetryDecision, RetryPolicy},
    storage::DeliveryStorage,
};

/// Counters for monitoring the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStats {
    /// Number of running delivery workers.
    pub active_workers: usize,
    /// Webhook ids pushed onto the work queue.
    pub webhooks_enqueued: u64,
    /// Batches processed by workers.
    pub batches_processed: u64,
    /// Events delivered successfully.
    pub events_delivered: u64,
    /// Failed attempts with a retry scheduled.
    pub events_retried: u64,
    /// Events that exhausted their attempts.
    pub events_terminal: u64,
    /// Attempts deferred by the rate limiter.
    pub events_rate_limited: u64,
    /// Backlog scans run.
    pub backlog_runs: u64,
    /// Processed events removed by retention cleanup.
    pub events_cleaned: u64,
    /// Times the notification subscription was re-established.
    pub subscription_reconnects: u64,
}

/// Result of a single delivery attempt.
#[derive(Debug)]
pub enum AttemptOutcome {
    /// The receiver accepted the payload.
    Delivered {
        /// HTTP status returned
        status_code: u16,
    },
    /// The rate limiter refused the attempt; nothing was sent.
    RateLimited,
    /// The attempt failed.
    Failed(DeliveryError),
}

/// What happened to one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    /// Events fetched for the batch.
    pub fetched: usize,
    /// Events delivered.
    pub delivered: usize,
    /// Failed attempts rescheduled.
    pub retried: usize,
    /// Events made terminal.
    pub terminal: usize,
    /// Events deferred by the rate limiter.
    pub rate_limited: usize,
}

/// Everything a worker needs to process a webhook.
pub(crate) struct DeliveryContext {
    pub storage: Arc<dyn DeliveryStorage>,
    pub client: Arc<DeliveryClient>,
    pub rate_limiter: Arc<EndpointRateLimiter>,
    pub clock: Arc<dyn Clock>,
    pub stats: Arc<RwLock<EngineStats>>,
    pub batch_size: usize,
    pub rate_limit_delay: Duration,
    pub fail_fast_on_unsafe_destination: bool,
}

impl DeliveryContext {
    /// Processes one batch of due events for `webhook_id`.
    pub async fn process_webhook(
        &self,
        webhook_id: WebhookId,
        cancel: &CancellationToken,
    ) -> Result<BatchSummary> {
        let mut summary = BatchSummary::default();

        let Some(webhook) = self.storage.find_webhook(webhook_id).await? else {
            debug!(webhook_id = %webhook_id, "webhook no longer exists, skipping");
            return Ok(summary);
        };
        if !webhook.enabled {
            debug!(webhook_id = %webhook_id, "webhook disabled, skipping");
            return Ok(summary);
        }

        let events = self
            .storage
            .fetch_due_events(webhook_id, self.batch_size, self.clock.now_utc())
            .await?;
        summary.fetched = events.len();
        if events.is_empty() {
            return Ok(summary);
        }

        debug!(webhook_id = %webhook_id, batch_size = events.len(), "processing event batch");

        let policy =
            RetryPolicy::for_webhook(&webhook).with_fail_fast(self.fail_fast_on_unsafe_destination);

        for event in events {
            if cancel.is_cancelled() {
                break;
            }

            let span = info_span!(
                "webhook_delivery",
                webhook_id = %webhook.id,
                event_id = %event.id,
                attempt = event.attempts + 1,
            );

            async {
                let outcome = self.attempt(&webhook, &event, cancel).await;
                if let Err(e) = self.apply_outcome(&policy, &event, outcome, &mut summary).await {
                    error!(error = %e, "failed to record delivery outcome");
                }
            }
            .instrument(span)
            .await;
        }

        self.stats.write().await.batches_processed += 1;
        Ok(summary)
    }

    /// Makes exactly one attempt at `event`, including the audit trail.
    async fn attempt(
        &self,
        webhook: &Webhook,
        event: &WebhookEvent,
        cancel: &CancellationToken,
    ) -> AttemptOutcome {
        if !self.rate_limiter.allow(&webhook.url) {
            return AttemptOutcome::RateLimited;
        }

        let started = self.clock.now_utc();
        let audit = WebhookDelivery::pending(event, started);
        let audit_id = audit.id;
        let audited = match self.storage.create_delivery(audit).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "failed to create delivery audit row");
                false
            },
        };

        let payload = WebhookPayload::from_event(event, started);
        let outcome = match self.client.deliver(cancel, webhook, &payload).await {
            Ok(response) => AttemptOutcome::Delivered { status_code: response.status_code },
            Err(e) => AttemptOutcome::Failed(e),
        };

        if audited {
            let (status, code, message) = match &outcome {
                AttemptOutcome::Delivered { status_code } => {
                    (DeliveryStatus::Success, Some(i32::from(*status_code)), None)
                },
                AttemptOutcome::Failed(e) => {
                    (DeliveryStatus::Failed, e.status_code().map(i32::from), Some(e.to_string()))
                },
                AttemptOutcome::RateLimited => (DeliveryStatus::Failed, None, None),
            };
            if let Err(e) = self
                .storage
                .complete_delivery(audit_id, status, code, message, self.clock.now_utc())
                .await
            {
                warn!(error = %e, "failed to complete delivery audit row");
            }
        }

        outcome
    }

    async fn apply_outcome(
        &self,
        policy: &RetryPolicy,
        event: &WebhookEvent,
        outcome: AttemptOutcome,
        summary: &mut BatchSummary,
    ) -> Result<()> {
        let now = self.clock.now_utc();

        match outcome {
            AttemptOutcome::Delivered { status_code } => {
                self.storage.mark_processed(event.id, now).await?;
                summary.delivered += 1;
                self.stats.write().await.events_delivered += 1;
                info!(status_code, "webhook delivered");
            },
            AttemptOutcome::RateLimited => {
                let delay = chrono::Duration::from_std(self.rate_limit_delay)
                    .map_err(|e| DeliveryError::internal(e.to_string()))?;
                self.storage.reschedule(event.id, now + delay).await?;
                summary.rate_limited += 1;
                self.stats.write().await.events_rate_limited += 1;
                debug!(delay_ms = self.rate_limit_delay.as_millis(), "rate limited, rescheduled");
            },
            AttemptOutcome::Failed(error) => {
                let decision =
                    RetryContext { attempts: event.attempts, error: &error, failed_at: now, policy }
                        .decide();

                self.storage
                    .record_failure(
                        event.id,
                        decision.attempts(),
                        decision.next_retry_at(),
                        error.to_string(),
                        now,
                    )
                    .await?;

                let category = ErrorCategory::from(&error);
                match decision {
                    RetryDecision::Retry { attempts, next_attempt_at } => {
                        summary.retried += 1;
                        self.stats.write().await.events_retried += 1;
                        warn!(
                            attempts,
                            next_retry_at = %next_attempt_at,
                            category = %category,
                            error = %error,
                            "delivery failed, retry scheduled"
                        );
                    },
                    RetryDecision::GiveUp { attempts, reason } => {
                        summary.terminal += 1;
                        self.stats.write().await.events_terminal += 1;
                        error!(
                            attempts,
                            reason = %reason,
                            category = %category,
                            error = %error,
                            "delivery permanently failed"
                        );
                    },
                }
            },
        }

        Ok(())
    }
}

/// Worker draining webhook ids from the shared queue.
pub(crate) struct DeliveryWorker {
    id: usize,
    context: Arc<DeliveryContext>,
    queue: Arc<Mutex<mpsc::Receiver<WebhookId>>>,
    cancellation_token: CancellationToken,
}

impl DeliveryWorker {
    pub fn new(
        id: usize,
        context: Arc<DeliveryContext>,
        queue: Arc<Mutex<mpsc::Receiver<WebhookId>>>,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self { id, context, queue, cancellation_token }
    }

    /// Main worker loop: pop a webhook id, process it, repeat until
    /// cancelled or the queue closes.
    pub async fn run(&self) -> Result<()> {
        loop {
            let next = tokio::select! {
                biased;
                () = self.cancellation_token.cancelled() => break,
                id = async { self.queue.lock().await.recv().await } => id,
            };

            let Some(webhook_id) = next else {
                debug!(worker_id = self.id, "work queue closed");
                break;
            };

            match self.context.process_webhook(webhook_id, &self.cancellation_token).await {
                Ok(summary) if summary.fetched > 0 => {
                    debug!(
                        worker_id = self.id,
                        webhook_id = %webhook_id,
                        delivered = summary.delivered,
                        retried = summary.retried,
                        terminal = summary.terminal,
                        rate_limited = summary.rate_limited,
                        "batch complete"
                    );
                },
                Ok(_) => {},
                Err(e) => {
                    error!(
                        worker_id = self.id,
                        webhook_id = %webhook_id,
                        error = %e,
                        "batch processing failed"
                    );
                },
            }
        }

        Ok(())
    }
}
