//! Trigger service: lifecycle and wiring of the delivery engine.
//!
//! `start()` subscribes to the notification source (bounded retry), signals
//! readiness, then spawns the listener, the worker pool and the two
//! tickers. `stop()` cancels everything and waits for it within the
//! shutdown timeout. Work flows listener/backlog/dispatch → bounded queue →
//! workers.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering},
        Arc,
    },
    time::Duration,
};

use hookline_core::{Clock, EventId, RealClock, RowChange, WebhookEvent, WebhookId};
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{mpsc, Mutex, RwLock},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    client::{ClientConfig, DeliveryClient},
    error::{DeliveryError, Result},
    listener::{subscribe_with_retry, Listener, SubscribeRetry},
    notify::NotificationSource,
    rate_limit::{EndpointRateLimiter, DEFAULT_LIMIT_PER_MINUTE},
    readiness::Readiness,
    scheduler::{enqueue, BacklogTicker, CleanupTicker},
    storage::DeliveryStorage,
    url_guard::UrlGuard,
    worker::{BatchSummary, DeliveryContext, EngineStats},
    worker_pool::WorkerPool,
};

/// Worker count used when a non-positive count is configured.
pub const DEFAULT_WORKER_COUNT: usize = 4;

/// Configuration for the trigger service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerConfig {
    /// Concurrent delivery workers. Non-positive values mean
    /// [`DEFAULT_WORKER_COUNT`].
    pub worker_count: i64,

    /// Capacity of the webhook-id work queue.
    pub queue_capacity: usize,

    /// Maximum events per webhook batch.
    pub batch_size: usize,

    /// Interval between backlog scans.
    pub backlog_interval: Duration,

    /// Maximum webhooks re-enqueued per backlog scan.
    pub backlog_batch_size: usize,

    /// Interval between retention cleanups.
    pub cleanup_interval: Duration,

    /// Age after which processed events are deleted.
    pub retention: Duration,

    /// Admissions per destination per minute.
    pub rate_limit_per_minute: i64,

    /// Delay applied to events refused by the rate limiter.
    pub rate_limit_delay: Duration,

    /// HTTP client configuration.
    pub client: ClientConfig,

    /// Skip destination address checks (non-production only).
    pub allow_private_destinations: bool,

    /// Make destination validation failures terminal on first occurrence.
    pub fail_fast_on_unsafe_destination: bool,

    /// Subscription attempts per round.
    pub subscribe_attempts: u32,

    /// Delay after the first failed subscription attempt.
    pub subscribe_initial_backoff: Duration,

    /// Cap for the doubling subscription backoff.
    pub subscribe_max_backoff: Duration,

    /// Time allowed for tasks to finish on stop.
    pub shutdown_timeout: Duration,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            queue_capacity: 1000,
            batch_size: 10,
            backlog_interval: Duration::from_secs(30),
            backlog_batch_size: 50,
            cleanup_interval: Duration::from_secs(3600),
            retention: Duration::from_secs(7 * 24 * 3600),
            rate_limit_per_minute: DEFAULT_LIMIT_PER_MINUTE,
            rate_limit_delay: Duration::from_secs(10),
            client: ClientConfig::default(),
            allow_private_destinations: false,
            fail_fast_on_unsafe_destination: false,
            subscribe_attempts: 5,
            subscribe_initial_backoff: Duration::from_millis(200),
            subscribe_max_backoff: Duration::from_secs(2),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl TriggerConfig {
    /// Worker count after applying the non-positive fallback.
    pub fn effective_worker_count(&self) -> usize {
        usize::try_from(self.worker_count).ok().filter(|n| *n > 0).unwrap_or(DEFAULT_WORKER_COUNT)
    }

    fn subscribe_retry(&self) -> SubscribeRetry {
        SubscribeRetry {
            attempts: self.subscribe_attempts,
            initial_backoff: self.subscribe_initial_backoff,
            max_backoff: self.subscribe_max_backoff,
        }
    }
}

/// Lifecycle state of the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServiceState {
    /// Not running.
    Stopped = 0,
    /// Subscribing to notifications.
    Starting = 1,
    /// Subscribed; spawning workers.
    Listening = 2,
    /// Fully running.
    Running = 3,
    /// Shutting down.
    Stopping = 4,
}

impl ServiceState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Starting,
            2 => Self::Listening,
            3 => Self::Running,
            4 => Self::Stopping,
            _ => Self::Stopped,
        }
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Starting => write!(f, "starting"),
            Self::Listening => write!(f, "listening"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
        }
    }
}

struct Running {
    cancellation_token: CancellationToken,
    queue: mpsc::Sender<WebhookId>,
    worker_pool: WorkerPool,
    tasks: Vec<JoinHandle<()>>,
}

/// Webhook delivery engine.
pub struct TriggerService {
    config: TriggerConfig,
    storage: Arc<dyn DeliveryStorage>,
    source: Arc<dyn NotificationSource>,
    clock: Arc<dyn Clock>,
    guard: UrlGuard,
    context: Arc<DeliveryContext>,
    readiness: Arc<Readiness>,
    stats: Arc<RwLock<EngineStats>>,
    backlog_interval_ms: Arc<AtomicU64>,
    state: AtomicU8,
    started: AtomicBool,
    root_token: CancellationToken,
    running: Mutex<Option<Running>>,
}

impl TriggerService {
    /// Creates a service using the system clock.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError` if the HTTP client cannot be built.
    pub fn new(
        storage: Arc<dyn DeliveryStorage>,
        source: Arc<dyn NotificationSource>,
        config: TriggerConfig,
    ) -> Result<Self> {
        Self::with_clock(storage, source, config, Arc::new(RealClock::new()))
    }

    /// Creates a service reading time from `clock`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError` if the HTTP client cannot be built.
    pub fn with_clock(
        storage: Arc<dyn DeliveryStorage>,
        source: Arc<dyn NotificationSource>,
        config: TriggerConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let guard = UrlGuard::new(config.allow_private_destinations);
        let client =
            Arc::new(DeliveryClient::new(config.client.clone(), guard.clone(), clock.clone())?);
        let rate_limiter =
            Arc::new(EndpointRateLimiter::new(config.rate_limit_per_minute, clock.clone()));
        let stats = Arc::new(RwLock::new(EngineStats::default()));

        let context = Arc::new(DeliveryContext {
            storage: storage.clone(),
            client,
            rate_limiter,
            clock: clock.clone(),
            stats: stats.clone(),
            batch_size: config.batch_size.max(1),
            rate_limit_delay: config.rate_limit_delay,
            fail_fast_on_unsafe_destination: config.fail_fast_on_unsafe_destination,
        });

        let backlog_ms = duration_ms(config.backlog_interval);

        Ok(Self {
            config,
            storage,
            source,
            clock,
            guard,
            context,
            readiness: Arc::new(Readiness::new()),
            stats,
            backlog_interval_ms: Arc::new(AtomicU64::new(backlog_ms)),
            state: AtomicU8::new(ServiceState::Stopped as u8),
            started: AtomicBool::new(false),
            root_token: CancellationToken::new(),
            running: Mutex::new(None),
        })
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ServiceState {
        ServiceState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ServiceState) {
        self.state.store(state as u8, Ordering::Release);
        debug!(state = %state, "trigger service state changed");
    }

    /// Workers the service runs.
    pub fn worker_count(&self) -> usize {
        self.config.effective_worker_count()
    }

    /// Starts the service.
    ///
    /// Subscribes with bounded retry and signals readiness with the outcome.
    /// On success, spawns listener, workers and tickers and returns.
    ///
    /// # Errors
    ///
    /// `ConfigurationError` if already started, `SubscriptionFailed` if the
    /// subscription could not be established, `Cancelled` if stopped while
    /// subscribing.
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(DeliveryError::configuration("trigger service can only be started once"));
        }

        self.set_state(ServiceState::Starting);
        let token = self.root_token.child_token();

        let subscription =
            match subscribe_with_retry(self.source.as_ref(), self.config.subscribe_retry(), &token)
                .await
            {
                Ok(subscription) => subscription,
                Err(e) => {
                    self.readiness.signal_once(true);
                    self.set_state(ServiceState::Stopped);
                    error!(error = %e, "notification subscription failed");
                    return Err(e);
                },
            };

        self.readiness.signal_once(false);
        self.set_state(ServiceState::Listening);

        let (queue_tx, queue_rx) = mpsc::channel(self.config.queue_capacity.max(1));

        let mut worker_pool = WorkerPool::new(
            self.worker_count(),
            self.context.clone(),
            queue_rx,
            self.stats.clone(),
            token.clone(),
        );
        worker_pool.spawn_workers().await;

        let listener = Listener {
            source: self.source.clone(),
            retry: self.config.subscribe_retry(),
            queue: queue_tx.clone(),
            stats: self.stats.clone(),
            cancellation_token: token.clone(),
        };
        let backlog = BacklogTicker {
            storage: self.storage.clone(),
            clock: self.clock.clone(),
            queue: queue_tx.clone(),
            interval_ms: self.backlog_interval_ms.clone(),
            batch_size: self.config.backlog_batch_size.max(1),
            stats: self.stats.clone(),
            cancellation_token: token.clone(),
        };
        let cleanup = CleanupTicker {
            storage: self.storage.clone(),
            clock: self.clock.clone(),
            rate_limiter: self.context.rate_limiter.clone(),
            interval: self.config.cleanup_interval,
            retention: self.config.retention,
            stats: self.stats.clone(),
            cancellation_token: token.clone(),
        };

        let tasks = vec![
            tokio::spawn(listener.run(subscription)),
            tokio::spawn(backlog.run()),
            tokio::spawn(cleanup.run()),
        ];

        *running = Some(Running { cancellation_token: token, queue: queue_tx, worker_pool, tasks });
        self.set_state(ServiceState::Running);

        info!(
            worker_count = self.worker_count(),
            queue_capacity = self.config.queue_capacity,
            "trigger service running"
        );
        Ok(())
    }

    /// Stops the service. Safe to call repeatedly and concurrently.
    ///
    /// # Errors
    ///
    /// `ShutdownTimeout` if tasks did not finish within the configured
    /// shutdown timeout.
    pub async fn stop(&self) -> Result<()> {
        // Unblocks a start() still retrying its subscription.
        self.root_token.cancel();

        let Some(running) = self.running.lock().await.take() else {
            return Ok(());
        };

        self.set_state(ServiceState::Stopping);
        info!("stopping trigger service");

        let Running { cancellation_token, queue, worker_pool, tasks } = running;
        cancellation_token.cancel();
        drop(queue);

        let timeout = self.config.shutdown_timeout;
        let tasks_done = tokio::time::timeout(timeout, async {
            for task in tasks {
                if let Err(e) = task.await {
                    warn!(error = %e, "background task ended abnormally");
                }
            }
        })
        .await;

        let workers_done = worker_pool.shutdown_graceful(timeout).await;
        self.set_state(ServiceState::Stopped);

        if tasks_done.is_err() {
            return Err(DeliveryError::ShutdownTimeout { timeout });
        }
        workers_done?;

        info!("trigger service stopped");
        Ok(())
    }

    /// Waits until the subscription outcome is known or `cancel` fires.
    ///
    /// # Errors
    ///
    /// `SubscriptionFailed` or `Cancelled`.
    pub async fn wait_for_ready(&self, cancel: &CancellationToken) -> Result<()> {
        self.readiness.wait(cancel).await
    }

    /// Waits for the subscription outcome for at most `timeout`.
    ///
    /// # Errors
    ///
    /// `SubscriptionFailed` or `Timeout`.
    pub async fn wait_for_ready_timeout(&self, timeout: Duration) -> Result<()> {
        self.readiness.wait_timeout(timeout).await
    }

    /// True once the notification subscription is established.
    pub fn is_ready(&self) -> bool {
        self.readiness.is_ready()
    }

    /// Shared readiness flag.
    pub fn readiness(&self) -> Arc<Readiness> {
        self.readiness.clone()
    }

    /// Changes the backlog scan interval, effective from the next tick.
    ///
    /// A zero duration is ignored.
    pub fn set_backlog_interval(&self, interval: Duration) {
        if interval.is_zero() {
            warn!("ignoring zero backlog interval");
            return;
        }
        self.backlog_interval_ms.store(duration_ms(interval), Ordering::Release);
        info!(interval_ms = interval.as_millis(), "backlog interval updated");
    }

    /// Current backlog scan interval.
    pub fn backlog_interval(&self) -> Duration {
        Duration::from_millis(self.backlog_interval_ms.load(Ordering::Acquire))
    }

    /// Allows or forbids internal destinations.
    pub fn set_allow_private_destinations(&self, allow: bool) {
        if allow {
            warn!("SSRF protection disabled: internal destinations allowed");
        }
        self.guard.set_allow_private(allow);
    }

    /// Creates events for every enabled webhook subscribed to `change` and
    /// enqueues the affected webhooks if the service is running.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError` if webhooks cannot be listed or the events
    /// cannot be stored; in that case no event is created.
    pub async fn dispatch_change(&self, change: &RowChange) -> Result<Vec<EventId>> {
        let now = self.clock.now_utc();
        let webhooks = self.storage.find_enabled_webhooks().await?;

        let events: Vec<WebhookEvent> = webhooks
            .iter()
            .filter(|w| w.subscribes_to(&change.schema, &change.table, change.operation))
            .map(|w| WebhookEvent::from_change(w.id, change, now))
            .collect();
        let targets: Vec<WebhookId> = events.iter().map(|e| e.webhook_id).collect();
        let created =
            if events.is_empty() { Vec::new() } else { self.storage.create_events(events).await? };

        debug!(
            operation = %change.operation,
            table = %format!("{}.{}", change.schema, change.table),
            events = created.len(),
            "change dispatched"
        );

        let sender = self
            .running
            .lock()
            .await
            .as_ref()
            .map(|r| (r.queue.clone(), r.cancellation_token.clone()));
        if let Some((queue, token)) = sender {
            for id in targets {
                if !enqueue(&queue, id, &token, &self.stats).await {
                    break;
                }
            }
        }

        Ok(created)
    }

    /// Processes one batch of due events for `webhook_id` on the caller's
    /// task.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError` if the batch cannot be loaded.
    pub async fn process_webhook(&self, webhook_id: WebhookId) -> Result<BatchSummary> {
        self.context.process_webhook(webhook_id, &self.root_token).await
    }

    /// Snapshot of the engine counters.
    pub async fn stats(&self) -> EngineStats {
        self.stats.read().await.clone()
    }
}

impl Drop for TriggerService {
    fn drop(&mut self) {
        self.root_token.cancel();
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_positive_worker_counts_use_default() {
        for count in [0, -1, -100] {
            let config = TriggerConfig { worker_count: count, ..TriggerConfig::default() };
            assert_eq!(config.effective_worker_count(), DEFAULT_WORKER_COUNT);
        }
        let config = TriggerConfig { worker_count: 9, ..TriggerConfig::default() };
        assert_eq!(config.effective_worker_count(), 9);
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = TriggerConfig::default();
        assert_eq!(config.queue_capacity, 1000);
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.backlog_interval, Duration::from_secs(30));
        assert_eq!(config.backlog_batch_size, 50);
        assert_eq!(config.cleanup_interval, Duration::from_secs(3600));
        assert_eq!(config.retention, Duration::from_secs(604_800));
        assert_eq!(config.rate_limit_delay, Duration::from_secs(10));
        assert_eq!(config.subscribe_retry(), SubscribeRetry::default());
    }

    #[test]
    fn state_round_trips_through_u8() {
        for state in [
            ServiceState::Stopped,
            ServiceState::Starting,
            ServiceState::Listening,
            ServiceState::Running,
            ServiceState::Stopping,
        ] {
            assert_eq!(ServiceState::from_u8(state as u8), state);
        }
    }
}
