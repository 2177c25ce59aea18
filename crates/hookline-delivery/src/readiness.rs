//! One-shot readiness signal for the notification subscription.
//!
//! The service signals once, after the subscription either succeeds or
//! exhausts its retries. Later signals are ignored. Waiters observe the
//! outcome through a watch channel.

use std::{sync::Mutex, time::Duration};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::{DeliveryError, Result};

/// Outcome of the subscription attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    /// No outcome yet.
    Pending,
    /// Subscription established.
    Ready,
    /// Subscription gave up.
    Failed,
}

/// Readiness flag set at most once.
#[derive(Debug)]
pub struct Readiness {
    state: Mutex<ReadyState>,
    tx: watch::Sender<ReadyState>,
}

impl Default for Readiness {
    fn default() -> Self {
        Self::new()
    }
}

impl Readiness {
    /// Creates an unsignaled readiness flag.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ReadyState::Pending);
        Self { state: Mutex::new(ReadyState::Pending), tx }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ReadyState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Records the subscription outcome. Returns false if already signaled.
    pub fn signal_once(&self, failed: bool) -> bool {
        let mut state = self.lock();
        if *state != ReadyState::Pending {
            return false;
        }
        *state = if failed { ReadyState::Failed } else { ReadyState::Ready };
        self.tx.send_replace(*state);
        true
    }

    /// Current state.
    pub fn state(&self) -> ReadyState {
        *self.lock()
    }

    /// True once the subscription succeeded.
    pub fn is_ready(&self) -> bool {
        self.state() == ReadyState::Ready
    }

    /// True once the subscription gave up.
    pub fn has_failed(&self) -> bool {
        self.state() == ReadyState::Failed
    }

    fn outcome(state: ReadyState) -> Option<Result<()>> {
        match state {
            ReadyState::Pending => None,
            ReadyState::Ready => Some(Ok(())),
            ReadyState::Failed => Some(Err(DeliveryError::SubscriptionFailed {
                attempts: 0,
                message: "notification subscription failed".to_string(),
            })),
        }
    }

    async fn wait_signaled(&self) -> Result<()> {
        let mut rx = self.tx.subscribe();
        let state = rx
            .wait_for(|s| *s != ReadyState::Pending)
            .await
            .map(|s| *s)
            .map_err(|_| DeliveryError::internal("readiness channel closed"))?;
        Self::outcome(state).unwrap_or(Ok(()))
    }

    /// Waits for the outcome or cancellation.
    ///
    /// Returns immediately if already signaled.
    ///
    /// # Errors
    ///
    /// `SubscriptionFailed` if the subscription gave up, `Cancelled` if
    /// `cancel` fired first.
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<()> {
        if let Some(outcome) = Self::outcome(self.state()) {
            return outcome;
        }
        tokio::select! {
            biased;
            result = self.wait_signaled() => result,
            () = cancel.cancelled() => Err(DeliveryError::Cancelled),
        }
    }

    /// Waits for the outcome for at most `timeout`.
    ///
    /// # Errors
    ///
    /// `SubscriptionFailed` if the subscription gave up, `Timeout` if the
    /// deadline passed first.
    pub async fn wait_timeout(&self, timeout: Duration) -> Result<()> {
        if let Some(outcome) = Self::outcome(self.state()) {
            return outcome;
        }
        tokio::time::timeout(timeout, self.wait_signaled())
            .await
            .map_err(|_| DeliveryError::timeout_after(timeout))?
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn first_signal_wins() {
        let readiness = Readiness::new();
        assert!(readiness.signal_once(false));
        assert!(!readiness.signal_once(true));
        assert!(readiness.is_ready());
        assert!(!readiness.has_failed());
    }

    #[tokio::test]
    async fn wait_returns_immediately_when_signaled() {
        let readiness = Readiness::new();
        readiness.signal_once(false);

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(readiness.wait(&cancel).await.is_ok());
    }

    #[tokio::test]
    async fn wait_reports_failure() {
        let readiness = Readiness::new();
        readiness.signal_once(true);
        let err = readiness.wait(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, DeliveryError::SubscriptionFailed { .. }));
    }

    #[tokio::test]
    async fn wait_returns_cancellation_error() {
        let readiness = Readiness::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(readiness.wait(&cancel).await, Err(DeliveryError::Cancelled)));
    }

    #[tokio::test]
    async fn wait_timeout_elapses() {
        let readiness = Readiness::new();
        let err = readiness.wait_timeout(Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Timeout { timeout_seconds: 1 }));
    }

    #[tokio::test]
    async fn waiter_wakes_on_signal() {
        let readiness = Arc::new(Readiness::new());
        let waiter = {
            let readiness = readiness.clone();
            tokio::spawn(async move { readiness.wait(&CancellationToken::new()).await })
        };

        tokio::task::yield_now().await;
        readiness.signal_once(false);
        assert!(waiter.await.unwrap().is_ok());
    }
}
