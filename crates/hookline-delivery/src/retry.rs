//! Linear backoff retry policy.
//!
//! A failed attempt always consumes one attempt. If the new attempt count
//! reaches the webhook's `max_retries` the event becomes terminal; otherwise
//! it is rescheduled `backoff * attempts` after the failure.

use std::time::Duration;

use chrono::{DateTime, Utc};
use hookline_core::Webhook;
use serde::{Deserialize, Serialize};

use crate::error::DeliveryError;

/// Retry limits for one webhook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts allowed before the event is terminally failed.
    pub max_retries: i32,

    /// Linear backoff unit.
    pub backoff_unit: Duration,

    /// Give up immediately on destination validation failures.
    pub fail_fast_on_rejected_destination: bool,
}

impl RetryPolicy {
    /// Builds the policy configured on `webhook`.
    pub fn for_webhook(webhook: &Webhook) -> Self {
        let unit = u64::try_from(webhook.retry_backoff_seconds).unwrap_or(0);
        Self {
            max_retries: webhook.max_retries,
            backoff_unit: Duration::from_secs(unit),
            fail_fast_on_rejected_destination: false,
        }
    }

    /// Enables or disables fail-fast handling of rejected destinations.
    #[must_use]
    pub fn with_fail_fast(mut self, enabled: bool) -> Self {
        self.fail_fast_on_rejected_destination = enabled;
        self
    }

    /// Delay before attempt number `attempts + 1`.
    pub fn delay_for(&self, attempts: i32) -> Duration {
        let factor = u32::try_from(attempts.max(0)).unwrap_or(u32::MAX);
        self.backoff_unit.saturating_mul(factor)
    }
}

/// Failed attempt awaiting a retry decision.
#[derive(Debug, Clone)]
pub struct RetryContext<'a> {
    /// Attempts recorded on the event before this failure.
    pub attempts: i32,
    /// Error that caused the failure.
    pub error: &'a DeliveryError,
    /// When the attempt failed.
    pub failed_at: DateTime<Utc>,
    /// Policy to apply.
    pub policy: &'a RetryPolicy,
}

/// Outcome of the retry policy for one failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Schedule another attempt.
    Retry {
        /// Attempt count to persist
        attempts: i32,
        /// When the event becomes due again
        next_attempt_at: DateTime<Utc>,
    },
    /// Stop retrying; the event is terminally failed.
    GiveUp {
        /// Attempt count to persist
        attempts: i32,
        /// Why retrying stopped
        reason: String,
    },
}

impl RetryDecision {
    /// Attempt count to persist.
    pub fn attempts(&self) -> i32 {
        match self {
            Self::Retry { attempts, .. } | Self::GiveUp { attempts, .. } => *attempts,
        }
    }

    /// `next_retry_at` to persist; `None` for terminal failures.
    pub fn next_retry_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Retry { next_attempt_at, .. } => Some(*next_attempt_at),
            Self::GiveUp { .. } => None,
        }
    }
}

impl RetryContext<'_> {
    /// Decides whether and when to retry.
    pub fn decide(&self) -> RetryDecision {
        let attempts = self.attempts.saturating_add(1);

        if attempts >= self.policy.max_retries {
            return RetryDecision::GiveUp {
                attempts,
                reason: format!("maximum attempts ({}) reached", self.policy.max_retries),
            };
        }

        if self.policy.fail_fast_on_rejected_destination && self.error.is_destination_rejected() {
            return RetryDecision::GiveUp {
                attempts,
                reason: format!("destination rejected: {}", self.error),
            };
        }

        let delay = self.policy.delay_for(attempts);
        let Ok(delay) = chrono::Duration::from_std(delay) else {
            return RetryDecision::GiveUp {
                attempts,
                reason: "retry delay out of range".to_string(),
            };
        };

        RetryDecision::Retry { attempts, next_attempt_at: self.failed_at + delay }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn policy(max_retries: i32, backoff_secs: u64) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            backoff_unit: Duration::from_secs(backoff_secs),
            fail_fast_on_rejected_destination: false,
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn backoff_is_linear_in_attempts() {
        let policy = policy(5, 60);
        let error = DeliveryError::server_error(500, "");

        for (before, expected_secs) in [(0, 60), (1, 120), (2, 180), (3, 240)] {
            let decision =
                RetryContext { attempts: before, error: &error, failed_at: now(), policy: &policy }
                    .decide();
            assert_eq!(
                decision,
                RetryDecision::Retry {
                    attempts: before + 1,
                    next_attempt_at: now() + chrono::Duration::seconds(expected_secs),
                }
            );
        }
    }

    #[test]
    fn last_attempt_becomes_terminal() {
        let policy = policy(3, 60);
        let error = DeliveryError::server_error(500, "");
        let decision =
            RetryContext { attempts: 2, error: &error, failed_at: now(), policy: &policy }.decide();

        assert!(matches!(decision, RetryDecision::GiveUp { attempts: 3, .. }));
        assert_eq!(decision.next_retry_at(), None);
    }

    #[test]
    fn rejected_destination_retries_unless_fail_fast() {
        let error = DeliveryError::unsafe_destination("http://10.0.0.1", "private");
        let lenient = policy(3, 10);
        let strict = policy(3, 10).with_fail_fast(true);

        let decision =
            RetryContext { attempts: 0, error: &error, failed_at: now(), policy: &lenient }.decide();
        assert!(matches!(decision, RetryDecision::Retry { attempts: 1, .. }));

        let decision =
            RetryContext { attempts: 0, error: &error, failed_at: now(), policy: &strict }.decide();
        assert!(matches!(decision, RetryDecision::GiveUp { attempts: 1, .. }));
    }

    #[test]
    fn non_positive_max_retries_fails_immediately() {
        let policy = policy(0, 60);
        let error = DeliveryError::timeout(30);
        let decision =
            RetryContext { attempts: 0, error: &error, failed_at: now(), policy: &policy }.decide();
        assert!(matches!(decision, RetryDecision::GiveUp { attempts: 1, .. }));
    }

    #[test]
    fn policy_from_webhook() {
        let mut webhook = Webhook::new("hook", "https://example.com");
        webhook.max_retries = 7;
        webhook.retry_backoff_seconds = 15;

        let policy = RetryPolicy::for_webhook(&webhook);
        assert_eq!(policy.max_retries, 7);
        assert_eq!(policy.backoff_unit, Duration::from_secs(15));
        assert_eq!(policy.delay_for(2), Duration::from_secs(30));
    }
}
