//! Per-destination sliding-window admission control.
//!
//! Each key keeps the instants of its admissions within the last minute.
//! A call is admitted (and recorded) while fewer than `limit` admissions
//! remain in the window; rejected calls are not recorded.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
    time::Duration,
};

use hookline_core::Clock;

/// Admissions per minute used when a non-positive limit is configured.
pub const DEFAULT_LIMIT_PER_MINUTE: i64 = 60;

const WINDOW: Duration = Duration::from_secs(60);

/// Sliding-window limiter keyed by destination.
#[derive(Debug)]
pub struct EndpointRateLimiter {
    limit: usize,
    clock: Arc<dyn Clock>,
    windows: Mutex<HashMap<String, VecDeque<std::time::Instant>>>,
}

impl EndpointRateLimiter {
    /// Creates a limiter admitting `limit_per_minute` calls per key.
    ///
    /// Values `<= 0` fall back to [`DEFAULT_LIMIT_PER_MINUTE`].
    pub fn new(limit_per_minute: i64, clock: Arc<dyn Clock>) -> Self {
        let limit = if limit_per_minute <= 0 { DEFAULT_LIMIT_PER_MINUTE } else { limit_per_minute };
        Self {
            limit: usize::try_from(limit).unwrap_or(usize::MAX),
            clock,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Effective per-minute limit.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Returns true and records the call if `key` is under its limit.
    pub fn allow(&self, key: &str) -> bool {
        let now = self.clock.now();
        let mut windows = match self.windows.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let window = windows.entry(key.to_string()).or_default();
        while window.front().is_some_and(|t| now.saturating_duration_since(*t) >= WINDOW) {
            window.pop_front();
        }

        if window.len() >= self.limit {
            return false;
        }

        window.push_back(now);
        true
    }

    /// Drops keys with no admissions inside the current window.
    pub fn prune(&self) {
        let now = self.clock.now();
        let mut windows = match self.windows.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        windows.retain(|_, window| {
            window.back().is_some_and(|t| now.saturating_duration_since(*t) < WINDOW)
        });
    }

    /// Number of tracked keys.
    pub fn tracked_keys(&self) -> usize {
        self.windows.lock().map_or(0, |w| w.len())
    }
}

#[cfg(test)]
mod tests {
    use hookline_core::TestClock;

    use super::*;

    #[test]
    fn non_positive_limits_use_default() {
        let clock = Arc::new(TestClock::new());
        assert_eq!(EndpointRateLimiter::new(0, clock.clone()).limit(), 60);
        assert_eq!(EndpointRateLimiter::new(-5, clock.clone()).limit(), 60);
        assert_eq!(EndpointRateLimiter::new(3, clock).limit(), 3);
    }

    #[test]
    fn rejects_over_limit_then_recovers() {
        let clock = Arc::new(TestClock::new());
        let limiter = EndpointRateLimiter::new(2, clock.clone());

        assert!(limiter.allow("https://a.example"));
        assert!(limiter.allow("https://a.example"));
        assert!(!limiter.allow("https://a.example"));
        assert!(limiter.allow("https://b.example"));

        clock.advance(Duration::from_secs(61));
        assert!(limiter.allow("https://a.example"));
    }

    #[test]
    fn rejected_calls_are_not_recorded() {
        let clock = Arc::new(TestClock::new());
        let limiter = EndpointRateLimiter::new(1, clock.clone());

        assert!(limiter.allow("k"));
        clock.advance(Duration::from_secs(30));
        assert!(!limiter.allow("k"));
        clock.advance(Duration::from_secs(31));
        // Only the first admission aged out; the rejected call left no trace.
        assert!(limiter.allow("k"));
    }

    #[test]
    fn prune_drops_idle_keys() {
        let clock = Arc::new(TestClock::new());
        let limiter = EndpointRateLimiter::new(5, clock.clone());
        limiter.allow("a");
        limiter.allow("b");
        clock.advance(Duration::from_secs(120));
        limiter.allow("b");

        limiter.prune();
        assert_eq!(limiter.tracked_keys(), 1);
    }
}
