//! Clock abstraction for deterministic time in tests.
//!
//! The engine reads time in two shapes: monotonic instants for the sliding
//! rate-limit window and wall-clock timestamps for `next_retry_at`,
//! `last_attempt_at` and retention cutoffs. Both come from the same `Clock`
//! so a test can age rate-limit entries and retry schedules together.

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};

/// Source of monotonic and wall-clock time.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Returns the current instant for window and duration measurements.
    fn now(&self) -> Instant;

    /// Returns the current wall-clock time for persisted timestamps.
    fn now_utc(&self) -> DateTime<Utc>;
}

/// Production clock backed by the operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealClock;

impl RealClock {
    /// Creates a new real clock.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for RealClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for tests.
///
/// Clones share the same offset, so a clone handed to the engine moves
/// whenever the test calls [`TestClock::advance`].
#[derive(Debug, Clone)]
pub struct TestClock {
    offset_ns: Arc<AtomicU64>,
    base_instant: Instant,
    base_utc: DateTime<Utc>,
}

impl TestClock {
    /// Creates a test clock anchored at the current time.
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    /// Creates a test clock whose wall-clock time starts at `start`.
    pub fn starting_at(start: DateTime<Utc>) -> Self {
        Self { offset_ns: Arc::new(AtomicU64::new(0)), base_instant: Instant::now(), base_utc: start }
    }

    /// Moves both monotonic and wall-clock time forward.
    pub fn advance(&self, duration: Duration) {
        let nanos = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        self.offset_ns.fetch_add(nanos, Ordering::AcqRel);
    }

    /// Total time advanced since creation.
    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.offset_ns.load(Ordering::Acquire))
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now(&self) -> Instant {
        self.base_instant + self.elapsed()
    }

    fn now_utc(&self) -> DateTime<Utc> {
        let offset = chrono::Duration::from_std(self.elapsed()).unwrap_or(chrono::Duration::MAX);
        self.base_utc + offset
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn test_clock_advances_both_time_sources() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let clock = TestClock::starting_at(start);
        let instant = clock.now();

        clock.advance(Duration::from_secs(90));

        assert_eq!(clock.now().duration_since(instant), Duration::from_secs(90));
        assert_eq!(clock.now_utc(), start + chrono::Duration::seconds(90));
    }

    #[test]
    fn clones_share_offset() {
        let clock = TestClock::new();
        let handle = clock.clone();

        handle.advance(Duration::from_secs(5));

        assert_eq!(clock.elapsed(), Duration::from_secs(5));
    }

    #[test]
    fn real_clock_is_monotonic() {
        let clock = RealClock::new();
        let first = clock.now();
        let second = clock.now();
        assert!(second >= first);
    }
}
