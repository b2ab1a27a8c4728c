//! Per-process monotonic write clock.
//!
//! Record timestamps drive last-write-wins, so every local write must carry
//! a `last_updated` strictly greater than the previous one even if the wall
//! clock steps backwards or two writes land in the same microsecond.
//! Timestamps are truncated to storage precision so a record read back from
//! the store compares equal to the one written.

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Utc};

/// Hands out strictly increasing timestamps at microsecond precision.
#[derive(Debug, Default)]
pub struct MonotonicClock {
    last_micros: AtomicI64,
}

impl MonotonicClock {
    /// Create a clock.
    pub const fn new() -> Self {
        Self {
            last_micros: AtomicI64::new(0),
        }
    }

    /// The next timestamp: `max(now, previous + 1µs)`.
    pub fn now(&self) -> DateTime<Utc> {
        self.tick(Utc::now())
    }

    fn tick(&self, wall: DateTime<Utc>) -> DateTime<Utc> {
        let wall_micros = wall.timestamp_micros();
        let mut previous = self.last_micros.load(Ordering::Acquire);
        loop {
            let next = wall_micros.max(previous.saturating_add(1));
            match self.last_micros.compare_exchange_weak(
                previous,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return DateTime::from_timestamp_micros(next).unwrap_or(wall),
                Err(actual) => previous = actual,
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::arithmetic_side_effects)]
mod tests {
    use chrono::Duration;

    use super::*;

    #[test]
    fn timestamps_strictly_increase() {
        let clock = MonotonicClock::new();
        let mut previous = clock.now();
        for _ in 0..1_000 {
            let next = clock.now();
            assert!(next > previous);
            previous = next;
        }
    }

    #[test]
    fn wall_clock_regression_is_absorbed() {
        let clock = MonotonicClock::new();
        let wall = Utc::now();
        let first = clock.tick(wall);
        let second = clock.tick(wall - Duration::seconds(5));
        assert!(second > first);
        assert_eq!(second - first, Duration::microseconds(1));
    }

    #[test]
    fn timestamps_have_storage_precision() {
        let clock = MonotonicClock::new();
        let ts = clock.now();
        assert_eq!(ts.timestamp_subsec_nanos() % 1_000, 0);
    }
}
