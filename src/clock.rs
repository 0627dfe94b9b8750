/// Nanosecond timestamps for versions and generated indexes.
///
/// Versions are wall-clock nanoseconds, bumped by one whenever the clock has
/// not advanced past the previous value. Clients compare versions for
/// ordering, so two stamps from the same pool must never be equal.
use chrono::Utc;
use std::sync::atomic::{AtomicI64, Ordering};

/// Current UTC time in nanoseconds since the Unix epoch.
pub fn now_nanos() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
}

/// Next stamp strictly greater than `previous`.
pub fn next_version(previous: i64) -> i64 {
    now_nanos().max(previous.saturating_add(1))
}

/// A shared strictly increasing nanosecond clock.
#[derive(Debug, Default)]
pub struct MonotonicClock {
    last: AtomicI64,
}

impl MonotonicClock {
    /// Create a clock with no stamps issued yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue the next stamp.
    pub fn next(&self) -> i64 {
        let now = now_nanos();
        match self
            .last
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |prev| {
                Some(now.max(prev.saturating_add(1)))
            }) {
            Ok(prev) | Err(prev) => now.max(prev.saturating_add(1)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_version_is_strictly_greater() {
        let future = now_nanos() + 1_000_000_000;
        assert_eq!(next_version(future), future + 1);
        assert!(next_version(0) > 0);
    }

    #[test]
    fn test_monotonic_clock_never_repeats() {
        let clock = MonotonicClock::new();
        let mut last = 0;
        for _ in 0..10_000 {
            let stamp = clock.next();
            assert!(stamp > last);
            last = stamp;
        }
    }
}
