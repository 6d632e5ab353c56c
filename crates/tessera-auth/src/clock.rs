//! Time source abstraction.
//!
//! Every component that checks expiry or stamps a record reads time through
//! a [`Clock`], so tests can move time forward without sleeping.

use std::fmt::Debug;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use time::OffsetDateTime;

/// A source of the current time.
pub trait Clock: Send + Sync + Debug {
    /// Returns the current UTC time.
    fn now(&self) -> OffsetDateTime;

    /// Returns the current time as Unix seconds.
    fn unix_timestamp(&self) -> i64 {
        self.now().unix_timestamp()
    }
}

/// The wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// A clock that only moves when told to.
///
/// Resolution is one millisecond.
#[derive(Debug)]
pub struct ManualClock {
    millis: AtomicI64,
}

impl ManualClock {
    /// Creates a clock frozen at `start`.
    #[must_use]
    pub fn new(start: OffsetDateTime) -> Self {
        Self {
            millis: AtomicI64::new(to_millis(start)),
        }
    }

    /// Creates a clock frozen at the current wall-clock time.
    #[must_use]
    pub fn starting_now() -> Self {
        Self::new(OffsetDateTime::now_utc())
    }

    /// Moves the clock forward.
    pub fn advance(&self, by: Duration) {
        let delta = i64::try_from(by.as_millis()).unwrap_or(i64::MAX);
        self.millis.fetch_add(delta, Ordering::SeqCst);
    }

    /// Sets the clock to an absolute instant.
    pub fn set(&self, at: OffsetDateTime) {
        self.millis.store(to_millis(at), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> OffsetDateTime {
        let millis = self.millis.load(Ordering::SeqCst);
        OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000)
            .unwrap_or(OffsetDateTime::UNIX_EPOCH)
    }
}

fn to_millis(at: OffsetDateTime) -> i64 {
    i64::try_from(at.unix_timestamp_nanos() / 1_000_000).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_manual_clock_is_frozen() {
        let clock = ManualClock::new(datetime!(2030-01-01 0:00 UTC));
        assert_eq!(clock.now(), clock.now());
        assert_eq!(clock.now(), datetime!(2030-01-01 0:00 UTC));
    }

    #[test]
    fn test_manual_clock_advance() {
        let clock = ManualClock::new(datetime!(2030-01-01 0:00 UTC));
        clock.advance(Duration::from_secs(3601));
        assert_eq!(clock.now(), datetime!(2030-01-01 1:00:01 UTC));
        assert_eq!(
            clock.unix_timestamp(),
            datetime!(2030-01-01 1:00:01 UTC).unix_timestamp()
        );
    }

    #[test]
    fn test_manual_clock_set() {
        let clock = ManualClock::starting_now();
        clock.set(datetime!(2020-06-15 12:30 UTC));
        assert_eq!(clock.now(), datetime!(2020-06-15 12:30 UTC));
    }

    #[test]
    fn test_system_clock_moves_forward() {
        let clock = SystemClock;
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }
}
