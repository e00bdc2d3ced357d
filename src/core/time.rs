//! Clock abstraction
//!
//! State machines (freshness, billing, token refresh) are pure functions of
//! their inputs plus "now". Injecting the clock keeps every boundary case
//! testable at a fixed instant.

use chrono::{DateTime, Utc};

/// Source of the current instant.
pub trait Clock: Send + Sync {
    /// Current UTC time.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock implementation used in production.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Whole minutes elapsed from `ts` to `now`; `None` when `ts` is absent.
pub fn minutes_since(ts: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Option<i64> {
    ts.map(|t| (now - t).num_minutes())
}

#[cfg(test)]
pub mod test_support {
    //! Fixed clock for unit tests.

    use super::*;
    use parking_lot::Mutex;

    /// Clock pinned to a settable instant.
    pub struct FixedClock {
        now: Mutex<DateTime<Utc>>,
    }

    impl FixedClock {
        /// Create a clock pinned at `now`.
        pub fn at(now: DateTime<Utc>) -> Self {
            Self {
                now: Mutex::new(now),
            }
        }

        /// Advance the clock by whole minutes.
        pub fn advance_minutes(&self, minutes: i64) {
            let mut now = self.now.lock();
            *now += chrono::Duration::minutes(minutes);
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            *self.now.lock()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::FixedClock;
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_minutes_since() {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let ts = Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 0).unwrap();
        assert_eq!(minutes_since(Some(ts), now), Some(120));
        assert_eq!(minutes_since(None, now), None);
    }

    #[test]
    fn test_fixed_clock_advances() {
        let start = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        let clock = FixedClock::at(start);
        assert_eq!(clock.now(), start);
        clock.advance_minutes(121);
        assert_eq!((clock.now() - start).num_minutes(), 121);
    }
}
