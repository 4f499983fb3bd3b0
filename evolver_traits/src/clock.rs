use chrono::{DateTime, Duration, Utc};

/// Wall-clock abstraction used to stamp and age calibrations.
///
/// - now(): current UTC time
/// - age_of(): helper to compute how long ago `created` was, saturating at 0
pub trait Clock {
    fn now(&self) -> DateTime<Utc>;

    /// Time elapsed since `created`, never negative.
    fn age_of(&self, created: DateTime<Utc>) -> Duration {
        let age = self.now().signed_duration_since(created);
        if age < Duration::zero() {
            Duration::zero()
        } else {
            age
        }
    }
}

/// Default clock backed by the system time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl SystemClock {
    #[inline]
    pub fn new() -> Self {
        Self
    }
}

impl Clock for SystemClock {
    #[inline]
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

pub mod test_clock {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Deterministic clock whose time can be advanced manually.
    ///
    /// now() = origin + offset
    #[derive(Debug, Clone)]
    pub struct TestClock {
        origin: DateTime<Utc>,
        offset: Arc<Mutex<Duration>>,
    }

    impl Default for TestClock {
        fn default() -> Self {
            Self::new()
        }
    }

    impl TestClock {
        pub fn new() -> Self {
            Self::starting_at(Utc::now())
        }

        pub fn starting_at(origin: DateTime<Utc>) -> Self {
            Self {
                origin,
                offset: Arc::new(Mutex::new(Duration::zero())),
            }
        }

        /// Advance the clock by the given duration.
        pub fn advance(&self, d: Duration) {
            if let Ok(mut off) = self.offset.lock() {
                *off += d;
            }
        }
    }

    impl Clock for TestClock {
        fn now(&self) -> DateTime<Utc> {
            let off = self.offset.lock().map(|g| *g).unwrap_or_else(|_| Duration::zero());
            self.origin + off
        }
    }

}
