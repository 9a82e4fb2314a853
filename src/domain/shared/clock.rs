//! Wall-clock access
//!
//! Nonce freshness and publication expiry are both defined against the
//! server wall clock, so every component that reads time does it through
//! this trait. Tests substitute a fixed clock.

use chrono::{DateTime, Utc};

/// Trait for providing time information (allows a fixed clock in tests)
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Seconds since the unix epoch
    fn unix_seconds(&self) -> i64 {
        self.now().timestamp()
    }
}

/// Default clock using system time
#[derive(Debug, Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock pinned to a single instant, for unit tests
#[cfg(test)]
pub struct FixedClock(pub DateTime<Utc>);

#[cfg(test)]
impl FixedClock {
    pub fn at_unix(secs: i64) -> Self {
        use chrono::TimeZone;
        Self(Utc.timestamp_opt(secs, 0).unwrap())
    }
}

#[cfg(test)]
impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}
