use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::CoreError;

/// Returns the current wall-clock time as milliseconds since Unix epoch.
pub fn physical_now() -> Result<i64, CoreError> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .map_err(|_| CoreError::InvalidData("system clock before epoch".into()))
}

/// Wall-clock instant, milliseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(i64);

impl Timestamp {
    pub const EPOCH: Timestamp = Timestamp(0);

    pub fn from_millis(ms: i64) -> Self {
        Self(ms)
    }

    pub fn from_secs(secs: i64) -> Self {
        Self(secs.saturating_mul(1000))
    }

    pub fn as_millis(&self) -> i64 {
        self.0
    }

    pub fn saturating_add(self, d: Duration) -> Self {
        Self(self.0.saturating_add(duration_ms(d)))
    }

    pub fn saturating_sub(self, d: Duration) -> Self {
        Self(self.0.saturating_sub(duration_ms(d)))
    }

    /// Time elapsed from `earlier` to `self`; zero if `earlier` is in the future.
    pub fn since(&self, earlier: Timestamp) -> Duration {
        let delta = self.0.saturating_sub(earlier.0);
        Duration::from_millis(delta.max(0) as u64)
    }
}

fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({}ms)", self.0)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Source of "now" for every time-dependent rule in the engine.
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        // A clock before 1970 is treated as the epoch rather than failing every request.
        Timestamp(physical_now().unwrap_or(0))
    }
}

/// A clock that only moves when told to. Clones share the same instant.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    ms: Arc<AtomicI64>,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            ms: Arc::new(AtomicI64::new(start.0)),
        }
    }

    pub fn set(&self, at: Timestamp) {
        self.ms.store(at.0, Ordering::SeqCst);
    }

    pub fn advance(&self, d: Duration) -> Timestamp {
        let delta = duration_ms(d);
        let prev = self.ms.fetch_add(delta, Ordering::SeqCst);
        Timestamp(prev.saturating_add(delta))
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp(self.ms.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn since_saturates_at_zero() {
        let a = Timestamp::from_secs(100);
        let b = Timestamp::from_secs(160);
        assert_eq!(b.since(a), Duration::from_secs(60));
        assert_eq!(a.since(b), Duration::ZERO);
    }

    #[test]
    fn add_and_sub_are_inverse() {
        let t = Timestamp::from_millis(1_700_000_000_000);
        let d = Duration::from_secs(900);
        assert_eq!(t.saturating_add(d).saturating_sub(d), t);
        assert_eq!(t.saturating_add(d).as_millis(), 1_700_000_900_000);
    }

    #[test]
    fn manual_clock_clones_share_time() {
        let clock = ManualClock::new(Timestamp::from_secs(10));
        let other = clock.clone();

        let after = clock.advance(Duration::from_secs(5));
        assert_eq!(after, Timestamp::from_secs(15));
        assert_eq!(other.now(), Timestamp::from_secs(15));

        other.set(Timestamp::EPOCH);
        assert_eq!(clock.now(), Timestamp::EPOCH);
    }

    #[test]
    fn system_clock_is_after_2020() {
        let now = SystemClock.now();
        assert!(now > Timestamp::from_secs(1_577_836_800), "got {now:?}");
    }
}
