//! Time sources for the token-bucket engine.
//!
//! Bucket timestamps are wall-clock nanoseconds since the Unix epoch so that
//! several instances sharing one store agree on them up to their clock skew.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

/// Clock abstraction so time can be faked in tests.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current time in nanoseconds since the Unix epoch.
    fn now_nanos(&self) -> i64;
}

/// Wall clock backed by `SystemTime::now()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    /// A host clock set before the epoch reads negative, which the engine
    /// refuses instead of persisting.
    fn now_nanos(&self) -> i64 {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(since) => i64::try_from(since.as_nanos()).unwrap_or(i64::MAX),
            Err(e) => i64::try_from(e.duration().as_nanos())
                .map(|before| -before.max(1))
                .unwrap_or(i64::MIN),
        }
    }
}

/// A manually driven clock.
///
/// Clones share the same time, so a test can hand one clone to an engine and
/// advance the other.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<i64>>,
}

impl ManualClock {
    /// Create a clock reading `start_nanos`.
    pub fn new(start_nanos: i64) -> Self {
        Self {
            now: Arc::new(Mutex::new(start_nanos)),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let by = i64::try_from(by.as_nanos()).unwrap_or(i64::MAX);
        let mut now = self.now.lock();
        *now = now.saturating_add(by);
    }

    /// Set the clock to an absolute reading, which may be in the past.
    pub fn set(&self, nanos: i64) {
        *self.now.lock() = nanos;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        // Anything non-zero; zero marks an absent bucket.
        Self::new(1_700_000_000_000_000_000)
    }
}

impl Clock for ManualClock {
    fn now_nanos(&self) -> i64 {
        *self.now.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_is_past_epoch() {
        assert!(SystemClock.now_nanos() > 0);
    }

    #[test]
    fn test_manual_clock_clones_share_time() {
        let clock = ManualClock::new(1_000);
        let other = clock.clone();

        clock.advance(Duration::from_nanos(500));
        assert_eq!(other.now_nanos(), 1_500);

        other.set(10);
        assert_eq!(clock.now_nanos(), 10);
    }
}
