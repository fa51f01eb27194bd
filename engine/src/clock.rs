//! Wall-clock abstraction.
//!
//! Every freshness window, session lifetime and conflict timestamp in Hearth
//! is measured in milliseconds since the Unix epoch. Components never read the
//! system time directly; they ask a [`Clock`], which lets tests move time
//! forward by days without sleeping.

use crate::Timestamp;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// One second in clock units.
pub const SECOND: Timestamp = 1_000;
/// One minute in clock units.
pub const MINUTE: Timestamp = 60 * SECOND;
/// One hour in clock units.
pub const HOUR: Timestamp = 60 * MINUTE;
/// One day in clock units.
pub const DAY: Timestamp = 24 * HOUR;

/// Source of the current time.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Milliseconds since the Unix epoch.
    fn now(&self) -> Timestamp;
}

/// The operating system's wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as Timestamp)
            .unwrap_or(0)
    }
}

/// A clock that only moves when told to.
///
/// Clones share the same underlying instant, so a test can hand one clone to
/// the component under test and keep another to advance time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    /// Create a clock frozen at `start`.
    pub fn new(start: Timestamp) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(start)),
        }
    }

    /// Jump to an absolute instant.
    pub fn set(&self, at: Timestamp) {
        self.now.store(at, Ordering::SeqCst);
    }

    /// Move forward by `delta` milliseconds and return the new instant.
    pub fn advance(&self, delta: Timestamp) -> Timestamp {
        self.now.fetch_add(delta, Ordering::SeqCst) + delta
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        self.now.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_starts_where_told() {
        let clock = ManualClock::new(1_000);
        assert_eq!(clock.now(), 1_000);
    }

    #[test]
    fn advance_moves_forward() {
        let clock = ManualClock::new(0);
        assert_eq!(clock.advance(15 * MINUTE), 900_000);
        assert_eq!(clock.now(), 900_000);
    }

    #[test]
    fn clones_share_time() {
        let clock = ManualClock::new(5);
        let handle = clock.clone();
        handle.advance(DAY);
        assert_eq!(clock.now(), 5 + DAY);
    }

    #[test]
    fn set_overrides() {
        let clock = ManualClock::new(10);
        clock.set(3);
        assert_eq!(clock.now(), 3);
    }

    #[test]
    fn system_clock_is_after_2020() {
        assert!(SystemClock.now() > 1_577_836_800_000);
    }

    #[test]
    fn unit_constants() {
        assert_eq!(DAY, 86_400_000);
        assert_eq!(7 * DAY, 604_800_000);
    }
}
