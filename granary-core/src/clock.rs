//! Wall-clock abstraction so tests can control time

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

/// Source of "now" carried by every component that reads the wall clock.
pub trait Clock: Send + Sync {
    /// Current time.
    fn now(&self) -> SystemTime;

    /// Current time as seconds since the Unix epoch.
    fn now_secs(&self) -> u64 {
        self.now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }
}

/// The default clock: the system wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Shared singleton system clock.
pub fn system_clock() -> Arc<dyn Clock> {
    Arc::new(SystemClock)
}

/// A manually advanced clock for deterministic tests.
pub struct FakeClock {
    now: Mutex<SystemTime>,
}

impl FakeClock {
    /// Create a fake clock starting at the given time.
    pub fn new(start: SystemTime) -> Arc<FakeClock> {
        Arc::new(FakeClock {
            now: Mutex::new(start),
        })
    }

    /// Move the clock forward.
    pub fn advance(&self, d: Duration) {
        let mut now = self.now.lock();
        *now += d;
    }

    /// Set the clock to an absolute time.
    pub fn set(&self, t: SystemTime) {
        *self.now.lock() = t;
    }
}

impl Clock for FakeClock {
    fn now(&self) -> SystemTime {
        *self.now.lock()
    }
}
