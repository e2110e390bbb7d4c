//! Time source used by actions.
//!
//! Each execution pass reads the clock once and uses that value for every
//! throttle and retry decision in the pass. Waits between retries also go
//! through the clock, so a manual clock turns them into jumps in time.

use std::time::{Duration, SystemTime};

use parking_lot::Mutex;

use crate::shutdown::ShutdownSignal;

pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> SystemTime;

    /// Wait for `timeout` or until shutdown is requested, whichever comes first.
    ///
    /// Returns `true` if shutdown was requested.
    fn wait(&self, shutdown: &ShutdownSignal, timeout: Duration) -> bool {
        shutdown.wait_timeout(timeout)
    }
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<SystemTime>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000))
    }
}

impl ManualClock {
    #[must_use]
    pub const fn new(start: SystemTime) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }

    pub fn set(&self, to: SystemTime) {
        *self.now.lock() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> SystemTime {
        *self.now.lock()
    }

    fn wait(&self, shutdown: &ShutdownSignal, timeout: Duration) -> bool {
        self.advance(timeout);
        shutdown.is_triggered()
    }
}

/// Seconds elapsed from `earlier` to `later`, zero if the clock went backwards.
pub(crate) fn elapsed_secs(earlier: SystemTime, later: SystemTime) -> u64 {
    later
        .duration_since(earlier)
        .map_or(0, |elapsed| elapsed.as_secs())
}
