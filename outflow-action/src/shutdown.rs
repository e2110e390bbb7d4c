//! Process-wide shutdown signal.
//!
//! The daemon owns and triggers the signal; actions only observe it, at
//! submission time and while waiting between retries. A pending retry wait
//! is cut short as soon as the signal fires, but an adapter call already in
//! progress is never interrupted.
//!
//! A signal can hand out children. A child fires with its parent, and can
//! also be fired on its own to stop a single action.

use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
pub struct ShutdownSignal {
    triggered: Mutex<bool>,
    condvar: Condvar,
    children: Mutex<Vec<Weak<ShutdownSignal>>>,
}

impl ShutdownSignal {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A signal that fires when this one does, or when triggered itself
    #[must_use]
    pub fn child(&self) -> Arc<Self> {
        let child = Self::new();

        let mut children = self.children.lock();
        children.retain(|weak| weak.strong_count() > 0);
        if self.is_triggered() {
            child.trigger();
        } else {
            children.push(Arc::downgrade(&child));
        }

        child
    }

    /// Request shutdown, waking every waiting action
    pub fn trigger(&self) {
        *self.triggered.lock() = true;
        self.condvar.notify_all();

        let children = std::mem::take(&mut *self.children.lock());
        for child in children.iter().filter_map(Weak::upgrade) {
            child.trigger();
        }
    }

    pub fn is_triggered(&self) -> bool {
        *self.triggered.lock()
    }

    /// Wait for up to `timeout`.
    ///
    /// Returns `true` if shutdown was requested before or during the wait.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut triggered = self.triggered.lock();
        if *triggered || timeout.is_zero() {
            return *triggered;
        }

        // Loop over spurious wakeups until the full timeout has passed.
        let deadline = std::time::Instant::now() + timeout;
        while !*triggered {
            if self.condvar.wait_until(&mut triggered, deadline).timed_out() {
                break;
            }
        }

        *triggered
    }
}
