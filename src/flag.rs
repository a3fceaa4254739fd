//! Signalable boolean flags.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// A signalable boolean with wait-with-timeout semantics.
///
/// All cancellation and reconfiguration in this crate is cooperative: a
/// producer publishes its data, then sets a flag; the consumer observes the
/// flag at its next bounded wait. Setting wakes every waiter.
#[derive(Default)]
pub struct Flag {
    state: Mutex<bool>,
    cond: Condvar,
}

impl Flag {
    /// Create an unset flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag and wake all waiters.
    pub fn set(&self) {
        let mut state = self.state.lock();
        *state = true;
        self.cond.notify_all();
    }

    /// Clear the flag.
    pub fn clear(&self) {
        *self.state.lock() = false;
    }

    /// Whether the flag is currently set.
    pub fn is_set(&self) -> bool {
        *self.state.lock()
    }

    /// Wait until the flag is set or the timeout elapses.
    ///
    /// Returns the state of the flag at wake-up.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut state = self.state.lock();
        if *state {
            return true;
        }
        self.cond.wait_for(&mut state, timeout);
        *state
    }
}

impl std::fmt::Debug for Flag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Flag").field(&self.is_set()).finish()
    }
}
