//! Per-thread parking for the attach protocol.
//!
//! A suspended thread parks here until the stop-the-world requester flips
//! its state back and wakes it. The predicate is re-checked under the
//! parker's lock, so a wakeup can never be lost between the state store and
//! the notify.

use parking_lot::{Condvar, Mutex};

pub struct Parker {
    lock: Mutex<()>,
    cond: Condvar,
}

impl Parker {
    pub fn new() -> Self {
        Self {
            lock: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    /// Park while `blocked()` returns true.
    pub fn park_while(&self, blocked: impl Fn() -> bool) {
        let mut guard = self.lock.lock();
        while blocked() {
            self.cond.wait(&mut guard);
        }
    }

    /// Wake every parked thread.
    ///
    /// The caller must have already published the state change the parked
    /// threads' predicates observe.
    pub fn unpark_all(&self) {
        let _guard = self.lock.lock();
        self.cond.notify_all();
    }
}

impl Default for Parker {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
