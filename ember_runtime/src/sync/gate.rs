//! Read-write gate ordering stop-the-world requests.
//!
//! Runtime-scope pauses take the gate exclusively; interpreter-scope pauses
//! take it shared, so independent interpreters may pause concurrently while
//! a whole-process pause excludes them all.
//!
//! Unlike a borrowed lock guard, the gate is locked and unlocked by explicit
//! calls, because a pause spans a begin/end call pair rather than a single
//! scope.

use parking_lot::{Condvar, Mutex};

struct GateState {
    /// Number of shared holders.
    readers: u32,
    /// Whether an exclusive holder is present.
    writer: bool,
}

/// A read-write gate with explicit lock/unlock pairs.
///
/// Writer-preferring is unnecessary here: at most one runtime-scope pause
/// exists at a time and interpreter-scope pauses are short.
pub struct RwGate {
    state: Mutex<GateState>,
    cond: Condvar,
}

impl RwGate {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GateState {
                readers: 0,
                writer: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Acquire shared access, blocking while an exclusive holder exists.
    pub fn lock_shared(&self) {
        let mut state = self.state.lock();
        while state.writer {
            self.cond.wait(&mut state);
        }
        state.readers += 1;
    }

    /// Release shared access.
    pub fn unlock_shared(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.readers > 0);
        state.readers -= 1;
        if state.readers == 0 {
            self.cond.notify_all();
        }
    }

    /// Acquire exclusive access, blocking while any holder exists.
    pub fn lock_exclusive(&self) {
        let mut state = self.state.lock();
        while state.writer || state.readers > 0 {
            self.cond.wait(&mut state);
        }
        state.writer = true;
    }

    /// Release exclusive access.
    pub fn unlock_exclusive(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.writer);
        state.writer = false;
        self.cond.notify_all();
    }
}

impl Default for RwGate {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_shared_access_is_concurrent() {
        let gate = RwGate::new();
        gate.lock_shared();
        gate.lock_shared();
        gate.unlock_shared();
        gate.unlock_shared();
    }

    #[test]
    fn test_exclusive_excludes_shared() {
        let gate = Arc::new(RwGate::new());
        let entered = Arc::new(AtomicU32::new(0));

        gate.lock_exclusive();

        let handle = {
            let gate = Arc::clone(&gate);
            let entered = Arc::clone(&entered);
            std::thread::spawn(move || {
                gate.lock_shared();
                entered.store(1, Ordering::SeqCst);
                gate.unlock_shared();
            })
        };

        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(entered.load(Ordering::SeqCst), 0);

        gate.unlock_exclusive();
        handle.join().unwrap();
        assert_eq!(entered.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_shared_excludes_exclusive() {
        let gate = Arc::new(RwGate::new());
        let entered = Arc::new(AtomicU32::new(0));

        gate.lock_shared();

        let handle = {
            let gate = Arc::clone(&gate);
            let entered = Arc::clone(&entered);
            std::thread::spawn(move || {
                gate.lock_exclusive();
                entered.store(1, Ordering::SeqCst);
                gate.unlock_exclusive();
            })
        };

        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(entered.load(Ordering::SeqCst), 0);

        gate.unlock_shared();
        handle.join().unwrap();
        assert_eq!(entered.load(Ordering::SeqCst), 1);
    }
}
