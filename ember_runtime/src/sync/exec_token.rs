//! The exclusive-execution token.
//!
//! One token exists per interpreter; a thread must hold it while attached.
//! The token is the single point through which all interpreter-visible
//! mutation is serialized.

use ember_core::fatal_invariant;
use parking_lot::{Condvar, Mutex};

struct TokenInner {
    /// Whether the token is currently held.
    locked: bool,
    /// Native thread id of the holder, for self-deadlock detection.
    holder: Option<u64>,
    /// Number of completed acquire/release handoffs.
    switches: u64,
}

/// A blocking, non-reentrant exclusive token.
pub struct ExecToken {
    inner: Mutex<TokenInner>,
    cond: Condvar,
}

impl ExecToken {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TokenInner {
                locked: false,
                holder: None,
                switches: 0,
            }),
            cond: Condvar::new(),
        }
    }

    /// Acquire the token for the calling thread, blocking until free.
    ///
    /// Re-acquiring from the holding thread is a hosting bug (it would
    /// self-deadlock) and is fatal.
    pub fn acquire(&self, native_thread_id: u64) {
        let mut inner = self.inner.lock();
        if inner.locked && inner.holder == Some(native_thread_id) {
            fatal_invariant(
                "thread already holds the execution token",
                format!("native thread {}", native_thread_id),
            );
        }
        while inner.locked {
            self.cond.wait(&mut inner);
        }
        inner.locked = true;
        inner.holder = Some(native_thread_id);
    }

    /// Release the token. Fatal if the caller is not the holder.
    pub fn release(&self, native_thread_id: u64) {
        let mut inner = self.inner.lock();
        if !inner.locked || inner.holder != Some(native_thread_id) {
            fatal_invariant(
                "releasing an execution token the thread does not hold",
                format!("native thread {}", native_thread_id),
            );
        }
        inner.locked = false;
        inner.holder = None;
        inner.switches += 1;
        self.cond.notify_one();
    }

    /// Whether the token is held by the given thread.
    #[inline]
    pub fn is_held_by(&self, native_thread_id: u64) -> bool {
        let inner = self.inner.lock();
        inner.locked && inner.holder == Some(native_thread_id)
    }

    /// Whether the token is held at all.
    #[inline]
    pub fn is_held(&self) -> bool {
        self.inner.lock().locked
    }

    /// Completed handoff count.
    pub fn switches(&self) -> u64 {
        self.inner.lock().switches
    }
}

impl Default for ExecToken {
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
    use std::sync::Arc;

    #[test]
    fn test_acquire_release() {
        let token = ExecToken::new();
        assert!(!token.is_held());

        token.acquire(1);
        assert!(token.is_held());
        assert!(token.is_held_by(1));
        assert!(!token.is_held_by(2));

        token.release(1);
        assert!(!token.is_held());
        assert_eq!(token.switches(), 1);
    }

    #[test]
    #[should_panic(expected = "already holds the execution token")]
    fn test_reacquire_is_fatal() {
        let token = ExecToken::new();
        token.acquire(1);
        token.acquire(1);
    }

    #[test]
    #[should_panic(expected = "does not hold")]
    fn test_release_by_non_holder_is_fatal() {
        let token = ExecToken::new();
        token.acquire(1);
        token.release(2);
    }

    #[test]
    fn test_contended_handoff() {
        let token = Arc::new(ExecToken::new());
        token.acquire(0);

        let handles: Vec<_> = (1..=4u64)
            .map(|tid| {
                let token = Arc::clone(&token);
                std::thread::spawn(move || {
                    token.acquire(tid);
                    token.release(tid);
                })
            })
            .collect();

        token.release(0);
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(token.switches(), 5);
        assert!(!token.is_held());
    }
}
