//! The "ensure/release" convenience pair for native callbacks.
//!
//! A native callback re-entering the runtime from an arbitrary OS thread
//! calls [`Runtime::threadstate_ensure`], which transparently creates,
//! binds, and attaches a thread state on first use, and tracks a recursion
//! counter so nested ensure/release pairs are safe. The matching
//! [`Runtime::threadstate_release`] detaches, and on the last release of a
//! state this pair created, clears and deletes it.
//!
//! The per-OS-thread registry is keyed by runtime id, so independent
//! runtime handles in one process never observe each other's bindings.

use std::cell::RefCell;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use ember_core::fatal_invariant;
use rustc_hash::FxHashMap;

use crate::attach::{attach_raw, detach_raw, AttachError};
use crate::state::status::ExecState;
use crate::state::thread::{delete_common, ThreadState, ThreadWhence};
use crate::state::Runtime;

thread_local! {
    /// runtime id -> this thread's bound thread state.
    static GILSTATE_TSS: RefCell<FxHashMap<u64, Arc<ThreadState>>> =
        RefCell::new(FxHashMap::default());
}

// =============================================================================
// Registry Plumbing
// =============================================================================

/// Record `ts` as the calling thread's state for `runtime_id`, unless one
/// is already recorded.
pub(crate) fn bind_gilstate(runtime_id: u64, ts: &ThreadState) {
    GILSTATE_TSS.with(|tss| {
        tss.borrow_mut()
            .entry(runtime_id)
            .or_insert_with(|| ts.arc());
    });
}

/// Drop the calling thread's binding if it is `ts`.
pub(crate) fn unbind_current_if(runtime_id: u64, ts: &ThreadState) {
    // Deletion from a foreign thread cannot reach that thread's local
    // registry; its entry is dropped when the OS thread exits.
    let _ = GILSTATE_TSS.try_with(|tss| {
        let mut tss = tss.borrow_mut();
        if tss
            .get(&runtime_id)
            .is_some_and(|cur| std::ptr::eq(cur.as_ref(), ts))
        {
            tss.remove(&runtime_id);
        }
    });
}

fn lookup(runtime_id: u64) -> Option<Arc<ThreadState>> {
    GILSTATE_TSS.with(|tss| tss.borrow().get(&runtime_id).cloned())
}

/// Whether `ts` is attached by the calling OS thread.
pub(crate) fn holds_token(ts: &ThreadState) -> bool {
    ts.exec_state() == ExecState::Attached
        && ts
            .binding
            .get()
            .is_some_and(|b| b.thread_id == std::thread::current().id())
}

// =============================================================================
// Ensure / Release
// =============================================================================

/// What `threadstate_ensure` found, returned to the matching release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GilStateKind {
    /// The calling thread was already attached.
    Locked,
    /// The calling thread had to attach (or had no state at all).
    Unlocked,
}

/// Token pairing an ensure with its release.
#[derive(Debug)]
#[must_use = "every ensure needs a matching threadstate_release"]
pub struct EnsureState {
    kind: GilStateKind,
}

impl EnsureState {
    #[inline]
    pub fn kind(&self) -> GilStateKind {
        self.kind
    }
}

impl Runtime {
    /// Make the calling OS thread ready to run interpreter code, creating
    /// and attaching a thread state in the auto interpreter if the thread
    /// has none.
    pub fn threadstate_ensure(&self) -> Result<EnsureState, AttachError> {
        let auto = match self.inner.gilstate.auto_interp() {
            Some(interp) => interp,
            None => fatal_invariant("thread-state ensure on an uninitialized runtime", ""),
        };
        let runtime_id = self.inner.id();

        let (ts, had_token) = match lookup(runtime_id) {
            Some(ts) => {
                let held = holds_token(&ts);
                (ts, held)
            }
            None => {
                let ts = auto.new_thread_state_bound(ThreadWhence::GilStateAuto);
                // The matching release must delete this state; a fresh
                // state's counter would otherwise pin it forever.
                ts.gilstate_counter.store(0, Ordering::SeqCst);
                GILSTATE_TSS.with(|tss| {
                    tss.borrow_mut().insert(runtime_id, Arc::clone(&ts));
                });
                (ts, false)
            }
        };

        if !had_token {
            attach_raw(&ts)?;
        }
        ts.gilstate_counter.fetch_add(1, Ordering::SeqCst);

        Ok(EnsureState {
            kind: if had_token {
                GilStateKind::Locked
            } else {
                GilStateKind::Unlocked
            },
        })
    }

    /// Undo one `threadstate_ensure`.
    pub fn threadstate_release(&self, state: EnsureState) {
        let runtime_id = self.inner.id();
        let ts = match lookup(runtime_id) {
            Some(ts) => ts,
            None => fatal_invariant(
                "auto-releasing a thread state, but this thread has none",
                "",
            ),
        };
        if !holds_token(&ts) {
            fatal_invariant(
                "thread state must be attached when releasing",
                format!("thread state {}", ts.id()),
            );
        }

        let previous = ts.gilstate_counter.fetch_sub(1, Ordering::SeqCst);
        if previous == 0 {
            fatal_invariant("thread-state release without a matching ensure", "");
        }

        if previous == 1 {
            // Tearing the state down. Clear may run teardown callbacks
            // that themselves use ensure/release; keep the counter nonzero
            // across it so they cannot re-trigger deletion.
            if state.kind == GilStateKind::Locked {
                fatal_invariant(
                    "destroying a thread state that was first seen attached",
                    "",
                );
            }
            ts.gilstate_counter.fetch_add(1, Ordering::SeqCst);
            ts.clear_impl();
            ts.gilstate_counter.fetch_sub(1, Ordering::SeqCst);
            delete_common(&ts, true);
        } else if state.kind == GilStateKind::Unlocked {
            detach_raw(&ts);
        }
    }

    /// The calling thread's bound state for this runtime, if any.
    pub fn current_thread_state(&self) -> Option<Arc<ThreadState>> {
        lookup(self.inner.id())
    }

    /// Whether the calling thread is currently attached to this runtime.
    pub fn gilstate_check(&self) -> bool {
        match lookup(self.inner.id()) {
            Some(ts) => holds_token(&ts),
            None => false,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_creates_exactly_once() {
        let runtime = Runtime::new();
        let main = runtime.main_interpreter().unwrap();
        assert_eq!(main.thread_count(), 0);

        let state = runtime.threadstate_ensure().unwrap();
        assert_eq!(state.kind(), GilStateKind::Unlocked);
        assert_eq!(main.thread_count(), 1);
        assert!(runtime.gilstate_check());

        let ts = runtime.current_thread_state().unwrap();
        assert_eq!(ts.whence(), ThreadWhence::GilStateAuto);

        runtime.threadstate_release(state);
        // Round trip: the thread is left with no live state.
        assert_eq!(main.thread_count(), 0);
        assert!(runtime.current_thread_state().is_none());
        assert!(!runtime.gilstate_check());
    }

    #[test]
    fn test_nested_ensure_is_safe() {
        let runtime = Runtime::new();
        let main = runtime.main_interpreter().unwrap();

        let outer = runtime.threadstate_ensure().unwrap();
        assert_eq!(outer.kind(), GilStateKind::Unlocked);

        let inner = runtime.threadstate_ensure().unwrap();
        assert_eq!(inner.kind(), GilStateKind::Locked);
        assert_eq!(main.thread_count(), 1);

        runtime.threadstate_release(inner);
        // Still attached: the outer pair owns the detach.
        assert!(runtime.gilstate_check());

        runtime.threadstate_release(outer);
        assert_eq!(main.thread_count(), 0);
    }

    #[test]
    fn test_ensure_reuses_embedder_state() {
        let runtime = Runtime::new();
        let main = runtime.main_interpreter().unwrap();
        let ts = main.new_thread_state_bound(ThreadWhence::Embedding);
        let guard = ts.attach().unwrap();

        // The attach registered the state for this thread, so ensure is an
        // idempotent no-op on it.
        let state = runtime.threadstate_ensure().unwrap();
        assert_eq!(state.kind(), GilStateKind::Locked);
        assert_eq!(main.thread_count(), 1);
        runtime.threadstate_release(state);

        // The embedder's state survives the release.
        assert_eq!(main.thread_count(), 1);
        assert!(runtime.gilstate_check());
        drop(guard);
        ts.delete();
    }

    #[test]
    fn test_independent_runtimes_do_not_collide() {
        let a = Runtime::new();
        let b = Runtime::new();

        let state_a = a.threadstate_ensure().unwrap();
        assert!(a.gilstate_check());
        assert!(!b.gilstate_check());
        assert!(b.current_thread_state().is_none());

        a.threadstate_release(state_a);
    }

    #[test]
    #[should_panic(expected = "this thread has none")]
    fn test_release_without_ensure_is_fatal() {
        let runtime = Runtime::new();
        runtime.threadstate_release(EnsureState {
            kind: GilStateKind::Unlocked,
        });
    }
}
