//! Per-thread execution state and its lifecycle.
//!
//! A `ThreadState` belongs to exactly one interpreter for its whole life:
//! new → bind → [attach/detach]* → clear → delete. It lives in the owning
//! interpreter's registry from the moment it is created until it is
//! deleted; it is never observable half-constructed.
//!
//! The registry is an arena of generation-checked slots. Slots are recycled
//! through a free list, handles carry the slot generation, and
//! stop-the-world scans read only each occupant's atomic `state` field.

use std::fmt;
use std::sync::atomic::AtomicU32;
use std::sync::{Arc, OnceLock, Weak};

use ember_core::{fatal_invariant, EmberError};
use parking_lot::Mutex;

use crate::state::interp::InterpreterState;
use crate::state::status::{AtomicExecState, ExecState};
use crate::sync::Parker;

// =============================================================================
// OS Thread Identity
// =============================================================================

/// Native (OS-level) id of the calling thread, for diagnostics and token
/// holder bookkeeping.
#[cfg(target_os = "linux")]
pub(crate) fn current_native_thread_id() -> u64 {
    (unsafe { libc::syscall(libc::SYS_gettid) }) as u64
}

#[cfg(all(unix, not(target_os = "linux")))]
pub(crate) fn current_native_thread_id() -> u64 {
    unsafe { libc::pthread_self() as u64 }
}

#[cfg(windows)]
pub(crate) fn current_native_thread_id() -> u64 {
    (unsafe { windows_sys::Win32::System::Threading::GetCurrentThreadId() }) as u64
}

/// Identity recorded when a thread state is bound; set once, never reset,
/// so diagnostics can name the thread even after it is gone.
#[derive(Debug, Clone)]
pub(crate) struct BoundIdentity {
    pub thread_id: std::thread::ThreadId,
    pub native_id: u64,
}

// =============================================================================
// Creation Reason
// =============================================================================

/// Why a thread state was created. Diagnostics only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadWhence {
    Unknown,
    /// Created through the embedding API.
    Embedding,
    /// Created through the legacy interpreter API.
    Legacy,
    /// Created for an exec-style invocation.
    Exec,
    /// Created automatically by `threadstate_ensure`.
    GilStateAuto,
}

impl fmt::Display for ThreadWhence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unknown => "unknown",
            Self::Embedding => "embedding",
            Self::Legacy => "legacy",
            Self::Exec => "exec",
            Self::GilStateAuto => "gilstate-auto",
        };
        write!(f, "{}", name)
    }
}

// =============================================================================
// Thread Handle
// =============================================================================

/// Generation-checked handle to a registry slot.
///
/// A stale handle (the slot was freed and reused) fails the generation
/// check instead of aliasing the new occupant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadHandle {
    pub(crate) slot: u32,
    pub(crate) generation: u64,
}

// =============================================================================
// ThreadState
// =============================================================================

/// Mutable per-thread bookkeeping, touched only by the owning OS thread
/// (while attached) and by interpreter teardown.
pub(crate) struct ThreadBody {
    pub recursion_remaining: u32,
    pub recursion_limit: u32,
    pub current_exception: Option<EmberError>,
    pub critical_section_depth: u32,
    pub suspended_critical_sections: u32,
    pub cleared: bool,
    pub finalized: bool,
}

/// The state of one logical thread of execution inside one interpreter.
pub struct ThreadState {
    id: u64,
    myself: Weak<ThreadState>,
    whence: ThreadWhence,
    handle: ThreadHandle,
    interp: Arc<InterpreterState>,
    /// The cross-thread handshake variable. Never read non-atomically.
    pub(crate) state: AtomicExecState,
    pub(crate) binding: OnceLock<BoundIdentity>,
    /// Recursion depth of ensure/release pairs; cleanup is safe at zero.
    pub(crate) gilstate_counter: AtomicU32,
    pub(crate) parker: Parker,
    pub(crate) body: Mutex<ThreadBody>,
}

impl ThreadState {
    pub(crate) fn new(
        myself: Weak<ThreadState>,
        interp: Arc<InterpreterState>,
        id: u64,
        whence: ThreadWhence,
        handle: ThreadHandle,
        start: ExecState,
        recursion_limit: u32,
    ) -> Self {
        Self {
            id,
            myself,
            whence,
            handle,
            interp,
            state: AtomicExecState::new(start),
            binding: OnceLock::new(),
            // threadstate_release must not try to delete this thread state
            // unless threadstate_ensure created it.
            gilstate_counter: AtomicU32::new(1),
            parker: Parker::new(),
            body: Mutex::new(ThreadBody {
                recursion_remaining: recursion_limit,
                recursion_limit,
                current_exception: None,
                critical_section_depth: 0,
                suspended_critical_sections: 0,
                cleared: false,
                finalized: false,
            }),
        }
    }

    /// Unique-per-interpreter id, assigned at creation.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn whence(&self) -> ThreadWhence {
        self.whence
    }

    #[inline]
    pub fn handle(&self) -> ThreadHandle {
        self.handle
    }

    /// The owning interpreter. Never changes after creation.
    #[inline]
    pub fn interp(&self) -> &Arc<InterpreterState> {
        &self.interp
    }

    #[inline]
    pub(crate) fn interp_id(&self) -> u64 {
        self.interp.id()
    }

    pub(crate) fn arc(&self) -> Arc<ThreadState> {
        match self.myself.upgrade() {
            Some(ts) => ts,
            None => fatal_invariant(
                "thread state used during destruction",
                format!("thread state {}", self.id),
            ),
        }
    }

    /// Current execution state.
    #[inline]
    pub fn exec_state(&self) -> ExecState {
        self.state.load()
    }

    /// Whether `bind` has run.
    #[inline]
    pub fn is_bound(&self) -> bool {
        self.binding.get().is_some()
    }

    /// Native thread id recorded at bind time; 0 if unbound.
    pub fn native_thread_id(&self) -> u64 {
        self.binding.get().map_or(0, |b| b.native_id)
    }

    pub(crate) fn bound_or_fatal(&self) -> &BoundIdentity {
        match self.binding.get() {
            Some(bound) => bound,
            None => fatal_invariant(
                "thread state used before bind",
                format!("thread state {}", self.id),
            ),
        }
    }

    pub(crate) fn bound_native_id(&self) -> u64 {
        self.bound_or_fatal().native_id
    }

    /// Record the calling OS thread's identity.
    ///
    /// Called once, from the thread that will use this state; a second
    /// bind is fatal.
    pub fn bind(&self) {
        let identity = BoundIdentity {
            thread_id: std::thread::current().id(),
            native_id: current_native_thread_id(),
        };
        if self.binding.set(identity).is_err() {
            fatal_invariant(
                "thread state is already bound",
                format!("thread state {}", self.id),
            );
        }
    }

    /// Mark this thread state terminally shutting down and wake the owner
    /// if it is parked in an attach attempt.
    pub fn set_shutting_down(&self) {
        self.state.store_shutting_down();
        self.parker.unpark_all();
    }

    /// Release all per-thread references: the pending exception, call
    /// bookkeeping, critical-section depths.
    ///
    /// The caller must hold the attach capability for this interpreter.
    /// Clearing a state with calls still in flight is reported (in verbose
    /// mode) but proceeds.
    pub fn clear(&self, guard: &crate::attach::AttachGuard) {
        if !Arc::ptr_eq(guard.thread().interp(), &self.interp) {
            fatal_invariant(
                "clearing a thread state from a different interpreter",
                format!("thread state {}", self.id),
            );
        }
        self.clear_impl();
    }

    pub(crate) fn clear_impl(&self) {
        let verbose = self.interp.config().verbose();
        let mut body = self.body.lock();
        if body.cleared {
            fatal_invariant(
                "thread state cleared twice",
                format!("thread state {}", self.id),
            );
        }
        if verbose && body.recursion_remaining != body.recursion_limit {
            eprintln!(
                "ember: thread state clear: warning: thread {} still has calls in flight",
                self.id
            );
        }
        if verbose && body.current_exception.is_some() {
            eprintln!(
                "ember: thread state clear: warning: thread {} has an exception set",
                self.id
            );
        }
        body.current_exception = None;
        body.recursion_remaining = body.recursion_limit;
        body.critical_section_depth = 0;
        body.suspended_critical_sections = 0;
        body.cleared = true;
    }

    /// Unlink from the owning interpreter and release this state's
    /// resources.
    ///
    /// Fatal if the state is still attached or suspended; a thread must
    /// tear itself down through detach, clear, delete in that order, or
    /// use `delete_current`.
    pub fn delete(&self) {
        delete_common(self, false);
    }

    /// Whether `clear` has run.
    pub fn is_cleared(&self) -> bool {
        self.body.lock().cleared
    }

    /// Whether the state has been unlinked from its interpreter.
    pub fn is_finalized(&self) -> bool {
        self.body.lock().finalized
    }

    pub(crate) fn mark_finalized(&self) {
        self.body.lock().finalized = true;
    }
}

impl fmt::Debug for ThreadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadState")
            .field("id", &self.id)
            .field("interp", &self.interp.id())
            .field("whence", &self.whence)
            .field("state", &self.state.load())
            .field("bound", &self.is_bound())
            .finish()
    }
}

// =============================================================================
// Deletion
// =============================================================================

/// Shared deletion path.
///
/// `release_token` is set for the delete-current flow: the state is
/// expected attached, leaves the attached state as part of deletion, and
/// releases the execution token after unlinking.
///
/// Any in-flight stop-the-world countdown this thread was counted in is
/// decremented here, so a requester never waits on a thread that no longer
/// exists.
pub(crate) fn delete_common(ts: &ThreadState, release_token: bool) {
    let interp = Arc::clone(ts.interp());
    let runtime = interp.runtime();

    {
        // Lock order: runtime pause sync, interpreter pause sync, registry.
        let mut runtime_sync = runtime.stoptheworld.sync_lock();
        let mut interp_sync = interp.stoptheworld.sync_lock();
        let mut registry = interp.threads.lock();

        let state = ts.state.load();
        if release_token {
            if state != ExecState::Attached {
                fatal_invariant(
                    "deleting the current thread state while not attached",
                    format!("thread state {} is {}", ts.id(), state),
                );
            }
        } else if matches!(state, ExecState::Attached | ExecState::Suspended) {
            fatal_invariant(
                "deleting a thread state that is still in use",
                format!("thread state {} is {}", ts.id(), state),
            );
        }

        if registry.remove(ts.handle()).is_none() {
            fatal_invariant(
                "deleting a thread state that is not registered",
                format!("thread state {}", ts.id()),
            );
        }

        if state != ExecState::Suspended {
            if interp.stoptheworld.is_requested() {
                interp.stoptheworld.decrement_with(&mut interp_sync);
            }
            if runtime.stoptheworld.is_requested() {
                runtime.stoptheworld.decrement_with(&mut runtime_sync);
            }
        }
    }

    crate::gilstate::unbind_current_if(runtime.id(), ts);
    ts.mark_finalized();

    if release_token {
        ts.state
            .transition_or_fatal(ExecState::Attached, ExecState::Detached);
        interp.token.release(ts.bound_native_id());
    }
}

// =============================================================================
// Thread Registry
// =============================================================================

struct Slot {
    generation: u64,
    occupant: Option<Arc<ThreadState>>,
}

/// Arena of thread-state slots for one interpreter.
///
/// Mutated only under the owning lock; walk order is newest-first.
pub(crate) struct ThreadRegistry {
    slots: Vec<Slot>,
    free: Vec<u32>,
    order: Vec<u32>,
    next_unique_id: u64,
}

impl ThreadRegistry {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            order: Vec::new(),
            next_unique_id: 0,
        }
    }

    /// Allocate the next unique-per-interpreter thread id.
    pub fn next_id(&mut self) -> u64 {
        self.next_unique_id += 1;
        self.next_unique_id
    }

    /// Reserve a slot (reusing a freed one when available) and return its
    /// handle. The slot stays empty until `install`.
    pub fn reserve(&mut self) -> ThreadHandle {
        let slot = match self.free.pop() {
            Some(slot) => slot,
            None => {
                self.slots.push(Slot {
                    generation: 1,
                    occupant: None,
                });
                (self.slots.len() - 1) as u32
            }
        };
        ThreadHandle {
            slot,
            generation: self.slots[slot as usize].generation,
        }
    }

    /// Install a fully constructed thread state at the head of the walk
    /// order.
    pub fn install(&mut self, handle: ThreadHandle, ts: Arc<ThreadState>) {
        let slot = &mut self.slots[handle.slot as usize];
        debug_assert_eq!(slot.generation, handle.generation);
        debug_assert!(slot.occupant.is_none());
        slot.occupant = Some(ts);
        self.order.insert(0, handle.slot);
    }

    /// Remove the occupant, bumping the slot generation so stale handles
    /// miss.
    pub fn remove(&mut self, handle: ThreadHandle) -> Option<Arc<ThreadState>> {
        let slot = self.slots.get_mut(handle.slot as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let ts = slot.occupant.take()?;
        slot.generation += 1;
        self.free.push(handle.slot);
        self.order.retain(|&s| s != handle.slot);
        Some(ts)
    }

    pub fn get(&self, handle: ThreadHandle) -> Option<&Arc<ThreadState>> {
        let slot = self.slots.get(handle.slot as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.occupant.as_ref()
    }

    /// Walk the registered states, newest first.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<ThreadState>> + '_ {
        self.order
            .iter()
            .filter_map(move |&slot| self.slots[slot as usize].occupant.as_ref())
    }

    /// The most recently added state.
    pub fn head(&self) -> Option<&Arc<ThreadState>> {
        self.order
            .first()
            .and_then(|&slot| self.slots[slot as usize].occupant.as_ref())
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Remove every state except `keep`, returning the removed ones in
    /// walk order.
    pub fn drain_except(&mut self, keep: ThreadHandle) -> Vec<Arc<ThreadState>> {
        let victims: Vec<ThreadHandle> = self
            .iter()
            .map(|ts| ts.handle())
            .filter(|h| *h != keep)
            .collect();
        victims
            .into_iter()
            .filter_map(|h| self.remove(h))
            .collect()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Runtime;

    // =========================================================================
    // Lifecycle Tests
    // =========================================================================

    #[test]
    fn test_new_thread_state_starts_detached() {
        let runtime = Runtime::new();
        let interp = runtime.main_interpreter().unwrap();
        let ts = interp.new_thread_state(ThreadWhence::Embedding);
        assert_eq!(ts.exec_state(), ExecState::Detached);
        assert_eq!(ts.whence(), ThreadWhence::Embedding);
        assert!(!ts.is_bound());
        assert_eq!(ts.native_thread_id(), 0);
        ts.delete();
    }

    #[test]
    fn test_thread_ids_are_unique_and_increasing() {
        let runtime = Runtime::new();
        let interp = runtime.main_interpreter().unwrap();
        let a = interp.new_thread_state(ThreadWhence::Unknown);
        let b = interp.new_thread_state(ThreadWhence::Unknown);
        let c = interp.new_thread_state(ThreadWhence::Unknown);
        assert!(a.id() < b.id());
        assert!(b.id() < c.id());
        c.delete();
        b.delete();
        // Ids are not reused after deletion.
        let d = interp.new_thread_state(ThreadWhence::Unknown);
        assert!(d.id() > c.id());
        d.delete();
        a.delete();
    }

    #[test]
    fn test_bind_records_identity() {
        let runtime = Runtime::new();
        let interp = runtime.main_interpreter().unwrap();
        let ts = interp.new_thread_state(ThreadWhence::Unknown);
        ts.bind();
        assert!(ts.is_bound());
        assert_ne!(ts.native_thread_id(), 0);
        ts.delete();
    }

    #[test]
    #[should_panic(expected = "already bound")]
    fn test_double_bind_is_fatal() {
        let runtime = Runtime::new();
        let interp = runtime.main_interpreter().unwrap();
        let ts = interp.new_thread_state(ThreadWhence::Unknown);
        ts.bind();
        ts.bind();
    }

    #[test]
    #[should_panic(expected = "still in use")]
    fn test_delete_attached_is_fatal() {
        let runtime = Runtime::new();
        let interp = runtime.main_interpreter().unwrap();
        let ts = interp.new_thread_state(ThreadWhence::Unknown);
        ts.bind();
        let guard = ts.attach().unwrap();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| ts.delete()));
        // Re-panic outside the catch so the guard can still drop cleanly.
        drop(guard);
        ts.delete();
        if let Err(payload) = result {
            std::panic::resume_unwind(payload);
        }
    }

    #[test]
    fn test_clear_then_delete() {
        let runtime = Runtime::new();
        let interp = runtime.main_interpreter().unwrap();
        let ts = interp.new_thread_state(ThreadWhence::Unknown);
        ts.bind();
        let guard = ts.attach().unwrap();
        ts.clear(&guard);
        drop(guard);
        ts.delete();
        assert_eq!(interp.thread_count(), 0);
    }

    #[test]
    fn test_shutting_down_is_terminal() {
        let runtime = Runtime::new();
        let interp = runtime.main_interpreter().unwrap();
        let ts = interp.new_thread_state(ThreadWhence::Unknown);
        ts.bind();
        ts.set_shutting_down();
        assert_eq!(ts.exec_state(), ExecState::ShuttingDown);
        assert!(ts.attach().is_err());
        ts.delete();
    }

    // =========================================================================
    // Registry Tests
    // =========================================================================

    #[test]
    fn test_registry_reserve_install_remove() {
        let runtime = Runtime::new();
        let interp = runtime.main_interpreter().unwrap();
        let a = interp.new_thread_state(ThreadWhence::Unknown);
        let b = interp.new_thread_state(ThreadWhence::Unknown);

        {
            let reg = interp.threads.lock();
            assert_eq!(reg.len(), 2);
            // Head is the most recently added.
            assert_eq!(reg.head().unwrap().id(), b.id());
            let order: Vec<u64> = reg.iter().map(|t| t.id()).collect();
            assert_eq!(order, vec![b.id(), a.id()]);
        }

        b.delete();
        {
            let reg = interp.threads.lock();
            assert_eq!(reg.len(), 1);
            assert_eq!(reg.head().unwrap().id(), a.id());
        }
        a.delete();
    }

    #[test]
    fn test_registry_stale_handle_misses_after_reuse() {
        let runtime = Runtime::new();
        let interp = runtime.main_interpreter().unwrap();
        let a = interp.new_thread_state(ThreadWhence::Unknown);
        let stale = a.handle();
        a.delete();

        // The freed slot is recycled with a bumped generation.
        let b = interp.new_thread_state(ThreadWhence::Unknown);
        assert_eq!(b.handle().slot, stale.slot);
        assert_ne!(b.handle().generation, stale.generation);

        let reg = interp.threads.lock();
        assert!(reg.get(stale).is_none());
        assert!(reg.get(b.handle()).is_some());
        drop(reg);
        b.delete();
    }

    #[test]
    fn test_whence_display() {
        assert_eq!(ThreadWhence::GilStateAuto.to_string(), "gilstate-auto");
        assert_eq!(ThreadWhence::Unknown.to_string(), "unknown");
    }
}
