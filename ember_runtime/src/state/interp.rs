//! Per-interpreter state and its lifecycle.
//!
//! An interpreter is an isolated execution environment: its own thread
//! registry, its own execution token, its own pause state. Interpreters
//! coexist in one runtime; the first one created is the "main" interpreter
//! and outlives every sibling.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use ember_core::{fatal_invariant, CallCx, InterpreterConfig, Value};
use parking_lot::Mutex;

use crate::attach::AttachGuard;
use crate::state::status::ExecState;
use crate::state::thread::{ThreadRegistry, ThreadState, ThreadWhence};
use crate::state::RuntimeInner;
use crate::stats::{AttachStats, CallStats};
use crate::stw::{self, StopTheWorldState, StwScope};
use crate::sync::ExecToken;

// =============================================================================
// Eval Frame Hook
// =============================================================================

/// Optional override of the frame-evaluation entry point.
///
/// The kernel stores and hands this out; instrumentation layers outside the
/// kernel install and consume it.
pub type EvalFrameHook = Arc<dyn Fn(&mut dyn CallCx, &[Value]) -> Option<Value> + Send + Sync>;

// =============================================================================
// InterpreterState
// =============================================================================

struct IdRefs {
    refcount: i64,
    requires: bool,
}

/// An isolated execution environment within one runtime.
pub struct InterpreterState {
    id: u64,
    myself: Weak<InterpreterState>,
    runtime: Weak<RuntimeInner>,
    config: InterpreterConfig,
    /// Registered thread states; head = most recently added.
    pub(crate) threads: Mutex<ThreadRegistry>,
    /// The exclusive-execution token gating attached execution.
    pub(crate) token: ExecToken,
    /// Pause state scoped to this interpreter alone.
    pub(crate) stoptheworld: StopTheWorldState,
    eval_frame_hook: Mutex<Option<EvalFrameHook>>,
    id_refs: Mutex<IdRefs>,
    cleared: AtomicBool,
    pub(crate) attach_stats: AttachStats,
    pub(crate) call_stats: CallStats,
}

impl InterpreterState {
    pub(crate) fn new(runtime: Weak<RuntimeInner>, id: u64, config: InterpreterConfig) -> Arc<Self> {
        Arc::new_cyclic(|myself| Self {
            id,
            myself: myself.clone(),
            runtime,
            config,
            threads: Mutex::new(ThreadRegistry::new()),
            token: ExecToken::new(),
            stoptheworld: StopTheWorldState::new(false),
            eval_frame_hook: Mutex::new(None),
            id_refs: Mutex::new(IdRefs {
                refcount: 0,
                requires: false,
            }),
            cleared: AtomicBool::new(false),
            attach_stats: AttachStats::default(),
            call_stats: CallStats::default(),
        })
    }

    /// Unique id, assigned at creation, never reused.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn config(&self) -> &InterpreterConfig {
        &self.config
    }

    /// Whether this is the first interpreter created in its runtime.
    #[inline]
    pub fn is_main(&self) -> bool {
        self.id == 0
    }

    pub fn attach_stats(&self) -> &AttachStats {
        &self.attach_stats
    }

    pub fn call_stats(&self) -> &CallStats {
        &self.call_stats
    }

    pub(crate) fn runtime(&self) -> Arc<RuntimeInner> {
        match self.runtime.upgrade() {
            Some(runtime) => runtime,
            None => fatal_invariant(
                "runtime destroyed before its interpreters",
                format!("interpreter {}", self.id),
            ),
        }
    }

    pub(crate) fn arc(&self) -> Arc<InterpreterState> {
        match self.myself.upgrade() {
            Some(interp) => interp,
            None => fatal_invariant(
                "interpreter state used during destruction",
                format!("interpreter {}", self.id),
            ),
        }
    }

    // =========================================================================
    // Thread States
    // =========================================================================

    /// Allocate and register a new thread state.
    ///
    /// The state is inserted at the head of the registry fully constructed.
    /// If a pause is in flight it starts suspended, so it can neither
    /// attach nor be missed by the resume sweep.
    pub fn new_thread_state(&self, whence: ThreadWhence) -> Arc<ThreadState> {
        let runtime = self.runtime();
        let mut registry = self.threads.lock();
        let id = registry.next_id();
        let start = if self.stoptheworld.is_requested() || runtime.stoptheworld.is_requested() {
            ExecState::Suspended
        } else {
            ExecState::Detached
        };
        let handle = registry.reserve();
        let interp = self.arc();
        let limit = self.config.recursion_limit();
        let ts = Arc::new_cyclic(|myself| {
            ThreadState::new(myself.clone(), interp, id, whence, handle, start, limit)
        });
        registry.install(handle, Arc::clone(&ts));
        ts
    }

    /// Allocate, register, and bind a thread state to the calling thread.
    pub fn new_thread_state_bound(&self, whence: ThreadWhence) -> Arc<ThreadState> {
        let ts = self.new_thread_state(whence);
        ts.bind();
        ts
    }

    /// Number of registered thread states.
    pub fn thread_count(&self) -> usize {
        self.threads.lock().len()
    }

    /// The most recently added thread state.
    pub fn thread_head(&self) -> Option<Arc<ThreadState>> {
        self.threads.lock().head().cloned()
    }

    /// Snapshot of the registered thread states, newest first.
    ///
    /// The snapshot is taken under the registry lock; callers inspecting
    /// execution states afterwards read each state's atomic field.
    pub fn threads_snapshot(&self) -> Vec<Arc<ThreadState>> {
        self.threads.lock().iter().cloned().collect()
    }

    pub(crate) fn remove_except(&self, keep: &ThreadState) -> Vec<Arc<ThreadState>> {
        self.threads.lock().drain_except(keep.handle())
    }

    // =========================================================================
    // Eval Frame Hook
    // =========================================================================

    pub fn eval_frame_hook(&self) -> Option<EvalFrameHook> {
        self.eval_frame_hook.lock().clone()
    }

    pub fn set_eval_frame_hook(&self, hook: Option<EvalFrameHook>) {
        *self.eval_frame_hook.lock() = hook;
    }

    // =========================================================================
    // Id References
    // =========================================================================

    /// Take an external reference that keeps this interpreter alive.
    pub fn incref_id(&self) {
        self.id_refs.lock().refcount += 1;
    }

    /// Drop an external reference.
    ///
    /// When the count reaches zero and `require_idref` was set, the
    /// interpreter is torn down: a fresh thread state is created and bound
    /// solely to run the teardown, then is itself deleted.
    pub fn decref_id(&self) {
        let finalize = {
            let mut refs = self.id_refs.lock();
            if refs.refcount == 0 {
                fatal_invariant(
                    "interpreter id refcount underflow",
                    format!("interpreter {}", self.id),
                );
            }
            refs.refcount -= 1;
            refs.refcount == 0 && refs.requires
        };
        if finalize {
            finalize_with_helper(self);
        }
    }

    pub fn id_refcount(&self) -> i64 {
        self.id_refs.lock().refcount
    }

    /// Mark whether a zero id refcount tears the interpreter down.
    pub fn require_idref(&self, required: bool) {
        self.id_refs.lock().requires = required;
    }

    pub fn requires_idref(&self) -> bool {
        self.id_refs.lock().requires
    }

    // =========================================================================
    // Pause (interpreter scope)
    // =========================================================================

    /// Pause every other thread of this interpreter. Blocks until all of
    /// them reach a safe point.
    pub fn stop_the_world_begin(&self, requester: Option<&AttachGuard>) {
        let runtime = self.runtime();
        stw::stop_the_world(
            &runtime,
            &StwScope::Interp(self.arc()),
            requester.map(|g| g.thread().as_ref()),
        );
    }

    /// Resume the threads paused by `stop_the_world_begin`.
    pub fn stop_the_world_end(&self) {
        let runtime = self.runtime();
        stw::start_the_world(&runtime, &StwScope::Interp(self.arc()));
    }

    // =========================================================================
    // Teardown
    // =========================================================================

    /// Clear interpreter-held state while the caller stays attached.
    ///
    /// Sibling thread states are shut down and cleared first; the current
    /// thread's clear runs last so the caller keeps valid bookkeeping while
    /// sibling teardown runs. That ordering is load-bearing but not proven
    /// safe under arbitrary teardown callbacks; see the focused tests.
    pub fn clear(&self, guard: &AttachGuard) {
        let current = guard.thread();
        if !std::ptr::eq(current.interp().as_ref(), self) {
            fatal_invariant(
                "clearing an interpreter the caller is not attached to",
                format!("interpreter {}", self.id),
            );
        }
        let runtime = self.runtime();
        debug_assert!(
            !self.stoptheworld.is_requested() && !runtime.stoptheworld.is_requested(),
            "interpreter cleared during a pause"
        );

        let siblings = self.remove_except(current);
        for sibling in &siblings {
            sibling.set_shutting_down();
            sibling.clear_impl();
            sibling.mark_finalized();
        }
        drop(siblings);

        current.clear_impl();

        *self.eval_frame_hook.lock() = None;
        self.cleared.store(true, Ordering::SeqCst);
    }

    /// Whether `clear` has run.
    pub fn is_cleared(&self) -> bool {
        self.cleared.load(Ordering::SeqCst)
    }

    /// Unlink this interpreter from its runtime.
    ///
    /// Fatal if any thread state is still registered, and fatal for the
    /// main interpreter while sibling interpreters remain.
    pub fn delete(&self) {
        let runtime = self.runtime();
        {
            let registry = self.threads.lock();
            if !registry.is_empty() {
                fatal_invariant(
                    "interpreter still has live thread states",
                    format!(
                        "interpreter {} has {} thread states",
                        self.id,
                        registry.len()
                    ),
                );
            }
        }
        runtime.unlink_interpreter(self);
    }
}

impl std::fmt::Debug for InterpreterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterpreterState")
            .field("id", &self.id)
            .field("threads", &self.thread_count())
            .field("cleared", &self.is_cleared())
            .finish()
    }
}

// =============================================================================
// Teardown Entry Points
// =============================================================================

/// Tear down the interpreter the guard is attached to: clear it, delete
/// the current thread state, and delete the interpreter.
pub fn end_interpreter(guard: AttachGuard) {
    let interp = Arc::clone(guard.thread().interp());
    interp.clear(&guard);
    crate::attach::delete_current(guard);
    interp.delete();
}

/// Tear an interpreter down from a thread with no thread state of its own:
/// create and bind a throwaway state, attach it, and run the teardown.
pub(crate) fn finalize_with_helper(interp: &InterpreterState) {
    let ts = interp.new_thread_state_bound(ThreadWhence::Legacy);
    match ts.attach() {
        Ok(guard) => end_interpreter(guard),
        Err(err) => fatal_invariant(
            "could not attach the finalizing thread state",
            err.to_string(),
        ),
    }
}

// =============================================================================
// Tests
// =============================================================================
