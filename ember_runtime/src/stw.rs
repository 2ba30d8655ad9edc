//! Stop-the-world coordination.
//!
//! A requester forces every other thread in scope out of the attached
//! state, does its work against a quiescent runtime, and resumes them.
//! Two scopes exist: the whole runtime, and a single interpreter. A
//! runtime-scope pause excludes every interpreter-scope pause through the
//! ordering gate; interpreter-scope pauses on different interpreters run
//! concurrently.
//!
//! The protocol:
//! 1. Serialize with any other request on the same scope.
//! 2. Mark the scope requested, then count every other live thread.
//! 3. Park detached threads directly (detached -> suspended); attached
//!    threads park themselves at their next safe point.
//! 4. Block on a one-shot event until the countdown reaches zero,
//!    re-sweeping newly detached threads every millisecond.
//! 5. Resume: flip every suspended thread back to detached and wake it.
//!
//! A pause never fails; it blocks until quiescence. Thread deletion
//! decrements any countdown the thread was part of, so a requester never
//! waits on a thread that no longer exists.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ember_core::fatal_invariant;
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::state::interp::InterpreterState;
use crate::state::status::ExecState;
use crate::state::RuntimeInner;
use crate::stats::StopTheWorldStats;
use crate::sync::Event;

/// How long the requester waits on the countdown event before re-sweeping
/// detached threads.
const PARK_RETRY_INTERVAL: Duration = Duration::from_millis(1);

// =============================================================================
// Scope
// =============================================================================

/// The set of threads a pause quiesces.
pub(crate) enum StwScope {
    /// Every thread of every interpreter in the runtime.
    Global,
    /// Every thread of one interpreter.
    Interp(Arc<InterpreterState>),
}

impl StwScope {
    pub(crate) fn state<'a>(&'a self, runtime: &'a RuntimeInner) -> &'a StopTheWorldState {
        match self {
            Self::Global => &runtime.stoptheworld,
            Self::Interp(interp) => &interp.stoptheworld,
        }
    }

    fn interps(&self, runtime: &RuntimeInner) -> Vec<Arc<InterpreterState>> {
        match self {
            Self::Global => runtime.interpreter_snapshot(),
            Self::Interp(interp) => vec![Arc::clone(interp)],
        }
    }
}

// =============================================================================
// Pause State
// =============================================================================

/// Countdown bookkeeping, guarded by the pause's sync lock.
pub(crate) struct StwSync {
    /// Threads still to park. The requester blocks while nonzero.
    pub countdown: u64,
    /// (interpreter id, thread id) of the requesting thread state, if the
    /// requester is attached. Exempt from parking.
    pub requester: Option<(u64, u64)>,
}

/// Pause state embedded in a runtime (global scope) or an interpreter.
pub struct StopTheWorldState {
    is_global: bool,
    /// One request in flight per scope.
    busy: Mutex<bool>,
    busy_cond: Condvar,
    /// Set for the whole duration of a request; read by the detach path
    /// and by thread-state creation.
    requested: AtomicBool,
    world_stopped: AtomicBool,
    sync: Mutex<StwSync>,
    stop_event: Event,
    stats: StopTheWorldStats,
}

impl StopTheWorldState {
    pub(crate) fn new(is_global: bool) -> Self {
        Self {
            is_global,
            busy: Mutex::new(false),
            busy_cond: Condvar::new(),
            requested: AtomicBool::new(false),
            world_stopped: AtomicBool::new(false),
            sync: Mutex::new(StwSync {
                countdown: 0,
                requester: None,
            }),
            stop_event: Event::new(),
            stats: StopTheWorldStats::default(),
        }
    }

    #[inline]
    pub(crate) fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    #[inline]
    pub(crate) fn is_world_stopped(&self) -> bool {
        self.world_stopped.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> &StopTheWorldStats {
        &self.stats
    }

    pub(crate) fn sync_lock(&self) -> MutexGuard<'_, StwSync> {
        self.sync.lock()
    }

    /// Decrement the countdown; the final decrement wakes the requester.
    pub(crate) fn decrement_countdown(&self) {
        let mut sync = self.sync.lock();
        self.decrement_with(&mut sync);
    }

    pub(crate) fn decrement_with(&self, sync: &mut StwSync) {
        if sync.countdown == 0 {
            fatal_invariant("stop-the-world countdown underflow", "");
        }
        sync.countdown -= 1;
        if sync.countdown == 0 {
            self.stop_event.notify();
        }
    }

    fn begin_request(&self) {
        let mut busy = self.busy.lock();
        while *busy {
            self.busy_cond.wait(&mut busy);
        }
        *busy = true;
    }

    fn end_request(&self) {
        let mut busy = self.busy.lock();
        *busy = false;
        self.busy_cond.notify_one();
    }
}

// =============================================================================
// Protocol
// =============================================================================

fn requester_key(requester: Option<&crate::state::thread::ThreadState>) -> Option<(u64, u64)> {
    requester.map(|ts| (ts.interp_id(), ts.id()))
}

/// Park the detached threads in scope (detached -> suspended). Returns
/// true once the countdown hits zero through parks performed here.
fn park_detached_threads(
    runtime: &RuntimeInner,
    scope: &StwScope,
    stw: &StopTheWorldState,
    sync: &mut StwSync,
) -> bool {
    let mut num_parked = 0u64;
    for interp in scope.interps(runtime) {
        let registry = interp.threads.lock();
        for ts in registry.iter() {
            if Some((ts.interp_id(), ts.id())) == sync.requester {
                continue;
            }
            if ts.state.load() == ExecState::Detached
                && ts
                    .state
                    .transition_or_fatal(ExecState::Detached, ExecState::Suspended)
            {
                num_parked += 1;
            }
        }
    }
    if num_parked > 0 {
        stw.stats.record_parked(num_parked);
        if sync.countdown < num_parked {
            fatal_invariant("stop-the-world countdown underflow", "");
        }
        sync.countdown -= num_parked;
    }
    num_parked > 0 && sync.countdown == 0
}

/// Quiesce every other thread in scope. Blocks until done; never fails.
pub(crate) fn stop_the_world(
    runtime: &RuntimeInner,
    scope: &StwScope,
    requester: Option<&crate::state::thread::ThreadState>,
) {
    let stw = scope.state(runtime);
    debug_assert_eq!(stw.is_global, matches!(scope, StwScope::Global));
    stw.begin_request();
    match scope {
        StwScope::Global => runtime.stw_gate.lock_exclusive(),
        StwScope::Interp(_) => runtime.stw_gate.lock_shared(),
    }
    stw.stats.record_request();

    {
        let mut sync = stw.sync.lock();
        stw.stop_event.reset();
        sync.requester = requester_key(requester);
        sync.countdown = 0;
        stw.requested.store(true, Ordering::SeqCst);

        // Count every other live thread in scope. Threads already
        // suspended were created after the request was flagged and are
        // parked from birth; they are resumed with the rest but never
        // counted.
        for interp in scope.interps(runtime) {
            let registry = interp.threads.lock();
            for ts in registry.iter() {
                if Some((ts.interp_id(), ts.id())) == sync.requester {
                    continue;
                }
                if ts.state.load() != ExecState::Suspended {
                    sync.countdown += 1;
                }
            }
        }

        if sync.countdown == 0 {
            stw.world_stopped.store(true, Ordering::SeqCst);
            return;
        }
    }

    loop {
        let stopped_all = {
            let mut sync = stw.sync.lock();
            sync.countdown == 0 || park_detached_threads(runtime, scope, stw, &mut sync)
        };
        if stopped_all {
            break;
        }
        if stw.stop_event.wait_timeout(PARK_RETRY_INTERVAL) {
            break;
        }
    }
    stw.world_stopped.store(true, Ordering::SeqCst);
}

/// Resume every thread parked by `stop_the_world` and release the scope.
pub(crate) fn start_the_world(runtime: &RuntimeInner, scope: &StwScope) {
    let stw = scope.state(runtime);
    if !stw.is_world_stopped() {
        fatal_invariant("stop-the-world end without a matching begin", "");
    }

    {
        let mut sync = stw.sync.lock();
        stw.requested.store(false, Ordering::SeqCst);
        stw.world_stopped.store(false, Ordering::SeqCst);
        for interp in scope.interps(runtime) {
            let registry = interp.threads.lock();
            for ts in registry.iter() {
                if Some((ts.interp_id(), ts.id())) == sync.requester {
                    continue;
                }
                if ts.state.load() == ExecState::Suspended {
                    ts.state
                        .transition_or_fatal(ExecState::Suspended, ExecState::Detached);
                    ts.parker.unpark_all();
                }
            }
        }
        sync.requester = None;
    }

    match scope {
        StwScope::Global => runtime.stw_gate.unlock_exclusive(),
        StwScope::Interp(_) => runtime.stw_gate.unlock_shared(),
    }
    stw.end_request();
}

// =============================================================================
// RAII Pause
// =============================================================================

/// A pause held for the lifetime of the guard; dropping it resumes the
/// world.
pub struct Pause {
    runtime: Arc<RuntimeInner>,
    scope: StwScope,
}

impl Pause {
    pub(crate) fn new(runtime: Arc<RuntimeInner>, scope: StwScope) -> Self {
        Self { runtime, scope }
    }
}

impl Drop for Pause {
    fn drop(&mut self) {
        start_the_world(&self.runtime, &self.scope);
    }
}

// =============================================================================
// Tests
// =============================================================================
