//! The attach/detach protocol.
//!
//! A thread must attach its thread state before touching any
//! interpreter-visible data. Attaching acquires the interpreter's
//! exclusive-execution token and yields an [`AttachGuard`] — the capability
//! required by every interpreter-mutating call, so "called without
//! attaching" is unrepresentable.
//!
//! Attach is an unbounded wait: it blocks for the token, and parks through
//! any pause in flight. There is no cancellation at this layer; callers
//! needing bounded waits must layer their own timeout above it.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use ember_core::fatal_invariant;

use crate::state::interp::InterpreterState;
use crate::state::status::ExecState;
use crate::state::thread::{delete_common, ThreadState};

// =============================================================================
// Errors
// =============================================================================

/// Why an attach attempt did not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachError {
    /// The thread state is terminally shutting down; the owning thread
    /// must abandon execution instead of re-attaching.
    ShuttingDown,
}

impl fmt::Display for AttachError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ShuttingDown => write!(f, "thread state is shutting down"),
        }
    }
}

impl std::error::Error for AttachError {}

// =============================================================================
// Raw Protocol
// =============================================================================

fn try_attach(ts: &ThreadState) -> bool {
    ts.state
        .transition_or_fatal(ExecState::Detached, ExecState::Attached)
}

/// Park until a pause releases this state, then claim the attached state.
fn wait_attach(ts: &ThreadState) -> Result<(), AttachError> {
    ts.interp().attach_stats.record_attach_wait();
    loop {
        match ts.state.load() {
            ExecState::Suspended => {
                ts.parker
                    .park_while(|| ts.state.load_relaxed() == ExecState::Suspended);
            }
            ExecState::ShuttingDown => return Err(AttachError::ShuttingDown),
            ExecState::Detached => {}
            ExecState::Attached => fatal_invariant(
                "thread state attached from another thread",
                format!("thread state {}", ts.id()),
            ),
        }
        if try_attach(ts) {
            return Ok(());
        }
    }
}

pub(crate) fn attach_raw(ts: &ThreadState) -> Result<(), AttachError> {
    let bound = ts.bound_or_fatal();
    if bound.thread_id != std::thread::current().id() {
        fatal_invariant(
            "attaching a thread state bound to a different thread",
            format!("thread state {}", ts.id()),
        );
    }
    let interp = Arc::clone(ts.interp());
    let native_id = bound.native_id;

    // The token acquire fatals if this thread already holds it, which
    // covers attaching twice without an intervening detach.
    interp.token.acquire(native_id);

    if !try_attach(ts) {
        if let Err(err) = wait_attach(ts) {
            interp.token.release(native_id);
            return Err(err);
        }
    }

    // Resume any critical sections suspended by the last detach.
    {
        let mut body = ts.body.lock();
        body.critical_section_depth = body.suspended_critical_sections;
        body.suspended_critical_sections = 0;
    }

    crate::gilstate::bind_gilstate(interp.runtime().id(), ts);
    interp.attach_stats.record_attach();
    Ok(())
}

/// Which scope has a pause pending that this thread must honor.
enum PendingPause {
    Runtime,
    Interp,
}

fn pending_pause(ts: &ThreadState) -> Option<PendingPause> {
    let key = Some((ts.interp_id(), ts.id()));
    let runtime = ts.interp().runtime();
    {
        let stw = &runtime.stoptheworld;
        let sync = stw.sync_lock();
        if stw.is_requested() && sync.requester != key {
            return Some(PendingPause::Runtime);
        }
    }
    {
        let stw = &ts.interp().stoptheworld;
        let sync = stw.sync_lock();
        if stw.is_requested() && sync.requester != key {
            return Some(PendingPause::Interp);
        }
    }
    None
}

pub(crate) fn detach_raw(ts: &ThreadState) {
    if ts.state.load() != ExecState::Attached {
        fatal_invariant(
            "detaching a thread state that is not attached",
            format!("thread state {} is {}", ts.id(), ts.state.load()),
        );
    }

    // Suspend held critical sections so the next attach can resume them.
    {
        let mut body = ts.body.lock();
        if body.critical_section_depth > 0 {
            body.suspended_critical_sections = body.critical_section_depth;
            body.critical_section_depth = 0;
        }
    }

    let interp = Arc::clone(ts.interp());
    let native_id = ts.bound_native_id();

    match pending_pause(ts) {
        None => {
            ts.state
                .transition_or_fatal(ExecState::Attached, ExecState::Detached);
            interp.token.release(native_id);
            interp.attach_stats.record_detach();
        }
        Some(which) => {
            // A requester is waiting on us: park instead of detaching, and
            // take ourselves out of its countdown.
            ts.state
                .transition_or_fatal(ExecState::Attached, ExecState::Suspended);
            interp.token.release(native_id);
            interp.attach_stats.record_suspend();
            match which {
                PendingPause::Runtime => interp.runtime().stoptheworld.decrement_countdown(),
                PendingPause::Interp => interp.stoptheworld.decrement_countdown(),
            }
        }
    }
}

// =============================================================================
// AttachGuard
// =============================================================================

/// The attach capability.
///
/// Exactly one guard exists per interpreter at any instant. Dropping the
/// guard detaches; [`AttachGuard::detach`] does the same explicitly. The
/// guard is deliberately not `Send`: the protocol binds it to the OS
/// thread that attached.
pub struct AttachGuard {
    pub(crate) ts: Arc<ThreadState>,
    pub(crate) active: bool,
    _not_send: PhantomData<*const ()>,
}

impl ThreadState {
    /// Attach this state, blocking until the execution token is free and
    /// any pause in flight has been released.
    pub fn attach(&self) -> Result<AttachGuard, AttachError> {
        attach_raw(self)?;
        Ok(AttachGuard {
            ts: self.arc(),
            active: true,
            _not_send: PhantomData,
        })
    }
}

impl AttachGuard {
    /// The attached thread state.
    #[inline]
    pub fn thread(&self) -> &Arc<ThreadState> {
        &self.ts
    }

    /// The interpreter this guard grants access to.
    #[inline]
    pub fn interp(&self) -> &Arc<InterpreterState> {
        self.ts.interp()
    }

    /// Release the token and return to the detached state (or park into a
    /// pending pause).
    pub fn detach(mut self) {
        self.active = false;
        detach_raw(&self.ts);
    }

    /// Whether a pause is waiting on this thread.
    pub fn stop_requested(&self) -> bool {
        pending_pause(&self.ts).is_some()
    }

    /// Explicit safe point: if a pause is pending, park through it and
    /// re-attach afterwards.
    ///
    /// On `Err` the thread state is shutting down and the guard is spent;
    /// the caller must abandon execution.
    pub fn poll_safe_point(&mut self) -> Result<(), AttachError> {
        if pending_pause(&self.ts).is_none() {
            return Ok(());
        }
        detach_raw(&self.ts);
        match attach_raw(&self.ts) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.active = false;
                Err(err)
            }
        }
    }

    // =========================================================================
    // Critical Sections
    // =========================================================================

    /// Enter a fine-grained critical section. Held sections are suspended
    /// across a detach and resumed on the next attach.
    pub fn begin_critical_section(&mut self) {
        self.ts.body.lock().critical_section_depth += 1;
    }

    pub fn end_critical_section(&mut self) {
        let mut body = self.ts.body.lock();
        if body.critical_section_depth == 0 {
            fatal_invariant("critical-section depth underflow", "");
        }
        body.critical_section_depth -= 1;
    }

    pub fn critical_section_depth(&self) -> u32 {
        self.ts.body.lock().critical_section_depth
    }
}

impl Drop for AttachGuard {
    fn drop(&mut self) {
        if self.active {
            detach_raw(&self.ts);
        }
    }
}

/// Detach and delete the calling thread's state in one step.
pub fn delete_current(mut guard: AttachGuard) {
    guard.active = false;
    let ts = Arc::clone(&guard.ts);
    drop(guard);
    delete_common(&ts, true);
}

// =============================================================================
// Tests
// =============================================================================
