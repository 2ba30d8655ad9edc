//! The process-level runtime handle and its interpreter list.
//!
//! There is no hidden global: a [`Runtime`] is constructed explicitly by
//! the embedder and passed to everything that needs it. Tests construct as
//! many independent runtimes as they like.

pub mod interp;
pub mod status;
pub mod thread;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use ember_core::{fatal_invariant, EmberError, EmberResult, InterpreterConfig, RuntimeConfig};
use parking_lot::Mutex;

use crate::attach::AttachGuard;
use crate::state::interp::{finalize_with_helper, InterpreterState};
use crate::state::thread::current_native_thread_id;
use crate::stw::{self, Pause, StopTheWorldState, StwScope};
use crate::sync::RwGate;

/// Distinguishes runtime handles within one process; keys the per-thread
/// gilstate registry.
static NEXT_RUNTIME_ID: AtomicU64 = AtomicU64::new(1);

// =============================================================================
// Gilstate Registration
// =============================================================================

/// Which interpreter `threadstate_ensure` creates states in, shared by all
/// interpreters of the runtime and owned by the main one.
pub(crate) struct GilStateRegistry {
    auto_interp: Mutex<Option<Arc<InterpreterState>>>,
}

impl GilStateRegistry {
    fn new() -> Self {
        Self {
            auto_interp: Mutex::new(None),
        }
    }

    pub(crate) fn auto_interp(&self) -> Option<Arc<InterpreterState>> {
        self.auto_interp.lock().clone()
    }

    pub(crate) fn set_auto_interp(&self, interp: Option<Arc<InterpreterState>>) {
        *self.auto_interp.lock() = interp;
    }
}

// =============================================================================
// RuntimeInner
// =============================================================================

struct InterpList {
    /// Index 0 = head = most recently created.
    list: Vec<Arc<InterpreterState>>,
    /// Monotonic; never reused, even after destruction.
    next_id: u64,
    /// The first interpreter ever created.
    main: Option<Arc<InterpreterState>>,
}

pub(crate) struct RuntimeInner {
    id: u64,
    interpreters: Mutex<InterpList>,
    main_thread: std::thread::ThreadId,
    main_native_thread: u64,
    /// Pause state for runtime-scope (whole-process) pauses.
    pub(crate) stoptheworld: StopTheWorldState,
    /// Orders runtime-scope pauses (exclusive) against interpreter-scope
    /// pauses (shared).
    pub(crate) stw_gate: RwGate,
    pub(crate) gilstate: GilStateRegistry,
    finalized: AtomicBool,
}

impl RuntimeInner {
    #[inline]
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn interpreter_snapshot(&self) -> Vec<Arc<InterpreterState>> {
        self.interpreters.lock().list.clone()
    }

    /// Remove a deleted interpreter from the list.
    ///
    /// The main interpreter may only go once every sibling is gone.
    pub(crate) fn unlink_interpreter(&self, interp: &InterpreterState) {
        let mut interps = self.interpreters.lock();
        let is_main = interps
            .main
            .as_ref()
            .is_some_and(|main| std::ptr::eq(main.as_ref(), interp));
        if is_main {
            if interps.list.len() > 1 {
                fatal_invariant(
                    "main interpreter deleted while sub-interpreters remain",
                    format!("{} interpreters live", interps.list.len()),
                );
            }
            interps.main = None;
            self.gilstate.set_auto_interp(None);
        }
        let before = interps.list.len();
        interps.list.retain(|i| !std::ptr::eq(i.as_ref(), interp));
        if interps.list.len() == before {
            fatal_invariant(
                "deleting an interpreter that is not registered",
                format!("interpreter {}", interp.id()),
            );
        }
    }
}

// =============================================================================
// Runtime
// =============================================================================

/// The explicit, embedder-owned runtime handle.
///
/// Cloning is cheap and shares the same runtime. The runtime is created
/// before its interpreters and must outlive all of them.
#[derive(Clone)]
pub struct Runtime {
    pub(crate) inner: Arc<RuntimeInner>,
}

impl Runtime {
    /// Create a runtime together with its main interpreter.
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    pub fn with_config(config: RuntimeConfig) -> Self {
        let inner = Arc::new(RuntimeInner {
            id: NEXT_RUNTIME_ID.fetch_add(1, Ordering::Relaxed),
            interpreters: Mutex::new(InterpList {
                list: Vec::new(),
                next_id: 0,
                main: None,
            }),
            main_thread: std::thread::current().id(),
            main_native_thread: current_native_thread_id(),
            stoptheworld: StopTheWorldState::new(true),
            stw_gate: RwGate::new(),
            gilstate: GilStateRegistry::new(),
            finalized: AtomicBool::new(false),
        });
        let runtime = Self { inner };
        runtime
            .interpreter_create(runtime_main_config(&config))
            .unwrap_or_else(|err| {
                fatal_invariant("could not create the main interpreter", err.to_string())
            });
        runtime
    }

    /// Create a new interpreter, linked at the head of the list.
    ///
    /// Ids are strictly increasing and never reused within the runtime's
    /// lifetime.
    pub fn interpreter_create(
        &self,
        config: InterpreterConfig,
    ) -> EmberResult<Arc<InterpreterState>> {
        if self.inner.finalized.load(Ordering::SeqCst) {
            return Err(EmberError::system("runtime is finalized"));
        }
        // Creation is fully serialized under the list lock.
        let mut interps = self.inner.interpreters.lock();
        let id = interps.next_id;
        interps.next_id += 1;
        let interp = InterpreterState::new(Arc::downgrade(&self.inner), id, config);
        if id == 0 {
            debug_assert!(interps.main.is_none());
            interps.main = Some(Arc::clone(&interp));
            self.inner.gilstate.set_auto_interp(Some(Arc::clone(&interp)));
        }
        interps.list.insert(0, Arc::clone(&interp));
        Ok(interp)
    }

    /// Tear down the interpreter with the given id.
    ///
    /// A throwaway thread state is bound to run the teardown; the
    /// interpreter must have no other live thread states.
    pub fn interpreter_destroy(&self, id: u64) -> EmberResult<()> {
        let interp = self
            .interpreter_lookup(id)
            .ok_or_else(|| EmberError::value_error(format!("unknown interpreter id {}", id)))?;
        finalize_with_helper(&interp);
        Ok(())
    }

    pub fn interpreter_lookup(&self, id: u64) -> Option<Arc<InterpreterState>> {
        self.inner
            .interpreters
            .lock()
            .list
            .iter()
            .find(|i| i.id() == id)
            .cloned()
    }

    /// The most recently created interpreter.
    pub fn interpreter_head(&self) -> Option<Arc<InterpreterState>> {
        self.inner.interpreters.lock().list.first().cloned()
    }

    pub fn main_interpreter(&self) -> Option<Arc<InterpreterState>> {
        self.inner.interpreters.lock().main.clone()
    }

    pub fn interpreter_count(&self) -> usize {
        self.inner.interpreters.lock().list.len()
    }

    /// Identity of the OS thread that created the runtime.
    pub fn main_thread_id(&self) -> std::thread::ThreadId {
        self.inner.main_thread
    }

    pub fn is_main_thread(&self) -> bool {
        std::thread::current().id() == self.inner.main_thread
    }

    pub fn main_native_thread_id(&self) -> u64 {
        self.inner.main_native_thread
    }

    // =========================================================================
    // Stop the World (runtime scope)
    // =========================================================================

    /// Pause every other thread in the runtime. Pass the caller's guard
    /// when the requesting thread is attached so it is exempted.
    pub fn stop_the_world_begin(&self, requester: Option<&AttachGuard>) {
        stw::stop_the_world(
            &self.inner,
            &StwScope::Global,
            requester.map(|g| g.thread().as_ref()),
        );
    }

    /// Resume the threads paused by `stop_the_world_begin`.
    pub fn stop_the_world_end(&self) {
        stw::start_the_world(&self.inner, &StwScope::Global);
    }

    /// RAII form of the runtime-scope pause.
    pub fn pause_all(&self, requester: Option<&AttachGuard>) -> Pause {
        self.stop_the_world_begin(requester);
        Pause::new(Arc::clone(&self.inner), StwScope::Global)
    }

    // =========================================================================
    // Finalize
    // =========================================================================

    /// Tear down every remaining interpreter, newest first, the main
    /// interpreter last. Idempotent only across a single runtime life; a
    /// second call is a no-op.
    pub fn finalize(&self) -> EmberResult<()> {
        if self.inner.finalized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        loop {
            let next = self.interpreter_head();
            match next {
                Some(interp) => finalize_with_helper(&interp),
                None => break,
            }
        }
        self.inner.gilstate.set_auto_interp(None);
        Ok(())
    }

    /// Whether `finalize` has run.
    pub fn is_finalized(&self) -> bool {
        self.inner.finalized.load(Ordering::SeqCst)
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

fn runtime_main_config(config: &RuntimeConfig) -> InterpreterConfig {
    config.main_interpreter.clone()
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("id", &self.inner.id)
            .field("interpreters", &self.interpreter_count())
            .field("finalized", &self.is_finalized())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_creates_main_interpreter() {
        let runtime = Runtime::new();
        assert_eq!(runtime.interpreter_count(), 1);
        let main = runtime.main_interpreter().unwrap();
        assert_eq!(main.id(), 0);
        assert!(runtime.is_main_thread());
    }

    #[test]
    fn test_interpreter_ids_increase_and_never_repeat() {
        let runtime = Runtime::new();
        let a = runtime
            .interpreter_create(InterpreterConfig::default())
            .unwrap();
        let b = runtime
            .interpreter_create(InterpreterConfig::default())
            .unwrap();
        assert!(a.id() < b.id());

        let b_id = b.id();
        runtime.interpreter_destroy(b_id).unwrap();

        let c = runtime
            .interpreter_create(InterpreterConfig::default())
            .unwrap();
        assert!(c.id() > b_id);
        let order: Vec<u64> = runtime
            .inner
            .interpreter_snapshot()
            .iter()
            .map(|i| i.id())
            .collect();
        // Head is the most recently created.
        assert_eq!(order[0], c.id());
        assert_eq!(*order.last().unwrap(), 0);
    }

    #[test]
    fn test_interpreter_lookup() {
        let runtime = Runtime::new();
        let sub = runtime
            .interpreter_create(InterpreterConfig::default())
            .unwrap();
        assert!(runtime.interpreter_lookup(sub.id()).is_some());
        assert!(runtime.interpreter_lookup(999).is_none());
        sub.delete();
    }

    #[test]
    fn test_destroy_unknown_interpreter() {
        let runtime = Runtime::new();
        assert!(runtime.interpreter_destroy(42).is_err());
    }

    #[test]
    fn test_finalize_destroys_everything() {
        let runtime = Runtime::new();
        runtime
            .interpreter_create(InterpreterConfig::default())
            .unwrap();
        runtime
            .interpreter_create(InterpreterConfig::default())
            .unwrap();
        assert_eq!(runtime.interpreter_count(), 3);

        runtime.finalize().unwrap();
        assert_eq!(runtime.interpreter_count(), 0);
        assert!(runtime.is_finalized());

        // Second finalize is a no-op.
        runtime.finalize().unwrap();

        // No new interpreters after finalize.
        assert!(runtime
            .interpreter_create(InterpreterConfig::default())
            .is_err());
    }

    #[test]
    #[should_panic(expected = "sub-interpreters remain")]
    fn test_main_cannot_go_before_siblings() {
        let runtime = Runtime::new();
        let _sub = runtime
            .interpreter_create(InterpreterConfig::default())
            .unwrap();
        let main = runtime.main_interpreter().unwrap();
        main.delete();
    }
}
