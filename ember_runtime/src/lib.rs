//! Execution-context kernel for the Ember runtime.
//!
//! This crate provides:
//! - Runtime / interpreter / thread state and their lifecycles
//! - The attach/detach protocol and its capability guard
//! - Stop-the-world coordination (runtime and interpreter scope)
//! - The ensure/release pair for native callbacks
//! - The uniform call-dispatch convention

#![deny(unsafe_op_in_unsafe_fn)]

pub mod attach;
pub mod call;
pub mod gilstate;
pub mod state;
pub mod stats;
pub mod stw;
pub mod sync;

pub use attach::{delete_current, AttachError, AttachGuard};
pub use call::args::{has_reserved_slot, nargs_from, ArgBuf, ARGUMENTS_OFFSET};
pub use call::{recursion_depth, vectorcall};
pub use gilstate::{EnsureState, GilStateKind};
pub use state::interp::{end_interpreter, EvalFrameHook, InterpreterState};
pub use state::status::{ExecState, InvalidTransition};
pub use state::thread::{ThreadHandle, ThreadState, ThreadWhence};
pub use state::Runtime;
pub use stats::{AttachStats, CallStats, StopTheWorldStats};
pub use stw::Pause;

// Re-export the core types every embedder needs alongside the kernel.
pub use ember_core::{
    CallCx, Callable, EmberError, EmberResult, FatalInvariant, InterpreterConfig, KwArgs, KwNames,
    RuntimeConfig, Value,
};
