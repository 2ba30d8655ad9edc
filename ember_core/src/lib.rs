//! Core types for the Ember execution-context kernel.
//!
//! This crate provides:
//! - The value and callable model at the call-dispatch boundary
//! - The error taxonomy (recoverable errors vs fatal invariants)
//! - Runtime and interpreter configuration

#![deny(unsafe_op_in_unsafe_fn)]

pub mod config;
pub mod error;
pub mod value;

pub use config::{InterpreterConfig, RuntimeConfig, DEFAULT_RECURSION_LIMIT};
pub use error::{fatal_invariant, EmberError, EmberResult, FatalInvariant};
pub use value::{CallCx, Callable, KwArgs, KwNames, Value};
