//! Uniform call dispatch.
//!
//! Every call site funnels through [`vectorcall`]: fast-call-capable
//! callables get the raw argument window, everything else goes through the
//! generic fallback, which materializes a positional vector and a keyword
//! map.
//!
//! After every call, fast or generic, exactly one of {result, pending
//! error} must be set. A callable violating that contract aborts in debug
//! builds; release builds synthesize an internal error and continue.
//!
//! Calls recurse into the interpreter, so a per-thread recursion counter
//! brackets every invocation and is restored on every exit path.

pub mod args;

use std::sync::Arc;

use ember_core::{
    fatal_invariant, CallCx, EmberError, EmberResult, KwArgs, KwNames, Value,
};

use crate::attach::AttachGuard;
use crate::call::args::{nargs_from, ArgBuf};
use crate::state::interp::InterpreterState;

// =============================================================================
// Recursion Bracketing
// =============================================================================

fn enter_recursive_call(guard: &mut AttachGuard, context: &str) -> EmberResult<()> {
    let mut body = guard.ts.body.lock();
    if body.recursion_remaining == 0 {
        drop(body);
        guard.interp().call_stats.record_recursion_error();
        return Err(EmberError::recursion(format!(
            "maximum recursion depth exceeded{}",
            context
        )));
    }
    body.recursion_remaining -= 1;
    Ok(())
}

fn leave_recursive_call(guard: &mut AttachGuard) {
    let mut body = guard.ts.body.lock();
    debug_assert!(body.recursion_remaining < body.recursion_limit);
    body.recursion_remaining += 1;
}

/// Depth of calls currently in flight on the guard's thread.
pub fn recursion_depth(guard: &AttachGuard) -> u32 {
    let body = guard.ts.body.lock();
    body.recursion_limit - body.recursion_remaining
}

// =============================================================================
// Result Contract
// =============================================================================

fn contract_violation(
    guard: &mut AttachGuard,
    interp: &InterpreterState,
    message: String,
) -> EmberResult<Value> {
    if cfg!(debug_assertions) {
        fatal_invariant("call contract violated", message);
    }
    interp.call_stats.record_contract_violation();
    guard.take_error();
    Err(EmberError::internal(message))
}

/// Enforce the call post-condition: exactly one of {result, pending
/// error}.
fn check_call_result(
    guard: &mut AttachGuard,
    interp: &InterpreterState,
    name: &str,
    result: Option<Value>,
) -> EmberResult<Value> {
    match (result, guard.error_pending()) {
        (Some(value), false) => Ok(value),
        (None, true) => Err(guard
            .take_error()
            .unwrap_or_else(|| EmberError::internal("pending error vanished"))),
        (Some(_), true) => contract_violation(
            guard,
            interp,
            format!("{} returned a result with an error set", name),
        ),
        (None, false) => contract_violation(
            guard,
            interp,
            format!("{} returned no result without setting an error", name),
        ),
    }
}

// =============================================================================
// Dispatch
// =============================================================================

/// Invoke `callable` with a raw argument window.
///
/// `args` holds the positional arguments followed by the keyword values,
/// one per entry of `kwnames`; `nargsf` is the count word for the window.
pub fn vectorcall(
    guard: &mut AttachGuard,
    callable: &Value,
    args: &[Value],
    nargsf: usize,
    kwnames: Option<&KwNames>,
) -> EmberResult<Value> {
    let target = match callable.as_callable() {
        Some(target) => Arc::clone(target),
        None => {
            return Err(EmberError::type_error(format!(
                "'{}' object is not callable",
                callable.type_name()
            )))
        }
    };

    let total = nargs_from(nargsf);
    debug_assert_eq!(total, args.len());
    let nkw = kwnames.map_or(0, |kw| kw.len());
    if total < nkw {
        return Err(EmberError::type_error(
            "more keyword names than arguments in the call window",
        ));
    }

    let interp = Arc::clone(guard.interp());
    enter_recursive_call(guard, " while calling a runtime object")?;

    let result = if target.supports_vectorcall() {
        interp.call_stats.record_fast();
        target.vectorcall(guard, args, kwnames)
    } else {
        interp.call_stats.record_generic();
        // Generic fallback: materialize the positional tuple and keyword
        // map the callable's generic slot expects.
        let npos = total - nkw;
        let positional: Vec<Value> = args[..npos].to_vec();
        let mut kwargs = KwArgs::default();
        if let Some(kw) = kwnames {
            for (index, name) in kw.iter().enumerate() {
                kwargs.insert(Arc::clone(name), args[npos + index].clone());
            }
        }
        target.tp_call(guard, positional, kwargs)
    };

    leave_recursive_call(guard);
    check_call_result(guard, &interp, target.name(), result)
}

impl AttachGuard {
    /// Call with positional arguments and optional trailing keyword
    /// values.
    pub fn call(
        &mut self,
        callable: &Value,
        args: &[Value],
        kwnames: Option<&KwNames>,
    ) -> EmberResult<Value> {
        vectorcall(self, callable, args, args.len(), kwnames)
    }

    pub fn call_no_args(&mut self, callable: &Value) -> EmberResult<Value> {
        vectorcall(self, callable, &[], 0, None)
    }

    pub fn call_one_arg(&mut self, callable: &Value, arg: Value) -> EmberResult<Value> {
        let args = [arg];
        vectorcall(self, callable, &args, 1, None)
    }

    /// Call with a prepared argument window.
    pub fn call_buf(
        &mut self,
        callable: &Value,
        buf: &ArgBuf,
        kwnames: Option<&KwNames>,
    ) -> EmberResult<Value> {
        vectorcall(self, callable, buf.args(), buf.nargsf(), kwnames)
    }
}

// =============================================================================
// Call Context
// =============================================================================

impl CallCx for AttachGuard {
    fn set_error(&mut self, err: EmberError) {
        self.ts.body.lock().current_exception = Some(err);
    }

    fn take_error(&mut self) -> Option<EmberError> {
        self.ts.body.lock().current_exception.take()
    }

    fn error_pending(&self) -> bool {
        self.ts.body.lock().current_exception.is_some()
    }

    fn call(
        &mut self,
        callable: &Value,
        args: &[Value],
        kwnames: Option<&KwNames>,
    ) -> Option<Value> {
        match vectorcall(self, callable, args, args.len(), kwnames) {
            Ok(value) => Some(value),
            Err(err) => {
                self.set_error(err);
                None
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
