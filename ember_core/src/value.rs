//! Values and the callable protocol at the dispatch boundary.
//!
//! The kernel does not define an object model; it only needs enough of a
//! value type to route calls. A callable advertises one of two capabilities:
//!
//! - **fast call**: the callable accepts a raw argument window plus an
//!   optional array of keyword names (`vectorcall`), or
//! - **generic call**: the callable accepts a materialized positional
//!   vector and keyword map (`tp_call`).
//!
//! Callables report failure by returning `None` after recording an error on
//! the call context; the dispatcher enforces that exactly one of
//! {result, pending error} is produced.

use std::fmt;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::error::EmberError;

// =============================================================================
// Keyword Names
// =============================================================================

/// Keyword-argument names accompanying a call.
///
/// The matching values travel at the tail of the argument window, in the
/// same order as the names.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KwNames {
    names: SmallVec<[Arc<str>; 4]>,
}

impl KwNames {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_names(names: &[&str]) -> Self {
        Self {
            names: names.iter().map(|n| Arc::from(*n)).collect(),
        }
    }

    pub fn push(&mut self, name: impl Into<Arc<str>>) {
        self.names.push(name.into());
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    #[inline]
    pub fn get(&self, index: usize) -> Option<&Arc<str>> {
        self.names.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<str>> {
        self.names.iter()
    }

    /// Position of `name`, if present.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| &**n == name)
    }
}

/// Keyword arguments materialized for the generic call path.
pub type KwArgs = FxHashMap<Arc<str>, Value>;

// =============================================================================
// Call Context
// =============================================================================

/// The context a callable runs against.
///
/// Implemented by the runtime's attach capability; callables use it to
/// record errors and to issue nested calls.
pub trait CallCx {
    /// Record a pending error. Overwrites any previous pending error.
    fn set_error(&mut self, err: EmberError);

    /// Take the pending error, clearing it.
    fn take_error(&mut self) -> Option<EmberError>;

    /// Check whether an error is pending.
    fn error_pending(&self) -> bool;

    /// Issue a nested call through the dispatcher.
    ///
    /// Returns `Some(result)` on success; on failure returns `None` with
    /// the error left pending on the context.
    fn call(
        &mut self,
        callable: &Value,
        args: &[Value],
        kwnames: Option<&KwNames>,
    ) -> Option<Value>;
}

// =============================================================================
// Callable Protocol
// =============================================================================

/// A callable value.
///
/// `tp_call` is mandatory; `vectorcall` is the optional fast entry point,
/// gated by `supports_vectorcall`.
pub trait Callable: Send + Sync {
    /// Display name used in diagnostics.
    fn name(&self) -> &str {
        "<callable>"
    }

    /// Whether the fast entry point may be used.
    fn supports_vectorcall(&self) -> bool {
        false
    }

    /// Fast entry point: raw argument window, keyword values at the tail.
    ///
    /// Only invoked when `supports_vectorcall` returns true.
    fn vectorcall(
        &self,
        cx: &mut dyn CallCx,
        _args: &[Value],
        _kwnames: Option<&KwNames>,
    ) -> Option<Value> {
        cx.set_error(EmberError::type_error(format!(
            "'{}' does not support the fast call protocol",
            self.name()
        )));
        None
    }

    /// Generic entry point: materialized positional and keyword arguments.
    fn tp_call(&self, cx: &mut dyn CallCx, args: Vec<Value>, kwargs: KwArgs) -> Option<Value>;
}

// =============================================================================
// Value
// =============================================================================

/// A runtime value at the kernel's dispatch boundary.
#[derive(Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Arc<str>),
    Callable(Arc<dyn Callable>),
}

impl Value {
    pub fn str(s: impl Into<Arc<str>>) -> Self {
        Self::Str(s.into())
    }

    pub fn callable(c: impl Callable + 'static) -> Self {
        Self::Callable(Arc::new(c))
    }

    #[inline]
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    #[inline]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    #[inline]
    pub fn as_callable(&self) -> Option<&Arc<dyn Callable>> {
        match self {
            Self::Callable(c) => Some(c),
            _ => None,
        }
    }

    /// Type name used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::None => "NoneType",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "str",
            Self::Callable(_) => "callable",
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "None"),
            Self::Bool(b) => write!(f, "{}", b),
            Self::Int(i) => write!(f, "{}", i),
            Self::Float(x) => write!(f, "{}", x),
            Self::Str(s) => write!(f, "{:?}", s),
            Self::Callable(c) => write!(f, "<callable {}>", c.name()),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::None, Self::None) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a == b,
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Callable(a), Self::Callable(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
