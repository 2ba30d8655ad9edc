//! Error taxonomy for the execution-context kernel.
//!
//! Two disjoint families:
//!
//! - [`EmberError`]: recoverable application errors (recursion limit hit,
//!   a callable rejecting its arguments, ...). These travel through
//!   `Result` and are handled by callers.
//! - [`FatalInvariant`]: lifecycle invariant violations (deleting an
//!   attached thread state, re-binding a bound one, ...). These indicate a
//!   hosting bug; continuing would risk silent corruption, so they are
//!   surfaced through [`fatal_invariant`] and never through `Result`.

use std::fmt;

// =============================================================================
// Recoverable Errors
// =============================================================================

/// A recoverable runtime error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmberError {
    /// The per-thread recursion limit was exceeded.
    Recursion { message: String },

    /// A value had the wrong type for an operation (e.g. calling a
    /// non-callable).
    Type { message: String },

    /// A configuration or argument value was out of range.
    Value { message: String },

    /// An internal contract was violated but the build policy chose to
    /// propagate instead of abort.
    Internal { message: String },

    /// A failure reported by a native callable through the generic call
    /// path.
    System { message: String },
}

impl EmberError {
    /// Recursion-limit error with the standard prefix.
    pub fn recursion(message: impl Into<String>) -> Self {
        Self::Recursion {
            message: message.into(),
        }
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::Type {
            message: message.into(),
        }
    }

    pub fn value_error(message: impl Into<String>) -> Self {
        Self::Value {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn system(message: impl Into<String>) -> Self {
        Self::System {
            message: message.into(),
        }
    }

    /// Check whether this is a recursion-limit error.
    #[inline]
    pub fn is_recursion(&self) -> bool {
        matches!(self, Self::Recursion { .. })
    }

    /// The error message without the kind prefix.
    pub fn message(&self) -> &str {
        match self {
            Self::Recursion { message }
            | Self::Type { message }
            | Self::Value { message }
            | Self::Internal { message }
            | Self::System { message } => message,
        }
    }
}

impl fmt::Display for EmberError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Recursion { message } => write!(f, "RecursionError: {}", message),
            Self::Type { message } => write!(f, "TypeError: {}", message),
            Self::Value { message } => write!(f, "ValueError: {}", message),
            Self::Internal { message } => write!(f, "InternalError: {}", message),
            Self::System { message } => write!(f, "SystemError: {}", message),
        }
    }
}

impl std::error::Error for EmberError {}

/// Result type for recoverable kernel operations.
pub type EmberResult<T> = Result<T, EmberError>;

// =============================================================================
// Fatal Invariants
// =============================================================================

/// A violated lifecycle invariant.
///
/// Distinct from [`EmberError`] on purpose: these are hosting bugs, not
/// runtime conditions, and they must not be swallowed by ordinary error
/// handling.
#[derive(Debug, Clone)]
pub struct FatalInvariant {
    /// Short, stable description of the invariant that was violated.
    pub invariant: &'static str,
    /// Context for the specific violation.
    pub details: String,
}

impl fmt::Display for FatalInvariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.details.is_empty() {
            write!(f, "{}", self.invariant)
        } else {
            write!(f, "{}: {}", self.invariant, self.details)
        }
    }
}

impl std::error::Error for FatalInvariant {}

/// Report a violated lifecycle invariant and terminate.
///
/// Prints the invariant to stderr, then panics with the formatted
/// [`FatalInvariant`] as the payload. Embedders building with
/// `panic = "abort"` get an immediate process abort; test builds observe
/// the panic with `#[should_panic]`.
#[cold]
pub fn fatal_invariant(invariant: &'static str, details: impl Into<String>) -> ! {
    let fatal = FatalInvariant {
        invariant,
        details: details.into(),
    };
    eprintln!("ember: fatal invariant violated: {}", fatal);
    panic!("fatal invariant violated: {}", fatal);
}

// =============================================================================
// Tests
// =============================================================================
