//! The per-thread execution state machine.
//!
//! A thread state is in exactly one of four states. The transition table is
//! a first-class artifact checked identically in debug and release builds;
//! cross-thread reads and handoffs go through [`AtomicExecState`].
//!
//! ```text
//!            attach                   pause pending at detach
//!  DETACHED ────────► ATTACHED ──────────────────────────────┐
//!     ▲ ▲                │ detach                            ▼
//!     │ └────────────────┘                               SUSPENDED
//!     │            resume                                    │
//!     └──────────────────────────────────────────────────────┘
//!
//!  (any) ────► SHUTTING_DOWN   terminal
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

// =============================================================================
// ExecState
// =============================================================================

/// Execution state of one thread state.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecState {
    /// Not executing interpreter code; does not hold the execution token.
    Detached = 0,
    /// Holds the execution token; at most one per interpreter.
    Attached = 1,
    /// Parked by an in-progress stop-the-world request.
    Suspended = 2,
    /// Terminal; the owning thread must abandon execution.
    ShuttingDown = 3,
}

impl ExecState {
    #[inline]
    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Detached,
            1 => Self::Attached,
            2 => Self::Suspended,
            3 => Self::ShuttingDown,
            _ => unreachable!("invalid execution state {}", raw),
        }
    }

    /// Whether a transition from `self` to `to` is legal.
    pub fn can_transition_to(self, to: ExecState) -> bool {
        use ExecState::*;
        match (self, to) {
            // Attach, and the requester parking a detached thread.
            (Detached, Attached) | (Detached, Suspended) => true,
            // Detach, and detach-to-suspended when a pause is pending.
            (Attached, Detached) | (Attached, Suspended) => true,
            // Resume releases a parked thread back to detached only.
            (Suspended, Detached) => true,
            // Shutdown is reachable from every non-terminal state.
            (Detached, ShuttingDown) | (Attached, ShuttingDown) | (Suspended, ShuttingDown) => {
                true
            }
            _ => false,
        }
    }

    /// Validate a transition, returning the violation if illegal.
    pub fn check_transition(self, to: ExecState) -> Result<(), InvalidTransition> {
        if self.can_transition_to(to) {
            Ok(())
        } else {
            Err(InvalidTransition { from: self, to })
        }
    }

    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::ShuttingDown)
    }
}

impl fmt::Display for ExecState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Detached => "detached",
            Self::Attached => "attached",
            Self::Suspended => "suspended",
            Self::ShuttingDown => "shutting-down",
        };
        write!(f, "{}", name)
    }
}

/// An illegal execution-state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: ExecState,
    pub to: ExecState,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid execution-state transition: {} -> {}",
            self.from, self.to
        )
    }
}

impl std::error::Error for InvalidTransition {}

// =============================================================================
// AtomicExecState
// =============================================================================

/// Atomic cell holding an [`ExecState`].
///
/// This is the single handshake variable between a thread state's owner and
/// a stop-the-world requester; it must never be read non-atomically from
/// another thread.
pub struct AtomicExecState(AtomicU8);

impl AtomicExecState {
    pub fn new(state: ExecState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    #[inline]
    pub fn load(&self) -> ExecState {
        ExecState::from_u8(self.0.load(Ordering::SeqCst))
    }

    #[inline]
    pub fn load_relaxed(&self) -> ExecState {
        ExecState::from_u8(self.0.load(Ordering::Relaxed))
    }

    /// Attempt the transition `from -> to` atomically.
    ///
    /// Returns `Ok(true)` on success, `Ok(false)` if the observed state was
    /// not `from`, and `Err` if the table forbids the transition regardless
    /// of the observed state.
    pub fn try_transition(
        &self,
        from: ExecState,
        to: ExecState,
    ) -> Result<bool, InvalidTransition> {
        from.check_transition(to)?;
        Ok(self
            .0
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok())
    }

    /// Attempt the transition, treating a table violation as a fatal
    /// invariant. Returns whether the CAS succeeded.
    pub(crate) fn transition_or_fatal(&self, from: ExecState, to: ExecState) -> bool {
        match self.try_transition(from, to) {
            Ok(done) => done,
            Err(err) => {
                ember_core::fatal_invariant("execution state machine violated", err.to_string())
            }
        }
    }

    /// Unconditionally enter the terminal shutting-down state.
    pub fn store_shutting_down(&self) {
        self.0.store(ExecState::ShuttingDown as u8, Ordering::SeqCst);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================================================
    // Transition Table Tests
    // =========================================================================

    #[test]
    fn test_legal_transitions() {
        use ExecState::*;
        assert!(Detached.can_transition_to(Attached));
        assert!(Detached.can_transition_to(Suspended));
        assert!(Attached.can_transition_to(Detached));
        assert!(Attached.can_transition_to(Suspended));
        assert!(Suspended.can_transition_to(Detached));
        assert!(Detached.can_transition_to(ShuttingDown));
        assert!(Suspended.can_transition_to(ShuttingDown));
    }

    #[test]
    fn test_illegal_transitions() {
        use ExecState::*;
        // A parked thread may not attach directly; it must be resumed first.
        assert!(!Suspended.can_transition_to(Attached));
        // Shutdown is terminal.
        assert!(!ShuttingDown.can_transition_to(Detached));
        assert!(!ShuttingDown.can_transition_to(Attached));
        // No self-loops.
        assert!(!Attached.can_transition_to(Attached));
        assert!(!Detached.can_transition_to(Detached));
    }

    #[test]
    fn test_check_transition_error() {
        let err = ExecState::Suspended
            .check_transition(ExecState::Attached)
            .unwrap_err();
        assert_eq!(err.from, ExecState::Suspended);
        assert_eq!(err.to, ExecState::Attached);
        assert!(err.to_string().contains("suspended -> attached"));
    }

    #[test]
    fn test_is_terminal() {
        assert!(ExecState::ShuttingDown.is_terminal());
        assert!(!ExecState::Detached.is_terminal());
    }

    // =========================================================================
    // AtomicExecState Tests
    // =========================================================================

    #[test]
    fn test_atomic_try_transition() {
        let state = AtomicExecState::new(ExecState::Detached);
        assert_eq!(state.load(), ExecState::Detached);

        assert!(state
            .try_transition(ExecState::Detached, ExecState::Attached)
            .unwrap());
        assert_eq!(state.load(), ExecState::Attached);

        // Observed state no longer matches.
        assert!(!state
            .try_transition(ExecState::Detached, ExecState::Attached)
            .unwrap());
    }

    #[test]
    fn test_atomic_rejects_illegal_transition() {
        let state = AtomicExecState::new(ExecState::Suspended);
        let result = state.try_transition(ExecState::Suspended, ExecState::Attached);
        assert!(result.is_err());
        // The cell is untouched.
        assert_eq!(state.load(), ExecState::Suspended);
    }

    #[test]
    fn test_atomic_shutting_down() {
        let state = AtomicExecState::new(ExecState::Detached);
        state.store_shutting_down();
        assert_eq!(state.load(), ExecState::ShuttingDown);
    }
}
