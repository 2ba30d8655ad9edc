//! Argument windows for the fast call convention.
//!
//! Arguments travel as a contiguous window plus a count word. The count
//! word's high bit marks a reserved leading slot: a call site holding an
//! [`ArgBuf`] may prepend exactly one argument (a bound receiver, say)
//! without copying the window.

use ember_core::{fatal_invariant, Value};
use smallvec::{smallvec, SmallVec};

/// High bit of the count word: the window has a writable leading slot.
pub const ARGUMENTS_OFFSET: usize = 1usize << (usize::BITS - 1);

/// Extract the argument count from a count word.
#[inline]
pub fn nargs_from(nargsf: usize) -> usize {
    nargsf & !ARGUMENTS_OFFSET
}

/// Whether the count word advertises the reserved leading slot.
#[inline]
pub fn has_reserved_slot(nargsf: usize) -> bool {
    nargsf & ARGUMENTS_OFFSET != 0
}

// =============================================================================
// ArgBuf
// =============================================================================

/// An owned argument window with one reserved leading slot.
pub struct ArgBuf {
    values: SmallVec<[Value; 8]>,
    start: usize,
}

impl ArgBuf {
    /// An empty window with its leading slot reserved.
    pub fn new() -> Self {
        Self {
            values: smallvec![Value::None],
            start: 1,
        }
    }

    pub fn from_slice(args: &[Value]) -> Self {
        let mut buf = Self::new();
        buf.values.extend(args.iter().cloned());
        buf
    }

    /// Append an argument at the tail.
    pub fn push(&mut self, value: Value) {
        self.values.push(value);
    }

    /// Consume the reserved slot to prepend one argument without moving
    /// the rest of the window. Fatal if the slot was already consumed.
    pub fn prepend(&mut self, value: Value) {
        if self.start == 0 {
            fatal_invariant("argument window leading slot already consumed", "");
        }
        self.values[0] = value;
        self.start = 0;
    }

    /// The visible argument window.
    #[inline]
    pub fn args(&self) -> &[Value] {
        &self.values[self.start..]
    }

    /// The count word for this window: length, plus the reserved-slot bit
    /// while the leading slot is still free.
    #[inline]
    pub fn nargsf(&self) -> usize {
        let n = self.values.len() - self.start;
        if self.start == 1 {
            n | ARGUMENTS_OFFSET
        } else {
            n
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.values.len() - self.start
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ArgBuf {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
