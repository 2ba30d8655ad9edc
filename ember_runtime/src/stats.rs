//! Counters for profiling the kernel's hot protocols.
//!
//! All counters use relaxed atomics; they are diagnostics, not
//! synchronization.

use std::sync::atomic::{AtomicU64, Ordering};

// =============================================================================
// Attach Protocol
// =============================================================================

/// Attach/detach protocol counters, one set per interpreter.
#[derive(Default, Debug)]
pub struct AttachStats {
    /// Successful attaches.
    pub attaches: AtomicU64,
    /// Detaches to the detached state.
    pub detaches: AtomicU64,
    /// Detaches redirected to the suspended state by a pending pause.
    pub suspends: AtomicU64,
    /// Attach attempts that had to park on a suspended state.
    pub attach_waits: AtomicU64,
}

impl AttachStats {
    pub fn record_attach(&self) {
        self.attaches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_detach(&self) {
        self.detaches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_suspend(&self) {
        self.suspends.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_attach_wait(&self) {
        self.attach_waits.fetch_add(1, Ordering::Relaxed);
    }
}

// =============================================================================
// Stop-the-World
// =============================================================================

/// Stop-the-world counters, one set per scope.
#[derive(Default, Debug)]
pub struct StopTheWorldStats {
    /// Requests issued.
    pub requests: AtomicU64,
    /// Detached threads parked directly by a requester.
    pub threads_parked: AtomicU64,
}

impl StopTheWorldStats {
    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_parked(&self, count: u64) {
        self.threads_parked.fetch_add(count, Ordering::Relaxed);
    }
}

// =============================================================================
// Call Dispatch
// =============================================================================

/// Call dispatch counters, one set per interpreter.
#[derive(Default, Debug)]
pub struct CallStats {
    /// Calls routed through the fast (vectorcall) path.
    pub fast_calls: AtomicU64,
    /// Calls routed through the generic (tp_call) fallback.
    pub generic_calls: AtomicU64,
    /// Calls rejected by the recursion limit.
    pub recursion_errors: AtomicU64,
    /// Call contract violations observed (release builds only; debug
    /// builds abort instead).
    pub contract_violations: AtomicU64,
}

impl CallStats {
    pub fn record_fast(&self) {
        self.fast_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_generic(&self) {
        self.generic_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_recursion_error(&self) {
        self.recursion_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_contract_violation(&self) {
        self.contract_violations.fetch_add(1, Ordering::Relaxed);
    }
}

// =============================================================================
// Tests
// =============================================================================
