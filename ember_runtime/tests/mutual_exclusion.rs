//! Mutual-exclusion tests for the attach protocol.
//!
//! Coverage:
//! - At most one thread observes the attached state per interpreter, under
//!   contention from many threads
//! - Independent interpreters attach concurrently

use std::sync::atomic::{AtomicI32, Ordering};

use ember_runtime::{InterpreterConfig, Runtime, ThreadWhence};

// =============================================================================
// Single-Token Exclusion
// =============================================================================

#[test]
fn test_at_most_one_thread_attached() {
    const WORKERS: usize = 4;
    const ITERATIONS: usize = 250;

    let runtime = Runtime::new();
    let interp = runtime.main_interpreter().unwrap();

    // Instrumented counter: incremented on attach, decremented before
    // detach. The peak must never exceed 1.
    let live = AtomicI32::new(0);
    let peak = AtomicI32::new(0);

    std::thread::scope(|scope| {
        for _ in 0..WORKERS {
            scope.spawn(|| {
                let ts = interp.new_thread_state_bound(ThreadWhence::Embedding);
                for _ in 0..ITERATIONS {
                    let guard = ts.attach().unwrap();
                    let now = live.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::hint::spin_loop();
                    live.fetch_sub(1, Ordering::SeqCst);
                    drop(guard);
                }
                ts.delete();
            });
        }
    });

    assert_eq!(peak.load(Ordering::SeqCst), 1);
    assert_eq!(live.load(Ordering::SeqCst), 0);
    assert_eq!(interp.thread_count(), 0);
}

// =============================================================================
// Per-Interpreter Tokens
// =============================================================================

#[test]
fn test_independent_interpreters_attach_concurrently() {
    let runtime = Runtime::new();
    let main = runtime.main_interpreter().unwrap();
    let sub = runtime
        .interpreter_create(InterpreterConfig::default())
        .unwrap();

    let main_ts = main.new_thread_state_bound(ThreadWhence::Embedding);
    let sub_ts = sub.new_thread_state_bound(ThreadWhence::Embedding);

    // Each interpreter has its own token, so both guards coexist.
    let main_guard = main_ts.attach().unwrap();
    let sub_guard = sub_ts.attach().unwrap();

    assert_eq!(main_ts.exec_state(), ember_runtime::ExecState::Attached);
    assert_eq!(sub_ts.exec_state(), ember_runtime::ExecState::Attached);

    drop(sub_guard);
    drop(main_guard);
    sub_ts.delete();
    main_ts.delete();
    sub.delete();
}

// =============================================================================
// Handoff Accounting
// =============================================================================

#[test]
fn test_attach_stats_balance() {
    const WORKERS: usize = 3;
    const ITERATIONS: u64 = 100;

    let runtime = Runtime::new();
    let interp = runtime.main_interpreter().unwrap();

    std::thread::scope(|scope| {
        for _ in 0..WORKERS {
            scope.spawn(|| {
                let ts = interp.new_thread_state_bound(ThreadWhence::Embedding);
                for _ in 0..ITERATIONS {
                    let guard = ts.attach().unwrap();
                    drop(guard);
                }
                ts.delete();
            });
        }
    });

    let stats = interp.attach_stats();
    let total = WORKERS as u64 * ITERATIONS;
    assert_eq!(stats.attaches.load(Ordering::Relaxed), total);
    assert_eq!(
        stats.detaches.load(Ordering::Relaxed) + stats.suspends.load(Ordering::Relaxed),
        total
    );
}
