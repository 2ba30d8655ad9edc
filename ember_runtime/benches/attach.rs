//! Attach protocol and call dispatch benchmarks.
//!
//! # Benchmark Categories
//!
//! 1. **Attach/Detach**: uncontended token round trip
//! 2. **Dispatch**: fast path vs generic fallback
//! 3. **Ensure/Release**: nested re-entry cost

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use ember_runtime::{CallCx, Callable, KwArgs, KwNames, Runtime, ThreadWhence, Value};

struct FastNone;

impl Callable for FastNone {
    fn supports_vectorcall(&self) -> bool {
        true
    }

    fn vectorcall(
        &self,
        _cx: &mut dyn CallCx,
        _args: &[Value],
        _kwnames: Option<&KwNames>,
    ) -> Option<Value> {
        Some(Value::None)
    }

    fn tp_call(&self, _cx: &mut dyn CallCx, _args: Vec<Value>, _kwargs: KwArgs) -> Option<Value> {
        Some(Value::None)
    }
}

struct GenericNone;

impl Callable for GenericNone {
    fn tp_call(&self, _cx: &mut dyn CallCx, _args: Vec<Value>, _kwargs: KwArgs) -> Option<Value> {
        Some(Value::None)
    }
}

fn bench_attach_detach(c: &mut Criterion) {
    let runtime = Runtime::new();
    let interp = runtime.main_interpreter().unwrap();
    let ts = interp.new_thread_state_bound(ThreadWhence::Embedding);

    c.bench_function("attach_detach_roundtrip", |b| {
        b.iter(|| {
            let guard = ts.attach().unwrap();
            black_box(&guard);
            drop(guard);
        })
    });

    ts.delete();
}

fn bench_dispatch(c: &mut Criterion) {
    let runtime = Runtime::new();
    let interp = runtime.main_interpreter().unwrap();
    let ts = interp.new_thread_state_bound(ThreadWhence::Embedding);
    let mut guard = ts.attach().unwrap();

    let fast = Value::callable(FastNone);
    let generic = Value::callable(GenericNone);
    let args = [Value::Int(1), Value::Int(2), Value::Int(3)];

    c.bench_function("vectorcall_fast_3_args", |b| {
        b.iter(|| guard.call(black_box(&fast), black_box(&args), None).unwrap())
    });

    c.bench_function("vectorcall_generic_3_args", |b| {
        b.iter(|| {
            guard
                .call(black_box(&generic), black_box(&args), None)
                .unwrap()
        })
    });

    drop(guard);
    ts.delete();
}

fn bench_ensure_release(c: &mut Criterion) {
    let runtime = Runtime::new();
    let outer = runtime.threadstate_ensure().unwrap();

    c.bench_function("ensure_release_nested", |b| {
        b.iter(|| {
            let state = runtime.threadstate_ensure().unwrap();
            runtime.threadstate_release(state);
        })
    });

    runtime.threadstate_release(outer);
}

criterion_group!(
    benches,
    bench_attach_detach,
    bench_dispatch,
    bench_ensure_release
);
criterion_main!(benches);
