//! Benchmarks for the forward-call path: argument frames, method-bind
//! resolution and variant packing, run against the headless engine.
//!
//! ## Profiling with Puffin
//!
//! Run with the `profile-with-puffin` feature to collect scope timings:
//!
//! ```bash
//! cargo bench --features profile-with-puffin -- --profile-time 5
//! ```

use criterion::{BatchSize, Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;
use std::sync::Arc;

use enginebind::prelude::*;
use enginebind::{BuiltinPtr, PackedArray};

#[cfg(feature = "profile-with-puffin")]
static FRAME_VIEW: std::sync::OnceLock<puffin::GlobalFrameView> = std::sync::OnceLock::new();

/// Initialize puffin profiler.
#[cfg(feature = "profile-with-puffin")]
fn setup_profiler() {
    puffin::set_scopes_on(true);
    FRAME_VIEW.get_or_init(puffin::GlobalFrameView::default);
}

#[cfg(not(feature = "profile-with-puffin"))]
fn setup_profiler() {}

/// Call at the end of each benchmark iteration to flush profiling data.
#[cfg(feature = "profile-with-puffin")]
fn end_profiling_frame() {
    puffin::GlobalProfiler::lock().new_frame();
}

#[cfg(not(feature = "profile-with-puffin"))]
fn end_profiling_frame() {}

fn runtime() -> (Arc<HeadlessEngine>, Runtime) {
    let engine = Arc::new(HeadlessEngine::new());
    engine
        .add_method("Object", "sum", 3, |call| {
            // SAFETY: three int arguments, int return.
            unsafe {
                let sum = call.arg::<i64>(0) + call.arg::<i64>(1) + call.arg::<i64>(2);
                call.write_return(sum);
            }
            Ok(())
        })
        .unwrap();
    engine
        .add_method("Object", "length", 1, |call| {
            // SAFETY: one string argument, int return.
            unsafe {
                let text = call.arg_string(0).ok_or(ErrorCode::InvalidParameter)?;
                call.write_return(text.len() as i64);
            }
            Ok(())
        })
        .unwrap();
    engine
        .add_method("Object", "echo_bytes", 1, |call| {
            // SAFETY: one packed-array argument, packed-array return.
            let input = unsafe { call.arg::<BuiltinPtr>(0) };
            let copy = call
                .engine()
                .builtin_duplicate(input)
                .ok_or(ErrorCode::InvalidParameter)?;
            unsafe { call.write_return(Some(copy)) };
            Ok(())
        })
        .unwrap();
    let runtime = RuntimeBuilder::new(engine.clone()).build().unwrap();
    (engine, runtime)
}

fn call_benchmarks(c: &mut Criterion) {
    setup_profiler();
    let (_engine, runtime) = runtime();
    let mut group = c.benchmark_group("call");

    group.bench_function("ints", |b| {
        b.iter(|| {
            let sum: i64 = runtime
                .call_static("Object", "sum", |frame| {
                    frame.arg(&black_box(1i64))?;
                    frame.arg(&2i64)?;
                    frame.arg(&3i64)
                })
                .unwrap();
            end_profiling_frame();
            black_box(sum)
        });
    });

    group.bench_function("string", |b| {
        b.iter(|| {
            let len: i64 = runtime
                .call_static("Object", "length", |frame| frame.arg(black_box("hello, engine")))
                .unwrap();
            end_profiling_frame();
            black_box(len)
        });
    });

    let resource = runtime.construct("Resource").unwrap();
    group.bench_function("method_on_handle", |b| {
        b.iter(|| {
            let count: i64 = runtime
                .call_method(&resource, "get_reference_count", |_| Ok(()))
                .unwrap();
            end_profiling_frame();
            black_box(count)
        });
    });

    for size in [16usize, 4096] {
        let bytes: Vec<u8> = (0..size).map(|i| i as u8).collect();
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(format!("packed_bytes_{size}"), |b| {
            b.iter(|| {
                let echoed: PackedArray<u8> = runtime
                    .call_static("Object", "echo_bytes", |frame| frame.arg(&bytes))
                    .unwrap();
                end_profiling_frame();
                black_box(echoed.len())
            });
        });
    }

    group.finish();
}

fn resolve_benchmarks(c: &mut Criterion) {
    let (_engine, runtime) = runtime();
    let mut group = c.benchmark_group("resolve");

    runtime.binds().resolve("Resource", "get_reference_count").unwrap();
    group.bench_function("cached", |b| {
        b.iter(|| black_box(runtime.binds().resolve("Resource", "get_reference_count").unwrap()));
    });

    group.finish();
}

fn variant_benchmarks(c: &mut Criterion) {
    let (_engine, runtime) = runtime();
    let context = runtime.context();
    let mut group = c.benchmark_group("variant");

    let mut entries = VarDictionary::new();
    for i in 0..32 {
        entries.insert(Variant::String(format!("key{i}")), Variant::Int(i));
    }
    let nested = Variant::Array(vec![
        Variant::Dictionary(entries),
        Variant::PackedFloat32Array(vec![0.5; 64]),
        Variant::Array((0..16).map(Variant::Int).collect()),
    ]);

    group.bench_function("pack_nested", |b| {
        b.iter(|| {
            let packed = VariantBridge::pack_any(context, black_box(&nested)).unwrap();
            end_profiling_frame();
            black_box(packed)
        });
    });

    group.bench_function("unpack_nested", |b| {
        b.iter_batched(
            || VariantBridge::pack_any(context, &nested).unwrap(),
            |packed| {
                let value = VariantBridge::unpack_any(context, &packed).unwrap();
                end_profiling_frame();
                black_box(value)
            },
            BatchSize::SmallInput,
        );
    });

    group.finish();
}

criterion_group!(benches, call_benchmarks, resolve_benchmarks, variant_benchmarks);

criterion_main!(benches);
