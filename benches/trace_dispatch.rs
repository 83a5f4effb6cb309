// Translation and guarded dispatch against plain interpretation
//
// Scenarios:
//
// 1. Plain interpretation (no hook installed)
// 2. Cached dispatch (guard check + compiled program per call)
// 3. Cold translation (symbolic execution + compilation per call)
//
// Straight-line tensor code should dispatch close to the interpreter once
// translated; translation cost is paid once per guard.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use symtrace::bytecode::assemble_function;
use symtrace::tensor::{DType, Tensor};
use symtrace::vm::{Function, Globals, ModuleRegistry};
use symtrace::{install, translate, Interpreter, JitConfig, TraceContext, Value};

// ================================================================================================
// Helper Functions
// ================================================================================================

/// A chain of `depth` elementwise updates on `x`
fn chain_source(depth: usize) -> String {
    let mut src = String::from(".args x y\n");
    for i in 0..depth {
        src.push_str("    LOAD_FAST x\n    LOAD_FAST y\n");
        src.push_str(if i % 2 == 0 { "    BINARY_ADD\n" } else { "    BINARY_MULTIPLY\n" });
        src.push_str("    STORE_FAST x\n");
    }
    src.push_str("    LOAD_FAST x\n    LOAD_METHOD relu\n    CALL_METHOD 0\n    RETURN_VALUE\n");
    src
}

fn chain(depth: usize) -> Arc<Function> {
    assemble_function(&chain_source(depth), &Globals::new()).expect("assembles")
}

fn args(len: usize) -> Vec<Value> {
    let x = Tensor::from_vec((0..len).map(|i| i as f64).collect(), &[len], DType::Float32).expect("tensor");
    let y = Tensor::full(&[len], 0.5, DType::Float32);
    vec![Value::tensor(x), Value::tensor(y)]
}

// ================================================================================================
// Benchmarks
// ================================================================================================

fn bench_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch");
    for depth in [1usize, 8, 32] {
        let function = chain(depth);
        let inputs = args(64);

        let plain = Interpreter::new();
        group.bench_with_input(BenchmarkId::new("interpreted", depth), &depth, |b, _| {
            b.iter(|| plain.call_function(black_box(&function), inputs.clone()).expect("runs"))
        });

        let traced = Interpreter::new();
        install(&traced, JitConfig::default());
        traced.call_function(&function, inputs.clone()).expect("warms up");
        group.bench_with_input(BenchmarkId::new("cached", depth), &depth, |b, _| {
            b.iter(|| traced.call_function(black_box(&function), inputs.clone()).expect("runs"))
        });
    }
    group.finish();
}

fn bench_translation(c: &mut Criterion) {
    let mut group = c.benchmark_group("translation");
    let ctx = TraceContext::new(JitConfig::default(), Arc::new(ModuleRegistry::with_stdlib()));
    for depth in [1usize, 8, 32] {
        let function = chain(depth);
        let inputs = args(64);
        group.bench_with_input(BenchmarkId::new("translate", depth), &depth, |b, _| {
            b.iter(|| translate(black_box(&function), &inputs, &ctx).expect("translates"))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_dispatch, bench_translation);
criterion_main!(benches);
