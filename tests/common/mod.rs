//! Shared helpers for the integration tests

#![allow(dead_code)]

use std::sync::{Arc, Once};

use symtrace::bytecode::assemble_function;
use symtrace::tensor::{DType, Tensor};
use symtrace::vm::{Function, Globals};
use symtrace::{install, Interpreter, JitConfig, SymbolicJit, Value};

static TRACING: Once = Once::new();

/// Route `symtrace::*` events to the test writer; set RUST_LOG-style
/// verbosity with `SYMTRACE_TEST_LOG=debug`
pub fn init_tracing() {
    TRACING.call_once(|| {
        let level = match std::env::var("SYMTRACE_TEST_LOG").as_deref() {
            Ok("trace") => tracing::Level::TRACE,
            Ok("debug") => tracing::Level::DEBUG,
            Ok("info") => tracing::Level::INFO,
            _ => tracing::Level::WARN,
        };
        let _ = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_test_writer()
            .try_init();
    });
}

pub fn tensor(data: &[f64], shape: &[usize]) -> Value {
    Value::tensor(Tensor::from_vec(data.to_vec(), shape, DType::Float32).expect("valid tensor"))
}

pub fn ones(shape: &[usize]) -> Value {
    Value::tensor(Tensor::ones(shape))
}

pub fn function(src: &str) -> Arc<Function> {
    assemble_function(src, &Globals::new()).expect("source assembles")
}

/// An interpreter with a fresh JIT installed
pub fn jit_vm(config: JitConfig) -> (Interpreter, Arc<SymbolicJit>) {
    init_tracing();
    let vm = Interpreter::new();
    let jit = install(&vm, config);
    (vm, jit)
}

pub fn assert_same(expected: &Value, actual: &Value) {
    match (expected.as_tensor(), actual.as_tensor()) {
        (Some(a), Some(b)) => {
            assert_eq!(a.shape(), b.shape());
            assert!(a.allclose(b), "{:?} != {:?}", a, b);
        }
        _ => assert_eq!(expected.repr(), actual.repr()),
    }
}

/// Run `function` on `args` untraced and through a JIT-enabled interpreter,
/// checking that results and printed output agree
pub fn run_both(vm: &Interpreter, function: &Arc<Function>, args: Vec<Value>) -> Value {
    let plain = Interpreter::new();
    let expected = plain.call_function(function, args.clone()).expect("untraced run");
    let expected_output = plain.take_output();

    let actual = vm.call_function(function, args).expect("traced run");
    let actual_output = vm.take_output();

    assert_same(&expected, &actual);
    assert_eq!(expected_output, actual_output);
    actual
}
