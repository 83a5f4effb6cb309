//! Tests for the guest interpreter.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::bytecode::{assemble, assemble_function, assemble_module, CodeObject};
use crate::tensor::Tensor;

use super::{FrameHook, Function, Globals, Interpreter, Value, VmConfig, VmError};

fn run(src: &str, args: Vec<Value>) -> Result<Value, VmError> {
    let function = assemble_function(src, &Globals::new()).expect("assembles");
    Interpreter::new().call_function(&function, args)
}

#[test]
fn test_vm_arithmetic() {
    let result = run(
        r#"
        .args a b
            LOAD_FAST a
            LOAD_FAST b
            BINARY_SUBTRACT
            LOAD_CONST 2
            BINARY_MULTIPLY
            RETURN_VALUE
        "#,
        vec![Value::Int(10), Value::Int(3)],
    )
    .expect("VM should succeed");
    assert!(matches!(result, Value::Int(14)));
}

#[test]
fn test_vm_branch() {
    let src = r#"
        .args x
            LOAD_FAST x
            LOAD_CONST 0
            COMPARE_OP >
            POP_JUMP_IF_FALSE negative
            LOAD_CONST 'pos'
            RETURN_VALUE
        negative:
            LOAD_CONST 'neg'
            RETURN_VALUE
    "#;
    assert_eq!(run(src, vec![Value::Int(5)]).expect("runs").repr(), "'pos'");
    assert_eq!(run(src, vec![Value::Int(-5)]).expect("runs").repr(), "'neg'");
}

#[test]
fn test_vm_for_loop() {
    let result = run(
        r#"
        .args n
            LOAD_CONST 0
            STORE_FAST acc
            LOAD_GLOBAL range
            LOAD_FAST n
            CALL_FUNCTION 1
            GET_ITER
        head:
            FOR_ITER done
            STORE_FAST i
            LOAD_FAST acc
            LOAD_FAST i
            INPLACE_ADD
            STORE_FAST acc
            JUMP_ABSOLUTE head
        done:
            LOAD_FAST acc
            RETURN_VALUE
        "#,
        vec![Value::Int(5)],
    )
    .expect("VM should succeed");
    assert!(matches!(result, Value::Int(10)));
}

#[test]
fn test_vm_closure() {
    let module = assemble_module(
        r#"
        .code outer
        .args x
        .cellvars x
            LOAD_CLOSURE x
            BUILD_TUPLE 1
            LOAD_CONST @inner
            LOAD_CONST 'inner'
            MAKE_FUNCTION 8
            STORE_FAST f
            LOAD_FAST f
            LOAD_CONST 2
            CALL_FUNCTION 1
            RETURN_VALUE
        .code inner
        .args y
        .freevars x
            LOAD_DEREF x
            LOAD_FAST y
            BINARY_MULTIPLY
            RETURN_VALUE
        "#,
    )
    .expect("assembles");
    let outer = Arc::new(Function::new(module["outer"].clone(), Globals::new()));
    let result = Interpreter::new()
        .call_function(&outer, vec![Value::Int(21)])
        .expect("VM should succeed");
    assert!(matches!(result, Value::Int(42)));
}

#[test]
fn test_vm_tensor_module() {
    let result = run(
        r#"
        .args x
            LOAD_CONST 0
            LOAD_CONST None
            IMPORT_NAME tensor
            STORE_FAST tensor
            LOAD_FAST tensor
            LOAD_METHOD relu
            LOAD_FAST x
            CALL_METHOD 1
            LOAD_METHOD sum
            CALL_METHOD 0
            RETURN_VALUE
        "#,
        vec![Value::tensor(Tensor::from_vec(vec![-1.0, 2.0, 3.0], &[3], crate::tensor::DType::Float32).expect("tensor"))],
    )
    .expect("VM should succeed");
    let t = result.as_tensor().expect("tensor result");
    assert_eq!(t.data(), &[5.0]);
}

#[test]
fn test_vm_setitem_rebinds_frame_references() {
    let result = run(
        r#"
        .args x
            LOAD_FAST x
            STORE_FAST y
            LOAD_CONST 7
            LOAD_FAST x
            LOAD_CONST 0
            STORE_SUBSCR
            LOAD_FAST y
            RETURN_VALUE
        "#,
        vec![Value::tensor(Tensor::zeros(&[2]))],
    )
    .expect("VM should succeed");
    assert_eq!(result.as_tensor().map(|t| t.data().to_vec()), Some(vec![7.0, 0.0]));
}

#[test]
fn test_vm_print_output() {
    let function = assemble_function(
        r#"
            LOAD_GLOBAL print
            LOAD_CONST 'hello'
            LOAD_CONST 3
            CALL_FUNCTION 2
            RETURN_VALUE
        "#,
        &Globals::new(),
    )
    .expect("assembles");
    let vm = Interpreter::new();
    vm.call_function(&function, vec![]).expect("VM should succeed");
    assert_eq!(vm.take_output(), vec!["hello 3".to_string()]);
    assert!(vm.take_output().is_empty());
}

#[test]
fn test_vm_errors() {
    let err = run("    LOAD_FAST ghost\n    RETURN_VALUE\n", vec![]).expect_err("unbound");
    assert_eq!(err, VmError::UnboundLocal("ghost".into()));

    let err = run("    LOAD_GLOBAL ghost\n    RETURN_VALUE\n", vec![]).expect_err("undefined");
    assert_eq!(err, VmError::NameError("ghost".into()));

    let err = run(".args a\n    LOAD_FAST a\n    RETURN_VALUE\n", vec![]).expect_err("arity");
    assert!(matches!(err, VmError::TypeError(_)));
}

#[test]
fn test_vm_call_depth_limit() {
    let globals = Globals::new();
    let function = assemble_function(
        r#"
        .name recurse
            LOAD_GLOBAL recurse
            CALL_FUNCTION 0
            RETURN_VALUE
        "#,
        &globals,
    )
    .expect("assembles");
    globals.insert("recurse", Value::Function(function.clone()));
    let vm = Interpreter::with_config(VmConfig {
        max_call_depth: 16,
        ..Default::default()
    });
    assert_eq!(
        vm.call_function(&function, vec![]).expect_err("too deep"),
        VmError::CallDepthExceeded(16)
    );
}

struct Substitute {
    code: Arc<CodeObject>,
    calls: AtomicUsize,
}

impl FrameHook for Substitute {
    fn on_frame(&self, _function: &Arc<Function>, _args: &[Value]) -> Option<Arc<CodeObject>> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        Some(self.code.clone())
    }
}

#[test]
fn test_vm_hook_substitutes_code() {
    let function = assemble_function(".args x\n    LOAD_FAST x\n    RETURN_VALUE\n", &Globals::new()).expect("assembles");
    let replacement = assemble(".args x\n    LOAD_CONST 99\n    RETURN_VALUE\n").expect("assembles");
    let hook = Arc::new(Substitute {
        code: replacement,
        calls: AtomicUsize::new(0),
    });
    let vm = Interpreter::new();
    vm.set_hook(Some(hook.clone()));
    let result = vm.call_function(&function, vec![Value::Int(1)]).expect("runs");
    assert!(matches!(result, Value::Int(99)));
    assert_eq!(hook.calls.load(Ordering::Relaxed), 1);

    vm.set_hook(None);
    let result = vm.call_function(&function, vec![Value::Int(1)]).expect("runs");
    assert!(matches!(result, Value::Int(1)));
}
