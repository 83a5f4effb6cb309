//! Tests for symbolic translation.
//!
//! Each case translates a guest function for one set of arguments, runs the
//! generated code in a hook-free interpreter and compares the result with
//! running the original code.

use std::sync::Arc;

use crate::bytecode::assemble_function;
use crate::config::JitConfig;
use crate::error::TraceError;
use crate::tensor::{DType, Tensor};
use crate::vm::{Function, Globals, Interpreter, ModuleRegistry, Value};

use super::{translate, FrameView, TraceContext, Translation};

fn context() -> TraceContext {
    TraceContext::new(JitConfig::default(), Arc::new(ModuleRegistry::with_stdlib()))
}

fn tensor(data: &[f64], shape: &[usize]) -> Value {
    Value::tensor(Tensor::from_vec(data.to_vec(), shape, DType::Float32).expect("tensor"))
}

fn assert_same(expected: &Value, actual: &Value) {
    match (expected.as_tensor(), actual.as_tensor()) {
        (Some(a), Some(b)) => assert!(a.allclose(b), "{:?} != {:?}", a, b),
        _ => assert_eq!(expected.repr(), actual.repr()),
    }
}

/// Translate for `args`, then check the generated code against the
/// original on `args` and on every call in `more`
fn check(src: &str, args: Vec<Value>, more: &[Vec<Value>]) -> (Arc<Function>, Translation, Vec<String>) {
    let function = assemble_function(src, &Globals::new()).expect("assembles");
    let translation = translate(&function, &args, &context()).expect("translates");
    let vm = Interpreter::new();
    let mut output = Vec::new();
    for call in std::iter::once(&args).chain(more) {
        let expected = vm.call_function(&function, call.clone()).expect("original runs");
        let original_output = vm.take_output();
        let actual = vm
            .run_code(&function, translation.code.clone(), call.clone())
            .expect("translated code runs");
        let translated_output = vm.take_output();
        assert_same(&expected, &actual);
        assert_eq!(original_output, translated_output);
        output = translated_output;
    }
    (function, translation, output)
}

const ADD_ONE: &str = r#"
    .args x
        LOAD_FAST x
        LOAD_CONST 1
        BINARY_ADD
        RETURN_VALUE
"#;

#[test]
fn test_straight_line_tensor_code() {
    let x = tensor(&[1.0, 2.0], &[2]);
    let (function, translation, _) = check(ADD_ONE, vec![x.clone()], &[vec![tensor(&[5.0, -1.0], &[2])]]);
    assert_eq!(translation.statements, 1);
    assert!(!translation.graph_break);

    let same_shape = [tensor(&[0.0, 0.0], &[2])];
    let other_shape = [tensor(&[0.0, 0.0, 0.0], &[3])];
    assert!(translation.guard.evaluate(&FrameView::new(&function, &same_shape)));
    assert!(!translation.guard.evaluate(&FrameView::new(&function, &other_shape)));
}

#[test]
fn test_scalar_arguments_are_guarded_by_value() {
    let src = r#"
        .args x n
            LOAD_FAST x
            LOAD_FAST n
            BINARY_MULTIPLY
            RETURN_VALUE
    "#;
    let x = tensor(&[1.0, 2.0], &[2]);
    let (function, translation, _) = check(src, vec![x.clone(), Value::Int(2)], &[]);
    assert!(translation.guard.to_string().contains("n == 2"));
    assert!(translation.guard.evaluate(&FrameView::new(&function, &[x.clone(), Value::Int(2)])));
    assert!(!translation.guard.evaluate(&FrameView::new(&function, &[x, Value::Int(3)])));
}

#[test]
fn test_print_breaks_the_graph() {
    let src = r#"
        .args x
            LOAD_FAST x
            LOAD_CONST 1
            BINARY_ADD
            STORE_FAST y
            LOAD_GLOBAL print
            LOAD_CONST 'hi'
            CALL_FUNCTION 1
            POP_TOP
            LOAD_FAST y
            LOAD_CONST 2
            BINARY_MULTIPLY
            RETURN_VALUE
    "#;
    let (_, translation, output) = check(src, vec![tensor(&[1.0, 2.0], &[2])], &[]);
    assert!(translation.graph_break);
    assert_eq!(translation.statements, 1);
    assert_eq!(output, vec!["hi".to_string()]);
}

#[test]
fn test_data_dependent_branch() {
    let src = r#"
        .args x
            LOAD_FAST x
            LOAD_METHOD sum
            CALL_METHOD 0
            LOAD_CONST 0
            COMPARE_OP >
            POP_JUMP_IF_FALSE negative
            LOAD_FAST x
            LOAD_CONST 1
            BINARY_ADD
            RETURN_VALUE
        negative:
            LOAD_FAST x
            LOAD_CONST 1
            BINARY_SUBTRACT
            RETURN_VALUE
    "#;
    let (_, translation, _) = check(
        src,
        vec![tensor(&[1.0, 2.0], &[2])],
        &[vec![tensor(&[-3.0, 1.0], &[2])]],
    );
    assert!(translation.graph_break);
    assert_eq!(translation.statements, 2);
}

const RANGE_LOOP: &str = r#"
    .args x
        LOAD_GLOBAL range
        LOAD_CONST 3
        CALL_FUNCTION 1
        GET_ITER
    head:
        FOR_ITER done
        STORE_FAST i
        LOAD_FAST x
        LOAD_FAST i
        BINARY_ADD
        STORE_FAST x
        JUMP_ABSOLUTE head
    done:
        LOAD_FAST x
        RETURN_VALUE
"#;

#[test]
fn test_constant_loop_is_unrolled() {
    let (_, translation, _) = check(RANGE_LOOP, vec![tensor(&[1.0], &[1])], &[]);
    assert!(!translation.graph_break);
    assert_eq!(translation.statements, 3);
}

#[test]
fn test_break_in_first_iteration_hands_over_the_loop() {
    let src = r#"
        .args x
            LOAD_GLOBAL range
            LOAD_CONST 3
            CALL_FUNCTION 1
            GET_ITER
        head:
            FOR_ITER done
            STORE_FAST i
            LOAD_GLOBAL print
            LOAD_FAST i
            CALL_FUNCTION 1
            POP_TOP
            LOAD_FAST x
            LOAD_FAST i
            BINARY_ADD
            STORE_FAST x
            JUMP_ABSOLUTE head
        done:
            LOAD_FAST x
            RETURN_VALUE
    "#;
    let (_, translation, output) = check(src, vec![tensor(&[1.0, 2.0], &[2])], &[]);
    assert!(translation.graph_break);
    assert_eq!(translation.statements, 0);
    assert_eq!(output, vec!["0", "1", "2"]);
}

#[test]
fn test_break_in_later_iteration_keeps_earlier_work() {
    let src = r#"
        .args x
            LOAD_GLOBAL range
            LOAD_CONST 3
            CALL_FUNCTION 1
            GET_ITER
        head:
            FOR_ITER done
            STORE_FAST i
            LOAD_FAST i
            LOAD_CONST 1
            COMPARE_OP ==
            POP_JUMP_IF_FALSE skip
            LOAD_GLOBAL print
            LOAD_FAST i
            CALL_FUNCTION 1
            POP_TOP
        skip:
            LOAD_FAST x
            LOAD_FAST i
            BINARY_ADD
            STORE_FAST x
            JUMP_ABSOLUTE head
        done:
            LOAD_FAST x
            RETURN_VALUE
    "#;
    let (_, translation, output) = check(src, vec![tensor(&[1.0, 2.0], &[2])], &[]);
    assert!(translation.graph_break);
    // Only the first iteration's add stays in the graph.
    assert_eq!(translation.statements, 1);
    assert_eq!(output, vec!["1"]);
}

#[test]
fn test_static_shape_is_folded() {
    let src = r#"
        .args x
            LOAD_FAST x
            LOAD_ATTR shape
            LOAD_CONST 0
            BINARY_SUBSCR
            LOAD_FAST x
            BINARY_MULTIPLY
            RETURN_VALUE
    "#;
    let (function, translation, _) = check(src, vec![tensor(&[1.0, 2.0, 3.0], &[3])], &[]);
    assert!(!translation.graph_break);
    assert_eq!(translation.statements, 1);
    let other = [tensor(&[1.0, 2.0], &[2])];
    assert!(!translation.guard.evaluate(&FrameView::new(&function, &other)));
}

#[test]
fn test_dynamic_shape_breaks() {
    let src = r#"
        .args x
            LOAD_FAST x
            LOAD_METHOD nonzero
            CALL_METHOD 0
            LOAD_ATTR shape
            RETURN_VALUE
    "#;
    let (_, translation, _) = check(src, vec![tensor(&[0.0, 2.0, 3.0], &[3])], &[]);
    assert!(translation.graph_break);
    assert_eq!(translation.statements, 1);
}

#[test]
fn test_setitem_rebinds_aliases() {
    let src = r#"
        .args x
            LOAD_FAST x
            LOAD_CONST 1
            BINARY_ADD
            STORE_FAST y
            LOAD_FAST y
            STORE_FAST z
            LOAD_CONST 7
            LOAD_FAST y
            LOAD_CONST 0
            STORE_SUBSCR
            LOAD_FAST z
            RETURN_VALUE
    "#;
    let (_, translation, _) = check(src, vec![tensor(&[1.0, 2.0], &[2])], &[]);
    assert!(!translation.graph_break);
    assert_eq!(translation.statements, 2);
}

#[test]
fn test_written_cell_is_stored_back() {
    let src = r#"
        .args x
        .cellvars c
            LOAD_FAST x
            LOAD_CONST 1
            BINARY_ADD
            STORE_DEREF c
            LOAD_DEREF c
            LOAD_CONST 2
            BINARY_MULTIPLY
            RETURN_VALUE
    "#;
    let (_, translation, _) = check(src, vec![tensor(&[1.0, 2.0], &[2])], &[]);
    assert!(!translation.graph_break);
    assert_eq!(translation.statements, 2);
}

#[test]
fn test_unpack_and_containers() {
    let src = r#"
        .args x
            LOAD_FAST x
            LOAD_CONST 2
            BUILD_TUPLE 2
            UNPACK_SEQUENCE 2
            STORE_FAST a
            STORE_FAST b
            LOAD_FAST a
            LOAD_FAST b
            BINARY_MULTIPLY
            RETURN_VALUE
    "#;
    let (_, translation, _) = check(src, vec![tensor(&[1.0, 2.0], &[2])], &[]);
    assert_eq!(translation.statements, 1);
}

#[test]
fn test_step_limit_outside_loops_is_fatal() {
    let function = assemble_function(ADD_ONE, &Globals::new()).expect("assembles");
    let mut ctx = context();
    ctx.config.max_trace_steps = 2;
    let err = translate(&function, &[tensor(&[1.0], &[1])], &ctx).expect_err("step limit");
    assert!(matches!(err, TraceError::NotImplemented(_)));
}

#[test]
fn test_shape_mismatch_is_a_backend_error() {
    let src = r#"
        .args x y
            LOAD_FAST x
            LOAD_FAST y
            BINARY_MATRIX_MULTIPLY
            RETURN_VALUE
    "#;
    let function = assemble_function(src, &Globals::new()).expect("assembles");
    let err = translate(
        &function,
        &[tensor(&[1.0; 6], &[2, 3]), tensor(&[1.0; 4], &[2, 2])],
        &context(),
    )
    .expect_err("mismatched matmul");
    assert!(matches!(err, TraceError::Backend(_)));
}

/// A fresh guest iterator over `range(n)`
fn range_iter(vm: &Interpreter, n: i64) -> Value {
    let make = assemble_function(
        ".args n\n    LOAD_GLOBAL range\n    LOAD_FAST n\n    CALL_FUNCTION 1\n    GET_ITER\n    RETURN_VALUE\n",
        &Globals::new(),
    )
    .expect("assembles");
    vm.call_function(&make, vec![Value::Int(n)]).expect("iterator")
}

#[test]
fn test_native_iterator_argument_breaks_at_for_iter() {
    let src = r#"
        .args it x
            LOAD_FAST it
        head:
            FOR_ITER done
            STORE_FAST i
            LOAD_FAST x
            LOAD_FAST i
            BINARY_ADD
            STORE_FAST x
            JUMP_ABSOLUTE head
        done:
            LOAD_FAST x
            RETURN_VALUE
    "#;
    let function = assemble_function(src, &Globals::new()).expect("assembles");
    let vm = Interpreter::new();
    let x = tensor(&[1.0, 2.0], &[2]);

    let translation = translate(&function, &[range_iter(&vm, 3), x.clone()], &context()).expect("translates");
    assert!(translation.graph_break);

    let expected = vm
        .call_function(&function, vec![range_iter(&vm, 3), x.clone()])
        .expect("original runs");
    let actual = vm
        .run_code(&function, translation.code.clone(), vec![range_iter(&vm, 3), x])
        .expect("translated code runs");
    assert_same(&expected, &actual);
    assert_eq!(actual.as_tensor().map(|t| t.data().to_vec()), Some(vec![4.0, 5.0]));
}

#[test]
fn test_context_oracle_drives_inference_and_compiled_code() {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::tensor::{MetaInfo, MetaOperand, ReferenceOracle, ShapeOracle, TensorOp, TensorResult};

    struct Counting(AtomicUsize);

    impl ShapeOracle for Counting {
        fn infer(&self, op: TensorOp, inputs: &[MetaOperand]) -> TensorResult<MetaInfo> {
            self.0.fetch_add(1, Ordering::SeqCst);
            ReferenceOracle.infer(op, inputs)
        }
    }

    let oracle = Arc::new(Counting(AtomicUsize::new(0)));
    let ctx = TraceContext::with_oracle(
        JitConfig::default(),
        Arc::new(ModuleRegistry::with_stdlib()),
        oracle.clone(),
    );
    let function = assemble_function(ADD_ONE, &Globals::new()).expect("assembles");
    let translation = translate(&function, &[tensor(&[1.0, 2.0], &[2])], &ctx).expect("translates");
    let traced = oracle.0.load(Ordering::SeqCst);
    assert!(traced >= 1);

    let vm = Interpreter::new();
    vm.run_code(&function, translation.code, vec![tensor(&[3.0, 4.0], &[2])])
        .expect("runs");
    assert!(oracle.0.load(Ordering::SeqCst) > traced);
}
