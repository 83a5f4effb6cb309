//! End-to-end behaviour of the installed JIT

mod common;

use common::{function, jit_vm, ones, run_both, tensor};
use symtrace::JitConfig;

const ADD_ONE: &str = r#"
    .name add_one
    .args x
        LOAD_FAST x
        LOAD_CONST 1
        BINARY_ADD
        RETURN_VALUE
"#;

#[test]
fn test_add_one_is_translated_once_per_shape() {
    let (vm, jit) = jit_vm(JitConfig::default());
    let add_one = function(ADD_ONE);

    let y = run_both(&vm, &add_one, vec![tensor(&[1.0, 2.0, 3.0], &[3])]);
    assert_eq!(y.as_tensor().map(|t| t.data().to_vec()), Some(vec![2.0, 3.0, 4.0]));
    run_both(&vm, &add_one, vec![tensor(&[0.5, 0.5, 0.5], &[3])]);

    let stats = jit.stats();
    assert_eq!(stats.translations, 1);
    assert_eq!(stats.cache_hits, 1);
    assert_eq!(stats.graph_breaks, 0);
}

#[test]
fn test_guard_failure_triggers_retranslation() {
    let (vm, jit) = jit_vm(JitConfig::default());
    let add_one = function(ADD_ONE);

    run_both(&vm, &add_one, vec![ones(&[2])]);
    run_both(&vm, &add_one, vec![ones(&[4, 2])]);
    run_both(&vm, &add_one, vec![ones(&[2])]);

    let stats = jit.stats();
    assert_eq!(stats.translations, 2);
    assert_eq!(stats.cache_hits, 1);
    assert_eq!(jit.cached_entries(&add_one), 2);
}

#[test]
fn test_shape_dependent_branch_specializes_per_shape() {
    let src = r#"
        .args x
            LOAD_FAST x
            LOAD_ATTR shape
            LOAD_CONST 0
            BINARY_SUBSCR
            LOAD_CONST 2
            COMPARE_OP >
            POP_JUMP_IF_FALSE small
            LOAD_FAST x
            LOAD_CONST 2
            BINARY_MULTIPLY
            RETURN_VALUE
        small:
            LOAD_FAST x
            LOAD_CONST 2
            BINARY_SUBTRACT
            RETURN_VALUE
    "#;
    let (vm, jit) = jit_vm(JitConfig::default());
    let f = function(src);

    let big = run_both(&vm, &f, vec![ones(&[3])]);
    let small = run_both(&vm, &f, vec![ones(&[1])]);
    assert_eq!(big.as_tensor().map(|t| t.data().to_vec()), Some(vec![2.0; 3]));
    assert_eq!(small.as_tensor().map(|t| t.data().to_vec()), Some(vec![-1.0]));

    let stats = jit.stats();
    assert_eq!(stats.translations, 2);
    assert_eq!(stats.graph_breaks, 0);
}

#[test]
fn test_data_dependent_branch_resumes_both_ways() {
    let src = r#"
        .args x
            LOAD_FAST x
            LOAD_CONST 3
            BINARY_MULTIPLY
            STORE_FAST y
            LOAD_FAST y
            LOAD_METHOD sum
            CALL_METHOD 0
            LOAD_CONST 0
            COMPARE_OP >
            POP_JUMP_IF_FALSE negative
            LOAD_FAST y
            LOAD_FAST x
            BINARY_ADD
            RETURN_VALUE
        negative:
            LOAD_FAST y
            LOAD_FAST x
            BINARY_SUBTRACT
            RETURN_VALUE
    "#;
    let (vm, jit) = jit_vm(JitConfig::default());
    let f = function(src);

    run_both(&vm, &f, vec![tensor(&[1.0, 2.0], &[2])]);
    // Same shape, other branch: the guard holds and the resume takes over.
    run_both(&vm, &f, vec![tensor(&[-4.0, 1.0], &[2])]);

    let stats = jit.stats();
    assert!(stats.graph_breaks >= 1);
    assert!(stats.cache_hits >= 1);
}

#[test]
fn test_print_between_tensor_work() {
    let src = r#"
        .args x
            LOAD_FAST x
            LOAD_CONST 1
            BINARY_ADD
            STORE_FAST y
            LOAD_GLOBAL print
            LOAD_CONST 'between'
            CALL_FUNCTION 1
            POP_TOP
            LOAD_FAST y
            LOAD_FAST y
            BINARY_MULTIPLY
            RETURN_VALUE
    "#;
    let (vm, jit) = jit_vm(JitConfig::default());
    let f = function(src);

    let plain = symtrace::Interpreter::new();
    plain.call_function(&f, vec![ones(&[2])]).expect("untraced run");
    assert_eq!(plain.take_output(), vec!["between".to_string()]);

    let y = run_both(&vm, &f, vec![ones(&[2])]);
    assert_eq!(y.as_tensor().map(|t| t.data().to_vec()), Some(vec![4.0, 4.0]));
    assert_eq!(jit.stats().graph_breaks, 1);
}

#[test]
fn test_loop_with_print_runs_every_iteration() {
    let src = r#"
        .args x n
            LOAD_GLOBAL range
            LOAD_FAST n
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
            BINARY_MULTIPLY
            LOAD_FAST x
            BINARY_ADD
            STORE_FAST x
            JUMP_ABSOLUTE head
        done:
            LOAD_FAST x
            RETURN_VALUE
    "#;
    let (vm, jit) = jit_vm(JitConfig::default());
    let f = function(src);

    run_both(&vm, &f, vec![ones(&[2]), symtrace::Value::Int(4)]);
    let first = jit.stats();
    assert_eq!(first.graph_breaks, 1);

    // The caller and the resume at the loop exit are both cached now.
    run_both(&vm, &f, vec![ones(&[2]), symtrace::Value::Int(4)]);
    assert_eq!(jit.stats().translations, first.translations);
}

#[test]
fn test_static_and_dynamic_shapes() {
    let static_src = r#"
        .args x
            LOAD_FAST x
            LOAD_ATTR shape
            RETURN_VALUE
    "#;
    let dynamic_src = r#"
        .args x
            LOAD_FAST x
            LOAD_METHOD nonzero
            CALL_METHOD 0
            LOAD_ATTR shape
            LOAD_CONST 0
            BINARY_SUBSCR
            RETURN_VALUE
    "#;
    let (vm, jit) = jit_vm(JitConfig::default());

    let shape = run_both(&vm, &function(static_src), vec![ones(&[2, 3])]);
    assert_eq!(shape.repr(), "[2, 3]");
    assert_eq!(jit.stats().graph_breaks, 0);

    let count = run_both(&vm, &function(dynamic_src), vec![tensor(&[0.0, 1.0, 0.0, 2.0], &[4])]);
    assert_eq!(count.repr(), "2");
    assert_eq!(jit.stats().graph_breaks, 1);
}

#[test]
fn test_nested_calls_are_traced_separately() {
    let src = r#"
        .code outer
        .args x
            LOAD_CONST @inner
            LOAD_CONST 'inner'
            MAKE_FUNCTION 0
            LOAD_FAST x
            CALL_FUNCTION 1
            LOAD_CONST 2
            BINARY_MULTIPLY
            RETURN_VALUE
        .code inner
        .args y
            LOAD_FAST y
            LOAD_CONST 1
            BINARY_ADD
            RETURN_VALUE
    "#;
    let (vm, jit) = jit_vm(JitConfig::default());
    let outer = function(src);

    let y = run_both(&vm, &outer, vec![ones(&[2])]);
    assert_eq!(y.as_tensor().map(|t| t.data().to_vec()), Some(vec![4.0, 4.0]));
    assert!(jit.stats().translations >= 1);
}

#[test]
fn test_break_in_inner_loop_keeps_outer_loop_traced() {
    let src = r#"
        .args x
            LOAD_GLOBAL range
            LOAD_CONST 2
            CALL_FUNCTION 1
            GET_ITER
        outer:
            FOR_ITER outer_done
            STORE_FAST i
            LOAD_GLOBAL range
            LOAD_CONST 2
            CALL_FUNCTION 1
            GET_ITER
        inner:
            FOR_ITER inner_done
            STORE_FAST j
            LOAD_GLOBAL print
            LOAD_FAST j
            CALL_FUNCTION 1
            POP_TOP
            JUMP_ABSOLUTE inner
        inner_done:
            LOAD_FAST x
            LOAD_FAST i
            BINARY_ADD
            STORE_FAST x
            JUMP_ABSOLUTE outer
        outer_done:
            LOAD_FAST x
            RETURN_VALUE
    "#;
    let (vm, jit) = jit_vm(JitConfig::default());
    let f = function(src);

    let y = run_both(&vm, &f, vec![ones(&[2])]);
    assert_eq!(y.as_tensor().map(|t| t.data().to_vec()), Some(vec![2.0, 2.0]));

    let stats = jit.stats();
    assert_eq!(stats.fallbacks, 0);
    assert!(stats.graph_breaks >= 2);
}
