//! Sharing of compiled statement programs

mod common;

use std::sync::Arc;

use common::{function, init_tracing, ones, tensor};
use symtrace::symbolic::CompileSirCache;
use symtrace::vm::ModuleRegistry;
use symtrace::{translate, Interpreter, JitConfig, TraceContext};

fn private_context(config: JitConfig) -> TraceContext {
    init_tracing();
    let mut ctx = TraceContext::new(config, Arc::new(ModuleRegistry::with_stdlib()));
    ctx.compile_cache = Arc::new(CompileSirCache::new());
    ctx
}

#[test]
fn test_structurally_equal_programs_share_one_compilation() {
    let ctx = private_context(JitConfig::default());
    let first = function(".name first\n.args x\n    LOAD_FAST x\n    LOAD_CONST 1\n    BINARY_ADD\n    RETURN_VALUE\n");
    let second = function(".name second\n.args y\n    LOAD_FAST y\n    LOAD_CONST 1\n    BINARY_ADD\n    RETURN_VALUE\n");

    translate(&first, &[ones(&[3])], &ctx).expect("translates");
    translate(&second, &[ones(&[3])], &ctx).expect("translates");

    let stats = ctx.compile_cache.stats();
    assert_eq!(ctx.compile_cache.len(), 1);
    assert_eq!(stats.compilations, 1);
    assert_eq!(stats.hits, 1);
}

#[test]
fn test_different_programs_compile_separately() {
    let ctx = private_context(JitConfig::default());
    let add = function(".args x\n    LOAD_FAST x\n    LOAD_CONST 1\n    BINARY_ADD\n    RETURN_VALUE\n");
    let mul = function(".args x\n    LOAD_FAST x\n    LOAD_CONST 1\n    BINARY_MULTIPLY\n    RETURN_VALUE\n");

    translate(&add, &[ones(&[2])], &ctx).expect("translates");
    translate(&mul, &[ones(&[2])], &ctx).expect("translates");
    assert_eq!(ctx.compile_cache.len(), 2);
}

#[test]
fn test_concurrent_translations_compile_once() {
    let ctx = private_context(JitConfig::default());
    let f = function(".args x\n    LOAD_FAST x\n    LOAD_METHOD exp\n    CALL_METHOD 0\n    RETURN_VALUE\n");

    std::thread::scope(|scope| {
        for _ in 0..8 {
            scope.spawn(|| {
                translate(&f, &[ones(&[4])], &ctx).expect("translates");
            });
        }
    });

    assert_eq!(ctx.compile_cache.stats().compilations, 1);
    assert_eq!(ctx.compile_cache.len(), 1);
}

#[test]
fn test_translated_code_runs_compiled_program() {
    let ctx = private_context(JitConfig {
        reuse_concrete_program: true,
        ..JitConfig::default()
    });
    let f = function(".args x y\n    LOAD_FAST x\n    LOAD_FAST y\n    BINARY_SUBTRACT\n    RETURN_VALUE\n");
    let translation = translate(&f, &[ones(&[2]), ones(&[2])], &ctx).expect("translates");

    let vm = Interpreter::new();
    for scale in [1.0, 2.0, 3.0] {
        let x = tensor(&[scale * 3.0, scale], &[2]);
        let result = vm
            .run_code(&f, translation.code.clone(), vec![x, ones(&[2])])
            .expect("runs");
        assert_eq!(
            result.as_tensor().map(|t| t.data().to_vec()),
            Some(vec![scale * 3.0 - 1.0, scale - 1.0])
        );
    }
}
