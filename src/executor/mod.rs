//! Symbolic translation of guest functions
//!
//! Given a function and the arguments of one call, the executor simulates
//! the function's bytecode, records tensor work into a statement program,
//! and emits replacement code together with a guard describing the frames
//! that code is valid for.
//!
//! This module is organized into submodules by functionality:
//! - `tracker`: provenance of symbolic values
//! - `guard`: guard expressions and the frame view they are checked against
//! - `variables`: symbolic values and their classification
//! - `function_graph`: statement recording, compilation and guard assembly
//! - `opcode_executor`: per-instruction simulation
//! - `breaks`: code generation at returns and graph breaks

use std::sync::Arc;

use crate::config::JitConfig;
use crate::error::TraceResult;
use crate::symbolic::CompileSirCache;
use crate::tensor::{InferMetaCache, ReferenceOracle, ShapeOracle};
use crate::vm::{Function, ModuleRegistry, Value};

mod breaks;
pub mod function_graph;
pub mod guard;
pub mod opcode_executor;
pub mod tracker;
pub mod variables;

#[cfg(test)]
mod tests;

pub use breaks::LOOP_ITER_NAME;
pub use function_graph::{FunctionGraph, GraphId};
pub use guard::{FrameExpr, FrameView, GuardExpr};
pub use opcode_executor::{OpcodeExecutor, Translation};
pub use tracker::Tracker;
pub use variables::{Variable, VariableFactory, VariableKind};

/// Everything a translation shares with the rest of the process
#[derive(Clone)]
pub struct TraceContext {
    pub config: JitConfig,
    pub modules: Arc<ModuleRegistry>,
    pub infer_cache: Arc<InferMetaCache>,
    pub compile_cache: Arc<CompileSirCache>,
}

impl TraceContext {
    /// Context backed by the process-wide caches, or a private bounded
    /// shape cache when the config asks for one
    pub fn new(config: JitConfig, modules: Arc<ModuleRegistry>) -> Self {
        let infer_cache = match config.infer_cache_bound() {
            Some(capacity) => Arc::new(InferMetaCache::with_capacity(Arc::new(ReferenceOracle), capacity)),
            None => InferMetaCache::global(),
        };
        Self {
            config,
            modules,
            infer_cache,
            compile_cache: CompileSirCache::global(),
        }
    }

    /// Context with private caches that infer and specialize through `oracle`
    pub fn with_oracle(config: JitConfig, modules: Arc<ModuleRegistry>, oracle: Arc<dyn ShapeOracle>) -> Self {
        let infer_cache = match config.infer_cache_bound() {
            Some(capacity) => InferMetaCache::with_capacity(oracle.clone(), capacity),
            None => InferMetaCache::new(oracle.clone()),
        };
        Self {
            config,
            modules,
            infer_cache: Arc::new(infer_cache),
            compile_cache: Arc::new(CompileSirCache::with_oracle(oracle)),
        }
    }
}

/// Translate one call of `function`
pub fn translate(function: &Arc<Function>, args: &[Value], ctx: &TraceContext) -> TraceResult<Translation> {
    OpcodeExecutor::new(function.clone(), args, ctx)?.transform()
}
