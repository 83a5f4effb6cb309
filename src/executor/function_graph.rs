//! The graph under construction for one translation
//!
//! Collects the statements recorded while tracing, the tensors the program
//! reads from the frame, and every frame value the translation depends on.
//! At a return or graph break the recorded statements are compiled into a
//! callable and spliced into the generated code.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::bytecode::{next_generated_name, CodeGen};
use crate::config::JitConfig;
use crate::error::{TraceError, TraceResult};
use crate::symbolic::{CompileSirCache, Operand, Statement, StatementIr, Symbol};
use crate::tensor::{InferMetaCache, MetaOperand, TensorOp};
use crate::vm::Value;

use super::guard::GuardExpr;
use super::tracker::Tracker;
use super::variables::{TensorVar, Variable, VariableKind};

static NEXT_GRAPH_ID: AtomicU64 = AtomicU64::new(0);
static NEXT_SIR_ID: AtomicUsize = AtomicUsize::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GraphId(u64);

/// Local of the generated code that holds the graph output for `symbol`
pub fn out_var_name(symbol: &Symbol) -> String {
    format!("___SIR_out_{}", symbol)
}

/// Saved graph state, restored when a loop iteration is rolled back
#[derive(Clone)]
pub struct GraphMemo {
    statements: usize,
    inputs: usize,
    frame_inputs: usize,
    global_guarded: usize,
    tracked: HashMap<String, Variable>,
}

pub struct FunctionGraph {
    id: GraphId,
    infer_cache: Arc<InferMetaCache>,
    compile_cache: Arc<CompileSirCache>,
    reuse_concrete_program: bool,
    log_sir: bool,
    next_symbol: usize,
    statements: Vec<Statement>,
    defined: HashSet<Symbol>,
    /// Tensors the program reads from the frame, in parameter order
    inputs: Vec<Variable>,
    /// Every frame-dependent value loaded during the trace
    frame_inputs: Vec<Variable>,
    /// Values whose concrete details leaked into the generated code
    global_guarded: Vec<Variable>,
    tracked: HashMap<String, Variable>,
}

impl FunctionGraph {
    pub fn new(infer_cache: Arc<InferMetaCache>, compile_cache: Arc<CompileSirCache>, config: &JitConfig) -> Self {
        Self {
            id: GraphId(NEXT_GRAPH_ID.fetch_add(1, Ordering::Relaxed)),
            infer_cache,
            compile_cache,
            reuse_concrete_program: config.reuse_concrete_program,
            log_sir: config.log_sir,
            next_symbol: 0,
            statements: Vec::new(),
            defined: HashSet::new(),
            inputs: Vec::new(),
            frame_inputs: Vec::new(),
            global_guarded: Vec::new(),
            tracked: HashMap::new(),
        }
    }

    pub fn id(&self) -> GraphId {
        self.id
    }

    pub fn statements(&self) -> &[Statement] {
        &self.statements
    }

    pub fn frame_inputs(&self) -> &[Variable] {
        &self.frame_inputs
    }

    pub fn alloc_symbol(&mut self) -> Symbol {
        let symbol = Symbol::new(&format!("var_{}", self.next_symbol));
        self.next_symbol += 1;
        symbol
    }

    /// Variable already loaded through the frame path `key`
    pub fn tracked(&self, key: &str) -> Option<Variable> {
        self.tracked.get(key).cloned()
    }

    pub fn register_frame_input(&mut self, key: String, variable: Variable) {
        trace!(target: "symtrace::graph", path = %key, variable = %variable, "Frame input");
        self.tracked.insert(key, variable.clone());
        self.frame_inputs.push(variable);
    }

    /// Guard `variable`'s frame leaves even though it never reaches the program
    pub fn add_global_guarded(&mut self, variable: Variable) {
        if !self.global_guarded.iter().any(|v| v.same(&variable)) {
            self.global_guarded.push(variable);
        }
    }

    // === Recording ===

    fn operand_of(&mut self, op: TensorOp, variable: &Variable) -> TraceResult<(Operand, MetaOperand)> {
        if let VariableKind::Tensor(TensorVar { meta, symbol, graph }) = variable.kind() {
            if *graph != self.id {
                return Err(TraceError::Inner(format!("{} belongs to another graph", variable)));
            }
            if !self.defined.contains(symbol) && !self.inputs.iter().any(|v| v.same(variable)) {
                if !variable.tracker().is_traceable() {
                    return Err(TraceError::Inner(format!("{} has no definition", variable)));
                }
                self.inputs.push(variable.clone());
            }
            return Ok((Operand::Symbol(symbol.clone()), MetaOperand::Tensor(meta.clone())));
        }
        let value = variable
            .to_const_arg()
            .ok_or_else(|| TraceError::BreakGraph(format!("cannot pass {} to {}", variable, op)))?;
        Ok((Operand::Const(value.clone()), MetaOperand::Const(value)))
    }

    /// Record `op(args..)`, returning the symbolic result
    pub fn call_tensor_api(&mut self, op: TensorOp, args: &[Variable]) -> TraceResult<Variable> {
        let mut operands: SmallVec<[Operand; 4]> = SmallVec::new();
        let mut metas = Vec::with_capacity(args.len());
        for arg in args {
            let (operand, meta) = self.operand_of(op, arg)?;
            operands.push(operand);
            metas.push(meta);
        }
        let meta = self.infer_cache.infer(op, &metas)?;
        let output = self.alloc_symbol();
        let statement = Statement {
            op,
            inputs: operands,
            output: output.clone(),
        };
        trace!(target: "symtrace::graph", statement = %statement, meta = %meta, "Recorded statement");
        self.statements.push(statement);
        self.defined.insert(output.clone());
        Ok(Variable::new(
            VariableKind::Tensor(TensorVar {
                meta,
                symbol: output,
                graph: self.id,
            }),
            Tracker::derived(args),
        ))
    }

    /// Record `receiver.op(args..)`
    pub fn call_tensor_method(&mut self, op: TensorOp, receiver: &Variable, args: &[Variable]) -> TraceResult<Variable> {
        let mut all = Vec::with_capacity(args.len() + 1);
        all.push(receiver.clone());
        all.extend_from_slice(args);
        self.call_tensor_api(op, &all)
    }

    // === Compilation ===

    /// Compile the recorded statements and emit code that runs them.
    ///
    /// The emitted code calls the compiled program on the frame's input
    /// tensors and stores every graph output that `ret_vars` needs into its
    /// `___SIR_out_*` local. Emits nothing when no statement was recorded.
    pub fn start_compile(&self, ret_vars: &[Variable], codegen: &mut CodeGen) -> TraceResult<()> {
        let mut outputs = Vec::new();
        for variable in ret_vars {
            variable.collect_derived_tensors(&mut outputs);
        }
        if self.statements.is_empty() {
            return Ok(());
        }

        let output_symbols = outputs
            .iter()
            .map(|v| {
                v.as_tensor()
                    .map(|t| t.symbol.clone())
                    .ok_or_else(|| TraceError::Inner(format!("{} is not a tensor", v)))
            })
            .collect::<TraceResult<Vec<_>>>()?;
        let input_symbols = self
            .inputs
            .iter()
            .map(|v| {
                v.as_tensor()
                    .map(|t| t.symbol.clone())
                    .ok_or_else(|| TraceError::Inner(format!("{} is not a tensor", v)))
            })
            .collect::<TraceResult<Vec<_>>>()?;
        let sir = StatementIr {
            name: format!("SIR_{}", NEXT_SIR_ID.fetch_add(1, Ordering::Relaxed)),
            inputs: input_symbols,
            statements: self.statements.clone(),
            outputs: output_symbols.clone(),
        };
        if self.log_sir {
            debug!(target: "symtrace::graph", "{}", sir);
        }
        debug!(
            target: "symtrace::graph",
            name = %sir.name,
            statements = sir.statements.len(),
            inputs = sir.inputs.len(),
            outputs = sir.outputs.len(),
            "Compiling graph"
        );

        let compiled = self.compile_cache.get_or_compile(sir, self.reuse_concrete_program)?;
        codegen.gen_load_object(Value::Native(compiled), &next_generated_name("compiled_fn"));
        for input in &self.inputs {
            input.reconstruct(codegen)?;
        }
        codegen.gen_call_function(self.inputs.len() as u32);
        codegen.gen_unpack_sequence(output_symbols.len() as u32);
        for symbol in &output_symbols {
            codegen.gen_store_fast(&out_var_name(symbol));
        }
        Ok(())
    }

    /// Conjunction of the guards of every frame value the translation used
    pub fn guard_fn(&self) -> TraceResult<GuardExpr> {
        let mut leaves = self.frame_inputs.clone();
        for variable in &self.global_guarded {
            variable.collect_guard_leaves(&mut leaves);
        }
        let guards = leaves.iter().map(Variable::make_guard).collect::<TraceResult<Vec<_>>>()?;
        Ok(GuardExpr::all(guards))
    }

    pub fn save_memo(&self) -> GraphMemo {
        GraphMemo {
            statements: self.statements.len(),
            inputs: self.inputs.len(),
            frame_inputs: self.frame_inputs.len(),
            global_guarded: self.global_guarded.len(),
            tracked: self.tracked.clone(),
        }
    }

    pub fn restore_memo(&mut self, memo: GraphMemo) {
        for dropped in self.statements.drain(memo.statements..) {
            self.defined.remove(&dropped.output);
        }
        self.inputs.truncate(memo.inputs);
        self.frame_inputs.truncate(memo.frame_inputs);
        self.global_guarded.truncate(memo.global_guarded);
        self.tracked = memo.tracked;
    }
}
