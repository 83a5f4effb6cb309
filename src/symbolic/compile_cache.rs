//! Process-wide cache of compiled statement programs
//!
//! Entries are keyed by [`StatementIr::structural_hash`]. Each key owns a
//! slot behind its own mutex, so concurrent traces that produce the same
//! program compile it once while programs with different hashes compile in
//! parallel. A failed compilation leaves the slot empty and the next
//! request retries.
//!
//! Compiled programs re-derive the metadata of every statement from the
//! cache's [`ShapeOracle`] and check each kernel result against it, so a
//! program only runs on inputs its oracle accepts.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};

use dashmap::DashMap;
use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::error::{TraceError, TraceResult};
use crate::tensor::{execute, ConstArg, MetaInfo, MetaOperand, OpArg, ReferenceOracle, ShapeOracle, Tensor, TensorOp};
use crate::vm::{NativeFunction, Value, VmError, VmResult};

use super::sir::{Operand, StatementIr, Symbol};

static GLOBAL_COMPILE_CACHE: LazyLock<Arc<CompileSirCache>> = LazyLock::new(|| Arc::new(CompileSirCache::new()));

#[derive(Debug, Clone)]
enum Slot {
    Reg(usize),
    Const(ConstArg),
}

#[derive(Debug, Clone)]
struct LoweredStatement {
    op: TensorOp,
    args: SmallVec<[Slot; 4]>,
}

/// Output metadata of every statement for one set of input metadata
#[derive(Debug, Clone)]
struct ConcreteProgram {
    input_metas: Vec<MetaInfo>,
    statement_metas: Vec<MetaInfo>,
}

/// A compiled statement program, callable from guest code.
///
/// Takes the program's input tensors positionally and returns a tuple of
/// its outputs.
pub struct CompiledSir {
    sir: Arc<StatementIr>,
    num_inputs: usize,
    program: Vec<LoweredStatement>,
    outputs: Vec<usize>,
    reuse_concrete_program: bool,
    oracle: Arc<dyn ShapeOracle>,
    concrete: Mutex<Option<Arc<ConcreteProgram>>>,
    calls: AtomicU64,
    specializations: AtomicU64,
}

impl CompiledSir {
    /// Lower `sir` into register form, specialized with the reference oracle
    pub fn compile(sir: StatementIr, reuse_concrete_program: bool) -> TraceResult<Self> {
        Self::compile_with_oracle(sir, reuse_concrete_program, Arc::new(ReferenceOracle))
    }

    pub fn compile_with_oracle(
        sir: StatementIr,
        reuse_concrete_program: bool,
        oracle: Arc<dyn ShapeOracle>,
    ) -> TraceResult<Self> {
        sir.validate()?;
        let mut registers: std::collections::HashMap<&Symbol, usize> = std::collections::HashMap::new();
        for (index, symbol) in sir.inputs.iter().enumerate() {
            registers.insert(symbol, index);
        }
        let mut program = Vec::with_capacity(sir.statements.len());
        for statement in &sir.statements {
            let args = statement
                .inputs
                .iter()
                .map(|operand| match operand {
                    Operand::Symbol(symbol) => registers
                        .get(symbol)
                        .copied()
                        .map(Slot::Reg)
                        .ok_or_else(|| TraceError::Inner(format!("unbound symbol {}", symbol))),
                    Operand::Const(value) => Ok(Slot::Const(value.clone())),
                })
                .collect::<TraceResult<SmallVec<[Slot; 4]>>>()?;
            let next = registers.len();
            registers.insert(&statement.output, next);
            program.push(LoweredStatement { op: statement.op, args });
        }
        let outputs = sir
            .outputs
            .iter()
            .map(|symbol| {
                registers
                    .get(symbol)
                    .copied()
                    .ok_or_else(|| TraceError::Inner(format!("unbound output {}", symbol)))
            })
            .collect::<TraceResult<Vec<_>>>()?;

        Ok(Self {
            num_inputs: sir.inputs.len(),
            sir: Arc::new(sir),
            program,
            outputs,
            reuse_concrete_program,
            oracle,
            concrete: Mutex::new(None),
            calls: AtomicU64::new(0),
            specializations: AtomicU64::new(0),
        })
    }

    /// The program this was compiled from, kept for diagnostics
    pub fn sir(&self) -> &Arc<StatementIr> {
        &self.sir
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    /// Number of times a concrete specialization was derived
    pub fn specializations(&self) -> u64 {
        self.specializations.load(Ordering::Relaxed)
    }

    fn specialize(&self, input_metas: Vec<MetaInfo>) -> TraceResult<ConcreteProgram> {
        let mut metas: Vec<MetaInfo> = input_metas.clone();
        let mut statement_metas = Vec::with_capacity(self.program.len());
        for statement in &self.program {
            let operands: Vec<MetaOperand> = statement
                .args
                .iter()
                .map(|slot| match slot {
                    Slot::Reg(index) => MetaOperand::Tensor(metas[*index].clone()),
                    Slot::Const(value) => MetaOperand::Const(value.clone()),
                })
                .collect();
            let meta = self.oracle.infer(statement.op, &operands)?;
            metas.push(meta.clone());
            statement_metas.push(meta);
        }
        self.specializations.fetch_add(1, Ordering::Relaxed);
        Ok(ConcreteProgram {
            input_metas,
            statement_metas,
        })
    }

    /// Concrete specialization for these inputs
    fn concrete_program(&self, inputs: &[Arc<Tensor>]) -> TraceResult<Arc<ConcreteProgram>> {
        let input_metas: Vec<MetaInfo> = inputs.iter().map(|t| t.meta()).collect();
        if self.reuse_concrete_program {
            let mut cached = self.concrete.lock();
            if let Some(program) = cached.as_ref().filter(|p| p.input_metas == input_metas) {
                return Ok(program.clone());
            }
            let program = Arc::new(self.specialize(input_metas)?);
            *cached = Some(program.clone());
            return Ok(program);
        }
        Ok(Arc::new(self.specialize(input_metas)?))
    }

    /// Run the program on concrete tensors
    pub fn run(&self, inputs: Vec<Arc<Tensor>>) -> TraceResult<Vec<Arc<Tensor>>> {
        if inputs.len() != self.num_inputs {
            return Err(TraceError::Inner(format!(
                "{} expects {} inputs, got {}",
                self.sir.name,
                self.num_inputs,
                inputs.len()
            )));
        }
        self.calls.fetch_add(1, Ordering::Relaxed);
        let concrete = self.concrete_program(&inputs)?;
        trace!(
            target: "symtrace::cache",
            sir = %self.sir.name,
            statements = concrete.statement_metas.len(),
            "Running compiled program"
        );

        let mut registers = inputs;
        registers.reserve(self.program.len());
        for (statement, expected) in self.program.iter().zip(&concrete.statement_metas) {
            let args: Vec<OpArg> = statement
                .args
                .iter()
                .map(|slot| match slot {
                    Slot::Reg(index) => OpArg::Tensor(registers[*index].clone()),
                    Slot::Const(value) => OpArg::Const(value.clone()),
                })
                .collect();
            let result = execute(statement.op, &args)?;
            if !conforms(&result, expected) {
                return Err(TraceError::Inner(format!(
                    "{}: {} produced {} where {} was inferred",
                    self.sir.name,
                    statement.op,
                    result.meta(),
                    expected
                )));
            }
            registers.push(Arc::new(result));
        }
        Ok(self.outputs.iter().map(|&index| registers[index].clone()).collect())
    }
}

/// Dynamic (`-1`) extents match any size
fn conforms(tensor: &Tensor, meta: &MetaInfo) -> bool {
    tensor.dtype() == meta.dtype
        && tensor.ndim() == meta.shape.len()
        && tensor
            .shape()
            .iter()
            .zip(&meta.shape)
            .all(|(&actual, &inferred)| inferred < 0 || actual as i64 == inferred)
}

impl NativeFunction for CompiledSir {
    fn name(&self) -> &str {
        &self.sir.name
    }

    fn call(&self, args: Vec<Value>) -> VmResult<Value> {
        let inputs = args
            .into_iter()
            .map(|arg| match arg {
                Value::Tensor(t) => Ok(t),
                other => Err(VmError::TypeError(format!(
                    "{} expects tensor inputs, got {}",
                    self.sir.name,
                    other.type_name()
                ))),
            })
            .collect::<VmResult<Vec<_>>>()?;
        let outputs = self.run(inputs).map_err(|e| match e {
            TraceError::Backend(e) => VmError::Tensor(e),
            TraceError::Vm(e) => e,
            other => VmError::Runtime(other.to_string()),
        })?;
        Ok(Value::tuple(outputs.into_iter().map(Value::Tensor).collect()))
    }
}

impl fmt::Debug for CompiledSir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledSir")
            .field("name", &self.sir.name)
            .field("statements", &self.program.len())
            .field("reuse_concrete_program", &self.reuse_concrete_program)
            .finish()
    }
}

/// Hit, miss and compilation counters
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CompileCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub compilations: u64,
    pub failures: u64,
}

type CompileSlot = Arc<Mutex<Option<Arc<CompiledSir>>>>;

pub struct CompileSirCache {
    oracle: Arc<dyn ShapeOracle>,
    slots: DashMap<(u64, bool), CompileSlot>,
    hits: AtomicU64,
    misses: AtomicU64,
    compilations: AtomicU64,
    failures: AtomicU64,
}

impl Default for CompileSirCache {
    fn default() -> Self {
        Self::with_oracle(Arc::new(ReferenceOracle))
    }
}

impl CompileSirCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache whose programs specialize through `oracle`
    pub fn with_oracle(oracle: Arc<dyn ShapeOracle>) -> Self {
        Self {
            oracle,
            slots: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            compilations: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    /// The cache shared by every translator in the process
    pub fn global() -> Arc<CompileSirCache> {
        GLOBAL_COMPILE_CACHE.clone()
    }

    /// Compiled program for `sir`, compiling it on first request.
    ///
    /// At most one compilation succeeds per structural hash; callers racing
    /// on the same hash wait for the first and share its result.
    pub fn get_or_compile(&self, sir: StatementIr, reuse_concrete_program: bool) -> TraceResult<Arc<CompiledSir>> {
        let key = (sir.structural_hash(), reuse_concrete_program);
        let slot = self.slots.entry(key).or_default().value().clone();
        let mut guard = slot.lock();
        if let Some(compiled) = guard.as_ref() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!(target: "symtrace::cache", sir = %sir.name, hash = key.0, "Compile cache hit");
            return Ok(compiled.clone());
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let name = sir.name.clone();
        match CompiledSir::compile_with_oracle(sir, reuse_concrete_program, self.oracle.clone()) {
            Ok(compiled) => {
                let compiled = Arc::new(compiled);
                self.compilations.fetch_add(1, Ordering::Relaxed);
                debug!(target: "symtrace::cache", sir = %name, hash = key.0, "Compiled statement program");
                *guard = Some(compiled.clone());
                Ok(compiled)
            }
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                debug!(target: "symtrace::cache", sir = %name, error = %e, "Compilation failed");
                Err(e)
            }
        }
    }

    /// Number of successfully compiled programs
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|entry| entry.value().lock().is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CompileCacheStats {
        CompileCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            compilations: self.compilations.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }

    pub fn clear(&self) {
        self.slots.clear();
    }
}

impl fmt::Debug for CompileSirCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompileSirCache")
            .field("entries", &self.slots.len())
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbolic::sir::Statement;
    use crate::tensor::DType;
    use crate::tensor::{TensorResult, DYNAMIC_DIM};
    use smallvec::smallvec;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    /// Reference answers, counted
    struct CountingOracle(AtomicUsize);

    impl ShapeOracle for CountingOracle {
        fn infer(&self, op: TensorOp, inputs: &[MetaOperand]) -> TensorResult<MetaInfo> {
            self.0.fetch_add(1, Ordering::SeqCst);
            ReferenceOracle.infer(op, inputs)
        }
    }

    /// Claims every output has one extra element
    struct OffByOneOracle;

    impl ShapeOracle for OffByOneOracle {
        fn infer(&self, op: TensorOp, inputs: &[MetaOperand]) -> TensorResult<MetaInfo> {
            let mut meta = ReferenceOracle.infer(op, inputs)?;
            if let Some(first) = meta.shape.first_mut() {
                *first += 1;
            }
            Ok(meta)
        }
    }

    fn program(op: TensorOp, prefix: &str) -> StatementIr {
        let x = Symbol::new(&format!("{}_x", prefix));
        let y = Symbol::new(&format!("{}_y", prefix));
        StatementIr {
            name: format!("SIR_{}", prefix),
            inputs: vec![x.clone()],
            statements: vec![Statement {
                op,
                inputs: smallvec![Operand::Symbol(x), Operand::Const(ConstArg::Int(1))],
                output: y.clone(),
            }],
            outputs: vec![y],
        }
    }

    fn tensor(values: &[f64]) -> Arc<Tensor> {
        Arc::new(Tensor::from_vec(values.to_vec(), &[values.len()], DType::Float32).expect("tensor"))
    }

    #[test]
    fn test_identical_programs_share_one_entry() {
        let cache = CompileSirCache::new();
        let a = cache.get_or_compile(program(TensorOp::Add, "a"), false).expect("compiles");
        let b = cache.get_or_compile(program(TensorOp::Add, "b"), false).expect("compiles");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);

        cache.get_or_compile(program(TensorOp::Subtract, "c"), false).expect("compiles");
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.stats().compilations, 2);
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn test_concurrent_requests_compile_once() {
        let cache = Arc::new(CompileSirCache::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let cache = cache.clone();
                thread::spawn(move || {
                    cache
                        .get_or_compile(program(TensorOp::Multiply, &format!("t{}", i)), false)
                        .expect("compiles")
                })
            })
            .collect();
        let compiled: Vec<_> = handles.into_iter().map(|h| h.join().expect("thread")).collect();
        assert!(compiled.iter().all(|c| Arc::ptr_eq(c, &compiled[0])));
        assert_eq!(cache.stats().compilations, 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_failures_are_not_cached() {
        let cache = CompileSirCache::new();
        let mut broken = program(TensorOp::Add, "bad");
        broken.outputs.push(Symbol::new("ghost"));
        assert!(cache.get_or_compile(broken.clone(), false).is_err());
        assert!(cache.get_or_compile(broken, false).is_err());
        assert_eq!(cache.stats().failures, 2);
        assert_eq!(cache.stats().compilations, 0);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_compiled_program_runs() {
        let compiled = CompiledSir::compile(program(TensorOp::Add, "run"), false).expect("compiles");
        let out = compiled
            .call(vec![Value::Tensor(tensor(&[1.0, 2.0]))])
            .expect("runs");
        let Value::Tuple(items) = out else {
            panic!("expected a tuple, got {:?}", out);
        };
        assert_eq!(items[0].as_tensor().map(|t| t.data().to_vec()), Some(vec![2.0, 3.0]));
        assert!(compiled.call(vec![Value::Int(1)]).is_err());
    }

    #[test]
    fn test_specialization_policy() {
        let every_call = CompiledSir::compile(program(TensorOp::Add, "p1"), false).expect("compiles");
        let reuse = CompiledSir::compile(program(TensorOp::Add, "p2"), true).expect("compiles");
        for _ in 0..3 {
            every_call.run(vec![tensor(&[1.0])]).expect("runs");
            reuse.run(vec![tensor(&[1.0])]).expect("runs");
        }
        assert_eq!(every_call.specializations(), 3);
        assert_eq!(reuse.specializations(), 1);

        reuse.run(vec![tensor(&[1.0, 2.0])]).expect("runs");
        assert_eq!(reuse.specializations(), 2);
        assert_eq!(reuse.calls(), 4);
    }

    #[test]
    fn test_programs_specialize_through_the_cache_oracle() {
        let oracle = Arc::new(CountingOracle(AtomicUsize::new(0)));
        let cache = CompileSirCache::with_oracle(oracle.clone());
        let compiled = cache.get_or_compile(program(TensorOp::Add, "o"), false).expect("compiles");
        compiled.run(vec![tensor(&[1.0, 2.0])]).expect("runs");
        compiled.run(vec![tensor(&[3.0])]).expect("runs");
        assert_eq!(oracle.0.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_results_must_match_the_specialization() {
        let compiled = CompiledSir::compile_with_oracle(program(TensorOp::Add, "off"), false, Arc::new(OffByOneOracle))
            .expect("compiles");
        let err = compiled.run(vec![tensor(&[1.0, 2.0])]).expect_err("shape disagrees");
        assert!(matches!(err, TraceError::Inner(_)));
    }

    #[test]
    fn test_dynamic_extents_conform_to_any_size() {
        let meta = MetaInfo::new([DYNAMIC_DIM, 1], DType::Int64, true);
        let found = Tensor::from_vec(vec![1.0, 3.0], &[2, 1], DType::Int64).expect("tensor");
        assert!(conforms(&found, &meta));
        let wrong_rank = Tensor::from_vec(vec![1.0, 3.0], &[2], DType::Int64).expect("tensor");
        assert!(!conforms(&wrong_rank, &meta));
    }
}
