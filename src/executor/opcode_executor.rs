//! Symbolic execution of guest bytecode
//!
//! The executor walks a function's instructions over [`Variable`]s instead
//! of values. Tensor operations are recorded into the [`FunctionGraph`];
//! everything else is folded at trace time when its operands are known.
//! Anything the trace cannot express raises a graph break, which is turned
//! into generated code by the emitters in `breaks.rs`.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::bytecode::opcodes::{BINARY, INPLACE};
use crate::bytecode::{get_instructions, ArgVal, CodeGen, CodeObject, CompareOp, InstrId, Instruction, Opcode};
use crate::error::{TraceError, TraceResult};
use crate::tensor::{TensorOp, DYNAMIC_DIM};
use crate::vm::{arithmetic, builtins, Builtin, Function, ModuleRegistry, SliceValue, Value, VmError};

use super::function_graph::{FunctionGraph, GraphMemo};
use super::guard::GuardExpr;
use super::tracker::Tracker;
use super::variables::{IterVar, Variable, VariableFactory, VariableKind};
use super::TraceContext;

/// Result of translating one function
#[derive(Debug)]
pub struct Translation {
    pub code: Arc<CodeObject>,
    /// Holds for every frame the code is valid for
    pub guard: GuardExpr,
    /// Whether the code hands control to generated resume functions
    pub graph_break: bool,
    /// Statements recorded into the compiled program
    pub statements: usize,
}

pub(super) enum Flow {
    Continue,
    Return(Variable),
}

/// Executor state restored when a loop iteration is rolled back
#[derive(Clone)]
pub(super) struct Snapshot {
    stack: Vec<Variable>,
    locals: HashMap<String, Variable>,
    cells: HashMap<String, Variable>,
    written_cells: BTreeSet<String>,
    pending_params: HashMap<String, Value>,
    graph: GraphMemo,
}

/// A `for` loop being unrolled
pub(super) struct LoopFrame {
    pub for_iter: usize,
    pub exit: usize,
    /// Iterations started so far, minus one
    pub iteration: usize,
    /// State at the start of the current iteration's `FOR_ITER`
    pub snapshot: Snapshot,
}

pub struct OpcodeExecutor {
    pub(super) function: Arc<Function>,
    pub(super) code: Arc<CodeObject>,
    pub(super) instructions: Vec<Instruction>,
    targets: HashMap<InstrId, usize>,
    pub(super) graph: FunctionGraph,
    modules: Arc<ModuleRegistry>,
    pub(super) stack: Vec<Variable>,
    pub(super) locals: HashMap<String, Variable>,
    /// Cell and free variables with a symbolic value
    pub(super) cells: HashMap<String, Variable>,
    /// Cells assigned during the trace
    pub(super) written_cells: BTreeSet<String>,
    /// Parameters not yet loaded; classified on first use
    pub(super) pending_params: HashMap<String, Value>,
    pc: usize,
    pub(super) loops: Vec<LoopFrame>,
    steps: usize,
    max_steps: usize,
    pub(super) spills: usize,
}

impl OpcodeExecutor {
    pub fn new(function: Arc<Function>, args: &[Value], ctx: &TraceContext) -> TraceResult<Self> {
        let code = function.code.clone();
        let instructions = get_instructions(&code)?;
        let targets = instructions.iter().enumerate().map(|(i, instr)| (instr.id, i)).collect();
        let params = bind_params(&function, args)?;
        let pending_params = code.varnames.iter().cloned().zip(params).collect();

        Ok(Self {
            graph: FunctionGraph::new(ctx.infer_cache.clone(), ctx.compile_cache.clone(), &ctx.config),
            modules: ctx.modules.clone(),
            function,
            code,
            instructions,
            targets,
            stack: Vec::new(),
            locals: HashMap::new(),
            cells: HashMap::new(),
            written_cells: BTreeSet::new(),
            pending_params,
            pc: 0,
            loops: Vec::new(),
            steps: 0,
            max_steps: ctx.config.max_trace_steps,
            spills: 0,
        })
    }

    /// Trace the function and generate its replacement code
    pub fn transform(mut self) -> TraceResult<Translation> {
        debug!(target: "symtrace::executor", code = %self.code.name, "Start translation");
        loop {
            let index = self.pc;
            let saved_stack = self.stack.clone();
            match self.step() {
                Ok(Flow::Continue) => {}
                Ok(Flow::Return(value)) => {
                    let codegen = self.emit_return(value)?;
                    return self.finish(codegen, false);
                }
                Err(TraceError::BreakGraph(reason)) => {
                    self.stack = saved_stack;
                    let codegen = self.handle_break(index, &reason)?;
                    return self.finish(codegen, true);
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn finish(&mut self, mut codegen: CodeGen, graph_break: bool) -> TraceResult<Translation> {
        let code = codegen.gen_code()?;
        let guard = self.graph.guard_fn()?;
        debug!(
            target: "symtrace::executor",
            code = %self.code.name,
            statements = self.graph.statements().len(),
            graph_break,
            guard = %guard,
            "Translated"
        );
        trace!(target: "symtrace::executor", "\n{}", code.disassemble());
        Ok(Translation {
            code,
            guard,
            graph_break,
            statements: self.graph.statements().len(),
        })
    }

    // === State ===

    pub(super) fn snapshot(&self) -> Snapshot {
        Snapshot {
            stack: self.stack.clone(),
            locals: self.locals.clone(),
            cells: self.cells.clone(),
            written_cells: self.written_cells.clone(),
            pending_params: self.pending_params.clone(),
            graph: self.graph.save_memo(),
        }
    }

    pub(super) fn restore(&mut self, snapshot: Snapshot) {
        self.stack = snapshot.stack;
        self.locals = snapshot.locals;
        self.cells = snapshot.cells;
        self.written_cells = snapshot.written_cells;
        self.pending_params = snapshot.pending_params;
        self.graph.restore_memo(snapshot.graph);
    }

    fn push(&mut self, variable: Variable) {
        self.stack.push(variable);
    }

    fn pop(&mut self) -> TraceResult<Variable> {
        self.stack
            .pop()
            .ok_or_else(|| TraceError::Inner(format!("stack underflow in {}", self.code.name)))
    }

    fn pop_n(&mut self, n: usize) -> TraceResult<Vec<Variable>> {
        if self.stack.len() < n {
            return Err(TraceError::Inner(format!("stack underflow in {}", self.code.name)));
        }
        Ok(self.stack.split_off(self.stack.len() - n))
    }

    fn peek(&self) -> TraceResult<&Variable> {
        self.stack
            .last()
            .ok_or_else(|| TraceError::Inner(format!("empty stack in {}", self.code.name)))
    }

    pub(super) fn target_of(&self, instr: &Instruction) -> TraceResult<usize> {
        instr
            .jump_to
            .and_then(|id| self.targets.get(&id).copied())
            .ok_or_else(|| TraceError::Inner(format!("{} has no jump target", instr.opcode)))
    }

    fn name_of(instr: &Instruction) -> TraceResult<&str> {
        instr
            .argval
            .name()
            .ok_or_else(|| TraceError::Inner(format!("{} without a name", instr.opcode)))
    }

    /// Current value of a local, classifying parameters on first use
    fn load_local(&mut self, name: &str) -> TraceResult<Option<Variable>> {
        if let Some(variable) = self.locals.get(name) {
            return Ok(Some(variable.clone()));
        }
        let Some(value) = self.pending_params.remove(name) else {
            return Ok(None);
        };
        let variable = VariableFactory::from_value(&value, &mut self.graph, Tracker::Local(name.to_string()))?;
        self.locals.insert(name.to_string(), variable.clone());
        Ok(Some(variable))
    }

    fn is_cellvar(&self, name: &str) -> bool {
        self.code.cellvars.iter().any(|n| n == name)
    }

    // === Dispatch ===

    pub(super) fn step(&mut self) -> TraceResult<Flow> {
        let index = self.pc;
        let instr = self
            .instructions
            .get(index)
            .cloned()
            .ok_or_else(|| TraceError::Inner(format!("fell off the end of {}", self.code.name)))?;
        self.steps += 1;
        if self.steps > self.max_steps {
            let reason = format!("trace exceeded {} steps", self.max_steps);
            return Err(if self.loops.is_empty() {
                TraceError::NotImplemented(reason)
            } else {
                TraceError::BreakGraph(reason)
            });
        }
        trace!(
            target: "symtrace::executor::step",
            index,
            opcode = %instr.opcode,
            depth = self.stack.len()
        );

        let mut next = index + 1;
        match instr.opcode {
            Opcode::Nop => {}
            Opcode::PopTop => {
                self.pop()?;
            }
            Opcode::RotTwo => {
                let top = self.pop_n(2)?;
                self.push(top[1].clone());
                self.push(top[0].clone());
            }
            Opcode::RotThree => {
                let top = self.pop_n(3)?;
                self.push(top[2].clone());
                self.push(top[0].clone());
                self.push(top[1].clone());
            }
            Opcode::DupTop => {
                let top = self.peek()?.clone();
                self.push(top);
            }
            Opcode::PushNull => self.push(Variable::dummy()),

            Opcode::UnaryPositive | Opcode::UnaryNegative | Opcode::UnaryNot | Opcode::UnaryInvert => {
                let a = self.pop()?;
                let result = self.unary(instr.opcode, a)?;
                self.push(result);
            }
            Opcode::BinarySubscr => {
                let key = self.pop()?;
                let container = self.pop()?;
                let result = self.subscript(&container, &key)?;
                self.push(result);
            }
            op if op.in_set(BINARY) || op.in_set(INPLACE) => {
                let b = self.pop()?;
                let a = self.pop()?;
                let result = self.binary(op, a, b)?;
                self.push(result);
            }
            Opcode::CompareOp => {
                let ArgVal::Compare(op) = instr.argval else {
                    return Err(TraceError::Inner("COMPARE_OP without a comparison".into()));
                };
                let b = self.pop()?;
                let a = self.pop()?;
                let result = self.compare(op, a, b)?;
                self.push(result);
            }
            Opcode::StoreSubscr => {
                let top = self.pop_n(3)?;
                self.store_subscr(&top[0], &top[1], &top[2])?;
            }

            Opcode::GetIter => {
                let value = self.pop()?;
                let iterator = self.get_iter(value)?;
                self.push(iterator);
            }
            Opcode::ForIter => {
                let exit = self.target_of(&instr)?;
                if let Some(target) = self.for_iter(index, exit)? {
                    next = target;
                }
            }
            Opcode::ReturnValue => return Ok(Flow::Return(self.pop()?)),

            Opcode::UnpackSequence => {
                let sequence = self.pop()?;
                let items = self.unpack(&sequence)?;
                if items.len() != instr.argval.count() as usize {
                    return Err(TraceError::BreakGraph(format!(
                        "unpacking {} values into {}",
                        items.len(),
                        instr.argval.count()
                    )));
                }
                self.stack.extend(items.into_iter().rev());
            }
            Opcode::UnpackEx => {
                let arg = instr.argval.count();
                let (before, after) = ((arg & 0xFF) as usize, (arg >> 8) as usize);
                let sequence = self.pop()?;
                let items = self.unpack(&sequence)?;
                if items.len() < before + after {
                    return Err(TraceError::BreakGraph(format!(
                        "unpacking {} values into at least {}",
                        items.len(),
                        before + after
                    )));
                }
                let middle = Variable::new(
                    VariableKind::List(items[before..items.len() - after].to_vec()),
                    Tracker::derived(std::slice::from_ref(&sequence)),
                );
                let mut unpacked: Vec<Variable> = items[..before].to_vec();
                unpacked.push(middle);
                unpacked.extend_from_slice(&items[items.len() - after..]);
                self.stack.extend(unpacked.into_iter().rev());
            }

            Opcode::LoadConst => {
                let ArgVal::Const(value) = &instr.argval else {
                    return Err(TraceError::Inner("LOAD_CONST without a constant".into()));
                };
                let variable = VariableFactory::from_value(value, &mut self.graph, Tracker::Const(value.clone()))?;
                self.push(variable);
            }
            Opcode::LoadFast => {
                let name = Self::name_of(&instr)?;
                let variable = self
                    .load_local(name)?
                    .ok_or_else(|| TraceError::BreakGraph(format!("local '{}' referenced before assignment", name)))?;
                self.push(variable);
            }
            Opcode::StoreFast => {
                let name = Self::name_of(&instr)?.to_string();
                let value = self.pop()?;
                self.pending_params.remove(&name);
                self.locals.insert(name, value);
            }
            Opcode::DeleteFast => {
                let name = Self::name_of(&instr)?;
                if self.locals.remove(name).is_none() && self.pending_params.remove(name).is_none() {
                    return Err(TraceError::BreakGraph(format!("deleting unbound local '{}'", name)));
                }
            }
            Opcode::LoadGlobal | Opcode::LoadName => {
                let variable = self.load_global(Self::name_of(&instr)?)?;
                self.push(variable);
            }
            Opcode::StoreGlobal => {
                return Err(TraceError::BreakGraph(format!(
                    "assignment to global '{}'",
                    Self::name_of(&instr)?
                )));
            }
            Opcode::LoadClosure => {
                let name = Self::name_of(&instr)?;
                self.push(Variable::closure(name));
            }
            Opcode::LoadDeref | Opcode::LoadClassDeref => {
                let variable = self.load_deref(Self::name_of(&instr)?)?;
                self.push(variable);
            }
            Opcode::StoreDeref => {
                let name = Self::name_of(&instr)?.to_string();
                let value = self.pop()?;
                self.written_cells.insert(name.clone());
                self.cells.insert(name, value);
            }

            Opcode::LoadAttr => {
                let owner = self.pop()?;
                let attr = self.load_attr(&owner, Self::name_of(&instr)?)?;
                self.push(attr);
            }
            Opcode::LoadMethod => {
                let owner = self.pop()?;
                let method = self.load_attr(&owner, Self::name_of(&instr)?)?;
                self.push(Variable::dummy());
                self.push(method);
            }
            Opcode::StoreAttr => {
                return Err(TraceError::BreakGraph(format!(
                    "attribute assignment '{}'",
                    Self::name_of(&instr)?
                )));
            }
            Opcode::ImportName => {
                self.pop_n(2)?;
                let name = Self::name_of(&instr)?;
                let module = self
                    .modules
                    .get(name)
                    .ok_or_else(|| TraceError::BreakGraph(format!("import of unknown module '{}'", name)))?;
                let value = Value::Module(module.clone());
                self.push(Variable::new(VariableKind::Module(module), Tracker::Const(value)));
            }
            Opcode::ImportFrom => {
                let module = self.peek()?.clone();
                let attr = self.load_attr(&module, Self::name_of(&instr)?)?;
                self.push(attr);
            }

            Opcode::BuildTuple => {
                let items = self.pop_n(instr.argval.count() as usize)?;
                let tracker = Tracker::derived(&items);
                self.push(Variable::new(VariableKind::Tuple(items), tracker));
            }
            Opcode::BuildList => {
                let items = self.pop_n(instr.argval.count() as usize)?;
                let tracker = Tracker::derived(&items);
                self.push(Variable::new(VariableKind::List(items), tracker));
            }
            Opcode::BuildMap => {
                let flat = self.pop_n(2 * instr.argval.count() as usize)?;
                let tracker = Tracker::derived(&flat);
                let pairs = flat.chunks_exact(2).map(|kv| (kv[0].clone(), kv[1].clone())).collect();
                self.push(Variable::new(VariableKind::Dict(pairs), tracker));
            }
            Opcode::BuildSlice => {
                let parts = self.pop_n(instr.argval.count() as usize)?;
                let slice = self.build_slice(parts)?;
                self.push(slice);
            }

            Opcode::JumpForward | Opcode::JumpAbsolute => {
                next = self.target_of(&instr)?;
            }
            Opcode::PopJumpIfFalse | Opcode::PopJumpIfTrue => {
                let cond = self.pop()?;
                if self.truth(&cond)? == (instr.opcode == Opcode::PopJumpIfTrue) {
                    next = self.target_of(&instr)?;
                }
            }
            Opcode::JumpIfFalseOrPop | Opcode::JumpIfTrueOrPop => {
                let cond = self.peek()?.clone();
                if self.truth(&cond)? == (instr.opcode == Opcode::JumpIfTrueOrPop) {
                    next = self.target_of(&instr)?;
                } else {
                    self.pop()?;
                }
            }

            Opcode::CallFunction => {
                let args = self.pop_n(instr.argval.count() as usize)?;
                let callable = self.pop()?;
                let result = self.call(&callable, args)?;
                self.push(result);
            }
            Opcode::CallMethod => {
                let args = self.pop_n(instr.argval.count() as usize)?;
                let callable = self.pop()?;
                self.pop()?;
                let result = self.call(&callable, args)?;
                self.push(result);
            }
            Opcode::MakeFunction => {
                return Err(TraceError::BreakGraph("function definition".into()));
            }

            other => {
                return Err(TraceError::NotImplemented(format!("opcode {}", other.mnemonic())));
            }
        }

        self.pc = next;
        while let Some(frame) = self.loops.last() {
            if (frame.for_iter..frame.exit).contains(&self.pc) {
                break;
            }
            self.loops.pop();
        }
        Ok(Flow::Continue)
    }

    // === Names ===

    fn load_global(&mut self, name: &str) -> TraceResult<Variable> {
        if let Some(value) = self.function.globals.get(name) {
            return VariableFactory::from_value(&value, &mut self.graph, Tracker::Global(name.to_string()));
        }
        match Builtin::lookup(name) {
            Some(builtin) => {
                VariableFactory::from_value(&Value::Builtin(builtin), &mut self.graph, Tracker::Builtin(name.to_string()))
            }
            None => Err(TraceError::BreakGraph(format!("name '{}' is not defined", name))),
        }
    }

    fn load_deref(&mut self, name: &str) -> TraceResult<Variable> {
        if let Some(variable) = self.cells.get(name) {
            return Ok(variable.clone());
        }
        let unbound = || TraceError::BreakGraph(format!("cell '{}' referenced before assignment", name));
        let variable = if self.is_cellvar(name) {
            // A cell that is also a parameter starts out holding the argument.
            self.load_local(name)?.ok_or_else(unbound)?
        } else {
            let value = self
                .function
                .free_cell(name)
                .and_then(|cell| cell.get())
                .ok_or_else(unbound)?;
            VariableFactory::from_value(&value, &mut self.graph, Tracker::Deref(name.to_string()))?
        };
        self.cells.insert(name.to_string(), variable.clone());
        Ok(variable)
    }

    // === Attributes ===

    fn load_attr(&mut self, owner: &Variable, name: &str) -> TraceResult<Variable> {
        let missing = || TraceError::BreakGraph(format!("{} has no attribute '{}'", owner, name));
        match owner.kind() {
            VariableKind::Tensor(_) => self.tensor_attr(owner, name),
            VariableKind::Module(module) => {
                let value = module.get(name).ok_or_else(missing)?;
                VariableFactory::from_value(&value, &mut self.graph, Tracker::attr(owner, name))
            }
            VariableKind::Object(Value::Object(object)) => {
                let value = object.get(name).ok_or_else(missing)?;
                VariableFactory::from_value(&value, &mut self.graph, Tracker::attr(owner, name))
            }
            _ => Err(TraceError::BreakGraph(format!("attribute '{}' of {}", name, owner))),
        }
    }

    fn tensor_attr(&mut self, tensor: &Variable, name: &str) -> TraceResult<Variable> {
        let meta = tensor
            .as_tensor()
            .map(|t| t.meta.clone())
            .ok_or_else(|| TraceError::Inner(format!("{} is not a tensor", tensor)))?;
        let derived = Tracker::derived(std::slice::from_ref(tensor));
        match name {
            "shape" => {
                if meta.is_dynamic_shape() {
                    return Err(TraceError::BreakGraph("shape of a tensor with dynamic dimensions".into()));
                }
                self.graph.add_global_guarded(tensor.clone());
                let dims = meta
                    .shape
                    .iter()
                    .map(|&d| Variable::constant(Value::Int(d), derived.clone()))
                    .collect();
                Ok(Variable::new(VariableKind::List(dims), derived))
            }
            "size" => {
                let numel = meta
                    .numel()
                    .ok_or_else(|| TraceError::BreakGraph("size of a tensor with dynamic dimensions".into()))?;
                self.graph.add_global_guarded(tensor.clone());
                Ok(Variable::constant(Value::Int(numel as i64), derived))
            }
            "ndim" => {
                self.graph.add_global_guarded(tensor.clone());
                Ok(Variable::constant(Value::Int(meta.ndim() as i64), derived))
            }
            "dtype" | "stop_gradient" => {
                let value = match name {
                    "dtype" => Value::str(meta.dtype.name()),
                    _ => Value::Bool(meta.stop_gradient),
                };
                if tensor.tracker().is_traceable() {
                    VariableFactory::from_value(&value, &mut self.graph, Tracker::attr(tensor, name))
                } else {
                    self.graph.add_global_guarded(tensor.clone());
                    Ok(Variable::constant(value, derived))
                }
            }
            "T" => self.graph.call_tensor_api(TensorOp::Transpose, std::slice::from_ref(tensor)),
            _ => match TensorOp::from_method_name(name) {
                Some(op) => Ok(Variable::new(
                    VariableKind::TensorMethod {
                        receiver: tensor.clone(),
                        op,
                    },
                    derived,
                )),
                None => Err(TraceError::Inner(format!("unknown tensor attribute '{}'", name))),
            },
        }
    }

    // === Operators ===

    /// Evaluate a guest operation on known values, breaking if it raises
    fn fold(&mut self, inputs: &[Variable], op: impl FnOnce(&[Value]) -> Result<Value, VmError>) -> TraceResult<Variable> {
        let values = inputs
            .iter()
            .map(Variable::to_value)
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| {
                TraceError::BreakGraph(format!(
                    "operation on symbolic values [{}]",
                    inputs.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(", ")
                ))
            })?;
        let result = op(&values).map_err(|e| TraceError::BreakGraph(format!("guest error: {}", e)))?;
        VariableFactory::from_value(&result, &mut self.graph, Tracker::derived(inputs))
    }

    fn unary(&mut self, opcode: Opcode, a: Variable) -> TraceResult<Variable> {
        if a.is_tensor() {
            return match opcode {
                Opcode::UnaryPositive => Ok(a),
                Opcode::UnaryNegative => self.graph.call_tensor_api(TensorOp::Negative, &[a]),
                _ => Err(TraceError::BreakGraph(format!("{} on a tensor", opcode.mnemonic()))),
            };
        }
        self.fold(&[a], |v| arithmetic::unary_op(opcode, &v[0]))
    }

    fn binary(&mut self, opcode: Opcode, a: Variable, b: Variable) -> TraceResult<Variable> {
        if a.is_tensor() || b.is_tensor() {
            let op = arithmetic::binary_tensor_op(opcode)
                .ok_or_else(|| TraceError::Inner(format!("{} has no tensor form", opcode.mnemonic())))?;
            return self.graph.call_tensor_api(op, &[a, b]);
        }
        if matches!(opcode, Opcode::BinaryAdd | Opcode::InplaceAdd) {
            let tracker = Tracker::derived(&[a.clone(), b.clone()]);
            match (a.kind(), b.kind()) {
                (VariableKind::Tuple(x), VariableKind::Tuple(y)) => {
                    let items = x.iter().chain(y).cloned().collect();
                    return Ok(Variable::new(VariableKind::Tuple(items), tracker));
                }
                (VariableKind::List(x), VariableKind::List(y)) => {
                    let items = x.iter().chain(y).cloned().collect();
                    return Ok(Variable::new(VariableKind::List(items), tracker));
                }
                _ => {}
            }
        }
        self.fold(&[a, b], |v| arithmetic::binary_op(opcode, &v[0], &v[1]))
    }

    fn compare(&mut self, op: CompareOp, a: Variable, b: Variable) -> TraceResult<Variable> {
        if a.is_tensor() || b.is_tensor() {
            return self.graph.call_tensor_api(arithmetic::compare_tensor_op(op), &[a, b]);
        }
        self.fold(&[a, b], |v| arithmetic::compare(op, &v[0], &v[1]))
    }

    fn subscript(&mut self, container: &Variable, key: &Variable) -> TraceResult<Variable> {
        match container.kind() {
            VariableKind::Tensor(_) => {
                if key.to_const_arg().is_none() {
                    return Err(TraceError::BreakGraph(format!("tensor index {} is not a constant", key)));
                }
                self.graph
                    .call_tensor_method(TensorOp::GetItem, container, std::slice::from_ref(key))
            }
            VariableKind::Tuple(items) | VariableKind::List(items) => {
                let key_value = key
                    .to_value()
                    .ok_or_else(|| TraceError::BreakGraph(format!("sequence index {} is symbolic", key)))?;
                // Resolve the index with guest semantics over the positions.
                let positions = Value::tuple((0..items.len() as i64).map(Value::Int).collect());
                let selected = arithmetic::subscript(&positions, &key_value)
                    .map_err(|e| TraceError::BreakGraph(format!("guest error: {}", e)))?;
                let pick = |v: &Value| v.as_int().and_then(|i| items.get(i as usize)).cloned();
                match &selected {
                    Value::Tuple(positions) => {
                        let picked = positions
                            .iter()
                            .map(pick)
                            .collect::<Option<Vec<_>>>()
                            .ok_or_else(|| TraceError::Inner("slice position out of range".into()))?;
                        let tracker = Tracker::derived(&[container.clone(), key.clone()]);
                        let kind = match container.kind() {
                            VariableKind::List(_) => VariableKind::List(picked),
                            _ => VariableKind::Tuple(picked),
                        };
                        Ok(Variable::new(kind, tracker))
                    }
                    other => pick(other).ok_or_else(|| TraceError::Inner("index position out of range".into())),
                }
            }
            VariableKind::Dict(pairs) => {
                let key_value = key
                    .to_value()
                    .ok_or_else(|| TraceError::BreakGraph(format!("dict key {} is symbolic", key)))?;
                pairs
                    .iter()
                    .find(|(k, _)| k.to_value().is_some_and(|k| k.py_eq(&key_value)))
                    .map(|(_, v)| v.clone())
                    .ok_or_else(|| TraceError::BreakGraph(format!("key {} not found", key_value.repr())))
            }
            _ => self.fold(&[container.clone(), key.clone()], |v| arithmetic::subscript(&v[0], &v[1])),
        }
    }

    fn store_subscr(&mut self, value: &Variable, container: &Variable, index: &Variable) -> TraceResult<()> {
        if !container.is_tensor() {
            return Err(TraceError::BreakGraph(format!("item assignment on {}", container)));
        }
        if index.to_const_arg().is_none() {
            return Err(TraceError::BreakGraph(format!("tensor index {} is not a constant", index)));
        }
        let updated = self
            .graph
            .call_tensor_method(TensorOp::SetItem, container, &[index.clone(), value.clone()])?;
        self.rebind(container, &updated);
        Ok(())
    }

    /// Replace every reference to `old` held by the frame with `new`
    fn rebind(&mut self, old: &Variable, new: &Variable) {
        for slot in self.stack.iter_mut().filter(|v| v.same(old)) {
            *slot = new.clone();
        }
        for slot in self.locals.values_mut().filter(|v| v.same(old)) {
            *slot = new.clone();
        }
        for (name, slot) in self.cells.iter_mut() {
            if slot.same(old) {
                *slot = new.clone();
                self.written_cells.insert(name.clone());
            }
        }
    }

    fn build_slice(&mut self, parts: Vec<Variable>) -> TraceResult<Variable> {
        let mut values = parts
            .iter()
            .map(|p| match p.to_value() {
                Some(v @ (Value::None | Value::Int(_) | Value::Bool(_))) => Ok(v),
                _ => Err(TraceError::BreakGraph(format!("slice bound {} is not a constant integer", p))),
            })
            .collect::<TraceResult<Vec<_>>>()?;
        let step = if values.len() == 3 { values.pop().unwrap_or(Value::None) } else { Value::None };
        let stop = values.pop().unwrap_or(Value::None);
        let start = values.pop().unwrap_or(Value::None);
        Ok(Variable::new(
            VariableKind::Slice(Arc::new(SliceValue { start, stop, step })),
            Tracker::derived(&parts),
        ))
    }

    fn truth(&self, cond: &Variable) -> TraceResult<bool> {
        cond.truthiness()
            .ok_or_else(|| TraceError::BreakGraph(format!("branch on the value of {}", cond)))
    }

    // === Calls ===

    fn call(&mut self, callable: &Variable, args: Vec<Variable>) -> TraceResult<Variable> {
        match callable.kind() {
            VariableKind::TensorMethod { receiver, op } => self.graph.call_tensor_method(*op, receiver, &args),
            VariableKind::Builtin(builtin) => self.call_builtin(*builtin, args),
            VariableKind::Function(function) => {
                Err(TraceError::BreakGraph(format!("call to user function {}", function.name)))
            }
            _ => Err(TraceError::BreakGraph(format!("call to {}", callable))),
        }
    }

    fn call_builtin(&mut self, builtin: Builtin, args: Vec<Variable>) -> TraceResult<Variable> {
        match (builtin, args.as_slice()) {
            (Builtin::TensorApi(op), _) => return self.graph.call_tensor_api(op, &args),
            (Builtin::Print, _) => return Err(TraceError::BreakGraph("print".into())),
            (Builtin::ToTensor, _) => return Err(TraceError::BreakGraph("tensor creation from host data".into())),
            (Builtin::Abs, [x]) if x.is_tensor() => return self.graph.call_tensor_api(TensorOp::Abs, &args),
            (Builtin::Len, [x]) => {
                if let Some(len) = self.static_len(x)? {
                    return Ok(len);
                }
            }
            _ => {}
        }
        let name = builtin.name();
        let sink = Mutex::new(Vec::new());
        self.fold(&args, |values| builtins::call_builtin(builtin, values.to_vec(), &sink))
            .map_err(|err| match err {
                TraceError::BreakGraph(reason) => TraceError::BreakGraph(format!("{}(): {}", name, reason)),
                other => other,
            })
    }

    /// `len(x)` for values whose length is known without their contents
    fn static_len(&mut self, x: &Variable) -> TraceResult<Option<Variable>> {
        let len = match x.kind() {
            VariableKind::Tensor(t) => match t.meta.shape.first() {
                None => return Err(TraceError::BreakGraph("len() of a 0-d tensor".into())),
                Some(&DYNAMIC_DIM) => {
                    return Err(TraceError::BreakGraph("len() of a tensor with a dynamic first dimension".into()))
                }
                Some(&dim) => {
                    self.graph.add_global_guarded(x.clone());
                    dim
                }
            },
            VariableKind::Tuple(items) | VariableKind::List(items) => items.len() as i64,
            VariableKind::Dict(pairs) => pairs.len() as i64,
            _ => return Ok(None),
        };
        Ok(Some(Variable::constant(
            Value::Int(len),
            Tracker::derived(std::slice::from_ref(x)),
        )))
    }

    // === Iteration ===

    fn get_iter(&mut self, value: Variable) -> TraceResult<Variable> {
        let len = match value.kind() {
            VariableKind::Iter(_) => return Ok(value),
            VariableKind::Tuple(items) | VariableKind::List(items) => items.len(),
            VariableKind::Dict(pairs) => pairs.len(),
            VariableKind::Constant(Value::Range(range)) => range.len(),
            VariableKind::Tensor(t) => match t.meta.shape.first() {
                Some(&dim) if dim != DYNAMIC_DIM => {
                    self.graph.add_global_guarded(value.clone());
                    dim as usize
                }
                _ => return Err(TraceError::BreakGraph(format!("iteration over {}", value))),
            },
            _ => return Err(TraceError::BreakGraph(format!("iteration over {}", value))),
        };
        let tracker = Tracker::derived(std::slice::from_ref(&value));
        Ok(Variable::new(
            VariableKind::Iter(IterVar {
                source: value,
                pos: 0,
                len,
            }),
            tracker,
        ))
    }

    /// Advance the unrolled iterator on top of the stack; the exit index
    /// when it is exhausted
    fn for_iter(&mut self, index: usize, exit: usize) -> TraceResult<Option<usize>> {
        // Iterators handed over by a resume function have already been
        // advanced natively; the rest of that loop runs natively too.
        match self.stack.last().map(Variable::kind) {
            Some(VariableKind::Iter(_)) => {}
            Some(_) => return Err(TraceError::BreakGraph("FOR_ITER over a native iterator".into())),
            None => return Err(TraceError::Inner("FOR_ITER on an empty stack".into())),
        }
        let snapshot = self.snapshot();
        match self.loops.last_mut() {
            Some(frame) if frame.for_iter == index => {
                frame.iteration += 1;
                frame.snapshot = snapshot;
            }
            _ => self.loops.push(LoopFrame {
                for_iter: index,
                exit,
                iteration: 0,
                snapshot,
            }),
        }

        let iterator = self.pop()?;
        let VariableKind::Iter(iter) = iterator.kind() else {
            return Err(TraceError::Inner(format!("FOR_ITER over {}", iterator)));
        };
        if iter.pos >= iter.len {
            return Ok(Some(exit));
        }
        let element = self.iter_element(iter)?;
        let advanced = Variable::new(
            VariableKind::Iter(IterVar {
                source: iter.source.clone(),
                pos: iter.pos + 1,
                len: iter.len,
            }),
            Tracker::derived(std::slice::from_ref(&iter.source)),
        );
        self.push(advanced);
        self.push(element);
        Ok(None)
    }

    fn iter_element(&mut self, iter: &IterVar) -> TraceResult<Variable> {
        let source = &iter.source;
        let missing = || TraceError::Inner(format!("element {} of {} out of range", iter.pos, source));
        match source.kind() {
            VariableKind::Constant(Value::Range(range)) => {
                let item = range.get(iter.pos).ok_or_else(missing)?;
                Ok(Variable::constant(
                    Value::Int(item),
                    Tracker::derived(std::slice::from_ref(source)),
                ))
            }
            VariableKind::Tuple(items) | VariableKind::List(items) => items.get(iter.pos).cloned().ok_or_else(missing),
            VariableKind::Dict(pairs) => pairs.get(iter.pos).map(|(k, _)| k.clone()).ok_or_else(missing),
            VariableKind::Tensor(_) => {
                let position = Variable::constant(Value::Int(iter.pos as i64), Tracker::Const(Value::Int(iter.pos as i64)));
                self.graph.call_tensor_method(TensorOp::GetItem, source, &[position])
            }
            _ => Err(TraceError::Inner(format!("iteration over {}", source))),
        }
    }

    fn unpack(&mut self, sequence: &Variable) -> TraceResult<Vec<Variable>> {
        match sequence.kind() {
            VariableKind::Tuple(items) | VariableKind::List(items) => Ok(items.clone()),
            VariableKind::Dict(pairs) => Ok(pairs.iter().map(|(k, _)| k.clone()).collect()),
            VariableKind::Tensor(t) => {
                let rows = match t.meta.shape.first() {
                    Some(&dim) if dim != DYNAMIC_DIM => dim as usize,
                    _ => return Err(TraceError::BreakGraph(format!("unpacking {}", sequence))),
                };
                self.graph.add_global_guarded(sequence.clone());
                (0..rows)
                    .map(|row| {
                        let position = Variable::constant(Value::Int(row as i64), Tracker::Const(Value::Int(row as i64)));
                        self.graph.call_tensor_method(TensorOp::GetItem, sequence, &[position])
                    })
                    .collect()
            }
            _ => {
                let value = sequence
                    .to_value()
                    .ok_or_else(|| TraceError::BreakGraph(format!("unpacking {}", sequence)))?;
                let items = builtins::unpack(&value).map_err(|e| TraceError::BreakGraph(format!("guest error: {}", e)))?;
                let tracker = Tracker::derived(std::slice::from_ref(sequence));
                items
                    .iter()
                    .map(|item| VariableFactory::from_value(item, &mut self.graph, tracker.clone()))
                    .collect()
            }
        }
    }
}

/// Positional arguments matched against the function's parameters
fn bind_params(function: &Function, args: &[Value]) -> TraceResult<Vec<Value>> {
    let argcount = function.code.argcount as usize;
    let mut params = args.to_vec();
    if params.len() < argcount {
        let missing = argcount - params.len();
        if missing > function.defaults.len() {
            return Err(VmError::TypeError(format!(
                "{}() takes {} positional arguments but {} were given",
                function.name,
                argcount,
                args.len()
            ))
            .into());
        }
        params.extend(function.defaults[function.defaults.len() - missing..].iter().cloned());
    }
    if params.len() > argcount {
        return Err(VmError::TypeError(format!(
            "{}() takes {} positional arguments but {} were given",
            function.name,
            argcount,
            args.len()
        ))
        .into());
    }
    Ok(params)
}
