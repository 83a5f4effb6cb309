//! Guest interpreter
//!
//! Executes guest code objects on a per-frame operand stack. Every call to
//! a user-defined function passes through an optional [`FrameHook`], which
//! may substitute a different code object for the frame. The tracing JIT
//! installs itself as that hook.
//!
//! This module is organized into submodules by functionality:
//! - `types`: VmError and VmConfig
//! - `value`: guest values
//! - `frame`: activation records
//! - `arithmetic`: numeric, comparison and subscript semantics
//! - `builtins`: builtin functions, attributes, iteration, modules

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::trace;

use crate::bytecode::{CodeObject, CompareOp, Opcode, INSTR_SIZE};
use crate::tensor::TensorOp;

pub mod arithmetic;
pub mod builtins;
mod frame;
mod types;
pub mod value;

#[cfg(test)]
mod tests;

pub use builtins::ModuleRegistry;
pub use frame::Frame;
pub use types::{VmConfig, VmError, VmResult};
pub use value::{
    BoundMethod, Builtin, Cell, ContextHandle, Function, Globals, Module, NativeFunction, Object, RangeValue,
    SliceValue, Value,
};

/// Interception point consulted before a user function's frame runs
pub trait FrameHook: Send + Sync {
    /// Code to run in place of `function.code`, if any.
    ///
    /// The replacement must take the same parameters and closure layout as
    /// the original code. It runs without consulting the hook again.
    fn on_frame(&self, function: &Arc<Function>, args: &[Value]) -> Option<Arc<CodeObject>>;
}

/// Guest interpreter
pub struct Interpreter {
    config: VmConfig,
    hook: RwLock<Option<Arc<dyn FrameHook>>>,
    modules: Arc<ModuleRegistry>,
    output: Mutex<Vec<String>>,
    depth: AtomicUsize,
}

enum Flow {
    Continue,
    Return(Value),
}

impl Interpreter {
    pub fn new() -> Self {
        Self::with_config(VmConfig::default())
    }

    pub fn with_config(config: VmConfig) -> Self {
        Self {
            config,
            hook: RwLock::new(None),
            modules: Arc::new(ModuleRegistry::with_stdlib()),
            output: Mutex::new(Vec::new()),
            depth: AtomicUsize::new(0),
        }
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// Install or remove the frame hook
    pub fn set_hook(&self, hook: Option<Arc<dyn FrameHook>>) {
        *self.hook.write() = hook;
    }

    pub fn has_hook(&self) -> bool {
        self.hook.read().is_some()
    }

    /// Registry resolved by `IMPORT_NAME`, shared with the tracer
    pub fn modules(&self) -> &Arc<ModuleRegistry> {
        &self.modules
    }

    /// Lines written by `print` since the last call
    pub fn take_output(&self) -> Vec<String> {
        std::mem::take(&mut *self.output.lock())
    }

    /// Call any callable guest value
    pub fn call(&self, callable: &Value, args: Vec<Value>) -> VmResult<Value> {
        match callable {
            Value::Function(function) => self.call_function(function, args),
            Value::Builtin(builtin) => builtins::call_builtin(*builtin, args, &self.output),
            Value::BoundMethod(method) => {
                let mut full = Vec::with_capacity(args.len() + 1);
                full.push(method.receiver.clone());
                full.extend(args);
                arithmetic::call_tensor_op(method.op, &full)
            }
            Value::Native(native) => native.call(args),
            other => Err(VmError::TypeError(format!("'{}' object is not callable", other.type_name()))),
        }
    }

    /// Call a user function, consulting the frame hook first
    pub fn call_function(&self, function: &Arc<Function>, args: Vec<Value>) -> VmResult<Value> {
        let hook = self.hook.read().clone();
        let code = hook
            .and_then(|hook| hook.on_frame(function, &args))
            .unwrap_or_else(|| function.code.clone());
        self.run_code(function, code, args)
    }

    /// Run `code` as a frame of `function`, bypassing the hook
    pub fn run_code(&self, function: &Arc<Function>, code: Arc<CodeObject>, args: Vec<Value>) -> VmResult<Value> {
        let depth = self.depth.fetch_add(1, Ordering::Relaxed);
        let result = if depth >= self.config.max_call_depth {
            Err(VmError::CallDepthExceeded(self.config.max_call_depth))
        } else {
            Frame::new(function.clone(), code, args).and_then(|mut frame| self.eval_frame(&mut frame))
        };
        self.depth.fetch_sub(1, Ordering::Relaxed);
        result
    }

    fn eval_frame(&self, frame: &mut Frame) -> VmResult<Value> {
        loop {
            if let Flow::Return(value) = self.step(frame)? {
                return Ok(value);
            }
        }
    }

    fn jump_target(frame: &Frame, opcode: Opcode, arg: u32) -> usize {
        if opcode.is_rel_jump() {
            frame.ip + arg as usize / INSTR_SIZE
        } else {
            arg as usize / INSTR_SIZE
        }
    }

    fn global(&self, frame: &Frame, name: &str) -> VmResult<Value> {
        frame
            .function
            .globals
            .get(name)
            .or_else(|| Builtin::lookup(name).map(Value::Builtin))
            .ok_or_else(|| VmError::NameError(name.to_string()))
    }

    fn name_at<'a>(table: &'a [String], index: u32) -> VmResult<&'a str> {
        table
            .get(index as usize)
            .map(String::as_str)
            .ok_or_else(|| VmError::Runtime(format!("name index {} out of range", index)))
    }

    /// Execute a single instruction
    fn step(&self, frame: &mut Frame) -> VmResult<Flow> {
        let code = frame.code.clone();
        let (opcode, arg) = *code
            .raw()
            .get(frame.ip)
            .ok_or_else(|| VmError::Runtime(format!("fell off the end of {}", code.name)))?;

        if self.config.trace {
            trace!(
                target: "symtrace::vm::step",
                code = %code.name,
                ip = frame.ip,
                mnemonic = opcode.mnemonic(),
                arg,
                stack_depth = frame.stack.len()
            );
        }
        if frame.stack.len() > self.config.max_value_stack {
            return Err(VmError::Runtime("value stack overflow".into()));
        }
        frame.ip += 1;

        match opcode {
            // === Stack Operations ===
            Opcode::Nop => {}
            Opcode::PopTop => {
                frame.pop()?;
            }
            Opcode::RotTwo => {
                let top = frame.pop_n(2)?;
                frame.push(top[1].clone());
                frame.push(top[0].clone());
            }
            Opcode::RotThree => {
                // [a, b, c] -> [c, a, b]
                let top = frame.pop_n(3)?;
                frame.push(top[2].clone());
                frame.push(top[0].clone());
                frame.push(top[1].clone());
            }
            Opcode::DupTop => {
                let top = frame.peek()?.clone();
                frame.push(top);
            }
            Opcode::PushNull => frame.push(Value::Null),

            // === Unary / Binary ===
            Opcode::UnaryPositive | Opcode::UnaryNegative | Opcode::UnaryNot | Opcode::UnaryInvert => {
                let a = frame.pop()?;
                frame.push(arithmetic::unary_op(opcode, &a)?);
            }
            op if op.in_set(crate::bytecode::opcodes::BINARY) || op.in_set(crate::bytecode::opcodes::INPLACE) => {
                let b = frame.pop()?;
                let a = frame.pop()?;
                frame.push(arithmetic::binary_op(op, &a, &b)?);
            }
            Opcode::CompareOp => {
                let op = CompareOp::from_arg(arg)
                    .ok_or_else(|| VmError::Runtime(format!("invalid comparison {}", arg)))?;
                let b = frame.pop()?;
                let a = frame.pop()?;
                frame.push(arithmetic::compare(op, &a, &b)?);
            }
            Opcode::StoreSubscr => {
                let top = frame.pop_n(3)?;
                let (value, container, index) = (&top[0], &top[1], &top[2]);
                self.store_subscr(frame, value, container, index)?;
            }

            // === Iteration / Return ===
            Opcode::GetIter => {
                let value = frame.pop()?;
                frame.push(builtins::make_iter(&value)?);
            }
            Opcode::ForIter => {
                let iterator = frame.peek()?.clone();
                match builtins::iter_next(&iterator)? {
                    Some(item) => frame.push(item),
                    None => {
                        frame.pop()?;
                        frame.ip = Self::jump_target(frame, opcode, arg);
                    }
                }
            }
            Opcode::ReturnValue => return Ok(Flow::Return(frame.pop()?)),

            // === Unpacking ===
            Opcode::UnpackSequence => {
                let items = builtins::unpack(&frame.pop()?)?;
                if items.len() != arg as usize {
                    return Err(VmError::ValueError(format!(
                        "expected {} values to unpack, got {}",
                        arg,
                        items.len()
                    )));
                }
                frame.stack.extend(items.into_iter().rev());
            }
            Opcode::UnpackEx => {
                let (before, after) = ((arg & 0xFF) as usize, (arg >> 8) as usize);
                let items = builtins::unpack(&frame.pop()?)?;
                if items.len() < before + after {
                    return Err(VmError::ValueError(format!(
                        "expected at least {} values to unpack, got {}",
                        before + after,
                        items.len()
                    )));
                }
                let middle = Value::list(items[before..items.len() - after].to_vec());
                let mut unpacked: Vec<Value> = items[..before].to_vec();
                unpacked.push(middle);
                unpacked.extend_from_slice(&items[items.len() - after..]);
                frame.stack.extend(unpacked.into_iter().rev());
            }

            // === Names ===
            Opcode::LoadConst => {
                let value = code
                    .consts
                    .get(arg as usize)
                    .cloned()
                    .ok_or_else(|| VmError::Runtime(format!("constant index {} out of range", arg)))?;
                frame.push(value);
            }
            Opcode::LoadFast => {
                let value = frame.local(arg as usize)?;
                frame.push(value);
            }
            Opcode::StoreFast => {
                let value = frame.pop()?;
                let slot = frame
                    .locals
                    .get_mut(arg as usize)
                    .ok_or_else(|| VmError::Runtime(format!("local index {} out of range", arg)))?;
                *slot = Some(value);
            }
            Opcode::DeleteFast => {
                frame.local(arg as usize)?;
                frame.locals[arg as usize] = None;
            }
            Opcode::LoadGlobal | Opcode::LoadName => {
                let value = self.global(frame, Self::name_at(&code.names, arg)?)?;
                frame.push(value);
            }
            Opcode::StoreGlobal => {
                let value = frame.pop()?;
                frame.function.globals.insert(Self::name_at(&code.names, arg)?, value);
            }
            Opcode::LoadClosure => {
                let cell = frame.cell(arg as usize)?.clone();
                frame.push(Value::Cell(cell));
            }
            Opcode::LoadDeref | Opcode::LoadClassDeref => {
                let value = frame
                    .cell(arg as usize)?
                    .get()
                    .ok_or_else(|| VmError::UnboundLocal(frame.cell_name(arg as usize)))?;
                frame.push(value);
            }
            Opcode::StoreDeref => {
                let value = frame.pop()?;
                frame.cell(arg as usize)?.set(value);
            }

            // === Attributes / Imports ===
            Opcode::LoadAttr => {
                let owner = frame.pop()?;
                frame.push(builtins::get_attr(&owner, Self::name_at(&code.names, arg)?)?);
            }
            Opcode::LoadMethod => {
                let owner = frame.pop()?;
                let method = builtins::get_attr(&owner, Self::name_at(&code.names, arg)?)?;
                frame.push(Value::Null);
                frame.push(method);
            }
            Opcode::StoreAttr => {
                let owner = frame.pop()?;
                let value = frame.pop()?;
                let name = Self::name_at(&code.names, arg)?;
                match owner {
                    Value::Object(object) => object.set(name, value),
                    other => {
                        return Err(VmError::AttributeError {
                            type_name: other.type_name(),
                            attr: name.to_string(),
                        })
                    }
                }
            }
            Opcode::ImportName => {
                frame.pop_n(2)?;
                let name = Self::name_at(&code.names, arg)?;
                let module = self
                    .modules
                    .get(name)
                    .ok_or_else(|| VmError::ImportError(name.to_string()))?;
                frame.push(Value::Module(module));
            }
            Opcode::ImportFrom => {
                let module = frame.peek()?.clone();
                frame.push(builtins::get_attr(&module, Self::name_at(&code.names, arg)?)?);
            }

            // === Builders ===
            Opcode::BuildTuple => {
                let items = frame.pop_n(arg as usize)?;
                frame.push(Value::tuple(items));
            }
            Opcode::BuildList => {
                let items = frame.pop_n(arg as usize)?;
                frame.push(Value::list(items));
            }
            Opcode::BuildMap => {
                let flat = frame.pop_n(2 * arg as usize)?;
                let pairs = flat.chunks_exact(2).map(|kv| (kv[0].clone(), kv[1].clone())).collect();
                frame.push(Value::Dict(Arc::new(RwLock::new(pairs))));
            }
            Opcode::BuildSlice => {
                let mut parts = frame.pop_n(arg as usize)?;
                let step = if parts.len() == 3 { parts.pop().unwrap_or(Value::None) } else { Value::None };
                let stop = parts.pop().unwrap_or(Value::None);
                let start = parts.pop().unwrap_or(Value::None);
                frame.push(Value::Slice(Arc::new(SliceValue { start, stop, step })));
            }

            // === Control flow ===
            Opcode::JumpForward | Opcode::JumpAbsolute => {
                frame.ip = Self::jump_target(frame, opcode, arg);
            }
            Opcode::PopJumpIfFalse | Opcode::PopJumpIfTrue => {
                let cond = frame.pop()?.truthy()?;
                if cond == (opcode == Opcode::PopJumpIfTrue) {
                    frame.ip = Self::jump_target(frame, opcode, arg);
                }
            }
            Opcode::JumpIfFalseOrPop | Opcode::JumpIfTrueOrPop => {
                let cond = frame.peek()?.truthy()?;
                if cond == (opcode == Opcode::JumpIfTrueOrPop) {
                    frame.ip = Self::jump_target(frame, opcode, arg);
                } else {
                    frame.pop()?;
                }
            }

            // === Calls ===
            Opcode::CallFunction => {
                let args = frame.pop_n(arg as usize)?;
                let callable = frame.pop()?;
                let result = self.call(&callable, args)?;
                frame.push(result);
            }
            Opcode::CallMethod => {
                let args = frame.pop_n(arg as usize)?;
                let callable = frame.pop()?;
                frame.pop()?;
                let result = self.call(&callable, args)?;
                frame.push(result);
            }
            Opcode::MakeFunction => {
                let name = frame.pop()?;
                let Value::Code(new_code) = frame.pop()? else {
                    return Err(VmError::TypeError("MAKE_FUNCTION expects a code object".into()));
                };
                let closure = if arg & 0x08 != 0 {
                    match frame.pop()? {
                        Value::Tuple(cells) => cells
                            .iter()
                            .map(|c| match c {
                                Value::Cell(cell) => Ok(cell.clone()),
                                other => Err(VmError::TypeError(format!(
                                    "closure item must be a cell, got {}",
                                    other.type_name()
                                ))),
                            })
                            .collect::<VmResult<Vec<_>>>()?,
                        other => {
                            return Err(VmError::TypeError(format!(
                                "closure must be a tuple, got {}",
                                other.type_name()
                            )))
                        }
                    }
                } else {
                    Vec::new()
                };
                let defaults = if arg & 0x01 != 0 {
                    match frame.pop()? {
                        Value::Tuple(items) => items.as_ref().clone(),
                        other => {
                            return Err(VmError::TypeError(format!(
                                "defaults must be a tuple, got {}",
                                other.type_name()
                            )))
                        }
                    }
                } else {
                    Vec::new()
                };
                let mut function = Function::with_closure(new_code, frame.function.globals.clone(), closure);
                if let Value::Str(name) = name {
                    function.name = name.to_string();
                }
                function.defaults = defaults;
                frame.push(Value::Function(Arc::new(function)));
            }

            other => {
                return Err(VmError::Runtime(format!("opcode {} not supported", other.mnemonic())));
            }
        }
        Ok(Flow::Continue)
    }

    /// `container[index] = value`.
    ///
    /// Tensors are values: the update produces a new tensor and every
    /// reference to the old one held by the frame is rebound to it.
    fn store_subscr(&self, frame: &mut Frame, value: &Value, container: &Value, index: &Value) -> VmResult<()> {
        match container {
            Value::Tensor(_) => {
                let updated =
                    arithmetic::call_tensor_op(TensorOp::SetItem, &[container.clone(), index.clone(), value.clone()])?;
                frame.rebind(container, &updated);
                Ok(())
            }
            Value::List(items) => {
                let mut items = items.write();
                let raw = index
                    .as_int()
                    .ok_or_else(|| VmError::TypeError("list indices must be integers".into()))?;
                let len = items.len();
                let at = if raw < 0 { raw + len as i64 } else { raw };
                if at < 0 || at >= len as i64 {
                    return Err(VmError::IndexOutOfBounds { index: raw, len });
                }
                items[at as usize] = value.clone();
                Ok(())
            }
            Value::Dict(items) => {
                let mut items = items.write();
                match items.iter_mut().find(|(k, _)| k.py_eq(index)) {
                    Some((_, slot)) => *slot = value.clone(),
                    None => items.push((index.clone(), value.clone())),
                }
                Ok(())
            }
            other => Err(VmError::TypeError(format!(
                "'{}' object does not support item assignment",
                other.type_name()
            ))),
        }
    }
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Interpreter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interpreter")
            .field("config", &self.config)
            .field("hooked", &self.has_hook())
            .finish()
    }
}
