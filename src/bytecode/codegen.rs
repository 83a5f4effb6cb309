//! Code generation for translated functions
//!
//! A [`CodeGen`] is bound to the function being translated. It owns a fresh
//! instruction list plus a mutable copy of the original code options and
//! finalizes them into a runnable code object. It also synthesizes the
//! resume and loop functions that continue execution after a graph break.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::error::{TraceError, TraceResult};
use crate::vm::{Cell, Function, Globals, Value};

use super::analysis::analysis_inputs;
use super::assemble::gen_new_code;
use super::code::{CodeObject, CodeOptions};
use super::instruction::{get_instructions, ArgVal, InstrId, Instruction};
use super::opcodes::Opcode;

/// Local that carries the loop-continues flag in and out of a loop body
pub const BREAK_FLAG_NAME: &str = "__break_flag";

static GENERATED_FN_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Unique name for a generated function (`__resume_fn_3`)
pub fn next_generated_name(prefix: &str) -> String {
    format!("__{}_{}", prefix, GENERATED_FN_COUNTER.fetch_add(1, Ordering::Relaxed))
}

/// Name of the synthetic local holding the `i`-th stack value at a resume point
pub fn stack_arg_name(index: usize) -> String {
    format!("__stack_arg{}", index)
}

/// A synthesized function together with its live-local parameters
#[derive(Debug, Clone)]
pub struct GeneratedFn {
    pub function: Arc<Function>,
    /// Live locals, in parameter order after any stack arguments
    pub inputs: Vec<String>,
}

pub struct CodeGen {
    origin: Arc<CodeObject>,
    globals: Globals,
    closure: Vec<Arc<Cell>>,
    options: CodeOptions,
    instructions: Vec<Instruction>,
}

impl CodeGen {
    pub fn new(origin: Arc<CodeObject>, globals: Globals, closure: Vec<Arc<Cell>>) -> Self {
        let options = origin.options();
        Self {
            origin,
            globals,
            closure,
            options,
            instructions: Vec::new(),
        }
    }

    pub fn for_function(function: &Function) -> Self {
        Self::new(function.code.clone(), function.globals.clone(), function.closure.clone())
    }

    fn fork(&self) -> Self {
        Self::new(self.origin.clone(), self.globals.clone(), self.closure.clone())
    }

    pub fn origin(&self) -> &Arc<CodeObject> {
        &self.origin
    }

    pub fn globals(&self) -> &Globals {
        &self.globals
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    pub fn options(&self) -> &CodeOptions {
        &self.options
    }

    /// Finalize the emitted instructions into a runnable code object
    pub fn gen_code(&mut self) -> TraceResult<Arc<CodeObject>> {
        gen_new_code(&mut self.instructions, &mut self.options)
    }

    /// Parameters first, then the remaining original locals
    fn set_parameters(&mut self, params: &[String]) {
        let mut varnames = params.to_vec();
        varnames.extend(
            self.origin
                .varnames
                .iter()
                .filter(|name| !params.contains(name))
                .cloned(),
        );
        self.options.argcount = params.len() as u32;
        self.options.varnames = varnames;
    }

    fn finish(mut self, name: String, params: &[String]) -> TraceResult<Arc<Function>> {
        self.set_parameters(params);
        self.options.name = name;
        let code = self.gen_code()?;
        debug!(
            target: "symtrace::codegen",
            name = %code.name,
            argcount = code.argcount,
            "Generated function"
        );
        Ok(Arc::new(Function::with_closure(code, self.globals, self.closure)))
    }

    fn live_inputs(&self, instructions: &[Instruction], index: usize) -> TraceResult<Vec<String>> {
        let mut inputs = analysis_inputs(instructions, index)?;
        inputs.retain(|name| !self.origin.freevars.contains(name));
        Ok(inputs)
    }

    /// Load each input, pack them into a tuple and return it
    fn gen_outputs(&mut self, inputs: &[String]) {
        for name in inputs {
            self.gen_load_fast(name);
        }
        self.gen_build_tuple(inputs.len() as u32);
        self.gen_return();
    }

    /// Build a function that continues the original code at `index`.
    ///
    /// The first `stack_size` parameters are the operand-stack values
    /// (bottom first), followed by the live locals. Returns `None` when the
    /// instruction at `index` is a return.
    pub fn gen_resume_fn_at(&self, index: usize, stack_size: usize) -> TraceResult<Option<GeneratedFn>> {
        let origin_instrs = get_instructions(&self.origin)?;
        let target = origin_instrs.get(index).ok_or_else(|| {
            TraceError::Inner(format!("resume index {} out of range in {}", index, self.origin.name))
        })?;
        if target.opcode == Opcode::ReturnValue {
            return Ok(None);
        }
        let target_id = target.id;
        let inputs = self.live_inputs(&origin_instrs, index)?;

        let mut gen = self.fork();
        let stack_names: Vec<String> = (0..stack_size).map(stack_arg_name).collect();
        for name in &stack_names {
            gen.gen_load_fast(name);
        }
        gen.gen_jump(Opcode::JumpAbsolute, target_id);
        gen.extend_instrs(origin_instrs);

        let params: Vec<String> = stack_names.into_iter().chain(inputs.iter().cloned()).collect();
        let function = gen.finish(next_generated_name("resume_fn"), &params)?;
        Ok(Some(GeneratedFn { function, inputs }))
    }

    /// Build a function that runs one iteration of a loop body.
    ///
    /// `for_iter_index` is the loop's `FOR_ITER`; the body is
    /// `[start, end)`. Parameters are the current element, the live locals
    /// and the break flag (passed in as `True`). The function returns the
    /// live locals followed by the flag, which is `False` after a `break`.
    pub fn gen_loop_body_between(&self, for_iter_index: usize, start: usize, end: usize) -> TraceResult<GeneratedFn> {
        let origin_instrs = get_instructions(&self.origin)?;
        let (for_iter_id, out_loop) = loop_header(&origin_instrs, for_iter_index)?;
        check_range(&origin_instrs, start, end)?;

        let mut inputs = self.live_inputs(&origin_instrs, for_iter_index)?;
        inputs.push(BREAK_FLAG_NAME.to_string());

        let mut gen = self.fork();
        // Stands in for the iterator that a `break` pops.
        gen.gen_load_const(Value::None);
        gen.gen_load_fast(&stack_arg_name(0));
        gen.extend_instrs(origin_instrs[start..end].to_vec());

        let nop_for_break = gen.gen_nop();
        gen.gen_load_const(Value::Bool(false));
        gen.gen_store_fast(BREAK_FLAG_NAME);
        gen.gen_load_const(Value::None);
        let nop_for_continue = gen.gen_nop();
        gen.gen_pop_top();

        for instr in gen.instructions.iter_mut() {
            if instr.jump_to == Some(for_iter_id) {
                instr.jump_to = Some(nop_for_continue);
            } else if instr.jump_to == Some(out_loop) {
                instr.jump_to = Some(nop_for_break);
            }
        }
        gen.gen_outputs(&inputs);

        let params: Vec<String> = std::iter::once(stack_arg_name(0)).chain(inputs.iter().cloned()).collect();
        let function = gen.finish(next_generated_name("loop_body"), &params)?;
        Ok(GeneratedFn { function, inputs })
    }

    /// Build a function that runs a whole `for` loop.
    ///
    /// `[start, end)` spans from the loop's `FOR_ITER` up to its exit. The
    /// iterator is passed in as the local `iterator_name`, the last
    /// parameter. The function returns all of its parameters.
    pub fn gen_for_loop_fn_between(&self, iterator_name: &str, start: usize, end: usize) -> TraceResult<GeneratedFn> {
        let origin_instrs = get_instructions(&self.origin)?;
        let (for_iter_id, out_loop) = loop_header(&origin_instrs, start)?;
        check_range(&origin_instrs, start, end)?;

        let mut inputs = self.live_inputs(&origin_instrs, start)?;
        inputs.retain(|name| name != iterator_name);
        inputs.push(iterator_name.to_string());

        let mut gen = self.fork();
        gen.gen_load_fast(iterator_name);
        gen.extend_instrs(origin_instrs[start..end].to_vec());

        let nop_for_continue = gen.gen_nop();
        let back_edge = Instruction::jump(Opcode::JumpAbsolute, for_iter_id);
        let back_edge_id = back_edge.id;
        gen.add_instr(back_edge);
        let nop_for_break = gen.gen_nop();

        for instr in gen.instructions.iter_mut() {
            if instr.id == back_edge_id {
                continue;
            }
            if instr.jump_to == Some(for_iter_id) {
                instr.jump_to = Some(nop_for_continue);
            } else if instr.jump_to == Some(out_loop) {
                instr.jump_to = Some(nop_for_break);
            }
        }
        gen.gen_outputs(&inputs);

        let function = gen.finish(next_generated_name("for_loop"), &inputs)?;
        Ok(GeneratedFn { function, inputs })
    }

    // === Emission primitives ===

    pub fn add_instr(&mut self, instr: Instruction) -> InstrId {
        let id = instr.id;
        self.instructions.push(instr);
        id
    }

    fn emit(&mut self, opcode: Opcode, argval: ArgVal) -> InstrId {
        self.add_instr(Instruction::new(opcode, argval))
    }

    fn emit_name(&mut self, opcode: Opcode, name: &str) -> InstrId {
        self.emit(opcode, ArgVal::Name(name.to_string()))
    }

    /// Append instructions as they are
    pub fn add_pure_instructions(&mut self, instructions: &[Instruction]) {
        self.instructions.extend(instructions.iter().map(Instruction::duplicate));
    }

    pub fn extend_instrs(&mut self, instructions: Vec<Instruction>) {
        self.instructions.extend(instructions);
    }

    pub fn pop_instr(&mut self) -> Option<Instruction> {
        self.instructions.pop()
    }

    /// Constants are deduplicated by identity when the code is finalized
    pub fn gen_load_const(&mut self, value: Value) -> InstrId {
        self.emit(Opcode::LoadConst, ArgVal::Const(value))
    }

    pub fn gen_load_global(&mut self, name: &str) -> InstrId {
        self.emit_name(Opcode::LoadGlobal, name)
    }

    /// Make `value` reachable from the generated code as global `name`
    pub fn gen_load_object(&mut self, value: Value, name: &str) -> InstrId {
        self.globals.insert(name, value);
        self.gen_load_global(name)
    }

    pub fn gen_load_fast(&mut self, name: &str) -> InstrId {
        self.emit_name(Opcode::LoadFast, name)
    }

    pub fn gen_store_fast(&mut self, name: &str) -> InstrId {
        self.emit_name(Opcode::StoreFast, name)
    }

    pub fn gen_load_deref(&mut self, name: &str) -> InstrId {
        self.emit_name(Opcode::LoadDeref, name)
    }

    pub fn gen_store_deref(&mut self, name: &str) -> InstrId {
        self.emit_name(Opcode::StoreDeref, name)
    }

    pub fn gen_load_closure(&mut self, name: &str) -> InstrId {
        self.emit_name(Opcode::LoadClosure, name)
    }

    pub fn gen_load_attr(&mut self, name: &str) -> InstrId {
        self.emit_name(Opcode::LoadAttr, name)
    }

    pub fn gen_load_method(&mut self, name: &str) -> InstrId {
        self.emit_name(Opcode::LoadMethod, name)
    }

    pub fn gen_import_name(&mut self, name: &str) -> InstrId {
        self.emit_name(Opcode::ImportName, name)
    }

    pub fn gen_push_null(&mut self) -> InstrId {
        self.emit(Opcode::PushNull, ArgVal::None)
    }

    pub fn gen_subscribe(&mut self) -> InstrId {
        self.emit(Opcode::BinarySubscr, ArgVal::None)
    }

    pub fn gen_build_tuple(&mut self, count: u32) -> InstrId {
        self.emit(Opcode::BuildTuple, ArgVal::Count(count))
    }

    pub fn gen_build_list(&mut self, count: u32) -> InstrId {
        self.emit(Opcode::BuildList, ArgVal::Count(count))
    }

    pub fn gen_build_map(&mut self, count: u32) -> InstrId {
        self.emit(Opcode::BuildMap, ArgVal::Count(count))
    }

    pub fn gen_build_slice(&mut self, count: u32) -> InstrId {
        self.emit(Opcode::BuildSlice, ArgVal::Count(count))
    }

    pub fn gen_get_iter(&mut self) -> InstrId {
        self.emit(Opcode::GetIter, ArgVal::None)
    }

    pub fn gen_unpack_sequence(&mut self, count: u32) -> InstrId {
        self.emit(Opcode::UnpackSequence, ArgVal::Count(count))
    }

    pub fn gen_call_function(&mut self, argc: u32) -> InstrId {
        self.emit(Opcode::CallFunction, ArgVal::Count(argc))
    }

    pub fn gen_call_method(&mut self, argc: u32) -> InstrId {
        self.emit(Opcode::CallMethod, ArgVal::Count(argc))
    }

    pub fn gen_pop_top(&mut self) -> InstrId {
        self.emit(Opcode::PopTop, ArgVal::None)
    }

    pub fn gen_nop(&mut self) -> InstrId {
        self.emit(Opcode::Nop, ArgVal::None)
    }

    pub fn gen_return(&mut self) -> InstrId {
        self.emit(Opcode::ReturnValue, ArgVal::None)
    }

    pub fn gen_jump(&mut self, opcode: Opcode, target: InstrId) -> InstrId {
        self.add_instr(Instruction::jump(opcode, target))
    }

    /// Listing of the instructions emitted so far
    pub fn pprint(&self) -> String {
        self.instructions.iter().map(|instr| format!("{}\n", instr)).collect()
    }
}

fn loop_header(instructions: &[Instruction], for_iter_index: usize) -> TraceResult<(InstrId, InstrId)> {
    match instructions.get(for_iter_index) {
        Some(instr) if instr.opcode == Opcode::ForIter => {
            let exit = instr
                .jump_to
                .ok_or_else(|| TraceError::Inner("FOR_ITER without exit target".into()))?;
            Ok((instr.id, exit))
        }
        Some(instr) => Err(TraceError::Inner(format!(
            "expected FOR_ITER at #{}, found {}",
            for_iter_index, instr.opcode
        ))),
        None => Err(TraceError::Inner(format!("loop header #{} out of range", for_iter_index))),
    }
}

fn check_range(instructions: &[Instruction], start: usize, end: usize) -> TraceResult<()> {
    if start > end || end > instructions.len() {
        return Err(TraceError::Inner(format!(
            "invalid instruction range [{}, {}) of {}",
            start,
            end,
            instructions.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::asm::assemble_function;

    const RESUMABLE: &str = r#"
        .name resumable
        .args x y
            LOAD_FAST x
            LOAD_CONST 1
            BINARY_ADD
            STORE_FAST z
            LOAD_FAST z
            LOAD_FAST y
            BINARY_MULTIPLY
            RETURN_VALUE
    "#;

    #[test]
    fn test_resume_fn_parameters() {
        let function = assemble_function(RESUMABLE, &Globals::new()).expect("assembles");
        let gen = CodeGen::for_function(&function);
        // resume after `x + 1` with its result still on the stack
        let resumed = gen.gen_resume_fn_at(3, 1).expect("generates").expect("not a return");
        assert_eq!(resumed.inputs, vec!["y".to_string()]);
        let code = &resumed.function.code;
        assert_eq!(code.argcount, 2);
        assert_eq!(&code.varnames[..2], &["__stack_arg0".to_string(), "y".to_string()]);
        assert!(code.name.starts_with("__resume_fn_"));
    }

    #[test]
    fn test_resume_at_return_is_none() {
        let function = assemble_function(RESUMABLE, &Globals::new()).expect("assembles");
        let gen = CodeGen::for_function(&function);
        assert!(gen.gen_resume_fn_at(7, 1).expect("generates").is_none());
    }

    #[test]
    fn test_load_object_publishes_global() {
        let function = assemble_function(RESUMABLE, &Globals::new()).expect("assembles");
        let mut gen = CodeGen::for_function(&function);
        gen.gen_load_object(Value::Int(42), "__compiled_fn_test");
        gen.gen_return();
        assert!(function.globals.contains("__compiled_fn_test"));
        let code = gen.gen_code().expect("assembles");
        assert!(code.names.contains(&"__compiled_fn_test".to_string()));
    }

    #[test]
    fn test_generated_names_are_unique() {
        let a = next_generated_name("resume_fn");
        let b = next_generated_name("resume_fn");
        assert_ne!(a, b);
    }
}
