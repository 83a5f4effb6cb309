//! Code generation at the end of a trace
//!
//! A trace ends either at `RETURN_VALUE` or at a graph break. Both start by
//! calling the compiled statement program; a break then hands the rest of
//! the frame to generated resume functions that run in the interpreter and
//! are traced again on their own first call.
//!
//! Generated code never reads a frame slot after writing one: every value
//! the continuation needs is first reconstructed into a `__spill_N`
//! temporary, and only then are cells and the stack rebuilt from those
//! temporaries.

use std::collections::HashMap;

use tracing::debug;

use crate::bytecode::codegen::BREAK_FLAG_NAME;
use crate::bytecode::{ArgVal, CodeGen, GeneratedFn, Instruction, Opcode};
use crate::error::{TraceError, TraceResult};
use crate::vm::Value;

use super::opcode_executor::OpcodeExecutor;
use super::tracker::Tracker;
use super::variables::{Variable, VariableKind};

/// Local that carries the iterator into a generated `for` loop function
pub const LOOP_ITER_NAME: &str = "__loop_iter";

/// Temporaries holding the values a continuation needs
#[derive(Default)]
struct Spilled {
    stack: Vec<String>,
    inputs: HashMap<String, String>,
    extra: Vec<String>,
    /// Cell name and the temporary holding its new value
    cells: Vec<(String, String)>,
}

impl OpcodeExecutor {
    // === Return ===

    pub(super) fn emit_return(&mut self, value: Variable) -> TraceResult<CodeGen> {
        let mut codegen = CodeGen::for_function(&self.function);
        if self.cell_writes().is_empty() {
            self.graph.start_compile(std::slice::from_ref(&value), &mut codegen)?;
            value.reconstruct(&mut codegen)?;
        } else {
            let spilled = self.spill_state(&mut codegen, &[], &[], std::slice::from_ref(&value))?;
            Self::write_cells(&mut codegen, &spilled);
            codegen.gen_load_fast(&spilled.extra[0]);
        }
        codegen.gen_return();
        Ok(codegen)
    }

    // === Graph breaks ===

    pub(super) fn handle_break(&mut self, index: usize, reason: &str) -> TraceResult<CodeGen> {
        let opcode = self.instructions[index].opcode;
        debug!(
            target: "symtrace::executor",
            code = %self.code.name,
            index,
            opcode = %opcode,
            reason,
            in_loop = !self.loops.is_empty(),
            "Graph break"
        );
        if !self.loops.is_empty() {
            return self.break_in_loop();
        }
        match opcode {
            Opcode::PopJumpIfFalse | Opcode::PopJumpIfTrue | Opcode::JumpIfFalseOrPop | Opcode::JumpIfTrueOrPop => {
                self.break_at_jump(index)
            }
            Opcode::ForIter => self.break_at_for_iter(index),
            op if op.is_jump() || op == Opcode::ReturnValue => {
                Err(TraceError::NotImplemented(format!("graph break at {}: {}", op, reason)))
            }
            _ => self.break_at_instruction(index),
        }
    }

    /// Run the breaking instruction natively, then resume after it
    fn break_at_instruction(&mut self, index: usize) -> TraceResult<CodeGen> {
        let instr = self.instructions[index].clone();
        let mut codegen = CodeGen::for_function(&self.function);
        let stack = self.stack.clone();

        let effect = instr.opcode.stack_effect(instr.arg.unwrap_or(0), None);
        let after = usize::try_from(stack.len() as i64 + effect as i64)
            .map_err(|_| TraceError::Inner(format!("{} underflows the stack", instr.opcode)))?;
        let resume = codegen.gen_resume_fn_at(index + 1, after)?;
        let inputs = resume.as_ref().map(|r| r.inputs.clone()).unwrap_or_default();

        let spilled = self.spill_state(&mut codegen, &stack, &inputs, &[])?;
        Self::write_cells(&mut codegen, &spilled);
        for tmp in &spilled.stack {
            codegen.gen_load_fast(tmp);
        }
        codegen.add_pure_instructions(std::slice::from_ref(&instr));

        let results: Vec<String> = (0..after).map(|_| self.next_spill_name()).collect();
        for tmp in results.iter().rev() {
            codegen.gen_store_fast(tmp);
        }
        Self::emit_resume(&mut codegen, resume.as_ref(), &results, &spilled.inputs)?;
        Ok(codegen)
    }

    /// Branch natively on the condition and resume on either edge
    fn break_at_jump(&mut self, index: usize) -> TraceResult<CodeGen> {
        let instr = self.instructions[index].clone();
        let target = self.target_of(&instr)?;
        let mut codegen = CodeGen::for_function(&self.function);
        let stack = self.stack.clone();
        let below = stack
            .len()
            .checked_sub(1)
            .ok_or_else(|| TraceError::Inner(format!("{} without a condition", instr.opcode)))?;
        let keeps_cond = matches!(instr.opcode, Opcode::JumpIfFalseOrPop | Opcode::JumpIfTrueOrPop);
        let jump_stack = below + keeps_cond as usize;

        let fall_through = codegen.gen_resume_fn_at(index + 1, below)?;
        let jump = codegen.gen_resume_fn_at(target, jump_stack)?;
        let mut inputs = Vec::new();
        Self::add_missing(&mut inputs, fall_through.as_ref());
        Self::add_missing(&mut inputs, jump.as_ref());

        let spilled = self.spill_state(&mut codegen, &stack, &inputs, &[])?;
        Self::write_cells(&mut codegen, &spilled);
        codegen.gen_load_fast(&spilled.stack[below]);
        let jump_target = Instruction::new(Opcode::Nop, ArgVal::None);
        let jump_opcode = match instr.opcode {
            Opcode::PopJumpIfTrue | Opcode::JumpIfTrueOrPop => Opcode::PopJumpIfTrue,
            _ => Opcode::PopJumpIfFalse,
        };
        codegen.gen_jump(jump_opcode, jump_target.id);
        Self::emit_resume(&mut codegen, fall_through.as_ref(), &spilled.stack[..below], &spilled.inputs)?;
        codegen.add_instr(jump_target);
        Self::emit_resume(&mut codegen, jump.as_ref(), &spilled.stack[..jump_stack], &spilled.inputs)?;
        Ok(codegen)
    }

    /// Advance a native iterator natively; resume in the loop body with the
    /// next element, or at the loop exit once it is exhausted
    fn break_at_for_iter(&mut self, index: usize) -> TraceResult<CodeGen> {
        let instr = self.instructions[index].clone();
        let exit = self.target_of(&instr)?;
        let mut codegen = CodeGen::for_function(&self.function);
        let stack = self.stack.clone();
        let below = stack
            .len()
            .checked_sub(1)
            .ok_or_else(|| TraceError::Inner("FOR_ITER without an iterator".into()))?;

        let body = codegen.gen_resume_fn_at(index + 1, below + 2)?;
        let done = codegen.gen_resume_fn_at(exit, below)?;
        let mut inputs = Vec::new();
        Self::add_missing(&mut inputs, body.as_ref());
        Self::add_missing(&mut inputs, done.as_ref());

        let spilled = self.spill_state(&mut codegen, &stack, &inputs, &[])?;
        Self::write_cells(&mut codegen, &spilled);
        codegen.gen_load_fast(&spilled.stack[below]);
        let exhausted = Instruction::new(Opcode::Nop, ArgVal::None);
        codegen.gen_jump(Opcode::ForIter, exhausted.id);

        let element = self.next_spill_name();
        codegen.gen_store_fast(&element);
        codegen.gen_pop_top();
        let mut body_stack = spilled.stack.clone();
        body_stack.push(element);
        Self::emit_resume(&mut codegen, body.as_ref(), &body_stack, &spilled.inputs)?;

        codegen.add_instr(exhausted);
        Self::emit_resume(&mut codegen, done.as_ref(), &spilled.stack[..below], &spilled.inputs)?;
        Ok(codegen)
    }

    /// Roll back to the start of the current iteration of the innermost
    /// loop and run the rest of it in generated functions
    fn break_in_loop(&mut self) -> TraceResult<CodeGen> {
        let frame = self
            .loops
            .pop()
            .ok_or_else(|| TraceError::Inner("loop break outside a loop".into()))?;
        if self.instructions[frame.for_iter..frame.exit]
            .iter()
            .any(|instr| instr.opcode == Opcode::ReturnValue)
        {
            return Err(TraceError::NotImplemented("graph break in a loop whose body returns".into()));
        }
        self.restore(frame.snapshot);
        self.loops.clear();

        let iterator = self
            .stack
            .last()
            .cloned()
            .ok_or_else(|| TraceError::Inner("loop without an iterator".into()))?;
        let VariableKind::Iter(iter) = iterator.kind() else {
            return Err(TraceError::Inner(format!("loop over {}", iterator)));
        };
        let below = self.stack[..self.stack.len() - 1].to_vec();
        let mut codegen = CodeGen::for_function(&self.function);
        let exit_resume = codegen.gen_resume_fn_at(frame.exit, below.len())?;

        debug!(
            target: "symtrace::executor",
            code = %self.code.name,
            for_iter = frame.for_iter,
            iteration = frame.iteration,
            remaining = iter.remaining(),
            "Breaking out of unrolled loop"
        );

        let spilled = if frame.iteration == 0 {
            // Nothing of the loop ran yet: hand the whole loop over.
            let loop_fn = codegen.gen_for_loop_fn_between(LOOP_ITER_NAME, frame.for_iter, frame.exit)?;
            self.check_loop_inputs(&loop_fn)?;
            let mut inputs: Vec<String> = loop_fn
                .inputs
                .iter()
                .filter(|name| name.as_str() != LOOP_ITER_NAME)
                .cloned()
                .collect();
            Self::add_missing(&mut inputs, exit_resume.as_ref());

            let mut spilled = self.spill_state(&mut codegen, &below, &inputs, std::slice::from_ref(&iterator))?;
            Self::write_cells(&mut codegen, &spilled);
            spilled
                .inputs
                .insert(LOOP_ITER_NAME.to_string(), spilled.extra[0].clone());
            Self::emit_call_and_unpack(&mut codegen, &loop_fn, None, &spilled.inputs);
            spilled
        } else {
            // Earlier iterations are in the graph; run the remaining
            // elements through the body one call at a time.
            let body_fn = codegen.gen_loop_body_between(frame.for_iter, frame.for_iter + 1, frame.exit)?;
            self.check_loop_inputs(&body_fn)?;
            let mut inputs: Vec<String> = body_fn
                .inputs
                .iter()
                .filter(|name| name.as_str() != BREAK_FLAG_NAME)
                .cloned()
                .collect();
            Self::add_missing(&mut inputs, exit_resume.as_ref());

            let mut spilled = self.spill_state(&mut codegen, &below, &inputs, std::slice::from_ref(&iter.source))?;
            let mut elements = Vec::with_capacity(iter.remaining());
            for position in iter.pos..iter.len {
                iter.reconstruct_element(position, &mut codegen)?;
                let tmp = self.next_spill_name();
                codegen.gen_store_fast(&tmp);
                elements.push(tmp);
            }
            Self::write_cells(&mut codegen, &spilled);

            codegen.gen_load_const(Value::Bool(true));
            let flag = self.next_spill_name();
            codegen.gen_store_fast(&flag);
            spilled.inputs.insert(BREAK_FLAG_NAME.to_string(), flag.clone());

            let exit = Instruction::new(Opcode::Nop, ArgVal::None);
            for element in &elements {
                Self::emit_call_and_unpack(&mut codegen, &body_fn, Some(element), &spilled.inputs);
                codegen.gen_load_fast(&flag);
                codegen.gen_jump(Opcode::PopJumpIfFalse, exit.id);
            }
            codegen.add_instr(exit);
            spilled
        };

        Self::emit_resume(&mut codegen, exit_resume.as_ref(), &spilled.stack, &spilled.inputs)?;
        Ok(codegen)
    }

    /// Loop functions pass locals by value, so a cell cannot be one of them
    fn check_loop_inputs(&self, generated: &GeneratedFn) -> TraceResult<()> {
        match generated.inputs.iter().find(|name| self.code.cellvars.contains(name)) {
            Some(name) => Err(TraceError::NotImplemented(format!(
                "graph break in a loop that uses cell '{}'",
                name
            ))),
            None => Ok(()),
        }
    }

    // === Spilling ===

    pub(super) fn next_spill_name(&mut self) -> String {
        let name = format!("__spill_{}", self.spills);
        self.spills += 1;
        name
    }

    fn spill(&mut self, codegen: &mut CodeGen, variable: &Variable) -> TraceResult<String> {
        variable.reconstruct(codegen)?;
        let name = self.next_spill_name();
        codegen.gen_store_fast(&name);
        Ok(name)
    }

    /// Compile the graph and move everything the continuation reads into
    /// temporaries. Cells are read here and written by [`Self::write_cells`].
    fn spill_state(
        &mut self,
        codegen: &mut CodeGen,
        stack: &[Variable],
        inputs: &[String],
        extra: &[Variable],
    ) -> TraceResult<Spilled> {
        let input_vars: Vec<(String, Option<Variable>)> =
            inputs.iter().map(|name| (name.clone(), self.input_value(name))).collect();
        let cells = self.cell_writes();

        let mut needed: Vec<Variable> = stack.to_vec();
        needed.extend(input_vars.iter().filter_map(|(_, v)| v.clone()));
        needed.extend(cells.iter().map(|(_, v)| v.clone()));
        needed.extend_from_slice(extra);
        self.graph.start_compile(&needed, codegen)?;

        let mut spilled = Spilled::default();
        for variable in stack {
            spilled.stack.push(self.spill(codegen, variable)?);
        }
        for (name, variable) in &input_vars {
            let tmp = match variable {
                Some(variable) => self.spill(codegen, variable)?,
                None => {
                    // Unbound here: the continuation sees `None`.
                    codegen.gen_load_const(Value::None);
                    let tmp = self.next_spill_name();
                    codegen.gen_store_fast(&tmp);
                    tmp
                }
            };
            spilled.inputs.insert(name.clone(), tmp);
        }
        for variable in extra {
            spilled.extra.push(self.spill(codegen, variable)?);
        }
        for (name, variable) in &cells {
            let tmp = self.spill(codegen, variable)?;
            spilled.cells.push((name.clone(), tmp));
        }
        Ok(spilled)
    }

    fn write_cells(codegen: &mut CodeGen, spilled: &Spilled) {
        for (name, tmp) in &spilled.cells {
            codegen.gen_load_fast(tmp);
            codegen.gen_store_deref(name);
        }
    }

    /// Cells assigned during the trace, with their current values
    fn cell_writes(&self) -> Vec<(String, Variable)> {
        self.written_cells
            .iter()
            .filter_map(|name| self.cells.get(name).map(|v| (name.clone(), v.clone())))
            .collect()
    }

    /// Value a resume function receives for the local `name`
    fn input_value(&self, name: &str) -> Option<Variable> {
        let bound = if self.code.cellvars.iter().any(|n| n == name) {
            self.cells.get(name).or_else(|| self.locals.get(name))
        } else {
            self.locals.get(name)
        };
        if let Some(variable) = bound {
            return Some(variable.clone());
        }
        // A parameter the trace never read is passed through untouched.
        self.pending_params
            .get(name)
            .map(|value| Variable::new(VariableKind::Object(value.clone()), Tracker::Local(name.to_string())))
    }

    fn add_missing(inputs: &mut Vec<String>, generated: Option<&GeneratedFn>) {
        for name in generated.iter().flat_map(|g| g.inputs.iter()) {
            if !inputs.contains(name) {
                inputs.push(name.clone());
            }
        }
    }

    // === Continuations ===

    fn emit_resume(
        codegen: &mut CodeGen,
        resume: Option<&GeneratedFn>,
        stack: &[String],
        inputs: &HashMap<String, String>,
    ) -> TraceResult<()> {
        match resume {
            None => {
                let top = stack
                    .last()
                    .ok_or_else(|| TraceError::Inner("return with an empty stack".into()))?;
                codegen.gen_load_fast(top);
            }
            Some(resume) => {
                codegen.gen_load_object(Value::Function(resume.function.clone()), &resume.function.name);
                for tmp in stack {
                    codegen.gen_load_fast(tmp);
                }
                for name in &resume.inputs {
                    match inputs.get(name) {
                        Some(tmp) => codegen.gen_load_fast(tmp),
                        None => codegen.gen_load_const(Value::None),
                    };
                }
                codegen.gen_call_function((stack.len() + resume.inputs.len()) as u32);
            }
        }
        codegen.gen_return();
        Ok(())
    }

    /// Call a generated loop function and store its results back into the
    /// temporaries of its inputs
    fn emit_call_and_unpack(
        codegen: &mut CodeGen,
        generated: &GeneratedFn,
        element: Option<&String>,
        inputs: &HashMap<String, String>,
    ) {
        codegen.gen_load_object(Value::Function(generated.function.clone()), &generated.function.name);
        if let Some(element) = element {
            codegen.gen_load_fast(element);
        }
        for name in &generated.inputs {
            match inputs.get(name) {
                Some(tmp) => codegen.gen_load_fast(tmp),
                None => codegen.gen_load_const(Value::None),
            };
        }
        let argc = generated.inputs.len() + element.is_some() as usize;
        codegen.gen_call_function(argc as u32);
        codegen.gen_unpack_sequence(generated.inputs.len() as u32);
        for name in &generated.inputs {
            match inputs.get(name) {
                Some(tmp) => codegen.gen_store_fast(tmp),
                None => codegen.gen_pop_top(),
            };
        }
    }
}
