//! Finalizing instruction lists into code objects
//!
//! The passes run in a fixed order: [`modify_instrs`] assigns offsets and
//! jump arguments, [`modify_vars`] re-indexes name and constant arguments
//! against the code options, [`compute_stack_bounds`] checks the stack
//! discipline, and [`reassemble_line_table`] produces the byte stream and
//! the line table.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::trace;

use crate::error::{TraceError, TraceResult};

use super::code::{CodeObject, CodeOptions};
use super::instruction::{ArgVal, InstrId, Instruction};
use super::opcodes::{Opcode, INSTR_SIZE};

/// Largest delta a single line-table entry carries in either column
const LNOTAB_MAX_DELTA: i64 = 127;
const LNOTAB_MIN_LINE_DELTA: i64 = -128;

fn index_map(instructions: &[Instruction]) -> HashMap<InstrId, usize> {
    instructions
        .iter()
        .enumerate()
        .map(|(index, instr)| (instr.id, index))
        .collect()
}

fn encodable(instr: &Instruction, arg: i64) -> TraceResult<u32> {
    u16::try_from(arg).map(u32::from).map_err(|_| {
        TraceError::Inner(format!(
            "argument {} of {} does not fit in 16 bits",
            arg, instr.opcode
        ))
    })
}

/// Assign offsets and compute jump arguments from `jump_to`
pub fn modify_instrs(instructions: &mut [Instruction]) -> TraceResult<()> {
    for (index, instr) in instructions.iter_mut().enumerate() {
        instr.offset = Some(index * INSTR_SIZE);
    }
    let positions = index_map(instructions);
    for instr in instructions.iter_mut() {
        let Some(target) = instr.jump_to else {
            if instr.opcode.is_jump() {
                return Err(TraceError::Inner(format!("{} has no jump target", instr.opcode)));
            }
            continue;
        };
        let target_index = *positions.get(&target).ok_or_else(|| {
            TraceError::Inner(format!("{} jumps to missing instruction #{}", instr.opcode, target.0))
        })?;
        let target_offset = (target_index * INSTR_SIZE) as i64;
        let offset = instr.offset.unwrap_or_default() as i64;
        let arg = if instr.opcode.is_rel_jump() {
            target_offset - (offset + INSTR_SIZE as i64)
        } else {
            target_offset
        };
        if arg < 0 {
            return Err(TraceError::Inner(format!(
                "relative jump {} at offset {} points backwards",
                instr.opcode, offset
            )));
        }
        instr.arg = Some(encodable(instr, arg)?);
    }
    Ok(())
}

fn intern(pool: &mut Vec<String>, name: &str) -> usize {
    match pool.iter().position(|n| n == name) {
        Some(index) => index,
        None => {
            pool.push(name.to_string());
            pool.len() - 1
        }
    }
}

/// Recompute name, local, cell and constant arguments from `argval`.
///
/// Missing local, name and constant entries are appended to their pools.
/// Constants are matched by identity so equal-but-distinct literals keep
/// separate slots.
pub fn modify_vars(instructions: &mut [Instruction], options: &mut CodeOptions) -> TraceResult<()> {
    for instr in instructions.iter_mut() {
        if instr.jump_to.is_some() {
            continue;
        }
        let index = match (&instr.argval, instr.opcode) {
            (ArgVal::Name(name), op) if op.has_local() => intern(&mut options.varnames, name),
            (ArgVal::Name(name), op) if op.has_free() => {
                if let Some(i) = options.cellvars.iter().position(|n| n == name) {
                    i
                } else if let Some(i) = options.freevars.iter().position(|n| n == name) {
                    options.cellvars.len() + i
                } else {
                    return Err(TraceError::Inner(format!(
                        "{} refers to unknown cell or free variable '{}'",
                        op, name
                    )));
                }
            }
            (ArgVal::Name(name), op) if op.has_name() => intern(&mut options.names, name),
            (ArgVal::Const(value), Opcode::LoadConst) => {
                match options.consts.iter().position(|c| c.same_constant(value)) {
                    Some(i) => i,
                    None => {
                        options.consts.push(value.clone());
                        options.consts.len() - 1
                    }
                }
            }
            (ArgVal::Compare(op), _) => *op as usize,
            (ArgVal::Count(n), _) => *n as usize,
            (ArgVal::None, _) => 0,
            (argval, op) => {
                return Err(TraceError::Inner(format!("argument {:?} does not fit {}", argval, op)))
            }
        };
        instr.arg = Some(encodable(instr, index as i64)?);
    }
    Ok(())
}

/// Maximum and minimum operand-stack depth over all reachable points.
///
/// Depth ranges are propagated along fallthrough and jump edges until they
/// stop changing. A negative depth, a dangling jump target, control
/// running off the end, or depth growing without bound is an internal
/// error.
pub fn compute_stack_bounds(instructions: &[Instruction]) -> TraceResult<(u32, i32)> {
    if instructions.is_empty() {
        return Ok((0, 0));
    }
    let positions = index_map(instructions);
    // Balanced code never exceeds the sum of all pushes.
    let cap: i32 = instructions
        .iter()
        .map(|i| i.opcode.stack_effect(i.arg.unwrap_or(0), None).max(0))
        .sum::<i32>()
        + 1;

    let mut ranges: Vec<Option<(i32, i32)>> = vec![None; instructions.len()];
    ranges[0] = Some((0, 0));
    let mut worklist = vec![0usize];
    let (mut max_depth, mut min_depth) = (0i32, 0i32);

    while let Some(index) = worklist.pop() {
        let Some((lo, hi)) = ranges[index] else {
            continue;
        };
        max_depth = max_depth.max(hi);
        min_depth = min_depth.min(lo);

        let instr = &instructions[index];
        let arg = instr.arg.unwrap_or(0);
        let mut edges: Vec<(Option<usize>, i32)> = Vec::with_capacity(2);
        if let Some(target) = instr.jump_to {
            let target_index = *positions.get(&target).ok_or_else(|| {
                TraceError::Inner(format!(
                    "{} at #{} jumps to missing instruction #{}",
                    instr.opcode, index, target.0
                ))
            })?;
            edges.push((Some(target_index), instr.opcode.stack_effect(arg, Some(true))));
        }
        if !instr.opcode.is_terminator() {
            if index + 1 >= instructions.len() {
                return Err(TraceError::Inner(format!(
                    "control runs off the end after {} at #{}",
                    instr.opcode, index
                )));
            }
            let jump = instr.jump_to.map(|_| false);
            edges.push((Some(index + 1), instr.opcode.stack_effect(arg, jump)));
        } else if instr.jump_to.is_none() {
            edges.push((None, instr.opcode.stack_effect(arg, None)));
        }

        for (next, effect) in edges {
            let (next_lo, next_hi) = (lo + effect, hi + effect);
            if next_lo < 0 {
                return Err(TraceError::Inner(format!(
                    "negative stack depth {} after {} at #{}",
                    next_lo, instr.opcode, index
                )));
            }
            if next_hi > cap {
                return Err(TraceError::Inner(format!(
                    "unbounded stack growth through {} at #{}",
                    instr.opcode, index
                )));
            }
            let Some(next) = next else {
                continue;
            };
            let merged = match ranges[next] {
                None => Some((next_lo, next_hi)),
                Some((a, b)) if next_lo < a || next_hi > b => Some((a.min(next_lo), b.max(next_hi))),
                Some(_) => None,
            };
            if let Some(range) = merged {
                ranges[next] = Some(range);
                worklist.push(next);
            }
        }
    }
    Ok((max_depth as u32, min_depth))
}

/// Line-table entries for one `(byte, line)` advance, split so that no
/// entry exceeds the per-entry range
fn lnotab_entries(mut byte_delta: i64, mut line_delta: i64) -> Vec<u8> {
    let mut out = Vec::new();
    while byte_delta > LNOTAB_MAX_DELTA {
        out.extend_from_slice(&[LNOTAB_MAX_DELTA as u8, 0]);
        byte_delta -= LNOTAB_MAX_DELTA;
    }
    while line_delta > LNOTAB_MAX_DELTA {
        out.extend_from_slice(&[byte_delta as u8, LNOTAB_MAX_DELTA as u8]);
        byte_delta = 0;
        line_delta -= LNOTAB_MAX_DELTA;
    }
    while line_delta < LNOTAB_MIN_LINE_DELTA {
        out.extend_from_slice(&[byte_delta as u8, LNOTAB_MIN_LINE_DELTA as i8 as u8]);
        byte_delta = 0;
        line_delta -= LNOTAB_MIN_LINE_DELTA;
    }
    out.extend_from_slice(&[byte_delta as u8, line_delta as i8 as u8]);
    out
}

/// Encode instructions into code bytes and a line table
pub fn reassemble_line_table(instructions: &[Instruction], first_line: u32) -> TraceResult<(Vec<u8>, Vec<u8>)> {
    let mut code = Vec::with_capacity(instructions.len() * INSTR_SIZE);
    let mut lnotab = Vec::new();
    let mut current_line = first_line as i64;
    let mut current_offset = 0i64;

    for instr in instructions {
        if let Some(line) = instr.starts_line {
            let offset = code.len() as i64;
            let (byte_delta, line_delta) = (offset - current_offset, line as i64 - current_line);
            if byte_delta != 0 || line_delta != 0 {
                lnotab.extend(lnotab_entries(byte_delta, line_delta));
            }
            current_line = line as i64;
            current_offset = offset;
        }
        let arg = encodable(instr, instr.arg.unwrap_or(0) as i64)?;
        code.push(instr.opcode.to_byte());
        code.extend_from_slice(&(arg as u16).to_be_bytes());
    }
    Ok((code, lnotab))
}

/// Run all finalization passes and build a code object
pub fn gen_new_code(instructions: &mut [Instruction], options: &mut CodeOptions) -> TraceResult<Arc<CodeObject>> {
    modify_instrs(instructions)?;
    modify_vars(instructions, options)?;
    let (max_depth, _) = compute_stack_bounds(instructions)?;
    let (code, lnotab) = reassemble_line_table(instructions, options.firstlineno)?;
    options.code = code;
    options.lnotab = lnotab;
    options.stacksize = max_depth;
    trace!(
        target: "symtrace::codegen",
        name = %options.name,
        instructions = instructions.len(),
        stacksize = max_depth,
        "Assembled code object"
    );
    CodeObject::new(options.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::instruction::get_instructions;
    use crate::vm::Value;

    fn instr(opcode: Opcode, argval: ArgVal) -> Instruction {
        Instruction::new(opcode, argval)
    }

    fn load_const(v: i64) -> Instruction {
        instr(Opcode::LoadConst, ArgVal::Const(Value::Int(v)))
    }

    #[test]
    fn test_balanced_sequence_bounds() {
        let instrs = vec![
            load_const(1),
            load_const(2),
            instr(Opcode::BinaryAdd, ArgVal::None),
            instr(Opcode::ReturnValue, ArgVal::None),
        ];
        let (max, min) = compute_stack_bounds(&instrs).expect("balanced code");
        assert_eq!(max, 2);
        assert!(min >= 0);
    }

    #[test]
    fn test_unbalanced_sequence_is_fatal() {
        let instrs = vec![
            load_const(1),
            instr(Opcode::BinaryAdd, ArgVal::None),
            instr(Opcode::ReturnValue, ArgVal::None),
        ];
        assert!(matches!(compute_stack_bounds(&instrs), Err(TraceError::Inner(_))));

        let pop_empty = vec![instr(Opcode::ReturnValue, ArgVal::None)];
        assert!(matches!(compute_stack_bounds(&pop_empty), Err(TraceError::Inner(_))));
    }

    #[test]
    fn test_dangling_jump_is_fatal() {
        let mut jump = instr(Opcode::JumpAbsolute, ArgVal::None);
        jump.jump_to = Some(InstrId::fresh());
        assert!(matches!(compute_stack_bounds(&[jump]), Err(TraceError::Inner(_))));
    }

    #[test]
    fn test_loop_growth_is_fatal() {
        let head = instr(Opcode::LoadConst, ArgVal::Const(Value::None));
        let back = Instruction::jump(Opcode::JumpAbsolute, head.id);
        assert!(matches!(compute_stack_bounds(&[head, back]), Err(TraceError::Inner(_))));
    }

    #[test]
    fn test_for_iter_edges() {
        // for _ in it: pass
        let mut instrs = vec![
            instr(Opcode::LoadFast, ArgVal::Name("it".into())),
            instr(Opcode::GetIter, ArgVal::None),
        ];
        let exit = instr(Opcode::LoadConst, ArgVal::Const(Value::None));
        let for_iter = Instruction::jump(Opcode::ForIter, exit.id);
        let for_iter_id = for_iter.id;
        instrs.push(for_iter);
        instrs.push(instr(Opcode::PopTop, ArgVal::None));
        instrs.push(Instruction::jump(Opcode::JumpAbsolute, for_iter_id));
        instrs.push(exit);
        instrs.push(instr(Opcode::ReturnValue, ArgVal::None));
        let (max, min) = compute_stack_bounds(&instrs).expect("loop is balanced");
        assert_eq!(max, 2);
        assert_eq!(min, 0);
    }

    #[test]
    fn test_lnotab_splitting() {
        assert_eq!(lnotab_entries(3, 1), vec![3, 1]);
        assert_eq!(lnotab_entries(300, 0), vec![127, 0, 127, 0, 46, 0]);
        assert_eq!(lnotab_entries(6, 300), vec![6, 127, 0, 127, 0, 46]);
        assert_eq!(lnotab_entries(0, -1), vec![0, 0xFF]);
        assert_eq!(lnotab_entries(0, -200), vec![0, 0x80, 0, (-72i8) as u8]);
    }

    #[test]
    fn test_line_table_roundtrips_through_decoder() {
        let mut instrs = vec![load_const(1), load_const(2), instr(Opcode::BinaryAdd, ArgVal::None)];
        instrs.push(instr(Opcode::ReturnValue, ArgVal::None));
        instrs[0].starts_line = Some(1);
        instrs[1].starts_line = Some(400);
        instrs[3].starts_line = Some(2);
        let mut options = CodeOptions {
            name: "lines".into(),
            firstlineno: 1,
            ..Default::default()
        };
        let code = gen_new_code(&mut instrs, &mut options).expect("assembles");
        let decoded = get_instructions(&code).expect("decodes");
        let lines: Vec<Option<u32>> = decoded.iter().map(|i| i.starts_line).collect();
        assert_eq!(lines, vec![Some(1), Some(400), None, Some(2)]);
    }

    #[test]
    fn test_constants_deduplicate_by_identity() {
        let mut instrs = vec![
            instr(Opcode::LoadConst, ArgVal::Const(Value::Int(1))),
            instr(Opcode::LoadConst, ArgVal::Const(Value::Bool(true))),
            instr(Opcode::LoadConst, ArgVal::Const(Value::Int(1))),
            instr(Opcode::BuildTuple, ArgVal::Count(3)),
            instr(Opcode::ReturnValue, ArgVal::None),
        ];
        let mut options = CodeOptions {
            name: "consts".into(),
            ..Default::default()
        };
        let code = gen_new_code(&mut instrs, &mut options).expect("assembles");
        assert_eq!(code.consts.len(), 2);
        assert_eq!(instrs[0].arg, instrs[2].arg);
        assert_ne!(instrs[0].arg, instrs[1].arg);
    }

    #[test]
    fn test_jump_arguments() {
        let ret = instr(Opcode::ReturnValue, ArgVal::None);
        let mut instrs = vec![
            load_const(0),
            Instruction::jump(Opcode::JumpForward, ret.id),
            load_const(1),
            ret,
        ];
        modify_instrs(&mut instrs).expect("valid jumps");
        // relative to the next instruction at offset 6, target at offset 9
        assert_eq!(instrs[1].arg, Some(3));
    }
}
