//! Decoded instructions
//!
//! Decoding resolves every jump argument to the [`InstrId`] of its target,
//! so transformation passes can insert, remove and reorder instructions
//! without tracking byte offsets. Offsets and jump arguments are recomputed
//! by [`super::assemble::modify_instrs`] when code is finalized.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::{TraceError, TraceResult};
use crate::vm::Value;

use super::code::CodeObject;
use super::opcodes::{CompareOp, Opcode, INSTR_SIZE};

/// Generated ids start above any decoded instruction index.
const FIRST_FRESH_ID: u32 = 1 << 24;

static NEXT_INSTR_ID: AtomicU32 = AtomicU32::new(FIRST_FRESH_ID);

/// Stable identity of an instruction across transformation passes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstrId(pub u32);

impl InstrId {
    pub fn fresh() -> Self {
        InstrId(NEXT_INSTR_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Decoded meaning of an instruction argument
#[derive(Debug, Clone)]
pub enum ArgVal {
    None,
    Count(u32),
    /// Local, cell/free or pool name depending on the opcode
    Name(String),
    Const(Value),
    Compare(CompareOp),
}

impl ArgVal {
    pub fn name(&self) -> Option<&str> {
        match self {
            ArgVal::Name(name) => Some(name),
            _ => None,
        }
    }

    pub fn count(&self) -> u32 {
        match self {
            ArgVal::Count(n) => *n,
            _ => 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Instruction {
    pub id: InstrId,
    pub opcode: Opcode,
    /// Encoded argument, recomputed when code is assembled
    pub arg: Option<u32>,
    pub argval: ArgVal,
    pub offset: Option<usize>,
    pub starts_line: Option<u32>,
    pub jump_to: Option<InstrId>,
}

impl Instruction {
    pub fn new(opcode: Opcode, argval: ArgVal) -> Self {
        let arg = match &argval {
            ArgVal::Count(n) => Some(*n),
            ArgVal::Compare(op) => Some(*op as u32),
            _ => None,
        };
        Self {
            id: InstrId::fresh(),
            opcode,
            arg,
            argval,
            offset: None,
            starts_line: None,
            jump_to: None,
        }
    }

    pub fn jump(opcode: Opcode, target: InstrId) -> Self {
        let mut instr = Self::new(opcode, ArgVal::None);
        instr.jump_to = Some(target);
        instr
    }

    /// Copy with a fresh identity
    pub fn duplicate(&self) -> Self {
        Self {
            id: InstrId::fresh(),
            ..self.clone()
        }
    }

    pub fn is_jump(&self) -> bool {
        self.opcode.is_jump()
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.starts_line {
            Some(line) => write!(f, "{:>4} ", line)?,
            None => write!(f, "     ")?,
        }
        match self.offset {
            Some(offset) => write!(f, "{:>5} ", offset)?,
            None => write!(f, "    ? ")?,
        }
        write!(f, "{:<24}", self.opcode.mnemonic())?;
        match (&self.argval, self.jump_to) {
            (_, Some(target)) => write!(f, " -> #{}", target.0),
            (ArgVal::Name(name), _) => write!(f, " {}", name),
            (ArgVal::Const(value), _) => write!(f, " {}", value.repr()),
            (ArgVal::Compare(op), _) => write!(f, " {}", op.symbol()),
            (ArgVal::Count(n), _) => write!(f, " {}", n),
            (ArgVal::None, _) => Ok(()),
        }
    }
}

/// Look up an instruction index by id
pub fn find_index(instructions: &[Instruction], id: InstrId) -> Option<usize> {
    instructions.iter().position(|instr| instr.id == id)
}

/// Decode a code object into instructions with resolved jump targets
pub fn get_instructions(code: &CodeObject) -> TraceResult<Vec<Instruction>> {
    let line_starts = code.line_starts();
    let count = code.code.len() / INSTR_SIZE;
    let mut instructions = Vec::with_capacity(count);

    for index in 0..count {
        let offset = index * INSTR_SIZE;
        let byte = code.code[offset];
        let opcode = Opcode::from_byte(byte)
            .ok_or_else(|| TraceError::Inner(format!("invalid opcode 0x{:02x} at offset {}", byte, offset)))?;
        let arg = u16::from_be_bytes([code.code[offset + 1], code.code[offset + 2]]) as u32;
        let missing = |table: &str| {
            TraceError::Inner(format!(
                "{} argument {} out of range of {} in {}",
                opcode, arg, table, code.name
            ))
        };

        let mut jump_to = None;
        let argval = if opcode.is_jump() {
            let target = if opcode.is_rel_jump() {
                offset + INSTR_SIZE + arg as usize
            } else {
                arg as usize
            };
            if target % INSTR_SIZE != 0 || target / INSTR_SIZE >= count {
                return Err(TraceError::Inner(format!(
                    "{} at offset {} jumps to invalid offset {}",
                    opcode, offset, target
                )));
            }
            jump_to = Some(InstrId((target / INSTR_SIZE) as u32));
            ArgVal::None
        } else if opcode.has_local() {
            ArgVal::Name(code.varnames.get(arg as usize).ok_or_else(|| missing("varnames"))?.clone())
        } else if opcode.has_free() {
            ArgVal::Name(code.cell_or_free_name(arg as usize).ok_or_else(|| missing("cell/free vars"))?.to_string())
        } else if opcode.has_name() {
            ArgVal::Name(code.names.get(arg as usize).ok_or_else(|| missing("names"))?.clone())
        } else if opcode == Opcode::LoadConst {
            ArgVal::Const(code.consts.get(arg as usize).ok_or_else(|| missing("consts"))?.clone())
        } else if opcode == Opcode::CompareOp {
            ArgVal::Compare(CompareOp::from_arg(arg).ok_or_else(|| missing("compare ops"))?)
        } else if opcode.has_argument() {
            ArgVal::Count(arg)
        } else {
            ArgVal::None
        };

        instructions.push(Instruction {
            id: InstrId(index as u32),
            opcode,
            arg: Some(arg),
            argval,
            offset: Some(offset),
            starts_line: line_starts.get(&offset).copied(),
            jump_to,
        });
    }
    Ok(instructions)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_ids_do_not_collide_with_decoded() {
        let a = InstrId::fresh();
        let b = InstrId::fresh();
        assert_ne!(a, b);
        assert!(a.0 >= FIRST_FRESH_ID);
    }

    #[test]
    fn test_duplicate_changes_identity_only() {
        let original = Instruction::new(Opcode::BuildTuple, ArgVal::Count(2));
        let copy = original.duplicate();
        assert_ne!(original.id, copy.id);
        assert_eq!(copy.opcode, Opcode::BuildTuple);
        assert_eq!(copy.arg, Some(2));
    }
}
