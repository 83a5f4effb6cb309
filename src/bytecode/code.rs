//! Immutable code objects and their mutable options

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{TraceError, TraceResult};
use crate::vm::value::next_object_id;
use crate::vm::Value;

use super::instruction::get_instructions;
use super::opcodes::{Opcode, INSTR_SIZE};

/// Mutable description of a code object.
///
/// A code generator edits one of these alongside its instruction list and
/// finalizes both into a [`CodeObject`].
#[derive(Debug, Clone, Default)]
pub struct CodeOptions {
    pub argcount: u32,
    pub stacksize: u32,
    pub flags: u32,
    pub code: Vec<u8>,
    pub consts: Vec<Value>,
    pub names: Vec<String>,
    pub varnames: Vec<String>,
    pub freevars: Vec<String>,
    pub cellvars: Vec<String>,
    pub filename: String,
    pub name: String,
    pub firstlineno: u32,
    pub lnotab: Vec<u8>,
}

/// A finalized, runnable unit of guest code
pub struct CodeObject {
    id: u64,
    pub argcount: u32,
    pub nlocals: u32,
    pub stacksize: u32,
    pub flags: u32,
    pub code: Vec<u8>,
    pub consts: Vec<Value>,
    pub names: Vec<String>,
    pub varnames: Vec<String>,
    pub freevars: Vec<String>,
    pub cellvars: Vec<String>,
    pub filename: String,
    pub name: String,
    pub firstlineno: u32,
    pub lnotab: Vec<u8>,
    raw: Vec<(Opcode, u32)>,
}

impl CodeObject {
    /// Validate and freeze code options
    pub fn new(options: CodeOptions) -> TraceResult<Arc<Self>> {
        if options.code.len() % INSTR_SIZE != 0 {
            return Err(TraceError::Inner(format!(
                "code of {} is {} bytes, not a multiple of {}",
                options.name,
                options.code.len(),
                INSTR_SIZE
            )));
        }
        if options.argcount as usize > options.varnames.len() {
            return Err(TraceError::Inner(format!(
                "{} declares {} arguments but only {} local names",
                options.name,
                options.argcount,
                options.varnames.len()
            )));
        }
        let raw = options
            .code
            .chunks_exact(INSTR_SIZE)
            .enumerate()
            .map(|(index, chunk)| {
                Opcode::from_byte(chunk[0])
                    .map(|op| (op, u16::from_be_bytes([chunk[1], chunk[2]]) as u32))
                    .ok_or_else(|| {
                        TraceError::Inner(format!(
                            "invalid opcode 0x{:02x} at offset {} in {}",
                            chunk[0],
                            index * INSTR_SIZE,
                            options.name
                        ))
                    })
            })
            .collect::<TraceResult<Vec<_>>>()?;

        Ok(Arc::new(Self {
            id: next_object_id(),
            argcount: options.argcount,
            nlocals: options.varnames.len() as u32,
            stacksize: options.stacksize,
            flags: options.flags,
            code: options.code,
            consts: options.consts,
            names: options.names,
            varnames: options.varnames,
            freevars: options.freevars,
            cellvars: options.cellvars,
            filename: options.filename,
            name: options.name,
            firstlineno: options.firstlineno,
            lnotab: options.lnotab,
            raw,
        }))
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Decoded `(opcode, arg)` pairs, one per instruction
    #[inline]
    pub fn raw(&self) -> &[(Opcode, u32)] {
        &self.raw
    }

    /// Mutable copy of this code object's options
    pub fn options(&self) -> CodeOptions {
        CodeOptions {
            argcount: self.argcount,
            stacksize: self.stacksize,
            flags: self.flags,
            code: self.code.clone(),
            consts: self.consts.clone(),
            names: self.names.clone(),
            varnames: self.varnames.clone(),
            freevars: self.freevars.clone(),
            cellvars: self.cellvars.clone(),
            filename: self.filename.clone(),
            name: self.name.clone(),
            firstlineno: self.firstlineno,
            lnotab: self.lnotab.clone(),
        }
    }

    /// Cell variables first, then free variables
    pub fn cell_or_free_name(&self, index: usize) -> Option<&str> {
        match index.checked_sub(self.cellvars.len()) {
            None => Some(self.cellvars[index].as_str()),
            Some(free) => self.freevars.get(free).map(String::as_str),
        }
    }

    pub fn has_free_vars(&self) -> bool {
        !self.freevars.is_empty()
    }

    /// Map of instruction offsets that start a source line
    pub fn line_starts(&self) -> HashMap<usize, u32> {
        let mut starts = HashMap::new();
        let mut last_line: Option<i64> = None;
        let mut line = self.firstlineno as i64;
        let mut addr = 0usize;
        for pair in self.lnotab.chunks_exact(2) {
            let (byte_incr, line_incr) = (pair[0], pair[1] as i8);
            if byte_incr != 0 {
                if last_line != Some(line) {
                    starts.insert(addr, line as u32);
                    last_line = Some(line);
                }
                addr += byte_incr as usize;
            }
            line += line_incr as i64;
        }
        if last_line != Some(line) {
            starts.insert(addr, line as u32);
        }
        starts
    }

    /// Source line of the instruction at `offset`
    pub fn line_for_offset(&self, offset: usize) -> u32 {
        self.line_starts()
            .into_iter()
            .filter(|(start, _)| *start <= offset)
            .max_by_key(|(start, _)| *start)
            .map(|(_, line)| line)
            .unwrap_or(self.firstlineno)
    }

    /// Human-readable listing
    pub fn disassemble(&self) -> String {
        let mut out = format!("Disassembly of <code {} #{}>:\n", self.name, self.id);
        match get_instructions(self) {
            Ok(instructions) => {
                for instr in instructions {
                    out.push_str(&format!("#{:<4}{}\n", instr.id.0, instr));
                }
            }
            Err(e) => out.push_str(&format!("  <undecodable: {}>\n", e)),
        }
        out
    }
}

impl fmt::Debug for CodeObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<code {} #{} ({} instructions)>", self.name, self.id, self.raw.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_truncated_code() {
        let options = CodeOptions {
            name: "bad".into(),
            code: vec![Opcode::ReturnValue as u8, 0],
            ..Default::default()
        };
        assert!(matches!(CodeObject::new(options), Err(TraceError::Inner(_))));
    }

    #[test]
    fn test_rejects_unknown_opcode() {
        let options = CodeOptions {
            name: "bad".into(),
            code: vec![0xEE, 0, 0],
            ..Default::default()
        };
        assert!(CodeObject::new(options).is_err());
    }

    #[test]
    fn test_line_starts_decode() {
        // line 10 at offset 0, line 12 at offset 6, line 11 at offset 9
        let options = CodeOptions {
            name: "lines".into(),
            firstlineno: 10,
            code: [Opcode::Nop as u8, 0, 0].repeat(4),
            lnotab: vec![6, 2, 3, 0xFF],
            ..Default::default()
        };
        let code = CodeObject::new(options).expect("valid code");
        let starts = code.line_starts();
        assert_eq!(starts.get(&0), Some(&10));
        assert_eq!(starts.get(&6), Some(&12));
        assert_eq!(starts.get(&9), Some(&11));
        assert_eq!(code.line_for_offset(7), 12);
    }

    #[test]
    fn test_cell_or_free_name() {
        let options = CodeOptions {
            name: "closure".into(),
            cellvars: vec!["a".into()],
            freevars: vec!["b".into(), "c".into()],
            ..Default::default()
        };
        let code = CodeObject::new(options).expect("valid code");
        assert_eq!(code.cell_or_free_name(0), Some("a"));
        assert_eq!(code.cell_or_free_name(2), Some("c"));
        assert_eq!(code.cell_or_free_name(3), None);
    }
}
