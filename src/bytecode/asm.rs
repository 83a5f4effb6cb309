//! Text assembler for guest code
//!
//! Hosts and tests write guest functions in a small line-oriented format:
//!
//! ```text
//! .code add_one
//! .args x
//! .line 1
//!     LOAD_FAST x
//!     LOAD_CONST 1
//!     BINARY_ADD
//!     RETURN_VALUE
//! ```
//!
//! Directives: `.code NAME` starts a new code object, `.name NAME` renames
//! the current one, `.args`, `.cellvars` and `.freevars` declare variables,
//! `.line N` marks the next instruction as starting source line `N`.
//! A `label:` line names the next instruction; jump opcodes take a label.
//! `LOAD_CONST` accepts integers, floats, `None`, `True`, `False`, quoted
//! strings and `@NAME` for another code object in the same source.
//! `COMPARE_OP` takes a comparison symbol. `;` starts a comment.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use crate::error::{TraceError, TraceResult};
use crate::vm::{Function, Globals, Value};

use super::assemble::gen_new_code;
use super::code::{CodeObject, CodeOptions};
use super::instruction::{ArgVal, InstrId, Instruction};
use super::opcodes::{CompareOp, Opcode};

fn asm_error(line: usize, message: impl std::fmt::Display) -> TraceError {
    TraceError::Inner(format!("asm line {}: {}", line, message))
}

#[derive(Debug, Clone)]
enum ConstToken {
    Value(Value),
    CodeRef(String),
}

#[derive(Debug)]
struct PendingInstr {
    source_line: usize,
    opcode: Opcode,
    argval: ArgVal,
    jump_label: Option<String>,
    const_token: Option<ConstToken>,
    starts_line: Option<u32>,
}

#[derive(Debug, Default)]
struct Section {
    name: String,
    args: Vec<String>,
    cellvars: Vec<String>,
    freevars: Vec<String>,
    firstlineno: Option<u32>,
    labels: HashMap<String, usize>,
    instrs: Vec<PendingInstr>,
}

fn strip_comment(line: &str) -> &str {
    let mut quote: Option<char> = None;
    for (i, c) in line.char_indices() {
        match (quote, c) {
            (None, ';') => return &line[..i],
            (None, '\'' | '"') => quote = Some(c),
            (Some(q), c) if c == q => quote = None,
            _ => {}
        }
    }
    line
}

fn parse_const(token: &str, line: usize) -> TraceResult<ConstToken> {
    let value = match token {
        "None" => Value::None,
        "True" => Value::Bool(true),
        "False" => Value::Bool(false),
        _ if token.starts_with('@') => return Ok(ConstToken::CodeRef(token[1..].to_string())),
        _ if token.len() >= 2
            && (token.starts_with('\'') && token.ends_with('\'')
                || token.starts_with('"') && token.ends_with('"')) =>
        {
            Value::str(&token[1..token.len() - 1])
        }
        _ => {
            if let Ok(i) = token.parse::<i64>() {
                Value::Int(i)
            } else if let Ok(f) = token.parse::<f64>() {
                Value::Float(f)
            } else {
                return Err(asm_error(line, format!("invalid constant '{}'", token)));
            }
        }
    };
    Ok(ConstToken::Value(value))
}

fn parse_instr(section: &Section, text: &str, line: usize, starts_line: Option<u32>) -> TraceResult<PendingInstr> {
    let (mnemonic, operand) = match text.split_once(char::is_whitespace) {
        Some((m, rest)) => (m, rest.trim()),
        None => (text, ""),
    };
    let opcode = Opcode::from_mnemonic(mnemonic)
        .ok_or_else(|| asm_error(line, format!("unknown opcode '{}'", mnemonic)))?;
    let mut pending = PendingInstr {
        source_line: line,
        opcode,
        argval: ArgVal::None,
        jump_label: None,
        const_token: None,
        starts_line,
    };
    let require = |what: &str| {
        if operand.is_empty() {
            Err(asm_error(line, format!("{} expects {}", opcode, what)))
        } else {
            Ok(())
        }
    };

    if opcode.is_jump() {
        require("a label")?;
        pending.jump_label = Some(operand.to_string());
    } else if opcode == Opcode::LoadConst {
        require("a constant")?;
        pending.const_token = Some(parse_const(operand, line)?);
    } else if opcode == Opcode::CompareOp {
        require("a comparison")?;
        let op = CompareOp::from_symbol(operand)
            .ok_or_else(|| asm_error(line, format!("unknown comparison '{}'", operand)))?;
        pending.argval = ArgVal::Compare(op);
    } else if opcode.has_free() {
        require("a cell or free variable")?;
        if !section.cellvars.iter().chain(&section.freevars).any(|n| n == operand) {
            return Err(asm_error(line, format!("'{}' is not a declared cell or free variable", operand)));
        }
        pending.argval = ArgVal::Name(operand.to_string());
    } else if opcode.has_local() || opcode.has_name() {
        require("a name")?;
        pending.argval = ArgVal::Name(operand.to_string());
    } else if opcode.has_argument() {
        require("an integer argument")?;
        let count = operand
            .parse::<u32>()
            .map_err(|_| asm_error(line, format!("invalid argument '{}'", operand)))?;
        pending.argval = ArgVal::Count(count);
    } else if !operand.is_empty() {
        return Err(asm_error(line, format!("{} takes no argument", opcode)));
    }
    Ok(pending)
}

fn parse_sections(src: &str) -> TraceResult<Vec<Section>> {
    let mut sections: Vec<Section> = Vec::new();
    let mut pending_line: Option<u32> = None;

    for (index, raw) in src.lines().enumerate() {
        let line = index + 1;
        let mut text = strip_comment(raw).trim();
        if text.is_empty() {
            continue;
        }
        if let Some(rest) = text.strip_prefix(".code") {
            sections.push(Section {
                name: rest.trim().to_string(),
                ..Default::default()
            });
            continue;
        }
        if sections.is_empty() {
            sections.push(Section {
                name: "<asm>".to_string(),
                ..Default::default()
            });
        }
        let section = sections
            .last_mut()
            .ok_or_else(|| asm_error(line, "no code section"))?;

        if let Some(directive) = text.strip_prefix('.') {
            let (key, rest) = directive.split_once(char::is_whitespace).unwrap_or((directive, ""));
            let names = || rest.split_whitespace().map(str::to_string).collect::<Vec<_>>();
            match key {
                "name" => section.name = rest.trim().to_string(),
                "args" => section.args = names(),
                "cellvars" => section.cellvars = names(),
                "freevars" => section.freevars = names(),
                "line" => {
                    let n = rest
                        .trim()
                        .parse::<u32>()
                        .map_err(|_| asm_error(line, format!("invalid line number '{}'", rest.trim())))?;
                    section.firstlineno.get_or_insert(n);
                    pending_line = Some(n);
                }
                other => return Err(asm_error(line, format!("unknown directive '.{}'", other))),
            }
            continue;
        }
        if let Some((label, rest)) = text.split_once(':') {
            let label = label.trim();
            if !label.is_empty() && label.chars().all(|c| c.is_alphanumeric() || c == '_') {
                if section.labels.insert(label.to_string(), section.instrs.len()).is_some() {
                    return Err(asm_error(line, format!("duplicate label '{}'", label)));
                }
                text = rest.trim();
                if text.is_empty() {
                    continue;
                }
            }
        }
        let instr = parse_instr(section, text, line, pending_line.take())?;
        section.instrs.push(instr);
    }
    Ok(sections)
}

struct Builder {
    sections: BTreeMap<String, Section>,
    built: HashMap<String, Arc<CodeObject>>,
    in_progress: HashSet<String>,
}

impl Builder {
    fn build(&mut self, name: &str) -> TraceResult<Arc<CodeObject>> {
        if let Some(code) = self.built.get(name) {
            return Ok(code.clone());
        }
        if !self.in_progress.insert(name.to_string()) {
            return Err(TraceError::Inner(format!("asm: code '{}' refers to itself", name)));
        }
        let section = self
            .sections
            .remove(name)
            .ok_or_else(|| TraceError::Inner(format!("asm: unknown code reference '@{}'", name)))?;

        let ids: Vec<InstrId> = section.instrs.iter().map(|_| InstrId::fresh()).collect();
        let firstlineno = section.firstlineno.unwrap_or(1);
        let mut instructions = Vec::with_capacity(section.instrs.len());
        for (index, pending) in section.instrs.iter().enumerate() {
            let argval = match &pending.const_token {
                Some(ConstToken::Value(value)) => ArgVal::Const(value.clone()),
                Some(ConstToken::CodeRef(target)) => ArgVal::Const(Value::Code(self.build(target)?)),
                None => pending.argval.clone(),
            };
            let mut instr = Instruction::new(pending.opcode, argval);
            instr.id = ids[index];
            instr.starts_line = pending.starts_line.or((index == 0).then_some(firstlineno));
            if let Some(label) = &pending.jump_label {
                let target = section
                    .labels
                    .get(label)
                    .and_then(|&i| ids.get(i))
                    .ok_or_else(|| asm_error(pending.source_line, format!("undefined label '{}'", label)))?;
                instr.jump_to = Some(*target);
            }
            instructions.push(instr);
        }

        let mut options = CodeOptions {
            argcount: section.args.len() as u32,
            varnames: section.args.clone(),
            cellvars: section.cellvars.clone(),
            freevars: section.freevars.clone(),
            filename: "<asm>".to_string(),
            name: section.name.clone(),
            firstlineno,
            ..Default::default()
        };
        let code = gen_new_code(&mut instructions, &mut options)?;
        self.in_progress.remove(name);
        self.built.insert(name.to_string(), code.clone());
        Ok(code)
    }
}

/// Assemble every `.code` section, keyed by section name
pub fn assemble_module(src: &str) -> TraceResult<BTreeMap<String, Arc<CodeObject>>> {
    let sections = parse_sections(src)?;
    let names: Vec<String> = sections.iter().map(|s| s.name.clone()).collect();
    let mut builder = Builder {
        sections: BTreeMap::new(),
        built: HashMap::new(),
        in_progress: HashSet::new(),
    };
    for section in sections {
        let name = section.name.clone();
        if builder.sections.insert(name.clone(), section).is_some() {
            return Err(TraceError::Inner(format!("asm: duplicate code section '{}'", name)));
        }
    }
    for name in &names {
        builder.build(name)?;
    }
    Ok(names
        .into_iter()
        .filter_map(|name| builder.built.get(&name).cloned().map(|code| (name, code)))
        .collect())
}

/// Assemble the first code object in `src`
pub fn assemble(src: &str) -> TraceResult<Arc<CodeObject>> {
    let first = parse_sections(src)?
        .first()
        .map(|s| s.name.clone())
        .ok_or_else(|| TraceError::Inner("asm: empty source".into()))?;
    assemble_module(src)?
        .remove(&first)
        .ok_or_else(|| TraceError::Inner(format!("asm: '{}' was not built", first)))
}

/// Assemble the first code object in `src` as a function over `globals`
pub fn assemble_function(src: &str, globals: &Globals) -> TraceResult<Arc<Function>> {
    let code = assemble(src)?;
    if code.has_free_vars() {
        return Err(TraceError::Inner(format!(
            "asm: '{}' has free variables and needs a closure",
            code.name
        )));
    }
    Ok(Arc::new(Function::new(code, globals.clone())))
}
