//! Live-input analysis for resume points
//!
//! A resume function starting at instruction `i` needs as parameters every
//! local (or cell variable) that some path from `i` reads before writing.
//! This is classic backward liveness over the instruction graph, solved to
//! a fixed point so loops and diamonds are handled exactly.

use std::collections::{BTreeSet, HashMap};

use crate::error::{TraceError, TraceResult};

use super::instruction::{InstrId, Instruction};
use super::opcodes::Opcode;

#[derive(Debug, Default, Clone)]
struct Effect {
    reads: Option<String>,
    writes: Option<String>,
}

fn effect_of(instr: &Instruction) -> Effect {
    let name = instr.argval.name().map(str::to_string);
    match instr.opcode {
        Opcode::LoadFast | Opcode::LoadDeref | Opcode::LoadClosure | Opcode::LoadClassDeref => Effect {
            reads: name,
            writes: None,
        },
        Opcode::StoreFast | Opcode::StoreDeref | Opcode::DeleteFast => Effect {
            reads: None,
            writes: name,
        },
        _ => Effect::default(),
    }
}

fn successors(
    instructions: &[Instruction],
    positions: &HashMap<InstrId, usize>,
    index: usize,
) -> TraceResult<Vec<usize>> {
    let instr = &instructions[index];
    let mut next = Vec::with_capacity(2);
    if let Some(target) = instr.jump_to {
        let target = *positions.get(&target).ok_or_else(|| {
            TraceError::Inner(format!("{} at #{} jumps to missing instruction", instr.opcode, index))
        })?;
        next.push(target);
    }
    if !instr.opcode.is_terminator() && index + 1 < instructions.len() {
        next.push(index + 1);
    }
    Ok(next)
}

/// Names live on entry to every instruction
pub fn live_variables(instructions: &[Instruction]) -> TraceResult<Vec<BTreeSet<String>>> {
    let positions: HashMap<InstrId, usize> = instructions
        .iter()
        .enumerate()
        .map(|(i, instr)| (instr.id, i))
        .collect();
    let effects: Vec<Effect> = instructions.iter().map(effect_of).collect();
    let succs = (0..instructions.len())
        .map(|i| successors(instructions, &positions, i))
        .collect::<TraceResult<Vec<_>>>()?;

    let mut live_in: Vec<BTreeSet<String>> = vec![BTreeSet::new(); instructions.len()];
    let mut changed = true;
    while changed {
        changed = false;
        for index in (0..instructions.len()).rev() {
            let mut live: BTreeSet<String> = succs[index]
                .iter()
                .flat_map(|&s| live_in[s].iter().cloned())
                .collect();
            if let Some(written) = &effects[index].writes {
                live.remove(written);
            }
            if let Some(read) = &effects[index].reads {
                live.insert(read.clone());
            }
            if live != live_in[index] {
                live_in[index] = live;
                changed = true;
            }
        }
    }
    Ok(live_in)
}

/// Locals read before written on some path starting at `index`, sorted
pub fn analysis_inputs(instructions: &[Instruction], index: usize) -> TraceResult<Vec<String>> {
    if index >= instructions.len() {
        return Err(TraceError::Inner(format!(
            "resume index {} out of range of {} instructions",
            index,
            instructions.len()
        )));
    }
    let live = live_variables(instructions)?;
    Ok(live[index].iter().cloned().collect())
}
