//! Guest bytecode: opcodes, code objects, instruction rewriting and
//! code generation

pub mod analysis;
pub mod asm;
pub mod assemble;
pub mod code;
pub mod codegen;
pub mod instruction;
pub mod opcodes;

pub use analysis::analysis_inputs;
pub use asm::{assemble, assemble_function, assemble_module};
pub use assemble::{compute_stack_bounds, gen_new_code, modify_instrs, modify_vars, reassemble_line_table};
pub use code::{CodeObject, CodeOptions};
pub use codegen::{next_generated_name, CodeGen, GeneratedFn};
pub use instruction::{get_instructions, ArgVal, InstrId, Instruction};
pub use opcodes::{CompareOp, Opcode, INSTR_SIZE};
