//! Statement IR and the compiled-program cache

pub mod compile_cache;
pub mod sir;

pub use compile_cache::{CompileCacheStats, CompileSirCache, CompiledSir};
pub use sir::{Operand, Statement, StatementIr, Symbol};
