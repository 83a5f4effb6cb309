/// symtrace - Selective Symbolic Tracing JIT
///
/// This library traces functions of a small stack-based guest language
/// symbolically, records their tensor work into a statement program, and
/// rewrites the functions so that the recorded work runs as one compiled
/// unit while everything else keeps running in the guest interpreter.
///
/// # Architecture
///
/// The pipeline consists of four stages:
///
/// 1. **Bytecode** (`bytecode` module)
///    - Opcode classification and stack effects
///    - Decoding code objects into instructions with stable jump targets
///    - Re-assembly: variable/constant resolution, jump encoding, stack
///      bounds, line tables
///    - Resume, loop-body and whole-loop function generation
///
/// 2. **Symbolic execution** (`executor` module)
///    - `Variable`s with `Tracker` provenance instead of values
///    - Tensor operations recorded into a `FunctionGraph` with metadata
///      from the Shape Oracle
///    - Graph breaks at anything the trace cannot express
///
/// 3. **Compilation** (`symbolic` module)
///    - Statement IR (SIR) and a process-wide cache keyed by structure
///    - Compiled programs exposed to guest code as native functions
///
/// 4. **Dispatch** (`jit` module)
///    - Guarded translations per code object, checked before every call
///
/// # Example
///
/// ```rust
/// use symtrace::bytecode::assemble_function;
/// use symtrace::tensor::{DType, Tensor};
/// use symtrace::vm::{Globals, Interpreter, Value};
/// use symtrace::{install, JitConfig};
///
/// let vm = Interpreter::new();
/// let jit = install(&vm, JitConfig::default());
///
/// let add_one = assemble_function(
///     ".args x\n    LOAD_FAST x\n    LOAD_CONST 1\n    BINARY_ADD\n    RETURN_VALUE\n",
///     &Globals::new(),
/// )
/// .unwrap();
///
/// let x = Value::tensor(Tensor::from_vec(vec![1.0, 2.0], &[2], DType::Float32).unwrap());
/// let y = vm.call_function(&add_one, vec![x]).unwrap();
///
/// assert_eq!(y.as_tensor().unwrap().data(), &[2.0, 3.0]);
/// assert_eq!(jit.stats().translations, 1);
/// ```
///
/// # Guarantees
///
/// - **Equivalence**: translated code returns what the original returns for
///   every frame its guard accepts
/// - **Fallback**: functions the translator cannot handle run untraced
/// - **Logging**: `tracing` events under `symtrace::*` targets; no
///   subscriber is installed by the library
pub mod bytecode;
pub mod config;
pub mod error;
pub mod executor;
pub mod jit;
pub mod symbolic;
pub mod tensor;
pub mod vm;

pub use config::{ConfigError, JitConfig};
pub use error::{TraceError, TraceResult};
pub use executor::{translate, TraceContext, Translation};
pub use jit::{install, JitStats, JitStatsSnapshot, SymbolicJit};
pub use vm::{FrameHook, Interpreter, Value, VmConfig, VmError};
