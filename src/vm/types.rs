//! Type definitions for the guest interpreter.
//!
//! - VmError: errors raised while executing guest code
//! - VmConfig: interpreter limits and tracing switches

use crate::tensor::TensorError;

/// Result of guest execution
pub type VmResult<T> = Result<T, VmError>;

/// Errors that can occur during guest execution
#[derive(Debug, Clone, PartialEq)]
pub enum VmError {
    /// Operand stack underflow
    StackUnderflow,
    /// Operation applied to values of the wrong type
    TypeError(String),
    /// Global or builtin name not found
    NameError(String),
    /// Local or cell read before assignment
    UnboundLocal(String),
    /// Missing attribute
    AttributeError { type_name: &'static str, attr: String },
    /// Module not registered with the interpreter
    ImportError(String),
    /// Integer division or modulo by zero
    ZeroDivision,
    /// Sequence index out of bounds
    IndexOutOfBounds { index: i64, len: usize },
    /// Wrong value for an otherwise valid type
    ValueError(String),
    /// Nested calls exceeded the configured depth
    CallDepthExceeded(usize),
    /// Numeric backend failure
    Tensor(TensorError),
    /// Runtime error with message
    Runtime(String),
}

impl std::fmt::Display for VmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StackUnderflow => write!(f, "Stack underflow"),
            Self::TypeError(msg) => write!(f, "TypeError: {}", msg),
            Self::NameError(name) => write!(f, "NameError: name '{}' is not defined", name),
            Self::UnboundLocal(name) => {
                write!(f, "UnboundLocalError: '{}' referenced before assignment", name)
            }
            Self::AttributeError { type_name, attr } => {
                write!(f, "AttributeError: '{}' object has no attribute '{}'", type_name, attr)
            }
            Self::ImportError(name) => write!(f, "ImportError: no module named '{}'", name),
            Self::ZeroDivision => write!(f, "ZeroDivisionError: division by zero"),
            Self::IndexOutOfBounds { index, len } => {
                write!(f, "IndexError: index {} out of range for length {}", index, len)
            }
            Self::ValueError(msg) => write!(f, "ValueError: {}", msg),
            Self::CallDepthExceeded(depth) => write!(f, "Maximum call depth {} exceeded", depth),
            Self::Tensor(e) => write!(f, "Tensor error: {}", e),
            Self::Runtime(msg) => write!(f, "Runtime error: {}", msg),
        }
    }
}

impl std::error::Error for VmError {}

impl From<TensorError> for VmError {
    fn from(e: TensorError) -> Self {
        VmError::Tensor(e)
    }
}

/// Configuration for the interpreter
#[derive(Debug, Clone)]
pub struct VmConfig {
    /// Maximum nesting of guest calls
    pub max_call_depth: usize,
    /// Maximum operand stack size of a single frame
    pub max_value_stack: usize,
    /// Emit a trace event per executed instruction
    pub trace: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            max_call_depth: 200,
            max_value_stack: 65536,
            trace: false,
        }
    }
}
