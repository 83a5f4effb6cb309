//! Error taxonomy of the tracer
//!
//! - [`TraceError::BreakGraph`]: tracing cannot continue at this
//!   instruction; the translator emits a resume function and the rest of
//!   the function runs untraced. Recoverable.
//! - [`TraceError::NotImplemented`] / [`TraceError::Inner`]: the translator
//!   cannot produce correct code for this function. The optimizing path is
//!   abandoned for the function and it runs untraced.
//! - [`TraceError::Backend`]: the Shape Oracle or numeric backend rejected
//!   an operation. Propagated unchanged, never cached.

use std::fmt;

use crate::tensor::TensorError;
use crate::vm::VmError;

#[derive(Debug, Clone)]
pub enum TraceError {
    /// Recoverable stop at the current instruction
    BreakGraph(String),
    /// Construct the translator does not support
    NotImplemented(String),
    /// Broken invariant inside the translator
    Inner(String),
    /// Oracle or backend failure
    Backend(TensorError),
    /// Guest execution failure while compiling or running generated code
    Vm(VmError),
}

impl TraceError {
    pub fn is_graph_break(&self) -> bool {
        matches!(self, TraceError::BreakGraph(_))
    }

    /// Errors that end the optimizing path for the whole function
    pub fn is_fatal(&self) -> bool {
        !self.is_graph_break()
    }
}

impl fmt::Display for TraceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BreakGraph(msg) => write!(f, "Graph break: {}", msg),
            Self::NotImplemented(msg) => write!(f, "Not implemented: {}", msg),
            Self::Inner(msg) => write!(f, "Internal error: {}", msg),
            Self::Backend(e) => write!(f, "Backend error: {}", e),
            Self::Vm(e) => write!(f, "VM error: {}", e),
        }
    }
}

impl std::error::Error for TraceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Backend(e) => Some(e),
            Self::Vm(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TensorError> for TraceError {
    fn from(e: TensorError) -> Self {
        TraceError::Backend(e)
    }
}

impl From<VmError> for TraceError {
    fn from(e: VmError) -> Self {
        TraceError::Vm(e)
    }
}

pub type TraceResult<T> = Result<T, TraceError>;
