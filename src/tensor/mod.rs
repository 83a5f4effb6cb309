//! Reference numeric backend
//!
//! - [`meta`]: shape/dtype metadata seen by the tracer
//! - [`ops`]: operation names and constant operands
//! - [`oracle`]: the Shape Oracle interface, its reference rules and the
//!   process-wide inference cache
//! - [`kernels`]: CPU kernels that execute compiled statement programs

pub mod dense;
pub mod kernels;
pub mod meta;
pub mod ops;
pub mod oracle;

use std::fmt;

pub use dense::Tensor;
pub use kernels::{execute, OpArg};
pub use meta::{DType, MetaInfo, Shape, DYNAMIC_DIM};
pub use ops::{ConstArg, IndexItem, TensorOp};
pub use oracle::{InferMetaCache, MetaOperand, ReferenceOracle, ShapeOracle};

/// Errors raised by shape inference or kernels
#[derive(Debug, Clone, PartialEq)]
pub enum TensorError {
    ShapeMismatch(String),
    InvalidArgument(String),
    IndexOutOfBounds { index: i64, len: usize },
    Unsupported(String),
}

impl fmt::Display for TensorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TensorError::ShapeMismatch(msg) => write!(f, "Shape mismatch: {}", msg),
            TensorError::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
            TensorError::IndexOutOfBounds { index, len } => {
                write!(f, "Index {} out of bounds for dimension of size {}", index, len)
            }
            TensorError::Unsupported(msg) => write!(f, "Unsupported: {}", msg),
        }
    }
}

impl std::error::Error for TensorError {}

pub type TensorResult<T> = Result<T, TensorError>;
