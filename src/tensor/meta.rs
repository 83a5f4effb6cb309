//! Abstract tensor metadata
//!
//! `MetaInfo` is what the tracer knows about a tensor without touching its
//! data: shape, element type and the gradient flag. A dimension of
//! [`DYNAMIC_DIM`] is unresolved at trace time.

use std::fmt;

use itertools::Itertools;
use smallvec::SmallVec;

/// Marker for a dimension whose extent is only known at run time.
pub const DYNAMIC_DIM: i64 = -1;

pub type Shape = SmallVec<[i64; 4]>;

/// Element type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DType {
    Bool,
    Int64,
    Float32,
}

impl DType {
    pub fn name(self) -> &'static str {
        match self {
            DType::Bool => "bool",
            DType::Int64 => "int64",
            DType::Float32 => "float32",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "bool" => Some(DType::Bool),
            "int64" => Some(DType::Int64),
            "float32" => Some(DType::Float32),
            _ => None,
        }
    }

    /// Result type of an arithmetic op over two operand types
    #[inline]
    pub fn promote(self, other: DType) -> DType {
        self.max(other)
    }

    #[inline]
    pub fn is_floating(self) -> bool {
        self == DType::Float32
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Shape, dtype and gradient flag of a tensor
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MetaInfo {
    pub shape: Shape,
    pub dtype: DType,
    pub stop_gradient: bool,
}

impl MetaInfo {
    pub fn new(shape: impl IntoIterator<Item = i64>, dtype: DType, stop_gradient: bool) -> Self {
        Self {
            shape: shape.into_iter().collect(),
            dtype,
            stop_gradient,
        }
    }

    /// Metadata of a zero-dimensional tensor
    pub fn scalar(dtype: DType) -> Self {
        Self::new([], dtype, true)
    }

    pub fn is_dynamic_shape(&self) -> bool {
        self.shape.contains(&DYNAMIC_DIM)
    }

    #[inline]
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Element count, `None` while any dimension is dynamic
    pub fn numel(&self) -> Option<usize> {
        if self.is_dynamic_shape() {
            return None;
        }
        Some(self.shape.iter().map(|&d| d as usize).product())
    }

    pub fn with_dtype(&self, dtype: DType) -> Self {
        Self {
            dtype,
            ..self.clone()
        }
    }
}

impl fmt::Display for MetaInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[{}], stop_gradient={}",
            self.dtype,
            self.shape.iter().join(", "),
            if self.stop_gradient { "True" } else { "False" }
        )
    }
}
