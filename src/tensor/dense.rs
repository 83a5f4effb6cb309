//! Dense CPU tensor used by the reference backend

use std::fmt;

use itertools::Itertools;
use smallvec::SmallVec;

use super::meta::{DType, MetaInfo};
use super::{TensorError, TensorResult};

/// Row-major dense tensor.
///
/// Elements are stored as `f64` regardless of dtype; integer and boolean
/// tensors keep integral values.
#[derive(Clone, PartialEq)]
pub struct Tensor {
    shape: SmallVec<[usize; 4]>,
    dtype: DType,
    stop_gradient: bool,
    data: Vec<f64>,
}

impl Tensor {
    pub fn from_vec(data: Vec<f64>, shape: &[usize], dtype: DType) -> TensorResult<Self> {
        let numel: usize = shape.iter().product();
        if numel != data.len() {
            return Err(TensorError::ShapeMismatch(format!(
                "cannot build tensor of shape {:?} from {} elements",
                shape,
                data.len()
            )));
        }
        let data = match dtype {
            DType::Float32 => data,
            DType::Int64 => data.into_iter().map(f64::trunc).collect(),
            DType::Bool => data.into_iter().map(|v| if v != 0.0 { 1.0 } else { 0.0 }).collect(),
        };
        Ok(Self {
            shape: shape.iter().copied().collect(),
            dtype,
            stop_gradient: true,
            data,
        })
    }

    pub fn scalar(value: f64, dtype: DType) -> Self {
        Self {
            shape: SmallVec::new(),
            dtype,
            stop_gradient: true,
            data: vec![value],
        }
    }

    pub fn full(shape: &[usize], value: f64, dtype: DType) -> Self {
        let numel = shape.iter().product();
        Self {
            shape: shape.iter().copied().collect(),
            dtype,
            stop_gradient: true,
            data: vec![value; numel],
        }
    }

    pub fn zeros(shape: &[usize]) -> Self {
        Self::full(shape, 0.0, DType::Float32)
    }

    pub fn ones(shape: &[usize]) -> Self {
        Self::full(shape, 1.0, DType::Float32)
    }

    /// `[0, 1, .., n - 1]` as a float tensor
    pub fn arange(n: usize) -> Self {
        Self {
            shape: SmallVec::from_slice(&[n]),
            dtype: DType::Float32,
            stop_gradient: true,
            data: (0..n).map(|i| i as f64).collect(),
        }
    }

    pub fn with_stop_gradient(mut self, stop_gradient: bool) -> Self {
        self.stop_gradient = stop_gradient;
        self
    }

    #[inline]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    #[inline]
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    #[inline]
    pub fn stop_gradient(&self) -> bool {
        self.stop_gradient
    }

    #[inline]
    pub fn data(&self) -> &[f64] {
        &self.data
    }

    #[inline]
    pub fn numel(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    pub fn meta(&self) -> MetaInfo {
        MetaInfo::new(
            self.shape.iter().map(|&d| d as i64),
            self.dtype,
            self.stop_gradient,
        )
    }

    /// Row-major strides in elements
    pub fn strides(&self) -> SmallVec<[usize; 4]> {
        strides_for(&self.shape)
    }

    /// Truth value of a single-element tensor
    pub fn truthy(&self) -> TensorResult<bool> {
        match self.data.as_slice() {
            [value] => Ok(*value != 0.0),
            _ => Err(TensorError::InvalidArgument(format!(
                "truth value of a tensor with {} elements is ambiguous",
                self.numel()
            ))),
        }
    }

    /// Element-wise comparison with a tolerance for float round-off
    pub fn allclose(&self, other: &Tensor) -> bool {
        self.shape == other.shape
            && self
                .data
                .iter()
                .zip(&other.data)
                .all(|(a, b)| (a - b).abs() <= 1e-6 + 1e-6 * b.abs())
    }
}

pub(crate) fn strides_for(shape: &[usize]) -> SmallVec<[usize; 4]> {
    let mut strides: SmallVec<[usize; 4]> = SmallVec::from_elem(1, shape.len());
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }
    strides
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tensor({}, [{}])", self.meta(), self.data.iter().take(8).join(", "))?;
        if self.data.len() > 8 {
            write!(f, "..")?;
        }
        Ok(())
    }
}
