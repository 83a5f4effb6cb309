//! Reference CPU kernels
//!
//! Kernels validate their operands through [`ReferenceOracle`] first, so
//! the metadata a trace records and the tensor a kernel returns always
//! agree.

use std::sync::Arc;

use smallvec::SmallVec;

use super::dense::{strides_for, Tensor};
use super::meta::DType;
use super::ops::{ConstArg, IndexItem, TensorOp};
use super::oracle::{normalize_axis, permutation, resolve_slice, MetaOperand, ReferenceOracle, ShapeOracle};
use super::{TensorError, TensorResult};

/// Concrete operand of a kernel call
#[derive(Debug, Clone)]
pub enum OpArg {
    Tensor(Arc<Tensor>),
    Const(ConstArg),
}

impl OpArg {
    pub fn meta_operand(&self) -> MetaOperand {
        match self {
            OpArg::Tensor(t) => MetaOperand::Tensor(t.meta()),
            OpArg::Const(c) => MetaOperand::Const(c.clone()),
        }
    }

    fn as_tensor(&self) -> TensorResult<&Tensor> {
        match self {
            OpArg::Tensor(t) => Ok(t),
            OpArg::Const(c) => Err(TensorError::InvalidArgument(format!(
                "expected a tensor operand, got {}",
                c
            ))),
        }
    }

    /// Shape and data of the operand, scalars as zero-dimensional
    fn view(&self) -> TensorResult<(SmallVec<[usize; 4]>, Vec<f64>)> {
        match self {
            OpArg::Tensor(t) => Ok((t.shape().iter().copied().collect(), t.data().to_vec())),
            OpArg::Const(c) => c
                .as_f64()
                .map(|v| (SmallVec::new(), vec![v]))
                .ok_or_else(|| TensorError::InvalidArgument(format!("non-numeric operand {}", c))),
        }
    }
}

/// Run one operation on concrete operands
pub fn execute(op: TensorOp, args: &[OpArg]) -> TensorResult<Tensor> {
    let metas: Vec<MetaOperand> = args.iter().map(OpArg::meta_operand).collect();
    let out = ReferenceOracle.infer(op, &metas)?;
    let dtype = out.dtype;
    let stop_gradient = out.stop_gradient;
    // The oracle cannot resolve data-dependent extents.
    let out_shape: SmallVec<[usize; 4]> = if op == TensorOp::Nonzero {
        SmallVec::new()
    } else {
        out.shape.iter().map(|&d| d as usize).collect()
    };

    let tensor = if op.is_elementwise_binary() {
        let (a_shape, a) = args[0].view()?;
        let (b_shape, b) = args[1].view()?;
        let a = expand(&a_shape, &a, &out_shape);
        let b = expand(&b_shape, &b, &out_shape);
        let integral = dtype == DType::Int64;
        let data = a
            .iter()
            .zip(&b)
            .map(|(&x, &y)| binary_scalar(op, x, y, integral))
            .collect::<TensorResult<Vec<_>>>()?;
        Tensor::from_vec(data, &out_shape, dtype)?
    } else if op.is_elementwise_unary() {
        let x = args[0].as_tensor()?;
        let data = x
            .data()
            .iter()
            .map(|&v| match op {
                TensorOp::Negative => -v,
                TensorOp::Relu => v.max(0.0),
                TensorOp::Exp => v.exp(),
                TensorOp::Abs => v.abs(),
                _ => v.sqrt(),
            })
            .collect();
        Tensor::from_vec(data, &out_shape, dtype)?
    } else {
        match op {
            TensorOp::MatMul => {
                let x = args[0].as_tensor()?;
                let y = args[1].as_tensor()?;
                let (m, k, n) = (x.shape()[0], x.shape()[1], y.shape()[1]);
                let mut data = vec![0.0; m * n];
                for i in 0..m {
                    for j in 0..n {
                        data[i * n + j] = (0..k).map(|p| x.data()[i * k + p] * y.data()[p * n + j]).sum();
                    }
                }
                Tensor::from_vec(data, &out_shape, dtype)?
            }
            TensorOp::Transpose => {
                let x = args[0].as_tensor()?;
                let perm = permutation(x.ndim(), const_arg(args, 1))?;
                let src_strides = x.strides();
                let offsets = gather_offsets(
                    &perm
                        .iter()
                        .map(|&axis| ((0..x.shape()[axis]).collect(), src_strides[axis]))
                        .collect::<Vec<_>>(),
                );
                let data = offsets.iter().map(|&o| x.data()[o]).collect();
                Tensor::from_vec(data, &out_shape, dtype)?
            }
            TensorOp::Reshape => {
                let x = args[0].as_tensor()?;
                Tensor::from_vec(x.data().to_vec(), &out_shape, dtype)?
            }
            TensorOp::Sum | TensorOp::Mean => {
                let x = args[0].as_tensor()?;
                let data = match const_arg(args, 1).and_then(ConstArg::as_int) {
                    None => {
                        let total: f64 = x.data().iter().sum();
                        if op == TensorOp::Mean {
                            vec![total / x.numel().max(1) as f64]
                        } else {
                            vec![total]
                        }
                    }
                    Some(axis) => reduce_axis(x, normalize_axis(axis, x.ndim())?, op == TensorOp::Mean),
                };
                Tensor::from_vec(data, &out_shape, dtype)?
            }
            TensorOp::GetItem => {
                let x = args[0].as_tensor()?;
                let axes = index_axes(x, const_arg(args, 1))?;
                let data = gather_offsets(&axes).iter().map(|&o| x.data()[o]).collect();
                Tensor::from_vec(data, &out_shape, dtype)?
            }
            TensorOp::SetItem => {
                let x = args[0].as_tensor()?;
                let axes = index_axes(x, const_arg(args, 1))?;
                let region: SmallVec<[usize; 4]> = axes
                    .iter()
                    .zip(kept_axes(x, const_arg(args, 1)))
                    .filter(|(_, keep)| *keep)
                    .map(|((indices, _), _)| indices.len())
                    .collect();
                let (value_shape, value) = args
                    .get(2)
                    .ok_or_else(|| TensorError::InvalidArgument("__setitem__ needs a value".into()))?
                    .view()?;
                let value = expand(&value_shape, &value, &region);
                let mut data = x.data().to_vec();
                for (offset, v) in gather_offsets(&axes).into_iter().zip(value) {
                    data[offset] = v;
                }
                Tensor::from_vec(data, &out_shape, dtype)?
            }
            TensorOp::Nonzero => {
                let x = args[0].as_tensor()?;
                let strides = x.strides();
                let mut data = Vec::new();
                let mut count = 0;
                for (flat, &v) in x.data().iter().enumerate() {
                    if v != 0.0 {
                        count += 1;
                        for (axis, &stride) in strides.iter().enumerate() {
                            data.push(((flat / stride) % x.shape()[axis]) as f64);
                        }
                    }
                }
                Tensor::from_vec(data, &[count, x.ndim()], dtype)?
            }
            TensorOp::Ones => Tensor::full(&out_shape, 1.0, dtype),
            TensorOp::Zeros => Tensor::full(&out_shape, 0.0, dtype),
            _ => return Err(TensorError::Unsupported(format!("no kernel for {}", op))),
        }
    };
    Ok(tensor.with_stop_gradient(stop_gradient))
}

fn const_arg(args: &[OpArg], index: usize) -> Option<&ConstArg> {
    match args.get(index) {
        Some(OpArg::Const(c)) => Some(c),
        _ => None,
    }
}

fn binary_scalar(op: TensorOp, x: f64, y: f64, integral: bool) -> TensorResult<f64> {
    let bool_f = |b: bool| if b { 1.0 } else { 0.0 };
    Ok(match op {
        TensorOp::Add => x + y,
        TensorOp::Subtract => x - y,
        TensorOp::Multiply => x * y,
        TensorOp::Divide => x / y,
        TensorOp::FloorDivide | TensorOp::Remainder if integral && y == 0.0 => {
            return Err(TensorError::InvalidArgument("integer division by zero".into()))
        }
        TensorOp::FloorDivide => (x / y).floor(),
        TensorOp::Remainder => x - (x / y).floor() * y,
        TensorOp::Pow => x.powf(y),
        TensorOp::Equal => bool_f(x == y),
        TensorOp::NotEqual => bool_f(x != y),
        TensorOp::LessThan => bool_f(x < y),
        TensorOp::LessEqual => bool_f(x <= y),
        TensorOp::GreaterThan => bool_f(x > y),
        TensorOp::GreaterEqual => bool_f(x >= y),
        _ => return Err(TensorError::Unsupported(format!("{} is not element-wise", op))),
    })
}

/// Broadcast `data` of `shape` to `out_shape`
fn expand(shape: &[usize], data: &[f64], out_shape: &[usize]) -> Vec<f64> {
    if shape == out_shape {
        return data.to_vec();
    }
    let src_strides = strides_for(shape);
    let offset = out_shape.len() - shape.len();
    let axes: Vec<(Vec<usize>, usize)> = out_shape
        .iter()
        .enumerate()
        .map(|(i, &extent)| {
            if i < offset || shape[i - offset] == 1 {
                (vec![0; extent], 0)
            } else {
                ((0..extent).collect(), src_strides[i - offset])
            }
        })
        .collect();
    gather_offsets(&axes).into_iter().map(|o| data[o]).collect()
}

/// Row-major cartesian product of per-axis index lists, as flat offsets
fn gather_offsets(axes: &[(Vec<usize>, usize)]) -> Vec<usize> {
    let mut offsets = vec![0usize];
    for (indices, stride) in axes {
        let mut next = Vec::with_capacity(offsets.len() * indices.len());
        for &base in &offsets {
            for &i in indices {
                next.push(base + i * stride);
            }
        }
        offsets = next;
    }
    offsets
}

fn index_items(index: Option<&ConstArg>) -> TensorResult<Vec<IndexItem>> {
    index
        .and_then(ConstArg::index_items)
        .ok_or_else(|| TensorError::InvalidArgument(format!("unsupported index {:?}", index)))
}

/// Per-axis source indices selected by an index expression
fn index_axes(x: &Tensor, index: Option<&ConstArg>) -> TensorResult<Vec<(Vec<usize>, usize)>> {
    let items = index_items(index)?;
    let strides = x.strides();
    let mut axes = Vec::with_capacity(x.ndim());
    for (axis, &dim) in x.shape().iter().enumerate() {
        let indices = match items.get(axis) {
            Some(IndexItem::Int(i)) => {
                let resolved = if *i < 0 { *i + dim as i64 } else { *i };
                if resolved < 0 || resolved >= dim as i64 {
                    return Err(TensorError::IndexOutOfBounds { index: *i, len: dim });
                }
                vec![resolved as usize]
            }
            Some(IndexItem::Slice(start, stop, step)) => {
                let (start, step, len) = resolve_slice(dim as i64, *start, *stop, *step)?;
                (0..len).map(|k| (start + k * step) as usize).collect()
            }
            None => (0..dim).collect(),
        };
        axes.push((indices, strides[axis]));
    }
    Ok(axes)
}

fn kept_axes(x: &Tensor, index: Option<&ConstArg>) -> Vec<bool> {
    let items = index.and_then(ConstArg::index_items).unwrap_or_default();
    (0..x.ndim())
        .map(|axis| !matches!(items.get(axis), Some(IndexItem::Int(_))))
        .collect()
}

fn reduce_axis(x: &Tensor, axis: usize, mean: bool) -> Vec<f64> {
    let shape = x.shape();
    let outer: usize = shape[..axis].iter().product();
    let extent = shape[axis];
    let inner: usize = shape[axis + 1..].iter().product();
    let mut out = vec![0.0; outer * inner];
    for o in 0..outer {
        for i in 0..inner {
            let total: f64 = (0..extent).map(|k| x.data()[(o * extent + k) * inner + i]).sum();
            out[o * inner + i] = if mean { total / extent.max(1) as f64 } else { total };
        }
    }
    out
}
