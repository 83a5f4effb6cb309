//! Shape Oracle: output metadata inference without data
//!
//! The tracer never runs kernels while recording. It asks a [`ShapeOracle`]
//! what an operation would produce and records the answer. Answers are
//! memoized process-wide by [`InferMetaCache`], keyed by the operation and
//! the full content of its operand metadata.

use std::fmt;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};

use dashmap::DashMap;
use lru::LruCache;
use parking_lot::Mutex;
use tracing::trace;

use super::meta::{DType, MetaInfo, Shape, DYNAMIC_DIM};
use super::ops::{ConstArg, IndexItem, TensorOp};
use super::{TensorError, TensorResult};

/// Operand as seen by the oracle
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MetaOperand {
    Tensor(MetaInfo),
    Const(ConstArg),
}

impl fmt::Display for MetaOperand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetaOperand::Tensor(meta) => write!(f, "{}", meta),
            MetaOperand::Const(value) => write!(f, "{}", value),
        }
    }
}

/// Infers output metadata for an operation.
///
/// Implementations must be deterministic for identical inputs.
pub trait ShapeOracle: Send + Sync {
    fn infer(&self, op: TensorOp, inputs: &[MetaOperand]) -> TensorResult<MetaInfo>;
}

/// Broadcasting and indexing rules of the reference backend
#[derive(Debug, Default, Clone, Copy)]
pub struct ReferenceOracle;

impl ShapeOracle for ReferenceOracle {
    fn infer(&self, op: TensorOp, inputs: &[MetaOperand]) -> TensorResult<MetaInfo> {
        if op.is_elementwise_binary() {
            return infer_binary(op, inputs);
        }
        if op.is_elementwise_unary() {
            let x = tensor_operand(op, inputs, 0)?;
            let dtype = match op {
                TensorOp::Exp | TensorOp::Sqrt => DType::Float32,
                _ => x.dtype,
            };
            return Ok(x.with_dtype(dtype));
        }
        match op {
            TensorOp::MatMul => infer_matmul(inputs),
            TensorOp::Transpose => {
                let x = tensor_operand(op, inputs, 0)?;
                let perm = permutation(x.ndim(), const_operand(inputs, 1))?;
                let shape = perm.iter().map(|&axis| x.shape[axis]).collect();
                Ok(MetaInfo { shape, ..x.clone() })
            }
            TensorOp::Reshape => {
                let x = tensor_operand(op, inputs, 0)?;
                let target = match const_operand(inputs, 1) {
                    Some(ConstArg::IntList(dims)) => dims.clone(),
                    Some(ConstArg::Int(dim)) => vec![*dim],
                    other => {
                        return Err(TensorError::InvalidArgument(format!(
                            "reshape expects a shape list, got {:?}",
                            other
                        )))
                    }
                };
                let shape = reshape_target(x.numel(), &target)?;
                Ok(MetaInfo { shape, ..x.clone() })
            }
            TensorOp::Sum | TensorOp::Mean => {
                let x = tensor_operand(op, inputs, 0)?;
                let shape: Shape = match const_operand(inputs, 1) {
                    None | Some(ConstArg::None) => Shape::new(),
                    Some(ConstArg::Int(axis)) => {
                        let axis = normalize_axis(*axis, x.ndim())?;
                        let mut shape = x.shape.clone();
                        shape.remove(axis);
                        shape
                    }
                    Some(other) => {
                        return Err(TensorError::InvalidArgument(format!(
                            "{} expects an integer axis, got {}",
                            op, other
                        )))
                    }
                };
                let dtype = match (op, x.dtype) {
                    (TensorOp::Mean, _) => DType::Float32,
                    (_, DType::Bool) => DType::Int64,
                    (_, dtype) => dtype,
                };
                Ok(MetaInfo::new(shape, dtype, x.stop_gradient))
            }
            TensorOp::GetItem => {
                let x = tensor_operand(op, inputs, 0)?;
                let items = index_operand(inputs, 1)?;
                let shape = indexed_shape(&x.shape, &items)?;
                Ok(MetaInfo { shape, ..x.clone() })
            }
            TensorOp::SetItem => {
                let x = tensor_operand(op, inputs, 0)?;
                let items = index_operand(inputs, 1)?;
                let region = indexed_shape(&x.shape, &items)?;
                let value_sg = match inputs.get(2) {
                    Some(MetaOperand::Tensor(value)) => {
                        broadcast_shapes(&value.shape, &region)?;
                        value.stop_gradient
                    }
                    Some(MetaOperand::Const(c)) if c.is_scalar() => true,
                    other => {
                        return Err(TensorError::InvalidArgument(format!(
                            "__setitem__ expects a tensor or scalar value, got {:?}",
                            other
                        )))
                    }
                };
                Ok(MetaInfo {
                    stop_gradient: x.stop_gradient && value_sg,
                    ..x.clone()
                })
            }
            TensorOp::Nonzero => {
                let x = tensor_operand(op, inputs, 0)?;
                Ok(MetaInfo::new(
                    [DYNAMIC_DIM, x.ndim() as i64],
                    DType::Int64,
                    true,
                ))
            }
            TensorOp::Ones | TensorOp::Zeros => {
                let shape = match const_operand(inputs, 0) {
                    Some(ConstArg::IntList(dims)) => dims.clone(),
                    Some(ConstArg::Int(dim)) => vec![*dim],
                    other => {
                        return Err(TensorError::InvalidArgument(format!(
                            "{} expects a shape list, got {:?}",
                            op, other
                        )))
                    }
                };
                if shape.iter().any(|&d| d < 0) {
                    return Err(TensorError::InvalidArgument(format!(
                        "negative dimension in {:?}",
                        shape
                    )));
                }
                let dtype = match const_operand(inputs, 1) {
                    Some(ConstArg::Str(name)) => DType::from_name(name).ok_or_else(|| {
                        TensorError::InvalidArgument(format!("unknown dtype '{}'", name))
                    })?,
                    _ => DType::Float32,
                };
                Ok(MetaInfo::new(shape, dtype, true))
            }
            _ => Err(TensorError::Unsupported(format!("no shape rule for {}", op))),
        }
    }
}

fn tensor_operand(op: TensorOp, inputs: &[MetaOperand], index: usize) -> TensorResult<&MetaInfo> {
    match inputs.get(index) {
        Some(MetaOperand::Tensor(meta)) => Ok(meta),
        other => Err(TensorError::InvalidArgument(format!(
            "{} expects a tensor at position {}, got {:?}",
            op, index, other
        ))),
    }
}

fn const_operand(inputs: &[MetaOperand], index: usize) -> Option<&ConstArg> {
    match inputs.get(index) {
        Some(MetaOperand::Const(value)) => Some(value),
        _ => None,
    }
}

fn index_operand(inputs: &[MetaOperand], index: usize) -> TensorResult<Vec<IndexItem>> {
    const_operand(inputs, index)
        .and_then(ConstArg::index_items)
        .ok_or_else(|| {
            TensorError::InvalidArgument(format!(
                "unsupported index {:?}",
                inputs.get(index)
            ))
        })
}

fn scalar_dtype(value: &ConstArg) -> Option<DType> {
    match value {
        ConstArg::Bool(_) => Some(DType::Bool),
        ConstArg::Int(_) => Some(DType::Int64),
        ConstArg::Float(_) => Some(DType::Float32),
        _ => None,
    }
}

fn infer_binary(op: TensorOp, inputs: &[MetaOperand]) -> TensorResult<MetaInfo> {
    if inputs.len() != 2 {
        return Err(TensorError::InvalidArgument(format!(
            "{} expects 2 operands, got {}",
            op,
            inputs.len()
        )));
    }
    let mut shape = Shape::new();
    let mut dtype: Option<DType> = None;
    let mut stop_gradient = true;
    let mut saw_tensor = false;
    for operand in inputs {
        match operand {
            MetaOperand::Tensor(meta) => {
                saw_tensor = true;
                shape = broadcast_shapes(&shape, &meta.shape)?;
                dtype = Some(dtype.map_or(meta.dtype, |d| d.promote(meta.dtype)));
                stop_gradient &= meta.stop_gradient;
            }
            MetaOperand::Const(value) => {
                let scalar = scalar_dtype(value).ok_or_else(|| {
                    TensorError::InvalidArgument(format!("{} cannot take operand {}", op, value))
                })?;
                dtype = Some(dtype.map_or(scalar, |d| d.promote(scalar)));
            }
        }
    }
    if !saw_tensor {
        return Err(TensorError::InvalidArgument(format!(
            "{} needs at least one tensor operand",
            op
        )));
    }
    let dtype = match op {
        _ if op.is_comparison() => {
            stop_gradient = true;
            DType::Bool
        }
        TensorOp::Divide => DType::Float32,
        _ => dtype.unwrap_or(DType::Float32),
    };
    Ok(MetaInfo {
        shape,
        dtype,
        stop_gradient,
    })
}

fn infer_matmul(inputs: &[MetaOperand]) -> TensorResult<MetaInfo> {
    let x = tensor_operand(TensorOp::MatMul, inputs, 0)?;
    let y = tensor_operand(TensorOp::MatMul, inputs, 1)?;
    if x.ndim() != 2 || y.ndim() != 2 {
        return Err(TensorError::Unsupported(format!(
            "matmul supports 2-D operands only, got {} and {}",
            x, y
        )));
    }
    let (k1, k2) = (x.shape[1], y.shape[0]);
    if k1 != DYNAMIC_DIM && k2 != DYNAMIC_DIM && k1 != k2 {
        return Err(TensorError::ShapeMismatch(format!(
            "matmul inner dimensions differ: {} vs {}",
            k1, k2
        )));
    }
    Ok(MetaInfo::new(
        [x.shape[0], y.shape[1]],
        x.dtype.promote(y.dtype),
        x.stop_gradient && y.stop_gradient,
    ))
}

/// Numpy-style broadcast of two shapes, dynamic-aware
pub fn broadcast_shapes(a: &[i64], b: &[i64]) -> TensorResult<Shape> {
    let ndim = a.len().max(b.len());
    let mut out = Shape::from_elem(1, ndim);
    for i in 0..ndim {
        let x = if i < ndim - a.len() { 1 } else { a[i - (ndim - a.len())] };
        let y = if i < ndim - b.len() { 1 } else { b[i - (ndim - b.len())] };
        out[i] = match (x, y) {
            _ if x == y => x,
            (1, _) => y,
            (_, 1) => x,
            (DYNAMIC_DIM, _) => y,
            (_, DYNAMIC_DIM) => x,
            _ => {
                return Err(TensorError::ShapeMismatch(format!(
                    "cannot broadcast {:?} with {:?}",
                    a, b
                )))
            }
        };
    }
    Ok(out)
}

pub(crate) fn normalize_axis(axis: i64, ndim: usize) -> TensorResult<usize> {
    let ndim = ndim as i64;
    let resolved = if axis < 0 { axis + ndim } else { axis };
    if resolved < 0 || resolved >= ndim {
        return Err(TensorError::IndexOutOfBounds { index: axis, len: ndim as usize });
    }
    Ok(resolved as usize)
}

pub(crate) fn permutation(ndim: usize, perm: Option<&ConstArg>) -> TensorResult<Vec<usize>> {
    match perm {
        None | Some(ConstArg::None) => Ok((0..ndim).rev().collect()),
        Some(ConstArg::IntList(axes)) if axes.len() == ndim => {
            let resolved = axes
                .iter()
                .map(|&a| normalize_axis(a, ndim))
                .collect::<TensorResult<Vec<_>>>()?;
            let mut seen = vec![false; ndim];
            for &axis in &resolved {
                if std::mem::replace(&mut seen[axis], true) {
                    return Err(TensorError::InvalidArgument(format!(
                        "repeated axis in permutation {:?}",
                        axes
                    )));
                }
            }
            Ok(resolved)
        }
        Some(other) => Err(TensorError::InvalidArgument(format!(
            "invalid permutation {} for {} dims",
            other, ndim
        ))),
    }
}

pub(crate) fn reshape_target(numel: Option<usize>, target: &[i64]) -> TensorResult<Shape> {
    let inferred: Vec<usize> = (0..target.len()).filter(|&i| target[i] == -1).collect();
    if inferred.len() > 1 || target.iter().any(|&d| d < -1) {
        return Err(TensorError::InvalidArgument(format!("invalid reshape target {:?}", target)));
    }
    let known: i64 = target.iter().filter(|&&d| d != -1).product();
    let mut shape: Shape = target.iter().copied().collect();
    match (numel, inferred.first()) {
        (Some(numel), Some(&slot)) => {
            if known == 0 || numel as i64 % known != 0 {
                return Err(TensorError::ShapeMismatch(format!(
                    "cannot reshape {} elements into {:?}",
                    numel, target
                )));
            }
            shape[slot] = numel as i64 / known;
        }
        (Some(numel), None) if numel as i64 != known => {
            return Err(TensorError::ShapeMismatch(format!(
                "cannot reshape {} elements into {:?}",
                numel, target
            )));
        }
        _ => {}
    }
    Ok(shape)
}

/// Resolved `(start, step, len)` of a slice over a dimension of `dim` elements
pub(crate) fn resolve_slice(
    dim: i64,
    start: Option<i64>,
    stop: Option<i64>,
    step: Option<i64>,
) -> TensorResult<(i64, i64, i64)> {
    let step = step.unwrap_or(1);
    if step == 0 {
        return Err(TensorError::InvalidArgument("slice step cannot be zero".into()));
    }
    let clamp = |v: i64, lo: i64, hi: i64| v.max(lo).min(hi);
    let wrap = |v: i64| if v < 0 { v + dim } else { v };
    if step > 0 {
        let start = start.map_or(0, |v| clamp(wrap(v), 0, dim));
        let stop = stop.map_or(dim, |v| clamp(wrap(v), 0, dim));
        let len = if stop > start { (stop - start + step - 1) / step } else { 0 };
        Ok((start, step, len))
    } else {
        let start = start.map_or(dim - 1, |v| clamp(wrap(v), -1, dim - 1));
        let stop = stop.map_or(-1, |v| clamp(wrap(v), -1, dim - 1));
        let len = if start > stop { (start - stop + (-step) - 1) / (-step) } else { 0 };
        Ok((start, step, len))
    }
}

pub(crate) fn indexed_shape(shape: &[i64], items: &[IndexItem]) -> TensorResult<Shape> {
    if items.len() > shape.len() {
        return Err(TensorError::InvalidArgument(format!(
            "too many indices ({}) for tensor of dimension {}",
            items.len(),
            shape.len()
        )));
    }
    let mut out = Shape::new();
    for (item, &dim) in items.iter().zip(shape) {
        match *item {
            IndexItem::Int(i) => {
                if dim != DYNAMIC_DIM && (i >= dim || i < -dim) {
                    return Err(TensorError::IndexOutOfBounds { index: i, len: dim as usize });
                }
            }
            IndexItem::Slice(start, stop, step) => {
                if dim == DYNAMIC_DIM {
                    if step == Some(0) {
                        return Err(TensorError::InvalidArgument("slice step cannot be zero".into()));
                    }
                    out.push(DYNAMIC_DIM);
                } else {
                    out.push(resolve_slice(dim, start, stop, step)?.2);
                }
            }
        }
    }
    out.extend_from_slice(&shape[items.len()..]);
    Ok(out)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct InferKey {
    op: TensorOp,
    inputs: Vec<MetaOperand>,
}

enum MetaStore {
    Unbounded(DashMap<InferKey, MetaInfo>),
    Bounded(Mutex<LruCache<InferKey, MetaInfo>>),
}

/// Process-wide memo of oracle answers.
///
/// Unbounded by default; `with_capacity` switches to an LRU bound. Failed
/// inferences are never stored.
pub struct InferMetaCache {
    oracle: Arc<dyn ShapeOracle>,
    store: MetaStore,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl InferMetaCache {
    pub fn new(oracle: Arc<dyn ShapeOracle>) -> Self {
        Self {
            oracle,
            store: MetaStore::Unbounded(DashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn with_capacity(oracle: Arc<dyn ShapeOracle>, capacity: NonZeroUsize) -> Self {
        Self {
            oracle,
            store: MetaStore::Bounded(Mutex::new(LruCache::new(capacity))),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn infer(&self, op: TensorOp, inputs: &[MetaOperand]) -> TensorResult<MetaInfo> {
        let key = InferKey {
            op,
            inputs: inputs.to_vec(),
        };
        let cached = match &self.store {
            MetaStore::Unbounded(map) => map.get(&key).map(|entry| entry.value().clone()),
            MetaStore::Bounded(lru) => lru.lock().get(&key).cloned(),
        };
        if let Some(meta) = cached {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(meta);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let meta = self.oracle.infer(op, inputs)?;
        trace!(target: "symtrace::oracle", %op, output = %meta, "Inferred metadata");
        match &self.store {
            MetaStore::Unbounded(map) => {
                map.insert(key, meta.clone());
            }
            MetaStore::Bounded(lru) => {
                lru.lock().put(key, meta.clone());
            }
        }
        Ok(meta)
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        match &self.store {
            MetaStore::Unbounded(map) => map.len(),
            MetaStore::Bounded(lru) => lru.lock().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InferMetaCache {
    fn default() -> Self {
        Self::new(Arc::new(ReferenceOracle))
    }
}

static GLOBAL_INFER_CACHE: LazyLock<Arc<InferMetaCache>> = LazyLock::new(|| Arc::new(InferMetaCache::default()));

impl InferMetaCache {
    /// The unbounded process-wide cache over [`ReferenceOracle`]
    pub fn global() -> Arc<InferMetaCache> {
        GLOBAL_INFER_CACHE.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn tensor(shape: &[i64]) -> MetaOperand {
        MetaOperand::Tensor(MetaInfo::new(shape.iter().copied(), DType::Float32, true))
    }

    #[test]
    fn test_broadcast_rules() {
        assert_eq!(broadcast_shapes(&[2, 3], &[3]).expect("ok").as_slice(), &[2, 3]);
        assert_eq!(broadcast_shapes(&[2, 1], &[1, 4]).expect("ok").as_slice(), &[2, 4]);
        assert_eq!(broadcast_shapes(&[-1, 3], &[1, 3]).expect("ok").as_slice(), &[-1, 3]);
        assert!(broadcast_shapes(&[2, 3], &[4]).is_err());
    }

    #[test]
    fn test_binary_with_scalar() {
        let out = ReferenceOracle
            .infer(TensorOp::Add, &[tensor(&[2, 3]), MetaOperand::Const(ConstArg::Int(1))])
            .expect("add should infer");
        assert_eq!(out, MetaInfo::new([2, 3], DType::Float32, true));

        let cmp = ReferenceOracle
            .infer(TensorOp::GreaterThan, &[tensor(&[2]), tensor(&[2])])
            .expect("compare should infer");
        assert_eq!(cmp.dtype, DType::Bool);
    }

    #[test]
    fn test_getitem_and_slices() {
        let x = tensor(&[4, 5]);
        let row = ReferenceOracle
            .infer(TensorOp::GetItem, &[x.clone(), MetaOperand::Const(ConstArg::Int(1))])
            .expect("int index");
        assert_eq!(row.shape.as_slice(), &[5]);

        let sliced = ReferenceOracle
            .infer(
                TensorOp::GetItem,
                &[
                    x.clone(),
                    MetaOperand::Const(ConstArg::Index(vec![
                        IndexItem::Slice(Some(1), None, None),
                        IndexItem::Slice(None, None, Some(2)),
                    ])),
                ],
            )
            .expect("slice index");
        assert_eq!(sliced.shape.as_slice(), &[3, 3]);

        assert!(ReferenceOracle
            .infer(TensorOp::GetItem, &[x, MetaOperand::Const(ConstArg::Int(4))])
            .is_err());
    }

    #[test]
    fn test_reverse_slice_length() {
        assert_eq!(resolve_slice(5, None, None, Some(-1)).expect("ok"), (4, -1, 5));
        assert_eq!(resolve_slice(5, Some(-2), None, None).expect("ok"), (3, 1, 2));
        assert_eq!(resolve_slice(5, Some(3), Some(1), None).expect("ok").2, 0);
    }

    #[test]
    fn test_reshape_inference() {
        let out = ReferenceOracle
            .infer(
                TensorOp::Reshape,
                &[tensor(&[2, 6]), MetaOperand::Const(ConstArg::IntList(vec![3, -1]))],
            )
            .expect("reshape");
        assert_eq!(out.shape.as_slice(), &[3, 4]);
        assert!(ReferenceOracle
            .infer(
                TensorOp::Reshape,
                &[tensor(&[2, 6]), MetaOperand::Const(ConstArg::IntList(vec![5, -1]))],
            )
            .is_err());
    }

    #[test]
    fn test_nonzero_is_dynamic() {
        let out = ReferenceOracle
            .infer(TensorOp::Nonzero, &[tensor(&[3, 2])])
            .expect("nonzero");
        assert!(out.is_dynamic_shape());
        assert_eq!(out.shape.as_slice(), &[DYNAMIC_DIM, 2]);
    }

    struct CountingOracle(AtomicUsize);

    impl ShapeOracle for CountingOracle {
        fn infer(&self, op: TensorOp, inputs: &[MetaOperand]) -> TensorResult<MetaInfo> {
            self.0.fetch_add(1, Ordering::SeqCst);
            ReferenceOracle.infer(op, inputs)
        }
    }

    #[test]
    fn test_cache_avoids_repeat_queries() {
        let oracle = Arc::new(CountingOracle(AtomicUsize::new(0)));
        let cache = InferMetaCache::new(oracle.clone());
        let inputs = [tensor(&[2, 3]), tensor(&[2, 3])];
        for _ in 0..3 {
            cache.infer(TensorOp::Add, &inputs).expect("add should infer");
        }
        assert_eq!(oracle.0.load(Ordering::SeqCst), 1);
        assert_eq!(cache.hits(), 2);
        assert_eq!(cache.misses(), 1);
    }

    #[test]
    fn test_cache_does_not_store_failures() {
        let oracle = Arc::new(CountingOracle(AtomicUsize::new(0)));
        let cache = InferMetaCache::with_capacity(oracle.clone(), NonZeroUsize::new(4).expect("nonzero"));
        let bad = [tensor(&[2, 3]), tensor(&[4])];
        assert!(cache.infer(TensorOp::Add, &bad).is_err());
        assert!(cache.infer(TensorOp::Add, &bad).is_err());
        assert_eq!(oracle.0.load(Ordering::SeqCst), 2);
        assert!(cache.is_empty());
    }
}
