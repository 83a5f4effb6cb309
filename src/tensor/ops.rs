//! Tensor operation names and constant operands

use std::fmt;
use std::hash::{Hash, Hasher};

use itertools::Itertools;

/// A numeric operation the tracer can record.
///
/// The same names serve as module-level API functions (`tensor.add(x, y)`)
/// and as tensor methods (`x.add(y)`); indexing uses the dunder names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TensorOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    FloorDivide,
    Remainder,
    Pow,
    Negative,
    MatMul,
    Transpose,
    Reshape,
    Sum,
    Mean,
    Relu,
    Exp,
    Abs,
    Sqrt,
    Equal,
    NotEqual,
    LessThan,
    LessEqual,
    GreaterThan,
    GreaterEqual,
    GetItem,
    SetItem,
    Nonzero,
    Ones,
    Zeros,
}

const ALL_OPS: &[TensorOp] = &[
    TensorOp::Add,
    TensorOp::Subtract,
    TensorOp::Multiply,
    TensorOp::Divide,
    TensorOp::FloorDivide,
    TensorOp::Remainder,
    TensorOp::Pow,
    TensorOp::Negative,
    TensorOp::MatMul,
    TensorOp::Transpose,
    TensorOp::Reshape,
    TensorOp::Sum,
    TensorOp::Mean,
    TensorOp::Relu,
    TensorOp::Exp,
    TensorOp::Abs,
    TensorOp::Sqrt,
    TensorOp::Equal,
    TensorOp::NotEqual,
    TensorOp::LessThan,
    TensorOp::LessEqual,
    TensorOp::GreaterThan,
    TensorOp::GreaterEqual,
    TensorOp::GetItem,
    TensorOp::SetItem,
    TensorOp::Nonzero,
    TensorOp::Ones,
    TensorOp::Zeros,
];

impl TensorOp {
    pub fn name(self) -> &'static str {
        match self {
            TensorOp::Add => "add",
            TensorOp::Subtract => "subtract",
            TensorOp::Multiply => "multiply",
            TensorOp::Divide => "divide",
            TensorOp::FloorDivide => "floor_divide",
            TensorOp::Remainder => "remainder",
            TensorOp::Pow => "pow",
            TensorOp::Negative => "neg",
            TensorOp::MatMul => "matmul",
            TensorOp::Transpose => "transpose",
            TensorOp::Reshape => "reshape",
            TensorOp::Sum => "sum",
            TensorOp::Mean => "mean",
            TensorOp::Relu => "relu",
            TensorOp::Exp => "exp",
            TensorOp::Abs => "abs",
            TensorOp::Sqrt => "sqrt",
            TensorOp::Equal => "equal",
            TensorOp::NotEqual => "not_equal",
            TensorOp::LessThan => "less_than",
            TensorOp::LessEqual => "less_equal",
            TensorOp::GreaterThan => "greater_than",
            TensorOp::GreaterEqual => "greater_equal",
            TensorOp::GetItem => "__getitem__",
            TensorOp::SetItem => "__setitem__",
            TensorOp::Nonzero => "nonzero",
            TensorOp::Ones => "ones",
            TensorOp::Zeros => "zeros",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        ALL_OPS.iter().copied().find(|op| op.name() == name)
    }

    /// Ops exposed as bound methods on tensor values
    pub fn from_method_name(name: &str) -> Option<Self> {
        match Self::from_name(name)? {
            TensorOp::Ones | TensorOp::Zeros => None,
            op => Some(op),
        }
    }

    /// Ops exposed as module-level functions of the `tensor` module
    pub fn api_ops() -> impl Iterator<Item = TensorOp> {
        ALL_OPS
            .iter()
            .copied()
            .filter(|op| !matches!(op, TensorOp::GetItem | TensorOp::SetItem))
    }

    pub fn is_elementwise_binary(self) -> bool {
        matches!(
            self,
            TensorOp::Add
                | TensorOp::Subtract
                | TensorOp::Multiply
                | TensorOp::Divide
                | TensorOp::FloorDivide
                | TensorOp::Remainder
                | TensorOp::Pow
        ) || self.is_comparison()
    }

    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            TensorOp::Equal
                | TensorOp::NotEqual
                | TensorOp::LessThan
                | TensorOp::LessEqual
                | TensorOp::GreaterThan
                | TensorOp::GreaterEqual
        )
    }

    pub fn is_elementwise_unary(self) -> bool {
        matches!(
            self,
            TensorOp::Negative | TensorOp::Relu | TensorOp::Exp | TensorOp::Abs | TensorOp::Sqrt
        )
    }
}

impl fmt::Display for TensorOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One component of a multi-dimensional index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexItem {
    Int(i64),
    Slice(Option<i64>, Option<i64>, Option<i64>),
}

impl fmt::Display for IndexItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let part = |v: &Option<i64>| v.map(|v| v.to_string()).unwrap_or_default();
        match self {
            IndexItem::Int(i) => write!(f, "{}", i),
            IndexItem::Slice(start, stop, None) => write!(f, "{}:{}", part(start), part(stop)),
            IndexItem::Slice(start, stop, step) => {
                write!(f, "{}:{}:{}", part(start), part(stop), part(step))
            }
        }
    }
}

/// A non-tensor operand baked into a statement
#[derive(Debug, Clone)]
pub enum ConstArg {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    IntList(Vec<i64>),
    Index(Vec<IndexItem>),
    Str(String),
}

impl ConstArg {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            ConstArg::Int(v) => Some(*v),
            ConstArg::Bool(b) => Some(*b as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ConstArg::Int(v) => Some(*v as f64),
            ConstArg::Float(v) => Some(*v),
            ConstArg::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    pub fn is_scalar(&self) -> bool {
        matches!(self, ConstArg::Int(_) | ConstArg::Float(_) | ConstArg::Bool(_))
    }

    /// Normalize index-like operands into index items
    pub fn index_items(&self) -> Option<Vec<IndexItem>> {
        match self {
            ConstArg::Int(i) => Some(vec![IndexItem::Int(*i)]),
            ConstArg::IntList(items) => Some(items.iter().map(|&i| IndexItem::Int(i)).collect()),
            ConstArg::Index(items) => Some(items.clone()),
            _ => None,
        }
    }
}

impl PartialEq for ConstArg {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ConstArg::None, ConstArg::None) => true,
            (ConstArg::Bool(a), ConstArg::Bool(b)) => a == b,
            (ConstArg::Int(a), ConstArg::Int(b)) => a == b,
            (ConstArg::Float(a), ConstArg::Float(b)) => a.to_bits() == b.to_bits(),
            (ConstArg::IntList(a), ConstArg::IntList(b)) => a == b,
            (ConstArg::Index(a), ConstArg::Index(b)) => a == b,
            (ConstArg::Str(a), ConstArg::Str(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for ConstArg {}

impl Hash for ConstArg {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            ConstArg::None => {}
            ConstArg::Bool(b) => b.hash(state),
            ConstArg::Int(v) => v.hash(state),
            ConstArg::Float(v) => v.to_bits().hash(state),
            ConstArg::IntList(v) => v.hash(state),
            ConstArg::Index(v) => v.hash(state),
            ConstArg::Str(s) => s.hash(state),
        }
    }
}

impl fmt::Display for ConstArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConstArg::None => f.write_str("None"),
            ConstArg::Bool(b) => f.write_str(if *b { "True" } else { "False" }),
            ConstArg::Int(v) => write!(f, "{}", v),
            ConstArg::Float(v) => write!(f, "{:?}", v),
            ConstArg::IntList(v) => write!(f, "[{}]", v.iter().join(", ")),
            ConstArg::Index(v) => write!(f, "[{}]", v.iter().join(", ")),
            ConstArg::Str(s) => write!(f, "{:?}", s),
        }
    }
}
