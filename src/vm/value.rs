//! Guest runtime values

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use itertools::Itertools;
use parking_lot::{Mutex, RwLock};

use crate::bytecode::CodeObject;
use crate::tensor::{ConstArg, IndexItem, Tensor, TensorOp};

use super::types::{VmError, VmResult};

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_object_id() -> u64 {
    NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed)
}

/// A guest value
#[derive(Clone)]
pub enum Value {
    None,
    /// Call sentinel pushed by `PUSH_NULL` / `LOAD_METHOD`
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Arc<str>),
    Tuple(Arc<Vec<Value>>),
    List(Arc<RwLock<Vec<Value>>>),
    Dict(Arc<RwLock<Vec<(Value, Value)>>>),
    Slice(Arc<SliceValue>),
    Range(RangeValue),
    Iter(Arc<Mutex<IterState>>),
    Tensor(Arc<Tensor>),
    Code(Arc<CodeObject>),
    Function(Arc<Function>),
    Builtin(Builtin),
    BoundMethod(Arc<BoundMethod>),
    Native(Arc<dyn NativeFunction>),
    Module(Arc<Module>),
    Object(Arc<Object>),
    Cell(Arc<Cell>),
    Context(Arc<ContextHandle>),
}

/// `start:stop:step`, each component a value
#[derive(Debug, Clone)]
pub struct SliceValue {
    pub start: Value,
    pub stop: Value,
    pub step: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RangeValue {
    pub start: i64,
    pub stop: i64,
    pub step: i64,
}

impl RangeValue {
    pub fn len(&self) -> usize {
        let span = if self.step > 0 {
            self.stop - self.start
        } else {
            self.start - self.stop
        };
        if span <= 0 {
            0
        } else {
            ((span + self.step.abs() - 1) / self.step.abs()) as usize
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Option<i64> {
        (index < self.len()).then(|| self.start + index as i64 * self.step)
    }
}

/// Iteration state behind `GET_ITER`
#[derive(Debug)]
pub enum IterState {
    Seq { items: Vec<Value>, pos: usize },
    Range { range: RangeValue, pos: usize },
    Rows { tensor: Arc<Tensor>, pos: usize },
}

/// A user-defined guest function
pub struct Function {
    pub id: u64,
    pub code: Arc<CodeObject>,
    pub globals: Globals,
    pub name: String,
    pub defaults: Vec<Value>,
    pub closure: Vec<Arc<Cell>>,
}

impl Function {
    pub fn new(code: Arc<CodeObject>, globals: Globals) -> Self {
        Self::with_closure(code, globals, Vec::new())
    }

    pub fn with_closure(code: Arc<CodeObject>, globals: Globals, closure: Vec<Arc<Cell>>) -> Self {
        Self {
            id: next_object_id(),
            name: code.name.clone(),
            code,
            globals,
            defaults: Vec::new(),
            closure,
        }
    }

    /// Closure cell by free-variable name
    pub fn free_cell(&self, name: &str) -> Option<&Arc<Cell>> {
        let index = self.code.freevars.iter().position(|n| n == name)?;
        self.closure.get(index)
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<function {} #{}>", self.name, self.id)
    }
}

/// Host-provided callable exposed to guest code
pub trait NativeFunction: Send + Sync {
    fn name(&self) -> &str;
    fn call(&self, args: Vec<Value>) -> VmResult<Value>;
}

/// Built-in functions of the guest runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Builtin {
    Range,
    Len,
    Print,
    Abs,
    Int,
    Float,
    /// `tensor.<op>(..)` module functions
    TensorApi(TensorOp),
    /// `tensor.to_tensor(list)`
    ToTensor,
}

impl Builtin {
    pub fn name(self) -> &'static str {
        match self {
            Builtin::Range => "range",
            Builtin::Len => "len",
            Builtin::Print => "print",
            Builtin::Abs => "abs",
            Builtin::Int => "int",
            Builtin::Float => "float",
            Builtin::TensorApi(op) => op.name(),
            Builtin::ToTensor => "to_tensor",
        }
    }

    /// Global builtins visible from every function
    pub fn lookup(name: &str) -> Option<Builtin> {
        match name {
            "range" => Some(Builtin::Range),
            "len" => Some(Builtin::Len),
            "print" => Some(Builtin::Print),
            "abs" => Some(Builtin::Abs),
            "int" => Some(Builtin::Int),
            "float" => Some(Builtin::Float),
            _ => None,
        }
    }
}

/// A tensor method bound to its receiver
#[derive(Debug)]
pub struct BoundMethod {
    pub receiver: Value,
    pub op: TensorOp,
}

/// An immutable attribute namespace (`import tensor`)
#[derive(Debug)]
pub struct Module {
    pub name: String,
    attrs: HashMap<String, Value>,
}

impl Module {
    pub fn new(name: impl Into<String>, attrs: HashMap<String, Value>) -> Self {
        Self {
            name: name.into(),
            attrs,
        }
    }

    pub fn get(&self, attr: &str) -> Option<Value> {
        self.attrs.get(attr).cloned()
    }
}

/// Plain attribute bag supplied by the host
#[derive(Debug)]
pub struct Object {
    pub id: u64,
    pub class_name: String,
    attrs: RwLock<HashMap<String, Value>>,
}

impl Object {
    pub fn new(class_name: impl Into<String>) -> Self {
        Self {
            id: next_object_id(),
            class_name: class_name.into(),
            attrs: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, attr: &str) -> Option<Value> {
        self.attrs.read().get(attr).cloned()
    }

    pub fn set(&self, attr: impl Into<String>, value: Value) {
        self.attrs.write().insert(attr.into(), value);
    }
}

/// Closure cell
#[derive(Debug, Default)]
pub struct Cell(Mutex<Option<Value>>);

impl Cell {
    pub fn new(value: Option<Value>) -> Self {
        Self(Mutex::new(value))
    }

    pub fn get(&self) -> Option<Value> {
        self.0.lock().clone()
    }

    pub fn set(&self, value: Value) {
        *self.0.lock() = Some(value);
    }
}

/// Opaque handle to interpreter-level state (gradient mode and similar)
#[derive(Debug)]
pub struct ContextHandle {
    pub name: String,
}

/// Module-level namespace shared by functions defined together
#[derive(Clone, Default)]
pub struct Globals(Arc<RwLock<HashMap<String, Value>>>);

impl Globals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.0.read().get(name).cloned()
    }

    pub fn insert(&self, name: impl Into<String>, value: Value) {
        self.0.write().insert(name.into(), value);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.read().contains_key(name)
    }

    pub fn ptr_eq(&self, other: &Globals) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Globals {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<globals: {} names>", self.0.read().len())
    }
}

impl Value {
    pub fn str(s: &str) -> Self {
        Value::Str(Arc::from(s))
    }

    pub fn tuple(items: Vec<Value>) -> Self {
        Value::Tuple(Arc::new(items))
    }

    pub fn list(items: Vec<Value>) -> Self {
        Value::List(Arc::new(RwLock::new(items)))
    }

    pub fn tensor(tensor: Tensor) -> Self {
        Value::Tensor(Arc::new(tensor))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "NoneType",
            Value::Null => "NULL",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Tuple(_) => "tuple",
            Value::List(_) => "list",
            Value::Dict(_) => "dict",
            Value::Slice(_) => "slice",
            Value::Range(_) => "range",
            Value::Iter(_) => "iterator",
            Value::Tensor(_) => "Tensor",
            Value::Code(_) => "code",
            Value::Function(_) => "function",
            Value::Builtin(_) => "builtin_function",
            Value::BoundMethod(_) => "method",
            Value::Native(_) => "native_function",
            Value::Module(_) => "module",
            Value::Object(_) => "object",
            Value::Cell(_) => "cell",
            Value::Context(_) => "context",
        }
    }

    /// Truth value used by conditional jumps
    pub fn truthy(&self) -> VmResult<bool> {
        Ok(match self {
            Value::None | Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::Tuple(items) => !items.is_empty(),
            Value::List(items) => !items.read().is_empty(),
            Value::Dict(items) => !items.read().is_empty(),
            Value::Range(r) => !r.is_empty(),
            Value::Tensor(t) => t.truthy().map_err(VmError::Tensor)?,
            _ => true,
        })
    }

    /// Identity in the sense of constant-pool deduplication.
    ///
    /// Scalars are identical only when both the variant and the bit pattern
    /// agree, so `True` and `1` (or `1.0` and `1`) never alias. Heap values
    /// compare by pointer.
    pub fn same_constant(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::None, Value::None) | (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Range(a), Value::Range(b)) => a == b,
            (Value::Builtin(a), Value::Builtin(b)) => a == b,
            _ => self.identity() == other.identity() && self.identity().is_some(),
        }
    }

    /// Pointer identity of heap values
    pub fn identity(&self) -> Option<usize> {
        Some(match self {
            Value::Tuple(v) => Arc::as_ptr(v) as *const () as usize,
            Value::List(v) => Arc::as_ptr(v) as *const () as usize,
            Value::Dict(v) => Arc::as_ptr(v) as *const () as usize,
            Value::Slice(v) => Arc::as_ptr(v) as *const () as usize,
            Value::Iter(v) => Arc::as_ptr(v) as *const () as usize,
            Value::Tensor(v) => Arc::as_ptr(v) as *const () as usize,
            Value::Code(v) => Arc::as_ptr(v) as *const () as usize,
            Value::Function(v) => Arc::as_ptr(v) as *const () as usize,
            Value::BoundMethod(v) => Arc::as_ptr(v) as *const () as usize,
            Value::Native(v) => Arc::as_ptr(v) as *const () as usize,
            Value::Module(v) => Arc::as_ptr(v) as *const () as usize,
            Value::Object(v) => Arc::as_ptr(v) as *const () as usize,
            Value::Cell(v) => Arc::as_ptr(v) as *const () as usize,
            Value::Context(v) => Arc::as_ptr(v) as *const () as usize,
            _ => return None,
        })
    }

    /// Guest `==`: numeric tower for scalars, structural for sequences,
    /// identity for everything else
    pub fn py_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::None, Value::None) => true,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Tuple(a), Value::Tuple(b)) => {
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.py_eq(y))
            }
            (Value::List(a), Value::List(b)) => {
                let (a, b) = (a.read(), b.read());
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.py_eq(y))
            }
            (Value::Range(a), Value::Range(b)) => a == b,
            (Value::Builtin(a), Value::Builtin(b)) => a == b,
            _ => match (self.as_number(), other.as_number()) {
                (Some(a), Some(b)) => a == b,
                _ => self.identity().is_some() && self.identity() == other.identity(),
            },
        }
    }

    /// Exact equality used by guards: same variant, same payload
    pub fn strict_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Tuple(a), Value::Tuple(b)) => {
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.strict_eq(y))
            }
            _ => self.same_constant(other),
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Bool(b) => Some(*b as i64),
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_tensor(&self) -> Option<&Arc<Tensor>> {
        match self {
            Value::Tensor(t) => Some(t),
            _ => None,
        }
    }

    /// Convert a non-tensor value into a kernel operand
    pub fn to_const_arg(&self) -> Option<ConstArg> {
        Some(match self {
            Value::None => ConstArg::None,
            Value::Bool(b) => ConstArg::Bool(*b),
            Value::Int(i) => ConstArg::Int(*i),
            Value::Float(f) => ConstArg::Float(*f),
            Value::Str(s) => ConstArg::Str(s.to_string()),
            Value::Slice(slice) => ConstArg::Index(vec![slice.to_index_item()?]),
            Value::Tuple(items) => sequence_const_arg(items.iter())?,
            Value::List(items) => sequence_const_arg(items.read().iter())?,
            _ => return None,
        })
    }

    /// Guest `repr`
    pub fn repr(&self) -> String {
        match self {
            Value::None => "None".to_string(),
            Value::Null => "NULL".to_string(),
            Value::Bool(b) => (if *b { "True" } else { "False" }).to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => format!("{:?}", f),
            Value::Str(s) => format!("'{}'", s),
            Value::Tuple(items) if items.len() == 1 => format!("({},)", items[0].repr()),
            Value::Tuple(items) => format!("({})", items.iter().map(Value::repr).join(", ")),
            Value::List(items) => format!("[{}]", items.read().iter().map(Value::repr).join(", ")),
            Value::Dict(items) => format!(
                "{{{}}}",
                items
                    .read()
                    .iter()
                    .map(|(k, v)| format!("{}: {}", k.repr(), v.repr()))
                    .join(", ")
            ),
            Value::Slice(s) => format!("slice({}, {}, {})", s.start.repr(), s.stop.repr(), s.step.repr()),
            Value::Range(r) => format!("range({}, {}, {})", r.start, r.stop, r.step),
            Value::Tensor(t) => format!("{:?}", t),
            Value::Code(c) => format!("<code {}>", c.name),
            Value::Function(func) => format!("{:?}", func),
            Value::Builtin(b) => format!("<built-in function {}>", b.name()),
            Value::BoundMethod(m) => format!("<bound method Tensor.{}>", m.op.name()),
            Value::Native(n) => format!("<native {}>", n.name()),
            Value::Module(m) => format!("<module '{}'>", m.name),
            Value::Object(o) => format!("<{} object #{}>", o.class_name, o.id),
            Value::Cell(_) => "<cell>".to_string(),
            Value::Context(c) => format!("<context {}>", c.name),
            Value::Iter(_) => "<iterator>".to_string(),
        }
    }
}

impl SliceValue {
    pub fn to_index_item(&self) -> Option<IndexItem> {
        let part = |v: &Value| match v {
            Value::None => Some(None),
            other => other.as_int().map(Some),
        };
        Some(IndexItem::Slice(part(&self.start)?, part(&self.stop)?, part(&self.step)?))
    }
}

fn sequence_const_arg<'a>(items: impl Iterator<Item = &'a Value>) -> Option<ConstArg> {
    let items: Vec<&Value> = items.collect();
    if items.iter().all(|v| matches!(v, Value::Int(_))) {
        return Some(ConstArg::IntList(items.iter().filter_map(|v| v.as_int()).collect()));
    }
    items
        .iter()
        .map(|v| match v {
            Value::Int(i) => Some(IndexItem::Int(*i)),
            Value::Slice(s) => s.to_index_item(),
            _ => None,
        })
        .collect::<Option<Vec<_>>>()
        .map(ConstArg::Index)
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.repr())
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<Tensor> for Value {
    fn from(t: Tensor) -> Self {
        Value::tensor(t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_constant_does_not_alias_bool_and_int() {
        assert!(!Value::Bool(true).same_constant(&Value::Int(1)));
        assert!(!Value::Int(1).same_constant(&Value::Float(1.0)));
        assert!(Value::Int(7).same_constant(&Value::Int(7)));
        assert!(Value::Int(1).py_eq(&Value::Bool(true)));
    }

    #[test]
    fn test_heap_values_compare_by_identity() {
        let a = Value::list(vec![Value::Int(1)]);
        let b = Value::list(vec![Value::Int(1)]);
        assert!(a.same_constant(&a.clone()));
        assert!(!a.same_constant(&b));
        assert!(a.py_eq(&b));
    }

    #[test]
    fn test_range_len() {
        assert_eq!(RangeValue { start: 0, stop: 5, step: 1 }.len(), 5);
        assert_eq!(RangeValue { start: 5, stop: 0, step: -2 }.len(), 3);
        assert_eq!(RangeValue { start: 3, stop: 3, step: 1 }.len(), 0);
        assert_eq!(RangeValue { start: 1, stop: 7, step: 3 }.get(1), Some(4));
    }

    #[test]
    fn test_const_arg_conversion() {
        let shape = Value::tuple(vec![Value::Int(2), Value::Int(-1)]);
        assert_eq!(shape.to_const_arg(), Some(ConstArg::IntList(vec![2, -1])));
        let slice = Value::Slice(Arc::new(SliceValue {
            start: Value::Int(1),
            stop: Value::None,
            step: Value::None,
        }));
        let index = Value::tuple(vec![slice, Value::Int(0)]);
        assert_eq!(
            index.to_const_arg(),
            Some(ConstArg::Index(vec![IndexItem::Slice(Some(1), None, None), IndexItem::Int(0)]))
        );
    }
}
