//! Symbolic values
//!
//! Every value on the executor's stack and in its locals is a [`Variable`]:
//! a kind describing what is known about the value plus a [`Tracker`]
//! describing where it came from. Variables are immutable and shared;
//! identity is the allocation id, never structural equality.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use itertools::Itertools;
use parking_lot::RwLock;
use tracing::trace;

use crate::bytecode::CodeGen;
use crate::error::{TraceError, TraceResult};
use crate::symbolic::Symbol;
use crate::tensor::{ConstArg, MetaInfo, TensorOp};
use crate::vm::{Builtin, ContextHandle, Function, Module, RangeValue, SliceValue, Value};

use super::function_graph::{out_var_name, FunctionGraph, GraphId};
use super::guard::GuardExpr;
use super::tracker::Tracker;

static NEXT_VARIABLE_ID: AtomicU64 = AtomicU64::new(0);

/// A traced tensor: metadata only, named by a statement-program symbol
#[derive(Debug, Clone)]
pub struct TensorVar {
    pub meta: MetaInfo,
    pub symbol: Symbol,
    pub graph: GraphId,
}

/// Position within an iteration that the executor unrolls
#[derive(Clone)]
pub struct IterVar {
    pub source: Variable,
    pub pos: usize,
    pub len: usize,
}

#[derive(Clone)]
pub enum VariableKind {
    /// A scalar, string, range or code object known at trace time
    Constant(Value),
    Tensor(TensorVar),
    /// A host object the trace never looks inside
    Object(Value),
    Slice(Arc<SliceValue>),
    Module(Arc<Module>),
    InterpreterContext(Arc<ContextHandle>),
    /// Placeholder pushed by `LOAD_METHOD`
    Dummy,
    /// A cell of the traced frame, as pushed by `LOAD_CLOSURE`
    Closure(String),
    Tuple(Vec<Variable>),
    List(Vec<Variable>),
    Dict(Vec<(Variable, Variable)>),
    Function(Arc<Function>),
    Builtin(Builtin),
    TensorMethod { receiver: Variable, op: TensorOp },
    Iter(IterVar),
}

impl VariableKind {
    pub fn name(&self) -> &'static str {
        match self {
            VariableKind::Constant(_) => "ConstantVariable",
            VariableKind::Tensor(_) => "TensorVariable",
            VariableKind::Object(_) => "ObjectVariable",
            VariableKind::Slice(_) => "SliceVariable",
            VariableKind::Module(_) => "ModuleVariable",
            VariableKind::InterpreterContext(_) => "InterpreterContextVariable",
            VariableKind::Dummy => "DummyVariable",
            VariableKind::Closure(_) => "ClosureVariable",
            VariableKind::Tuple(_) => "TupleVariable",
            VariableKind::List(_) => "ListVariable",
            VariableKind::Dict(_) => "DictVariable",
            VariableKind::Function(_) => "UserFunctionVariable",
            VariableKind::Builtin(_) => "BuiltinVariable",
            VariableKind::TensorMethod { .. } => "TensorMethodVariable",
            VariableKind::Iter(_) => "IterVariable",
        }
    }
}

struct VariableInner {
    id: u64,
    kind: VariableKind,
    tracker: Tracker,
}

#[derive(Clone)]
pub struct Variable(Arc<VariableInner>);

impl Variable {
    pub fn new(kind: VariableKind, tracker: Tracker) -> Self {
        Variable(Arc::new(VariableInner {
            id: NEXT_VARIABLE_ID.fetch_add(1, Ordering::Relaxed),
            kind,
            tracker,
        }))
    }

    pub fn constant(value: Value, tracker: Tracker) -> Self {
        Self::new(VariableKind::Constant(value), tracker)
    }

    pub fn dummy() -> Self {
        Self::new(VariableKind::Dummy, Tracker::derived(&[]))
    }

    pub fn closure(name: &str) -> Self {
        Self::new(VariableKind::Closure(name.to_string()), Tracker::derived(&[]))
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.0.id
    }

    #[inline]
    pub fn kind(&self) -> &VariableKind {
        &self.0.kind
    }

    #[inline]
    pub fn tracker(&self) -> &Tracker {
        &self.0.tracker
    }

    pub fn same(&self, other: &Variable) -> bool {
        self.id() == other.id()
    }

    pub fn as_tensor(&self) -> Option<&TensorVar> {
        match self.kind() {
            VariableKind::Tensor(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_constant(&self) -> Option<&Value> {
        match self.kind() {
            VariableKind::Constant(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_tensor(&self) -> bool {
        self.as_tensor().is_some()
    }

    /// Elements of a tuple or list
    pub fn items(&self) -> Option<&[Variable]> {
        match self.kind() {
            VariableKind::Tuple(items) | VariableKind::List(items) => Some(items),
            _ => None,
        }
    }

    /// Tensor produced by a recorded statement
    pub fn is_graph_output(&self) -> bool {
        self.is_tensor() && matches!(self.tracker(), Tracker::DerivedCall { .. })
    }

    /// The concrete guest value, when nothing about it is symbolic
    pub fn to_value(&self) -> Option<Value> {
        Some(match self.kind() {
            VariableKind::Constant(v) | VariableKind::Object(v) => v.clone(),
            VariableKind::Slice(s) => Value::Slice(s.clone()),
            VariableKind::Module(m) => Value::Module(m.clone()),
            VariableKind::InterpreterContext(c) => Value::Context(c.clone()),
            VariableKind::Function(f) => Value::Function(f.clone()),
            VariableKind::Builtin(b) => Value::Builtin(*b),
            VariableKind::Tuple(items) => Value::tuple(items.iter().map(Variable::to_value).collect::<Option<_>>()?),
            VariableKind::List(items) => Value::list(items.iter().map(Variable::to_value).collect::<Option<_>>()?),
            VariableKind::Dict(pairs) => Value::Dict(Arc::new(RwLock::new(
                pairs
                    .iter()
                    .map(|(k, v)| Some((k.to_value()?, v.to_value()?)))
                    .collect::<Option<_>>()?,
            ))),
            VariableKind::Tensor(_)
            | VariableKind::Dummy
            | VariableKind::Closure(_)
            | VariableKind::TensorMethod { .. }
            | VariableKind::Iter(_) => return None,
        })
    }

    /// Operand form for a statement, `None` for symbolic values
    pub fn to_const_arg(&self) -> Option<ConstArg> {
        match self.kind() {
            VariableKind::Object(_) => None,
            _ => self.to_value()?.to_const_arg(),
        }
    }

    /// Truth value known at trace time, `None` for tensors
    pub fn truthiness(&self) -> Option<bool> {
        match self.kind() {
            VariableKind::Constant(v) => v.truthy().ok(),
            VariableKind::Tuple(items) | VariableKind::List(items) => Some(!items.is_empty()),
            VariableKind::Dict(pairs) => Some(!pairs.is_empty()),
            VariableKind::Tensor(_) | VariableKind::Dummy => None,
            _ => Some(true),
        }
    }

    /// Guard that holds when the frame still produces this value
    pub fn make_guard(&self) -> TraceResult<GuardExpr> {
        if let Tracker::DerivedCall { .. } = self.tracker() {
            return Err(TraceError::Inner(format!("{} has no frame path to guard", self)));
        }
        if !self.tracker().is_frame_dependent() {
            return Ok(GuardExpr::True);
        }
        let expr = self.tracker().trace_value_from_frame()?;
        Ok(match self.kind() {
            VariableKind::Constant(value) => GuardExpr::ValueEq {
                expr,
                value: value.clone(),
            },
            VariableKind::Slice(slice) => GuardExpr::ValueEq {
                expr,
                value: Value::Slice(slice.clone()),
            },
            VariableKind::Tensor(t) => GuardExpr::MetaEq {
                expr,
                meta: t.meta.clone(),
            },
            VariableKind::InterpreterContext(_) => GuardExpr::True,
            VariableKind::Tuple(items) => GuardExpr::LenEq {
                expr,
                type_name: "tuple",
                len: items.len(),
            },
            VariableKind::List(items) => GuardExpr::LenEq {
                expr,
                type_name: "list",
                len: items.len(),
            },
            VariableKind::Dict(pairs) => GuardExpr::LenEq {
                expr,
                type_name: "dict",
                len: pairs.len(),
            },
            VariableKind::Module(_) | VariableKind::Function(_) | VariableKind::Builtin(_) | VariableKind::Object(_) => {
                let value = self
                    .to_value()
                    .ok_or_else(|| TraceError::Inner(format!("{} has no host value", self)))?;
                GuardExpr::Identity { expr, value }
            }
            VariableKind::Dummy
            | VariableKind::Closure(_)
            | VariableKind::TensorMethod { .. }
            | VariableKind::Iter(_) => {
                return Err(TraceError::Inner(format!("cannot guard {}", self)));
            }
        })
    }

    /// Frame-dependent variables this value was derived from
    pub fn collect_guard_leaves(&self, out: &mut Vec<Variable>) {
        if self.tracker().is_frame_dependent() {
            if !out.iter().any(|v| v.same(self)) {
                out.push(self.clone());
            }
            return;
        }
        for input in self.tracker().inputs() {
            input.collect_guard_leaves(out);
        }
    }

    /// Graph outputs needed to reconstruct this value
    pub fn collect_derived_tensors(&self, out: &mut Vec<Variable>) {
        if self.is_graph_output() {
            if !out.iter().any(|v| v.same(self)) {
                out.push(self.clone());
            }
            return;
        }
        if self.tracker().is_traceable() {
            return;
        }
        match self.kind() {
            VariableKind::Tuple(items) | VariableKind::List(items) => {
                items.iter().for_each(|item| item.collect_derived_tensors(out));
            }
            VariableKind::Dict(pairs) => {
                for (key, value) in pairs {
                    key.collect_derived_tensors(out);
                    value.collect_derived_tensors(out);
                }
            }
            VariableKind::TensorMethod { receiver, .. } => receiver.collect_derived_tensors(out),
            VariableKind::Iter(iter) => iter.source.collect_derived_tensors(out),
            _ => {}
        }
    }

    /// Emit instructions that leave this value on top of the stack
    pub fn reconstruct(&self, codegen: &mut CodeGen) -> TraceResult<()> {
        if let VariableKind::Tensor(t) = self.kind() {
            if self.is_graph_output() {
                codegen.gen_load_fast(&out_var_name(&t.symbol));
                return Ok(());
            }
        }
        if self.tracker().is_traceable() {
            return self.tracker().gen_instructions(codegen);
        }
        match self.kind() {
            VariableKind::Constant(value) => {
                codegen.gen_load_const(value.clone());
            }
            VariableKind::Slice(slice) => {
                codegen.gen_load_const(slice.start.clone());
                codegen.gen_load_const(slice.stop.clone());
                codegen.gen_load_const(slice.step.clone());
                codegen.gen_build_slice(3);
            }
            VariableKind::Tuple(items) => {
                for item in items {
                    item.reconstruct(codegen)?;
                }
                codegen.gen_build_tuple(items.len() as u32);
            }
            VariableKind::List(items) => {
                for item in items {
                    item.reconstruct(codegen)?;
                }
                codegen.gen_build_list(items.len() as u32);
            }
            VariableKind::Dict(pairs) => {
                for (key, value) in pairs {
                    key.reconstruct(codegen)?;
                    value.reconstruct(codegen)?;
                }
                codegen.gen_build_map(pairs.len() as u32);
            }
            VariableKind::Dummy => {
                codegen.gen_push_null();
            }
            VariableKind::Closure(name) => {
                codegen.gen_load_closure(name);
            }
            VariableKind::TensorMethod { receiver, op } => {
                receiver.reconstruct(codegen)?;
                codegen.gen_load_attr(op.name());
            }
            VariableKind::Iter(iter) => iter.reconstruct_remaining(codegen)?,
            VariableKind::Module(_)
            | VariableKind::InterpreterContext(_)
            | VariableKind::Function(_)
            | VariableKind::Builtin(_)
            | VariableKind::Object(_) => {
                let value = self
                    .to_value()
                    .ok_or_else(|| TraceError::Inner(format!("{} has no host value", self)))?;
                codegen.gen_load_const(value);
            }
            VariableKind::Tensor(_) => {
                return Err(TraceError::Inner(format!("{} cannot be reconstructed", self)));
            }
        }
        Ok(())
    }
}

impl IterVar {
    pub fn remaining(&self) -> usize {
        self.len.saturating_sub(self.pos)
    }

    /// An iterator over the elements not yet consumed
    pub fn reconstruct_remaining(&self, codegen: &mut CodeGen) -> TraceResult<()> {
        match self.source.kind() {
            VariableKind::Constant(Value::Range(range)) => {
                let start = range.start + self.pos as i64 * range.step;
                codegen.gen_load_const(Value::Range(RangeValue { start, ..*range }));
            }
            VariableKind::Tuple(items) | VariableKind::List(items) => {
                let rest = items.get(self.pos..).unwrap_or_default();
                for item in rest {
                    item.reconstruct(codegen)?;
                }
                codegen.gen_build_tuple(rest.len() as u32);
            }
            VariableKind::Dict(pairs) => {
                let rest = pairs.get(self.pos..).unwrap_or_default();
                for (key, _) in rest {
                    key.reconstruct(codegen)?;
                }
                codegen.gen_build_tuple(rest.len() as u32);
            }
            VariableKind::Tensor(_) => {
                self.source.reconstruct(codegen)?;
                codegen.gen_load_const(Value::Int(self.pos as i64));
                codegen.gen_load_const(Value::None);
                codegen.gen_build_slice(2);
                codegen.gen_subscribe();
            }
            _ => {
                return Err(TraceError::Inner(format!(
                    "cannot resume iteration over {}",
                    self.source
                )))
            }
        }
        codegen.gen_get_iter();
        Ok(())
    }

    /// Emit the `index`-th element of the source
    pub fn reconstruct_element(&self, index: usize, codegen: &mut CodeGen) -> TraceResult<()> {
        let out_of_range = || TraceError::Inner(format!("element {} of {} out of range", index, self.source));
        match self.source.kind() {
            VariableKind::Constant(Value::Range(range)) => {
                let item = range.get(index).ok_or_else(out_of_range)?;
                codegen.gen_load_const(Value::Int(item));
            }
            VariableKind::Tuple(items) | VariableKind::List(items) => {
                items.get(index).ok_or_else(out_of_range)?.reconstruct(codegen)?;
            }
            VariableKind::Dict(pairs) => {
                pairs.get(index).ok_or_else(out_of_range)?.0.reconstruct(codegen)?;
            }
            VariableKind::Tensor(_) => {
                self.source.reconstruct(codegen)?;
                codegen.gen_load_const(Value::Int(index as i64));
                codegen.gen_subscribe();
            }
            _ => {
                return Err(TraceError::Inner(format!(
                    "cannot index iteration over {}",
                    self.source
                )))
            }
        }
        Ok(())
    }
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            VariableKind::Tensor(t) => write!(f, "{}({}: {})", self.kind().name(), t.symbol, t.meta),
            VariableKind::Constant(v) | VariableKind::Object(v) => write!(f, "{}({})", self.kind().name(), v.repr()),
            VariableKind::Tuple(items) | VariableKind::List(items) => {
                write!(f, "{}([{}])", self.kind().name(), items.iter().join(", "))
            }
            VariableKind::Builtin(b) => write!(f, "{}({})", self.kind().name(), b.name()),
            VariableKind::Function(func) => write!(f, "{}({})", self.kind().name(), func.name),
            VariableKind::TensorMethod { op, .. } => write!(f, "{}({})", self.kind().name(), op.name()),
            VariableKind::Closure(name) => write!(f, "{}({})", self.kind().name(), name),
            VariableKind::Iter(iter) => write!(f, "{}({}/{})", self.kind().name(), iter.pos, iter.len),
            _ => f.write_str(self.kind().name()),
        }
    }
}

impl fmt::Debug for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} #{} {:?}", self, self.id(), self.tracker())
    }
}

// === Classification ===

type Recognizer = fn(&Value, &mut FunctionGraph, &Tracker) -> TraceResult<Option<VariableKind>>;

/// Recognizers in priority order; the first match wins
const RECOGNIZERS: &[(&str, Recognizer)] = &[
    ("constant", recognize_constant),
    ("tensor", recognize_tensor),
    ("slice", recognize_slice),
    ("module", recognize_module),
    ("interpreter_context", recognize_context),
    ("container", recognize_container),
    ("callable", recognize_callable),
    ("object", recognize_object),
];

/// Builds variables for concrete guest values
pub struct VariableFactory;

impl VariableFactory {
    pub fn recognizer_names() -> impl Iterator<Item = &'static str> {
        RECOGNIZERS.iter().map(|(name, _)| *name)
    }

    /// Classify `value` loaded through `tracker`.
    ///
    /// Frame-dependent loads are memoized per frame path and recorded as
    /// graph frame inputs, so repeated loads share one variable and one
    /// guard.
    pub fn from_value(value: &Value, graph: &mut FunctionGraph, tracker: Tracker) -> TraceResult<Variable> {
        let key = if tracker.is_frame_dependent() {
            let key = tracker.trace_value_from_frame()?.to_string();
            if let Some(existing) = graph.tracked(&key) {
                return Ok(existing);
            }
            Some(key)
        } else {
            None
        };
        let kind = Self::classify(value, graph, &tracker)?;
        let variable = Variable::new(kind, tracker);
        if let Some(key) = key {
            graph.register_frame_input(key, variable.clone());
        }
        Ok(variable)
    }

    fn classify(value: &Value, graph: &mut FunctionGraph, tracker: &Tracker) -> TraceResult<VariableKind> {
        for (name, recognize) in RECOGNIZERS {
            if let Some(kind) = recognize(value, graph, tracker)? {
                trace!(target: "symtrace::executor", recognizer = *name, value = %value.repr(), "Classified value");
                return Ok(kind);
            }
        }
        Err(TraceError::Inner(format!("no variable kind for {}", value.repr())))
    }
}

fn recognize_constant(value: &Value, _: &mut FunctionGraph, _: &Tracker) -> TraceResult<Option<VariableKind>> {
    Ok(match value {
        Value::None
        | Value::Bool(_)
        | Value::Int(_)
        | Value::Float(_)
        | Value::Str(_)
        | Value::Range(_)
        | Value::Code(_) => Some(VariableKind::Constant(value.clone())),
        _ => None,
    })
}

fn recognize_tensor(value: &Value, graph: &mut FunctionGraph, _: &Tracker) -> TraceResult<Option<VariableKind>> {
    Ok(match value {
        Value::Tensor(t) => Some(VariableKind::Tensor(TensorVar {
            meta: t.meta(),
            symbol: graph.alloc_symbol(),
            graph: graph.id(),
        })),
        _ => None,
    })
}

fn recognize_slice(value: &Value, _: &mut FunctionGraph, _: &Tracker) -> TraceResult<Option<VariableKind>> {
    Ok(match value {
        Value::Slice(s) => Some(VariableKind::Slice(s.clone())),
        _ => None,
    })
}

fn recognize_module(value: &Value, _: &mut FunctionGraph, _: &Tracker) -> TraceResult<Option<VariableKind>> {
    Ok(match value {
        Value::Module(m) => Some(VariableKind::Module(m.clone())),
        _ => None,
    })
}

fn recognize_context(value: &Value, _: &mut FunctionGraph, _: &Tracker) -> TraceResult<Option<VariableKind>> {
    Ok(match value {
        Value::Context(c) => Some(VariableKind::InterpreterContext(c.clone())),
        _ => None,
    })
}

fn recognize_container(value: &Value, graph: &mut FunctionGraph, tracker: &Tracker) -> TraceResult<Option<VariableKind>> {
    let elements = |items: &[Value], graph: &mut FunctionGraph| -> TraceResult<Vec<Variable>> {
        items
            .iter()
            .enumerate()
            .map(|(i, item)| {
                let child = Tracker::element(tracker, Value::Int(i as i64), item);
                VariableFactory::from_value(item, graph, child)
            })
            .collect()
    };
    Ok(match value {
        Value::Tuple(items) => Some(VariableKind::Tuple(elements(items, graph)?)),
        Value::List(items) => {
            let snapshot = items.read().clone();
            Some(VariableKind::List(elements(&snapshot, graph)?))
        }
        Value::Dict(items) => {
            let snapshot = items.read().clone();
            let mut pairs = Vec::with_capacity(snapshot.len());
            for (key, item) in &snapshot {
                let key_var = VariableFactory::from_value(key, graph, Tracker::Const(key.clone()))?;
                let child = Tracker::element(tracker, key.clone(), item);
                pairs.push((key_var, VariableFactory::from_value(item, graph, child)?));
            }
            Some(VariableKind::Dict(pairs))
        }
        _ => None,
    })
}

fn recognize_callable(value: &Value, _: &mut FunctionGraph, _: &Tracker) -> TraceResult<Option<VariableKind>> {
    Ok(match value {
        Value::Function(f) => Some(VariableKind::Function(f.clone())),
        Value::Builtin(b) => Some(VariableKind::Builtin(*b)),
        _ => None,
    })
}

fn recognize_object(value: &Value, _: &mut FunctionGraph, _: &Tracker) -> TraceResult<Option<VariableKind>> {
    Ok(Some(VariableKind::Object(value.clone())))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::bytecode::assemble_function;
    use crate::config::JitConfig;
    use crate::executor::guard::FrameView;
    use crate::symbolic::CompileSirCache;
    use crate::tensor::{DType, InferMetaCache, Tensor};
    use crate::vm::{Globals, Object};

    fn graph() -> FunctionGraph {
        FunctionGraph::new(InferMetaCache::global(), Arc::new(CompileSirCache::new()), &JitConfig::default())
    }

    fn classify(value: Value) -> VariableKind {
        let mut graph = graph();
        VariableFactory::from_value(&value, &mut graph, Tracker::Const(Value::None))
            .expect("classifies")
            .kind()
            .clone()
    }

    fn tensor(shape: &[usize], dtype: DType) -> Value {
        let numel = shape.iter().product();
        Value::tensor(Tensor::from_vec(vec![1.0; numel], shape, dtype).expect("tensor"))
    }

    #[test]
    fn test_recognizer_priority() {
        let names: Vec<_> = VariableFactory::recognizer_names().collect();
        assert_eq!(
            names,
            [
                "constant",
                "tensor",
                "slice",
                "module",
                "interpreter_context",
                "container",
                "callable",
                "object"
            ]
        );
    }

    #[test]
    fn test_each_value_lands_in_its_kind() {
        let slice = Value::Slice(Arc::new(SliceValue {
            start: Value::Int(0),
            stop: Value::Int(2),
            step: Value::None,
        }));
        let module = Value::Module(Arc::new(Module::new("m", HashMap::new())));
        let context = Value::Context(Arc::new(ContextHandle { name: "no_grad".into() }));
        let cases = [
            (Value::Int(3), "ConstantVariable"),
            (Value::str("s"), "ConstantVariable"),
            (tensor(&[2], DType::Float32), "TensorVariable"),
            (slice, "SliceVariable"),
            (module, "ModuleVariable"),
            (context, "InterpreterContextVariable"),
            (Value::tuple(vec![Value::Int(1)]), "TupleVariable"),
            (Value::list(vec![]), "ListVariable"),
            (Value::Builtin(Builtin::Print), "BuiltinVariable"),
            (Value::Object(Arc::new(Object::new("Point"))), "ObjectVariable"),
        ];
        for (value, expected) in cases {
            let repr = value.repr();
            assert_eq!(classify(value).name(), expected, "{}", repr);
        }
    }

    #[test]
    fn test_container_elements_are_classified_recursively() {
        let kind = classify(Value::tuple(vec![Value::Int(1), tensor(&[3], DType::Float32)]));
        let VariableKind::Tuple(items) = kind else {
            panic!("expected a tuple");
        };
        assert_eq!(items[0].kind().name(), "ConstantVariable");
        assert!(items[1].is_tensor());
    }

    #[test]
    fn test_guards_follow_the_kind() {
        let function = assemble_function(".args x n\n    LOAD_CONST None\n    RETURN_VALUE\n", &Globals::new())
            .expect("assembles");
        let mut graph = graph();
        let x = VariableFactory::from_value(&tensor(&[2], DType::Float32), &mut graph, Tracker::Local("x".into()))
            .expect("tensor");
        let n = VariableFactory::from_value(&Value::Int(4), &mut graph, Tracker::Local("n".into())).expect("int");

        let guard = GuardExpr::all([x.make_guard().expect("guard"), n.make_guard().expect("guard")]);
        let holds = |args: &[Value]| guard.evaluate(&FrameView::new(&function, args));

        assert!(holds(&[tensor(&[2], DType::Float32), Value::Int(4)]));
        assert!(!holds(&[tensor(&[2], DType::Int64), Value::Int(4)]));
        assert!(!holds(&[tensor(&[3], DType::Float32), Value::Int(4)]));
        assert!(!holds(&[tensor(&[2], DType::Float32), Value::Int(5)]));
    }

    #[test]
    fn test_literals_need_no_guard() {
        let mut graph = graph();
        let one = VariableFactory::from_value(&Value::Int(1), &mut graph, Tracker::Const(Value::Int(1))).expect("int");
        assert!(matches!(one.make_guard(), Ok(GuardExpr::True)));
    }

    #[test]
    fn test_derived_values_cannot_be_guarded() {
        let mut graph = graph();
        let x = VariableFactory::from_value(&tensor(&[2], DType::Float32), &mut graph, Tracker::Local("x".into()))
            .expect("tensor");
        let y = graph.call_tensor_api(TensorOp::Relu, &[x]).expect("records");
        assert!(matches!(y.tracker(), Tracker::DerivedCall { .. }));
        assert!(matches!(y.make_guard(), Err(TraceError::Inner(_))));
    }
}
