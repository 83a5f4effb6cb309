//! Guards over frame values
//!
//! A guard is a predicate over a frame's arguments, globals and closure
//! cells. It is evaluated before a cached translation runs; a translation
//! is reused only when its guard holds.

use std::collections::HashSet;
use std::fmt;

use itertools::Itertools;

use crate::tensor::MetaInfo;
use crate::vm::{arithmetic, builtins, Builtin, Function, Value};

/// The frame a guard is evaluated against
#[derive(Clone, Copy)]
pub struct FrameView<'a> {
    pub function: &'a Function,
    pub args: &'a [Value],
}

impl<'a> FrameView<'a> {
    pub fn new(function: &'a Function, args: &'a [Value]) -> Self {
        Self { function, args }
    }

    /// Parameter value, falling back to the function's defaults
    pub fn local(&self, name: &str) -> Option<Value> {
        let code = &self.function.code;
        let argcount = code.argcount as usize;
        let index = code.varnames.iter().take(argcount).position(|n| n == name)?;
        if let Some(value) = self.args.get(index) {
            return Some(value.clone());
        }
        let defaults = &self.function.defaults;
        let first_default = argcount.checked_sub(defaults.len())?;
        index
            .checked_sub(first_default)
            .and_then(|i| defaults.get(i))
            .cloned()
    }

    pub fn global(&self, name: &str) -> Option<Value> {
        self.function
            .globals
            .get(name)
            .or_else(|| Builtin::lookup(name).map(Value::Builtin))
    }

    /// A builtin that no global shadows
    pub fn builtin(&self, name: &str) -> Option<Value> {
        if self.function.globals.contains(name) {
            return None;
        }
        Builtin::lookup(name).map(Value::Builtin)
    }

    pub fn deref(&self, name: &str) -> Option<Value> {
        self.function.free_cell(name)?.get()
    }
}

/// How to re-derive a value from a frame
#[derive(Clone)]
pub enum FrameExpr {
    Const(Value),
    Local(String),
    Global(String),
    Builtin(String),
    Deref(String),
    Attr(Box<FrameExpr>, String),
    Item(Box<FrameExpr>, Value),
}

impl FrameExpr {
    /// `None` when the path no longer resolves
    pub fn evaluate(&self, frame: &FrameView<'_>) -> Option<Value> {
        match self {
            FrameExpr::Const(value) => Some(value.clone()),
            FrameExpr::Local(name) => frame.local(name),
            FrameExpr::Global(name) => frame.global(name),
            FrameExpr::Builtin(name) => frame.builtin(name),
            FrameExpr::Deref(name) => frame.deref(name),
            FrameExpr::Attr(base, attr) => builtins::get_attr(&base.evaluate(frame)?, attr).ok(),
            FrameExpr::Item(base, key) => arithmetic::subscript(&base.evaluate(frame)?, key).ok(),
        }
    }
}

impl fmt::Display for FrameExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameExpr::Const(value) => write!(f, "{}", value.repr()),
            FrameExpr::Local(name) => f.write_str(name),
            FrameExpr::Global(name) => write!(f, "globals['{}']", name),
            FrameExpr::Builtin(name) => write!(f, "builtins.{}", name),
            FrameExpr::Deref(name) => write!(f, "closure['{}']", name),
            FrameExpr::Attr(base, attr) => write!(f, "{}.{}", base, attr),
            FrameExpr::Item(base, key) => write!(f, "{}[{}]", base, key.repr()),
        }
    }
}

/// Predicate deciding whether a cached translation applies
#[derive(Clone)]
pub enum GuardExpr {
    True,
    /// Tensor with identical shape, dtype and stop_gradient
    MetaEq { expr: FrameExpr, meta: MetaInfo },
    ValueEq { expr: FrameExpr, value: Value },
    /// Same heap object, or same builtin
    Identity { expr: FrameExpr, value: Value },
    LenEq { expr: FrameExpr, type_name: &'static str, len: usize },
    All(Vec<GuardExpr>),
}

impl GuardExpr {
    /// Conjunction with nested conjunctions flattened, `True` dropped and
    /// textual duplicates removed
    pub fn all(guards: impl IntoIterator<Item = GuardExpr>) -> GuardExpr {
        let mut seen = HashSet::new();
        let mut flat = Vec::new();
        let mut pending: Vec<GuardExpr> = guards.into_iter().collect();
        pending.reverse();
        while let Some(guard) = pending.pop() {
            match guard {
                GuardExpr::True => {}
                GuardExpr::All(inner) => pending.extend(inner.into_iter().rev()),
                other => {
                    if seen.insert(other.to_string()) {
                        flat.push(other);
                    }
                }
            }
        }
        match flat.len() {
            0 => GuardExpr::True,
            1 => flat.pop().unwrap_or(GuardExpr::True),
            _ => GuardExpr::All(flat),
        }
    }

    pub fn evaluate(&self, frame: &FrameView<'_>) -> bool {
        match self {
            GuardExpr::True => true,
            GuardExpr::MetaEq { expr, meta } => {
                matches!(expr.evaluate(frame), Some(Value::Tensor(t)) if t.meta() == *meta)
            }
            GuardExpr::ValueEq { expr, value } => expr.evaluate(frame).is_some_and(|v| values_equal(&v, value)),
            GuardExpr::Identity { expr, value } => expr.evaluate(frame).is_some_and(|v| v.same_constant(value)),
            GuardExpr::LenEq { expr, type_name, len } => expr.evaluate(frame).is_some_and(|v| {
                v.type_name() == *type_name && builtins::len_of(&v).is_ok_and(|actual| actual == *len)
            }),
            GuardExpr::All(guards) => guards.iter().all(|g| g.evaluate(frame)),
        }
    }

    /// Number of leaf predicates
    pub fn len(&self) -> usize {
        match self {
            GuardExpr::True => 0,
            GuardExpr::All(guards) => guards.iter().map(GuardExpr::len).sum(),
            _ => 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Guard equality: exact variant and payload, slices compared part-wise
fn values_equal(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::Slice(a), Value::Slice(b)) => {
            a.start.strict_eq(&b.start) && a.stop.strict_eq(&b.stop) && a.step.strict_eq(&b.step)
        }
        _ => actual.strict_eq(expected),
    }
}

impl fmt::Display for GuardExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuardExpr::True => f.write_str("True"),
            GuardExpr::MetaEq { expr, meta } => write!(f, "MetaInfo({}) == '{}'", expr, meta),
            GuardExpr::ValueEq { expr, value } => write!(f, "{} == {}", expr, value.repr()),
            GuardExpr::Identity { expr, value } => write!(f, "id({}) == id({})", expr, value.repr()),
            GuardExpr::LenEq { expr, type_name, len } => {
                write!(f, "isinstance({}, {}) and len({}) == {}", expr, type_name, expr, len)
            }
            GuardExpr::All(guards) => write!(f, "{}", guards.iter().join(" and ")),
        }
    }
}

impl fmt::Debug for GuardExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Guard({})", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::bytecode::assemble;
    use crate::tensor::Tensor;
    use crate::vm::{Cell, Globals};

    fn two_param_function(defaults: Vec<Value>) -> Function {
        let code = assemble(".code f\n.args x y\n    LOAD_FAST x\n    RETURN_VALUE\n").expect("assembles");
        let mut function = Function::new(code, Globals::new());
        function.defaults = defaults;
        function
    }

    fn tensor(shape: &[usize]) -> Value {
        Value::tensor(Tensor::zeros(shape))
    }

    #[test]
    fn test_meta_guard_tracks_shape() {
        let function = two_param_function(vec![]);
        let arg = tensor(&[2, 3]);
        let Value::Tensor(t) = &arg else { unreachable!() };
        let guard = GuardExpr::MetaEq {
            expr: FrameExpr::Local("x".into()),
            meta: t.meta(),
        };
        let same = [tensor(&[2, 3]), Value::None];
        let other = [tensor(&[4, 3]), Value::None];
        assert!(guard.evaluate(&FrameView::new(&function, &same)));
        assert!(!guard.evaluate(&FrameView::new(&function, &other)));
        assert!(!guard.evaluate(&FrameView::new(&function, &[Value::Int(1), Value::None])));
    }

    #[test]
    fn test_value_guard_is_strict() {
        let function = two_param_function(vec![]);
        let guard = GuardExpr::ValueEq {
            expr: FrameExpr::Local("y".into()),
            value: Value::Int(1),
        };
        assert!(guard.evaluate(&FrameView::new(&function, &[Value::None, Value::Int(1)])));
        assert!(!guard.evaluate(&FrameView::new(&function, &[Value::None, Value::Bool(true)])));
        assert!(!guard.evaluate(&FrameView::new(&function, &[Value::None, Value::Float(1.0)])));
    }

    #[test]
    fn test_local_falls_back_to_defaults() {
        let function = two_param_function(vec![Value::Int(7)]);
        let view_args = [Value::None];
        let view = FrameView::new(&function, &view_args);
        assert!(view.local("y").is_some_and(|v| v.strict_eq(&Value::Int(7))));
        assert!(view.local("z").is_none());
    }

    #[test]
    fn test_builtin_shadowed_by_global() {
        let function = two_param_function(vec![]);
        let guard = GuardExpr::Identity {
            expr: FrameExpr::Builtin("len".into()),
            value: Value::Builtin(Builtin::Len),
        };
        let args = [Value::None, Value::None];
        assert!(guard.evaluate(&FrameView::new(&function, &args)));
        function.globals.insert("len", Value::Int(3));
        assert!(!guard.evaluate(&FrameView::new(&function, &args)));
    }

    #[test]
    fn test_deref_reads_closure_cell() {
        let code = assemble(".code inner\n.freevars k\n    LOAD_DEREF k\n    RETURN_VALUE\n").expect("assembles");
        let cell = Arc::new(Cell::new(Some(Value::Int(2))));
        let function = Function::with_closure(code, Globals::new(), vec![cell.clone()]);
        let guard = GuardExpr::ValueEq {
            expr: FrameExpr::Deref("k".into()),
            value: Value::Int(2),
        };
        assert!(guard.evaluate(&FrameView::new(&function, &[])));
        cell.set(Value::Int(3));
        assert!(!guard.evaluate(&FrameView::new(&function, &[])));
    }

    #[test]
    fn test_len_guard_and_items() {
        let function = two_param_function(vec![]);
        let guard = GuardExpr::all([
            GuardExpr::LenEq {
                expr: FrameExpr::Local("x".into()),
                type_name: "tuple",
                len: 2,
            },
            GuardExpr::ValueEq {
                expr: FrameExpr::Item(Box::new(FrameExpr::Local("x".into())), Value::Int(0)),
                value: Value::Int(5),
            },
        ]);
        let ok = [Value::tuple(vec![Value::Int(5), Value::Int(6)]), Value::None];
        let short = [Value::tuple(vec![Value::Int(5)]), Value::None];
        let list = [Value::list(vec![Value::Int(5), Value::Int(6)]), Value::None];
        assert!(guard.evaluate(&FrameView::new(&function, &ok)));
        assert!(!guard.evaluate(&FrameView::new(&function, &short)));
        assert!(!guard.evaluate(&FrameView::new(&function, &list)));
    }

    #[test]
    fn test_all_flattens_and_dedups() {
        let leaf = || GuardExpr::ValueEq {
            expr: FrameExpr::Local("y".into()),
            value: Value::Int(1),
        };
        assert!(matches!(GuardExpr::all([]), GuardExpr::True));
        assert!(matches!(GuardExpr::all([GuardExpr::True, leaf()]), GuardExpr::ValueEq { .. }));
        let nested = GuardExpr::all([leaf(), GuardExpr::All(vec![leaf(), GuardExpr::True])]);
        assert_eq!(nested.len(), 1);
        assert_eq!(nested.to_string(), "y == 1");
    }
}
