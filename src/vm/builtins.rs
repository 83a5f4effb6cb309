//! Builtin functions, attribute lookup and the module registry.

use std::collections::HashMap;
use std::sync::Arc;

use itertools::Itertools;
use parking_lot::{Mutex, RwLock};

use crate::tensor::{DType, Tensor, TensorOp};

use super::arithmetic::call_tensor_op;
use super::types::{VmError, VmResult};
use super::value::{BoundMethod, Builtin, ContextHandle, IterState, Module, RangeValue, Value};

/// Modules importable by guest code
#[derive(Debug)]
pub struct ModuleRegistry {
    modules: RwLock<HashMap<String, Arc<Module>>>,
}

impl ModuleRegistry {
    /// Registry with the `tensor` module
    pub fn with_stdlib() -> Self {
        let registry = Self {
            modules: RwLock::new(HashMap::new()),
        };
        registry.register(tensor_module());
        registry
    }

    pub fn register(&self, module: Module) {
        self.modules.write().insert(module.name.clone(), Arc::new(module));
    }

    pub fn get(&self, name: &str) -> Option<Arc<Module>> {
        self.modules.read().get(name).cloned()
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::with_stdlib()
    }
}

/// The `tensor` module: API functions, `to_tensor`, and the `context` handle
pub fn tensor_module() -> Module {
    let mut attrs: HashMap<String, Value> = TensorOp::api_ops()
        .map(|op| (op.name().to_string(), Value::Builtin(Builtin::TensorApi(op))))
        .collect();
    attrs.insert("to_tensor".into(), Value::Builtin(Builtin::ToTensor));
    attrs.insert(
        "context".into(),
        Value::Context(Arc::new(ContextHandle {
            name: "tensor.context".into(),
        })),
    );
    Module::new("tensor", attrs)
}

/// Guest `str()` of a value: strings print without quotes
pub fn display(value: &Value) -> String {
    match value {
        Value::Str(s) => s.to_string(),
        other => other.repr(),
    }
}

fn expect_args(name: &str, args: &[Value], range: std::ops::RangeInclusive<usize>) -> VmResult<()> {
    if range.contains(&args.len()) {
        Ok(())
    } else {
        Err(VmError::TypeError(format!(
            "{}() takes {} to {} arguments but {} were given",
            name,
            range.start(),
            range.end(),
            args.len()
        )))
    }
}

fn int_arg(name: &str, value: &Value) -> VmResult<i64> {
    value
        .as_int()
        .ok_or_else(|| VmError::TypeError(format!("{}() expects integers, got '{}'", name, value.type_name())))
}

/// Length of a sized value
pub fn len_of(value: &Value) -> VmResult<usize> {
    Ok(match value {
        Value::Str(s) => s.chars().count(),
        Value::Tuple(items) => items.len(),
        Value::List(items) => items.read().len(),
        Value::Dict(items) => items.read().len(),
        Value::Range(r) => r.len(),
        Value::Tensor(t) => t
            .shape()
            .first()
            .copied()
            .ok_or_else(|| VmError::TypeError("len() of a 0-d tensor".into()))?,
        other => return Err(VmError::TypeError(format!("object of type '{}' has no len()", other.type_name()))),
    })
}

fn nested_to_tensor(value: &Value) -> VmResult<Tensor> {
    fn walk(value: &Value, depth: usize, shape: &mut Vec<usize>, data: &mut Vec<f64>, dtype: &mut DType) -> VmResult<()> {
        let items: Vec<Value> = match value {
            Value::Tuple(items) => items.as_ref().clone(),
            Value::List(items) => items.read().clone(),
            Value::Bool(b) => {
                data.push(*b as i64 as f64);
                return Ok(());
            }
            Value::Int(i) => {
                *dtype = dtype.promote(DType::Int64);
                data.push(*i as f64);
                return Ok(());
            }
            Value::Float(f) => {
                *dtype = DType::Float32;
                data.push(*f);
                return Ok(());
            }
            other => {
                return Err(VmError::TypeError(format!(
                    "to_tensor() cannot convert '{}'",
                    other.type_name()
                )))
            }
        };
        match shape.get(depth) {
            Some(&len) if len != items.len() => {
                return Err(VmError::ValueError("to_tensor() needs a rectangular nesting".into()))
            }
            Some(_) => {}
            None => shape.push(items.len()),
        }
        for item in &items {
            walk(item, depth + 1, shape, data, dtype)?;
        }
        Ok(())
    }

    let mut shape = Vec::new();
    let mut data = Vec::new();
    let mut dtype = DType::Bool;
    walk(value, 0, &mut shape, &mut data, &mut dtype)?;
    Ok(Tensor::from_vec(data, &shape, dtype)?)
}

/// Invoke a builtin with positional arguments
pub fn call_builtin(builtin: Builtin, args: Vec<Value>, output: &Mutex<Vec<String>>) -> VmResult<Value> {
    let name = builtin.name();
    match builtin {
        Builtin::Range => {
            expect_args(name, &args, 1..=3)?;
            let ints = args.iter().map(|a| int_arg(name, a)).collect::<VmResult<Vec<_>>>()?;
            let (start, stop, step) = match ints.as_slice() {
                [stop] => (0, *stop, 1),
                [start, stop] => (*start, *stop, 1),
                [start, stop, step] => (*start, *stop, *step),
                _ => unreachable!("argument count checked"),
            };
            if step == 0 {
                return Err(VmError::ValueError("range() arg 3 must not be zero".into()));
            }
            Ok(Value::Range(RangeValue { start, stop, step }))
        }
        Builtin::Len => {
            expect_args(name, &args, 1..=1)?;
            Ok(Value::Int(len_of(&args[0])? as i64))
        }
        Builtin::Print => {
            let line = args.iter().map(display).join(" ");
            tracing::debug!(target: "symtrace::vm", line = %line, "print");
            output.lock().push(line);
            Ok(Value::None)
        }
        Builtin::Abs => {
            expect_args(name, &args, 1..=1)?;
            match &args[0] {
                Value::Tensor(_) => call_tensor_op(TensorOp::Abs, &args),
                Value::Float(f) => Ok(Value::Float(f.abs())),
                v => Ok(Value::Int(int_arg(name, v)?.abs())),
            }
        }
        Builtin::Int => {
            expect_args(name, &args, 1..=1)?;
            match &args[0] {
                Value::Float(f) => Ok(Value::Int(f.trunc() as i64)),
                Value::Tensor(t) if t.numel() == 1 => Ok(Value::Int(t.data()[0].trunc() as i64)),
                v => Ok(Value::Int(int_arg(name, v)?)),
            }
        }
        Builtin::Float => {
            expect_args(name, &args, 1..=1)?;
            match &args[0] {
                Value::Tensor(t) if t.numel() == 1 => Ok(Value::Float(t.data()[0])),
                v => v
                    .as_number()
                    .map(Value::Float)
                    .ok_or_else(|| VmError::TypeError(format!("float() cannot convert '{}'", v.type_name()))),
            }
        }
        Builtin::TensorApi(op) => call_tensor_op(op, &args),
        Builtin::ToTensor => {
            expect_args(name, &args, 1..=1)?;
            Ok(Value::tensor(nested_to_tensor(&args[0])?))
        }
    }
}

/// `value.attr`
pub fn get_attr(value: &Value, attr: &str) -> VmResult<Value> {
    let missing = || VmError::AttributeError {
        type_name: value.type_name(),
        attr: attr.to_string(),
    };
    match value {
        Value::Module(module) => module.get(attr).ok_or_else(missing),
        Value::Object(object) => object.get(attr).ok_or_else(missing),
        Value::Tensor(t) => match attr {
            "shape" => Ok(Value::list(t.shape().iter().map(|&d| Value::Int(d as i64)).collect())),
            "dtype" => Ok(Value::str(t.dtype().name())),
            "ndim" => Ok(Value::Int(t.ndim() as i64)),
            "stop_gradient" => Ok(Value::Bool(t.stop_gradient())),
            "size" => Ok(Value::Int(t.numel() as i64)),
            "T" => call_tensor_op(TensorOp::Transpose, std::slice::from_ref(value)),
            _ => TensorOp::from_method_name(attr)
                .map(|op| {
                    Value::BoundMethod(Arc::new(BoundMethod {
                        receiver: value.clone(),
                        op,
                    }))
                })
                .ok_or_else(missing),
        },
        _ => Err(missing()),
    }
}

/// Iterator over a value for `GET_ITER`
pub fn make_iter(value: &Value) -> VmResult<Value> {
    let state = match value {
        Value::Iter(_) => return Ok(value.clone()),
        Value::Tuple(items) => IterState::Seq {
            items: items.as_ref().clone(),
            pos: 0,
        },
        Value::List(items) => IterState::Seq {
            items: items.read().clone(),
            pos: 0,
        },
        Value::Dict(items) => IterState::Seq {
            items: items.read().iter().map(|(k, _)| k.clone()).collect(),
            pos: 0,
        },
        Value::Range(range) => IterState::Range { range: *range, pos: 0 },
        Value::Tensor(t) if t.ndim() > 0 => IterState::Rows {
            tensor: t.clone(),
            pos: 0,
        },
        other => return Err(VmError::TypeError(format!("'{}' object is not iterable", other.type_name()))),
    };
    Ok(Value::Iter(Arc::new(Mutex::new(state))))
}

/// Advance an iterator, `None` when exhausted
pub fn iter_next(iterator: &Value) -> VmResult<Option<Value>> {
    let Value::Iter(state) = iterator else {
        return Err(VmError::TypeError(format!("'{}' object is not an iterator", iterator.type_name())));
    };
    let mut state = state.lock();
    Ok(match &mut *state {
        IterState::Seq { items, pos } => {
            let item = items.get(*pos).cloned();
            *pos += usize::from(item.is_some());
            item
        }
        IterState::Range { range, pos } => {
            let item = range.get(*pos).map(Value::Int);
            *pos += usize::from(item.is_some());
            item
        }
        IterState::Rows { tensor, pos } => {
            if *pos >= tensor.shape()[0] {
                None
            } else {
                let row = call_tensor_op(TensorOp::GetItem, &[Value::Tensor(tensor.clone()), Value::Int(*pos as i64)])?;
                *pos += 1;
                Some(row)
            }
        }
    })
}

/// Elements of a value for `UNPACK_SEQUENCE`
pub fn unpack(value: &Value) -> VmResult<Vec<Value>> {
    let iterator = make_iter(value)?;
    let mut items = Vec::new();
    while let Some(item) = iter_next(&iterator)? {
        items.push(item);
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_builtin() {
        let output = Mutex::new(Vec::new());
        let r = call_builtin(Builtin::Range, vec![Value::Int(1), Value::Int(4)], &output).expect("range");
        assert_eq!(unpack(&r).expect("iterable").len(), 3);
        assert!(call_builtin(Builtin::Range, vec![Value::Int(0), Value::Int(1), Value::Int(0)], &output).is_err());
    }

    #[test]
    fn test_print_collects_output() {
        let output = Mutex::new(Vec::new());
        call_builtin(Builtin::Print, vec![Value::str("x ="), Value::Int(3)], &output).expect("print");
        assert_eq!(output.lock().as_slice(), &["x = 3".to_string()]);
    }

    #[test]
    fn test_to_tensor_infers_dtype() {
        let output = Mutex::new(Vec::new());
        let nested = Value::list(vec![
            Value::list(vec![Value::Int(1), Value::Int(2)]),
            Value::list(vec![Value::Int(3), Value::Float(4.5)]),
        ]);
        let t = call_builtin(Builtin::ToTensor, vec![nested], &output).expect("converts");
        let t = t.as_tensor().expect("tensor");
        assert_eq!(t.shape(), &[2, 2]);
        assert_eq!(t.dtype(), DType::Float32);

        let ragged = Value::list(vec![Value::list(vec![Value::Int(1)]), Value::list(vec![])]);
        assert!(call_builtin(Builtin::ToTensor, vec![ragged], &output).is_err());
    }

    #[test]
    fn test_tensor_attributes() {
        let t = Value::tensor(Tensor::zeros(&[2, 3]));
        assert_eq!(get_attr(&t, "shape").expect("shape").repr(), "[2, 3]");
        assert!(matches!(get_attr(&t, "sum"), Ok(Value::BoundMethod(_))));
        assert!(matches!(get_attr(&t, "nope"), Err(VmError::AttributeError { .. })));
    }

    #[test]
    fn test_tensor_module_exports() {
        let registry = ModuleRegistry::with_stdlib();
        let module = registry.get("tensor").expect("tensor module");
        assert!(matches!(module.get("add"), Some(Value::Builtin(Builtin::TensorApi(TensorOp::Add)))));
        assert!(matches!(module.get("context"), Some(Value::Context(_))));
        assert!(module.get("__getitem__").is_none());
    }

    #[test]
    fn test_iterate_tensor_rows() {
        let t = Value::tensor(Tensor::arange(6));
        let rows = unpack(&t).expect("rows");
        assert_eq!(rows.len(), 6);
    }
}
