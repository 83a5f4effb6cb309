//! Arithmetic, comparison and subscript semantics of guest values.
//!
//! Scalars follow the guest's numeric tower (`bool` < `int` < `float`).
//! Any operation with a tensor operand is routed to the numeric backend
//! through the same [`TensorOp`] the tracer records for it.

use std::sync::Arc;

use crate::bytecode::{CompareOp, Opcode};
use crate::tensor::{execute, OpArg, TensorOp};

use super::types::{VmError, VmResult};
use super::value::Value;

/// Tensor operation performed by a binary or in-place opcode
pub fn binary_tensor_op(opcode: Opcode) -> Option<TensorOp> {
    Some(match opcode {
        Opcode::BinaryAdd | Opcode::InplaceAdd => TensorOp::Add,
        Opcode::BinarySubtract | Opcode::InplaceSubtract => TensorOp::Subtract,
        Opcode::BinaryMultiply | Opcode::InplaceMultiply => TensorOp::Multiply,
        Opcode::BinaryTrueDivide | Opcode::InplaceTrueDivide => TensorOp::Divide,
        Opcode::BinaryFloorDivide | Opcode::InplaceFloorDivide => TensorOp::FloorDivide,
        Opcode::BinaryModulo | Opcode::InplaceModulo => TensorOp::Remainder,
        Opcode::BinaryPower | Opcode::InplacePower => TensorOp::Pow,
        Opcode::BinaryMatrixMultiply | Opcode::InplaceMatrixMultiply => TensorOp::MatMul,
        Opcode::BinarySubscr => TensorOp::GetItem,
        _ => return None,
    })
}

/// Tensor operation performed by a comparison
pub fn compare_tensor_op(op: CompareOp) -> TensorOp {
    match op {
        CompareOp::Lt => TensorOp::LessThan,
        CompareOp::Le => TensorOp::LessEqual,
        CompareOp::Eq => TensorOp::Equal,
        CompareOp::Ne => TensorOp::NotEqual,
        CompareOp::Gt => TensorOp::GreaterThan,
        CompareOp::Ge => TensorOp::GreaterEqual,
    }
}

/// Convert a guest value into a kernel operand
pub fn to_op_arg(value: &Value) -> VmResult<OpArg> {
    match value {
        Value::Tensor(t) => Ok(OpArg::Tensor(t.clone())),
        other => other
            .to_const_arg()
            .map(OpArg::Const)
            .ok_or_else(|| VmError::TypeError(format!("cannot pass {} to a tensor operation", other.type_name()))),
    }
}

/// Run a tensor operation on guest values
pub fn call_tensor_op(op: TensorOp, args: &[Value]) -> VmResult<Value> {
    let args = args.iter().map(to_op_arg).collect::<VmResult<Vec<_>>>()?;
    Ok(Value::Tensor(Arc::new(execute(op, &args)?)))
}

fn type_error(op: &str, a: &Value, b: &Value) -> VmError {
    VmError::TypeError(format!(
        "unsupported operand type(s) for {}: '{}' and '{}'",
        op,
        a.type_name(),
        b.type_name()
    ))
}

fn int_binary(opcode: Opcode, x: i64, y: i64) -> VmResult<Value> {
    let overflow = || VmError::ValueError("integer overflow".into());
    Ok(match binary_tensor_op(opcode) {
        Some(TensorOp::Add) => Value::Int(x.checked_add(y).ok_or_else(overflow)?),
        Some(TensorOp::Subtract) => Value::Int(x.checked_sub(y).ok_or_else(overflow)?),
        Some(TensorOp::Multiply) => Value::Int(x.checked_mul(y).ok_or_else(overflow)?),
        Some(TensorOp::Divide) => {
            if y == 0 {
                return Err(VmError::ZeroDivision);
            }
            Value::Float(x as f64 / y as f64)
        }
        Some(TensorOp::FloorDivide) => {
            if y == 0 {
                return Err(VmError::ZeroDivision);
            }
            Value::Int(x.div_euclid(y) - if y < 0 && x.rem_euclid(y) != 0 { 1 } else { 0 })
        }
        Some(TensorOp::Remainder) => {
            if y == 0 {
                return Err(VmError::ZeroDivision);
            }
            let r = x.rem_euclid(y);
            Value::Int(if y < 0 && r != 0 { r + y } else { r })
        }
        Some(TensorOp::Pow) if y >= 0 => {
            let exp = u32::try_from(y).map_err(|_| overflow())?;
            Value::Int(x.checked_pow(exp).ok_or_else(overflow)?)
        }
        Some(TensorOp::Pow) => Value::Float((x as f64).powf(y as f64)),
        _ => return Err(type_error(opcode.mnemonic(), &Value::Int(x), &Value::Int(y))),
    })
}

fn float_binary(opcode: Opcode, x: f64, y: f64) -> VmResult<Value> {
    Ok(Value::Float(match binary_tensor_op(opcode) {
        Some(TensorOp::Add) => x + y,
        Some(TensorOp::Subtract) => x - y,
        Some(TensorOp::Multiply) => x * y,
        Some(TensorOp::Divide) if y == 0.0 => return Err(VmError::ZeroDivision),
        Some(TensorOp::Divide) => x / y,
        Some(TensorOp::FloorDivide) if y == 0.0 => return Err(VmError::ZeroDivision),
        Some(TensorOp::FloorDivide) => (x / y).floor(),
        Some(TensorOp::Remainder) if y == 0.0 => return Err(VmError::ZeroDivision),
        Some(TensorOp::Remainder) => x - y * (x / y).floor(),
        Some(TensorOp::Pow) => x.powf(y),
        _ => return Err(type_error(opcode.mnemonic(), &Value::Float(x), &Value::Float(y))),
    }))
}

fn concat(a: &[Value], b: &[Value]) -> Vec<Value> {
    a.iter().chain(b.iter()).cloned().collect()
}

/// `a <op> b` for a binary or in-place opcode
pub fn binary_op(opcode: Opcode, a: &Value, b: &Value) -> VmResult<Value> {
    if opcode == Opcode::BinarySubscr {
        return subscript(a, b);
    }
    let op = binary_tensor_op(opcode)
        .ok_or_else(|| VmError::Runtime(format!("{} is not a binary operation", opcode)))?;
    if matches!(a, Value::Tensor(_)) || matches!(b, Value::Tensor(_)) {
        return call_tensor_op(op, &[a.clone(), b.clone()]);
    }
    match (a, b) {
        (Value::Str(x), Value::Str(y)) if op == TensorOp::Add => Ok(Value::str(&format!("{}{}", x, y))),
        (Value::Tuple(x), Value::Tuple(y)) if op == TensorOp::Add => Ok(Value::tuple(concat(x, y))),
        (Value::List(x), Value::List(y)) if op == TensorOp::Add => {
            let joined = concat(&x.read(), &y.read());
            Ok(Value::list(joined))
        }
        _ => match (a.as_int(), b.as_int()) {
            (Some(x), Some(y)) => int_binary(opcode, x, y),
            _ => match (a.as_number(), b.as_number()) {
                (Some(x), Some(y)) => float_binary(opcode, x, y),
                _ => Err(type_error(op.name(), a, b)),
            },
        },
    }
}

/// Unary opcode applied to `a`
pub fn unary_op(opcode: Opcode, a: &Value) -> VmResult<Value> {
    match (opcode, a) {
        (Opcode::UnaryNot, _) => Ok(Value::Bool(!a.truthy()?)),
        (Opcode::UnaryPositive, Value::Tensor(_)) => Ok(a.clone()),
        (Opcode::UnaryNegative, Value::Tensor(_)) => call_tensor_op(TensorOp::Negative, &[a.clone()]),
        (Opcode::UnaryPositive, Value::Bool(b)) => Ok(Value::Int(*b as i64)),
        (Opcode::UnaryPositive, Value::Int(_) | Value::Float(_)) => Ok(a.clone()),
        (Opcode::UnaryNegative, Value::Bool(b)) => Ok(Value::Int(-(*b as i64))),
        (Opcode::UnaryNegative, Value::Int(i)) => i
            .checked_neg()
            .map(Value::Int)
            .ok_or_else(|| VmError::ValueError("integer overflow".into())),
        (Opcode::UnaryNegative, Value::Float(f)) => Ok(Value::Float(-f)),
        (Opcode::UnaryInvert, v) if v.as_int().is_some() => Ok(Value::Int(!v.as_int().unwrap_or_default())),
        _ => Err(VmError::TypeError(format!(
            "bad operand type for {}: '{}'",
            opcode,
            a.type_name()
        ))),
    }
}

/// `a <op> b` for `COMPARE_OP`
pub fn compare(op: CompareOp, a: &Value, b: &Value) -> VmResult<Value> {
    if matches!(a, Value::Tensor(_)) || matches!(b, Value::Tensor(_)) {
        return call_tensor_op(compare_tensor_op(op), &[a.clone(), b.clone()]);
    }
    let ordering = match (a, b) {
        (Value::Str(x), Value::Str(y)) => Some(x.cmp(y)),
        _ => match (a.as_number(), b.as_number()) {
            (Some(x), Some(y)) => x.partial_cmp(&y),
            _ => None,
        },
    };
    let result = match (op, ordering) {
        (CompareOp::Eq, _) => a.py_eq(b),
        (CompareOp::Ne, _) => !a.py_eq(b),
        (CompareOp::Lt, Some(o)) => o.is_lt(),
        (CompareOp::Le, Some(o)) => o.is_le(),
        (CompareOp::Gt, Some(o)) => o.is_gt(),
        (CompareOp::Ge, Some(o)) => o.is_ge(),
        (_, None) => {
            return Err(VmError::TypeError(format!(
                "'{}' not supported between '{}' and '{}'",
                op.symbol(),
                a.type_name(),
                b.type_name()
            )))
        }
    };
    Ok(Value::Bool(result))
}

fn normalize_index(index: i64, len: usize) -> VmResult<usize> {
    let resolved = if index < 0 { index + len as i64 } else { index };
    if resolved < 0 || resolved >= len as i64 {
        return Err(VmError::IndexOutOfBounds { index, len });
    }
    Ok(resolved as usize)
}

fn slice_items(items: &[Value], slice: &super::value::SliceValue) -> VmResult<Vec<Value>> {
    let part = |v: &Value| match v {
        Value::None => Ok(None),
        other => other
            .as_int()
            .map(Some)
            .ok_or_else(|| VmError::TypeError("slice indices must be integers".into())),
    };
    let (start, stop, step) = (part(&slice.start)?, part(&slice.stop)?, part(&slice.step)?);
    let (start, step, len) = crate::tensor::oracle::resolve_slice(items.len() as i64, start, stop, step)
        .map_err(VmError::Tensor)?;
    Ok((0..len)
        .map(|i| items[(start + i * step) as usize].clone())
        .collect())
}

/// `container[index]`
pub fn subscript(container: &Value, index: &Value) -> VmResult<Value> {
    match (container, index) {
        (Value::Tensor(_), _) => call_tensor_op(TensorOp::GetItem, &[container.clone(), index.clone()]),
        (Value::Tuple(items), Value::Slice(s)) => Ok(Value::tuple(slice_items(items, s)?)),
        (Value::List(items), Value::Slice(s)) => Ok(Value::list(slice_items(&items.read(), s)?)),
        (Value::Tuple(items), i) if i.as_int().is_some() => {
            let at = normalize_index(i.as_int().unwrap_or_default(), items.len())?;
            Ok(items[at].clone())
        }
        (Value::List(items), i) if i.as_int().is_some() => {
            let items = items.read();
            let at = normalize_index(i.as_int().unwrap_or_default(), items.len())?;
            Ok(items[at].clone())
        }
        (Value::Range(range), i) if i.as_int().is_some() => {
            let at = normalize_index(i.as_int().unwrap_or_default(), range.len())?;
            range
                .get(at)
                .map(Value::Int)
                .ok_or(VmError::IndexOutOfBounds { index: at as i64, len: range.len() })
        }
        (Value::Dict(items), key) => items
            .read()
            .iter()
            .find(|(k, _)| k.py_eq(key))
            .map(|(_, v)| v.clone())
            .ok_or_else(|| VmError::ValueError(format!("key {} not found", key.repr()))),
        _ => Err(VmError::TypeError(format!(
            "'{}' object is not subscriptable with '{}'",
            container.type_name(),
            index.type_name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Tensor;

    #[test]
    fn test_integer_semantics() {
        assert!(matches!(binary_op(Opcode::BinaryFloorDivide, &Value::Int(-7), &Value::Int(2)), Ok(Value::Int(-4))));
        assert!(matches!(binary_op(Opcode::BinaryModulo, &Value::Int(-7), &Value::Int(2)), Ok(Value::Int(1))));
        assert!(matches!(binary_op(Opcode::BinaryModulo, &Value::Int(7), &Value::Int(-2)), Ok(Value::Int(-1))));
        assert!(matches!(binary_op(Opcode::BinaryTrueDivide, &Value::Int(1), &Value::Int(2)), Ok(Value::Float(f)) if f == 0.5));
        assert!(matches!(binary_op(Opcode::BinaryPower, &Value::Int(2), &Value::Int(10)), Ok(Value::Int(1024))));
        assert_eq!(binary_op(Opcode::BinaryFloorDivide, &Value::Int(1), &Value::Int(0)).err(), Some(VmError::ZeroDivision));
    }

    #[test]
    fn test_bool_participates_as_int() {
        assert!(matches!(binary_op(Opcode::BinaryAdd, &Value::Bool(true), &Value::Int(1)), Ok(Value::Int(2))));
        assert!(matches!(compare(CompareOp::Eq, &Value::Bool(true), &Value::Int(1)), Ok(Value::Bool(true))));
    }

    #[test]
    fn test_tensor_operands_dispatch_to_kernels() {
        let x = Value::tensor(Tensor::ones(&[2]));
        let y = binary_op(Opcode::InplaceAdd, &x, &Value::Int(1)).expect("tensor add");
        let t = y.as_tensor().expect("tensor result");
        assert_eq!(t.data(), &[2.0, 2.0]);

        let mask = compare(CompareOp::Gt, &y, &Value::Float(1.5)).expect("tensor compare");
        assert_eq!(mask.as_tensor().map(|t| t.dtype()), Some(crate::tensor::DType::Bool));
    }

    #[test]
    fn test_subscript_sequences() {
        let items = Value::tuple(vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
        assert!(matches!(subscript(&items, &Value::Int(-1)), Ok(Value::Int(3))));
        assert!(matches!(
            subscript(&items, &Value::Int(3)),
            Err(VmError::IndexOutOfBounds { index: 3, len: 3 })
        ));
        let slice = Value::Slice(Arc::new(crate::vm::value::SliceValue {
            start: Value::Int(1),
            stop: Value::None,
            step: Value::None,
        }));
        let tail = subscript(&items, &slice).expect("slice");
        assert_eq!(tail.repr(), "(2, 3)");
    }

    #[test]
    fn test_unsupported_operands() {
        let err = binary_op(Opcode::BinaryAdd, &Value::None, &Value::Int(1)).expect_err("None + 1");
        assert!(err.to_string().contains("NoneType"));
    }
}
