//! Operator semantics shared by the VM, the interpreter and the constant folder.
//!
//! Int and Float mix by promoting to Float. Integer arithmetic wraps.

use crate::ast::{BinOp, UnaryOp};
use crate::value::Value;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum OpError {
    #[error("cannot apply '{op}' to {left} and {right}")]
    TypeMismatch { op: &'static str, left: &'static str, right: &'static str },
    #[error("cannot apply '{op}' to {operand}")]
    UnaryMismatch { op: &'static str, operand: &'static str },
    #[error("division by zero")]
    DivisionByZero,
    #[error("index {index} out of bounds for length {len}")]
    IndexOutOfBounds { index: i64, len: usize },
    #[error("no field '{field}'")]
    FieldNotFound { field: String },
}

type Result<T> = std::result::Result<T, OpError>;

fn mismatch(op: BinOp, a: &Value, b: &Value) -> OpError {
    OpError::TypeMismatch { op: op.symbol(), left: a.type_name(), right: b.type_name() }
}

/// Numeric `+ - * / %`. Strings and other non-numbers are a type mismatch.
pub fn arith(op: BinOp, a: &Value, b: &Value) -> Result<Value> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => {
            let (x, y) = (*x, *y);
            Ok(Value::Int(match op {
                BinOp::Add => x.wrapping_add(y),
                BinOp::Sub => x.wrapping_sub(y),
                BinOp::Mul => x.wrapping_mul(y),
                BinOp::Div if y == 0 => return Err(OpError::DivisionByZero),
                BinOp::Div => x.wrapping_div(y),
                BinOp::Mod if y == 0 => return Err(OpError::DivisionByZero),
                BinOp::Mod => x.wrapping_rem(y),
                _ => return Err(mismatch(op, a, b)),
            }))
        }
        _ => {
            let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) else {
                return Err(mismatch(op, a, b));
            };
            Ok(Value::Float(match op {
                BinOp::Add => x + y,
                BinOp::Sub => x - y,
                BinOp::Mul => x * y,
                BinOp::Div if y == 0.0 => return Err(OpError::DivisionByZero),
                BinOp::Div => x / y,
                BinOp::Mod if y == 0.0 => return Err(OpError::DivisionByZero),
                BinOp::Mod => x % y,
                _ => return Err(mismatch(op, a, b)),
            }))
        }
    }
}

/// Dynamic `+`: two strings concatenate, two arrays join, numbers add.
/// Anything else, including a string with a non-string, is a type mismatch.
pub fn plus(a: &Value, b: &Value) -> Result<Value> {
    match (a, b) {
        (Value::Str(x), Value::Str(y)) => Ok(Value::Str(format!("{}{}", x, y))),
        (Value::Array(x), Value::Array(y)) => Ok(Value::Array(x.iter().chain(y).cloned().collect())),
        _ => arith(BinOp::Add, a, b),
    }
}

/// `< > <= >=` on two numbers or two strings.
pub fn compare(op: BinOp, a: &Value, b: &Value) -> Result<Value> {
    let ordering = match (a, b) {
        (Value::Int(x), Value::Int(y)) => x.cmp(y),
        (Value::Str(x), Value::Str(y)) => x.cmp(y),
        _ => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => match x.partial_cmp(&y) {
                Some(o) => o,
                None => return Ok(Value::Bool(false)),
            },
            _ => return Err(mismatch(op, a, b)),
        },
    };
    Ok(Value::Bool(match op {
        BinOp::Lt => ordering.is_lt(),
        BinOp::Gt => ordering.is_gt(),
        BinOp::Le => ordering.is_le(),
        BinOp::Ge => ordering.is_ge(),
        _ => return Err(mismatch(op, a, b)),
    }))
}

/// `&&` and `||`. Both operands are always evaluated and must be Bool.
pub fn logic(op: BinOp, a: &Value, b: &Value) -> Result<Value> {
    match (a, b, op) {
        (Value::Bool(x), Value::Bool(y), BinOp::And) => Ok(Value::Bool(*x && *y)),
        (Value::Bool(x), Value::Bool(y), BinOp::Or) => Ok(Value::Bool(*x || *y)),
        _ => Err(mismatch(op, a, b)),
    }
}

pub fn binary(op: BinOp, a: &Value, b: &Value) -> Result<Value> {
    match op {
        BinOp::Add => plus(a, b),
        BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Mod => arith(op, a, b),
        BinOp::Eq => Ok(Value::Bool(a.loose_eq(b))),
        BinOp::Ne => Ok(Value::Bool(!a.loose_eq(b))),
        BinOp::Lt | BinOp::Gt | BinOp::Le | BinOp::Ge => compare(op, a, b),
        BinOp::And | BinOp::Or => logic(op, a, b),
    }
}

pub fn unary(op: UnaryOp, v: &Value) -> Result<Value> {
    match (op, v) {
        (UnaryOp::Not, Value::Bool(b)) => Ok(Value::Bool(!b)),
        (UnaryOp::Neg, Value::Int(n)) => Ok(Value::Int(n.wrapping_neg())),
        (UnaryOp::Neg, Value::Float(x)) => Ok(Value::Float(-x)),
        (UnaryOp::Not, other) => Err(OpError::UnaryMismatch { op: "!", operand: other.type_name() }),
        (UnaryOp::Neg, other) => Err(OpError::UnaryMismatch { op: "-", operand: other.type_name() }),
    }
}

/// `obj.field`
pub fn field(obj: &Value, name: &str) -> Result<Value> {
    match obj {
        Value::Object(fields) => fields
            .get(name)
            .cloned()
            .ok_or_else(|| OpError::FieldNotFound { field: name.to_string() }),
        other => Err(OpError::UnaryMismatch { op: ".", operand: other.type_name() }),
    }
}

/// `arr[i]` with an Int index, `obj[key]` with a Str key.
pub fn index(container: &Value, idx: &Value) -> Result<Value> {
    match (container, idx) {
        (Value::Array(items), Value::Int(i)) => usize::try_from(*i)
            .ok()
            .and_then(|u| items.get(u))
            .cloned()
            .ok_or(OpError::IndexOutOfBounds { index: *i, len: items.len() }),
        (Value::Object(_), Value::Str(key)) => field(container, key),
        (Value::Str(s), Value::Int(i)) => usize::try_from(*i)
            .ok()
            .and_then(|u| s.chars().nth(u))
            .map(|c| Value::Str(c.to_string()))
            .ok_or(OpError::IndexOutOfBounds { index: *i, len: s.chars().count() }),
        _ => Err(OpError::TypeMismatch { op: "[]", left: container.type_name(), right: idx.type_name() }),
    }
}

/// Condition of `if`, `while` and conditional jumps.
pub fn truth(v: &Value) -> Result<bool> {
    v.as_bool().ok_or(OpError::UnaryMismatch { op: "condition", operand: v.type_name() })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_float_promotion() {
        assert_eq!(arith(BinOp::Add, &Value::Int(1), &Value::Float(0.5)).unwrap(), Value::Float(1.5));
        assert_eq!(arith(BinOp::Div, &Value::Int(7), &Value::Int(2)).unwrap(), Value::Int(3));
    }

    #[test]
    fn arith_rejects_strings() {
        let err = arith(BinOp::Add, &Value::str("a"), &Value::Int(1)).unwrap_err();
        assert_eq!(err, OpError::TypeMismatch { op: "+", left: "string", right: "int" });
    }

    #[test]
    fn division_by_zero() {
        assert_eq!(arith(BinOp::Div, &Value::Int(1), &Value::Int(0)), Err(OpError::DivisionByZero));
        assert_eq!(arith(BinOp::Mod, &Value::Float(1.0), &Value::Int(0)), Err(OpError::DivisionByZero));
    }

    #[test]
    fn plus_concatenates() {
        assert_eq!(plus(&Value::str("n="), &Value::str("3")).unwrap(), Value::str("n=3"));
        assert_eq!(
            plus(&Value::Array(vec![Value::Int(1)]), &Value::Array(vec![Value::Int(2)])).unwrap(),
            Value::Array(vec![Value::Int(1), Value::Int(2)])
        );
        assert_eq!(plus(&Value::Int(2), &Value::Int(3)).unwrap(), Value::Int(5));
    }

    #[test]
    fn plus_does_not_coerce() {
        assert_eq!(
            plus(&Value::str("hello"), &Value::Int(5)),
            Err(OpError::TypeMismatch { op: "+", left: "string", right: "int" })
        );
        assert_eq!(
            plus(&Value::Null, &Value::str("x")),
            Err(OpError::TypeMismatch { op: "+", left: "null", right: "string" })
        );
        assert!(plus(&Value::str("x"), &Value::object([("a", Value::Int(1))])).is_err());
        assert!(plus(&Value::Array(vec![]), &Value::str("x")).is_err());
    }

    #[test]
    fn compare_strings_and_numbers() {
        assert_eq!(compare(BinOp::Lt, &Value::str("a"), &Value::str("b")).unwrap(), Value::Bool(true));
        assert_eq!(compare(BinOp::Ge, &Value::Int(2), &Value::Float(2.0)).unwrap(), Value::Bool(true));
        assert!(compare(BinOp::Lt, &Value::str("a"), &Value::Int(1)).is_err());
    }

    #[test]
    fn logic_requires_bools() {
        assert_eq!(logic(BinOp::Or, &Value::Bool(false), &Value::Bool(true)).unwrap(), Value::Bool(true));
        assert!(logic(BinOp::And, &Value::Int(1), &Value::Bool(true)).is_err());
    }

    #[test]
    fn index_and_field() {
        let arr = Value::Array(vec![Value::Int(10), Value::Int(20)]);
        assert_eq!(index(&arr, &Value::Int(1)).unwrap(), Value::Int(20));
        assert_eq!(index(&arr, &Value::Int(-1)), Err(OpError::IndexOutOfBounds { index: -1, len: 2 }));
        let obj = Value::object([("a", Value::Int(1))]);
        assert_eq!(index(&obj, &Value::str("a")).unwrap(), Value::Int(1));
        assert!(matches!(field(&obj, "b"), Err(OpError::FieldNotFound { .. })));
    }

    #[test]
    fn unary_ops() {
        assert_eq!(unary(UnaryOp::Neg, &Value::Int(3)).unwrap(), Value::Int(-3));
        assert!(unary(UnaryOp::Not, &Value::Int(0)).is_err());
    }
}
