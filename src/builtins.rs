//! Pure functions callable from programs, shared by the VM and the interpreter.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::value::Value;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{name}(): {message}")]
pub struct BuiltinError {
    pub name: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    TimeNow,
    Length,
    Upper,
    Lower,
    Trim,
    Split,
    Join,
    Contains,
    Replace,
    Substring,
}

/// Coarse result type, used by the compiler to choose between `ADD` and `CONCAT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnKind {
    Int,
    Bool,
    Str,
    Array,
}

impl Builtin {
    pub fn from_name(name: &str) -> Option<Builtin> {
        Some(match name {
            "time.now" | "now" => Builtin::TimeNow,
            "length" => Builtin::Length,
            "upper" => Builtin::Upper,
            "lower" => Builtin::Lower,
            "trim" => Builtin::Trim,
            "split" => Builtin::Split,
            "join" => Builtin::Join,
            "contains" => Builtin::Contains,
            "replace" => Builtin::Replace,
            "substring" => Builtin::Substring,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Builtin::TimeNow => "time.now",
            Builtin::Length => "length",
            Builtin::Upper => "upper",
            Builtin::Lower => "lower",
            Builtin::Trim => "trim",
            Builtin::Split => "split",
            Builtin::Join => "join",
            Builtin::Contains => "contains",
            Builtin::Replace => "replace",
            Builtin::Substring => "substring",
        }
    }

    pub fn arity(self) -> usize {
        match self {
            Builtin::TimeNow => 0,
            Builtin::Length | Builtin::Upper | Builtin::Lower | Builtin::Trim => 1,
            Builtin::Split | Builtin::Join | Builtin::Contains => 2,
            Builtin::Replace | Builtin::Substring => 3,
        }
    }

    pub fn returns(self) -> ReturnKind {
        match self {
            Builtin::TimeNow | Builtin::Length => ReturnKind::Int,
            Builtin::Contains => ReturnKind::Bool,
            Builtin::Split => ReturnKind::Array,
            Builtin::Upper | Builtin::Lower | Builtin::Trim | Builtin::Join | Builtin::Replace | Builtin::Substring => {
                ReturnKind::Str
            }
        }
    }

    pub fn call(self, args: &[Value]) -> Result<Value, BuiltinError> {
        let name = self.name();
        let err = |message: String| BuiltinError { name, message };
        if args.len() != self.arity() {
            return Err(err(format!("takes exactly {} argument(s), got {}", self.arity(), args.len())));
        }
        let text = |idx: usize| str_arg(name, args, idx);
        let int = |idx: usize| -> Result<i64, BuiltinError> {
            match &args[idx] {
                Value::Int(n) => Ok(*n),
                other => Err(err(format!("argument {} must be an int, got {}", idx + 1, other.type_name()))),
            }
        };

        match self {
            Builtin::TimeNow => {
                let secs = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
                Ok(Value::Int(secs as i64))
            }
            Builtin::Length => match &args[0] {
                Value::Str(s) => Ok(Value::Int(s.chars().count() as i64)),
                Value::Array(items) => Ok(Value::Int(items.len() as i64)),
                Value::Object(fields) => Ok(Value::Int(fields.len() as i64)),
                other => Err(err(format!("requires a string, array or object, got {}", other.type_name()))),
            },
            Builtin::Upper => Ok(Value::Str(text(0)?.to_uppercase())),
            Builtin::Lower => Ok(Value::Str(text(0)?.to_lowercase())),
            Builtin::Trim => Ok(Value::Str(text(0)?.trim().to_string())),
            Builtin::Split => {
                let (s, delim) = (text(0)?, text(1)?);
                let parts: Vec<Value> = if delim.is_empty() {
                    s.chars().map(|c| Value::Str(c.to_string())).collect()
                } else {
                    s.split(delim).map(Value::str).collect()
                };
                Ok(Value::Array(parts))
            }
            Builtin::Join => {
                let Value::Array(items) = &args[0] else {
                    return Err(err(format!("argument 1 must be an array, got {}", args[0].type_name())));
                };
                let delim = text(1)?;
                let parts: Vec<String> = items.iter().map(|v| v.to_string()).collect();
                Ok(Value::Str(parts.join(delim)))
            }
            Builtin::Contains => Ok(Value::Bool(text(0)?.contains(text(1)?))),
            Builtin::Replace => Ok(Value::Str(text(0)?.replace(text(1)?, text(2)?))),
            Builtin::Substring => {
                let s = text(0)?;
                let (start, end) = (int(1)?, int(2)?);
                if start < 0 || end < 0 {
                    return Err(err("indices must be non-negative".into()));
                }
                if start > end {
                    return Err(err(format!("start {} is after end {}", start, end)));
                }
                let len = s.chars().count() as i64;
                if end > len {
                    return Err(err(format!("end index {} out of bounds (length {})", end, len)));
                }
                let out: String = s.chars().skip(start as usize).take((end - start) as usize).collect();
                Ok(Value::Str(out))
            }
        }
    }
}

fn str_arg<'a>(name: &'static str, args: &'a [Value], idx: usize) -> Result<&'a str, BuiltinError> {
    match &args[idx] {
        Value::Str(s) => Ok(s),
        other => Err(BuiltinError {
            name,
            message: format!("argument {} must be a string, got {}", idx + 1, other.type_name()),
        }),
    }
}
