//! SQL values and types.
//!
//! Values travel over the wire in PostgreSQL text format; bound parameters
//! may additionally arrive in binary format (big-endian, per type OID).

use std::cmp::Ordering;

use byteorder::{BigEndian, ByteOrder};

use crate::error::ExecError;

/// The type of a column or parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Integer,
    Double,
    Varchar,
    Boolean,
}

impl ValueType {
    /// PostgreSQL type OID (int4, float8, text, bool).
    pub fn type_oid(self) -> i32 {
        match self {
            ValueType::Integer => 23,
            ValueType::Double => 701,
            ValueType::Varchar => 25,
            ValueType::Boolean => 16,
        }
    }

    /// Wire-level type size; -1 for variable length.
    pub fn type_size(self) -> i16 {
        match self {
            ValueType::Integer => 4,
            ValueType::Double => 8,
            ValueType::Varchar => -1,
            ValueType::Boolean => 1,
        }
    }

    pub fn from_type_oid(oid: i32) -> Option<Self> {
        match oid {
            23 => Some(ValueType::Integer),
            701 => Some(ValueType::Double),
            25 | 1043 => Some(ValueType::Varchar),
            16 => Some(ValueType::Boolean),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ValueType::Integer => "integer",
            ValueType::Double => "double",
            ValueType::Varchar => "varchar",
            ValueType::Boolean => "boolean",
        }
    }
}

/// A single SQL value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Integer(i32),
    Double(f64),
    Varchar(String),
    Boolean(bool),
    Null,
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn value_type(&self) -> Option<ValueType> {
        match self {
            Value::Integer(_) => Some(ValueType::Integer),
            Value::Double(_) => Some(ValueType::Double),
            Value::Varchar(_) => Some(ValueType::Varchar),
            Value::Boolean(_) => Some(ValueType::Boolean),
            Value::Null => None,
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            Value::Integer(_) => "integer",
            Value::Double(_) => "double",
            Value::Varchar(_) => "varchar",
            Value::Boolean(_) => "boolean",
            Value::Null => "null",
        }
    }

    /// Render in wire text format. `None` for SQL NULL.
    pub fn to_text(&self) -> Option<String> {
        match self {
            Value::Integer(v) => Some(v.to_string()),
            Value::Double(v) => Some(v.to_string()),
            Value::Varchar(v) => Some(v.clone()),
            Value::Boolean(v) => Some(if *v { "t".to_string() } else { "f".to_string() }),
            Value::Null => None,
        }
    }

    /// Parse wire text format into a value of the given type.
    pub fn parse_text(text: &str, ty: ValueType) -> Result<Value, ExecError> {
        match ty {
            ValueType::Integer => text
                .trim()
                .parse::<i32>()
                .map(Value::Integer)
                .map_err(|_| ExecError::InvalidText {
                    text: text.to_string(),
                    target: "integer",
                }),
            ValueType::Double => text
                .trim()
                .parse::<f64>()
                .map(Value::Double)
                .map_err(|_| ExecError::InvalidText {
                    text: text.to_string(),
                    target: "double",
                }),
            ValueType::Varchar => Ok(Value::Varchar(text.to_string())),
            ValueType::Boolean => match text.trim().to_ascii_lowercase().as_str() {
                "t" | "true" | "1" | "on" => Ok(Value::Boolean(true)),
                "f" | "false" | "0" | "off" => Ok(Value::Boolean(false)),
                _ => Err(ExecError::InvalidText {
                    text: text.to_string(),
                    target: "boolean",
                }),
            },
        }
    }

    /// Decode a binary-format parameter per its declared type: integers are
    /// 4-byte big-endian signed, doubles are 8-byte big-endian IEEE-754.
    pub fn decode_binary(buf: &[u8], ty: ValueType) -> Result<Value, ExecError> {
        match ty {
            ValueType::Integer => {
                if buf.len() != 4 {
                    return Err(ExecError::MalformedBinary("integer"));
                }
                Ok(Value::Integer(BigEndian::read_i32(buf)))
            }
            ValueType::Double => {
                if buf.len() != 8 {
                    return Err(ExecError::MalformedBinary("double"));
                }
                Ok(Value::Double(BigEndian::read_f64(buf)))
            }
            ValueType::Varchar => String::from_utf8(buf.to_vec())
                .map(Value::Varchar)
                .map_err(|_| ExecError::MalformedBinary("varchar")),
            ValueType::Boolean => match buf {
                [0] => Ok(Value::Boolean(false)),
                [_] => Ok(Value::Boolean(true)),
                _ => Err(ExecError::MalformedBinary("boolean")),
            },
        }
    }

    /// Cast to the target type. Text casts parse; numeric casts coerce.
    pub fn cast(self, ty: ValueType) -> Result<Value, ExecError> {
        match (self, ty) {
            (Value::Null, _) => Ok(Value::Null),
            (v, t) if v.value_type() == Some(t) => Ok(v),
            (Value::Integer(v), ValueType::Double) => Ok(Value::Double(f64::from(v))),
            (Value::Double(v), ValueType::Integer) => Ok(Value::Integer(v as i32)),
            (Value::Varchar(s), t) => Value::parse_text(&s, t),
            (v, ValueType::Varchar) => Ok(Value::Varchar(
                v.to_text().unwrap_or_default(),
            )),
            (v, t) => Err(ExecError::TypeMismatch {
                expected: t.name(),
                actual: v.type_name(),
            }),
        }
    }

    /// Three-valued comparison: `None` when either side is NULL.
    pub fn compare(&self, other: &Value) -> Result<Option<Ordering>, ExecError> {
        match (self, other) {
            (Value::Null, _) | (_, Value::Null) => Ok(None),
            (Value::Integer(a), Value::Integer(b)) => Ok(Some(a.cmp(b))),
            (Value::Double(a), Value::Double(b)) => Ok(Some(
                a.partial_cmp(b).unwrap_or(Ordering::Equal),
            )),
            (Value::Integer(a), Value::Double(b)) => Ok(Some(
                f64::from(*a).partial_cmp(b).unwrap_or(Ordering::Equal),
            )),
            (Value::Double(a), Value::Integer(b)) => Ok(Some(
                a.partial_cmp(&f64::from(*b)).unwrap_or(Ordering::Equal),
            )),
            (Value::Varchar(a), Value::Varchar(b)) => Ok(Some(a.cmp(b))),
            (Value::Boolean(a), Value::Boolean(b)) => Ok(Some(a.cmp(b))),
            (a, b) => Err(ExecError::TypeMismatch {
                expected: a.type_name(),
                actual: b.type_name(),
            }),
        }
    }

    /// Numeric arithmetic with Integer/Double coercion; NULL propagates.
    pub fn arithmetic(&self, other: &Value, op: ArithOp) -> Result<Value, ExecError> {
        match (self, other) {
            (Value::Null, _) | (_, Value::Null) => Ok(Value::Null),
            (Value::Integer(a), Value::Integer(b)) => op.apply_i32(*a, *b),
            (Value::Double(a), Value::Double(b)) => op.apply_f64(*a, *b),
            (Value::Integer(a), Value::Double(b)) => op.apply_f64(f64::from(*a), *b),
            (Value::Double(a), Value::Integer(b)) => op.apply_f64(*a, f64::from(*b)),
            (a, b) => Err(ExecError::TypeMismatch {
                expected: a.type_name(),
                actual: b.type_name(),
            }),
        }
    }
}

/// Arithmetic operator for `Value::arithmetic`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl ArithOp {
    fn apply_i32(self, a: i32, b: i32) -> Result<Value, ExecError> {
        match self {
            ArithOp::Add => Ok(Value::Integer(a.wrapping_add(b))),
            ArithOp::Sub => Ok(Value::Integer(a.wrapping_sub(b))),
            ArithOp::Mul => Ok(Value::Integer(a.wrapping_mul(b))),
            ArithOp::Div => {
                if b == 0 {
                    Err(ExecError::DivisionByZero)
                } else {
                    Ok(Value::Integer(a.wrapping_div(b)))
                }
            }
        }
    }

    fn apply_f64(self, a: f64, b: f64) -> Result<Value, ExecError> {
        match self {
            ArithOp::Add => Ok(Value::Double(a + b)),
            ArithOp::Sub => Ok(Value::Double(a - b)),
            ArithOp::Mul => Ok(Value::Double(a * b)),
            ArithOp::Div => {
                if b == 0.0 {
                    Err(ExecError::DivisionByZero)
                } else {
                    Ok(Value::Double(a / b))
                }
            }
        }
    }
}
