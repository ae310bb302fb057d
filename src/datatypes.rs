//! Portable type codes, decoded values and the native type-name converter.

use crate::error::Result;
use std::fmt;

/// Driver-independent classification of a column.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TypeCode {
    String,
    Number,
    Binary,
    DateTime,
}

/// A decoded column value or a scalar parameter value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Text(String),
    Integer(i64),
    Float(f64),
    Binary(Vec<u8>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            Value::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Integer(i) => Some(*i as f64),
            Value::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Binary(b) => Some(b),
            _ => None,
        }
    }

    /// Text form used when binding as a character parameter.
    pub fn to_text(&self) -> Option<String> {
        match self {
            Value::Null | Value::Binary(_) => None,
            Value::Text(s) => Some(s.clone()),
            Value::Integer(i) => Some(i.to_string()),
            Value::Float(f) => Some(f.to_string()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Text(s) => write!(f, "{s}"),
            Value::Integer(i) => write!(f, "{i}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Binary(b) => {
                for byte in b {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Integer(i as i64)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Binary(b)
    }
}

impl From<&[u8]> for Value {
    fn from(b: &[u8]) -> Self {
        Value::Binary(b.to_vec())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

/// Maps native type names to [`TypeCode`]s and post-processes fetched values.
pub trait TypeConverter: Send + Sync {
    fn convert_type(&self, db_type: &str, type_name: &str) -> TypeCode;

    /// Convert a raw fetched value. Raw values are `Null`, `Text` or `Binary`.
    fn convert_value(
        &self,
        _db_type: &str,
        _type_name: &str,
        _type_code: TypeCode,
        value: Value,
    ) -> Result<Value> {
        Ok(value)
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultConverter;

fn base_type_name(type_name: &str) -> String {
    let upper = type_name.trim().to_ascii_uppercase();
    match upper.find('(') {
        Some(idx) => upper[..idx].trim_end().to_string(),
        None => upper,
    }
}

fn is_integer_type(base: &str) -> bool {
    matches!(base, "BYTEINT" | "SMALLINT" | "INTEGER" | "INT" | "BIGINT" | "TINYINT")
}

fn is_float_type(base: &str) -> bool {
    matches!(base, "FLOAT" | "REAL" | "DOUBLE" | "DOUBLE PRECISION")
}

impl TypeConverter for DefaultConverter {
    fn convert_type(&self, _db_type: &str, type_name: &str) -> TypeCode {
        let base = base_type_name(type_name);
        match base.as_str() {
            "BYTE" | "VARBYTE" | "BLOB" | "BINARY" | "VARBINARY" | "LONG VARBINARY" => {
                TypeCode::Binary
            }
            b if is_integer_type(b) || is_float_type(b) => TypeCode::Number,
            "DECIMAL" | "NUMERIC" | "NUMBER" => TypeCode::Number,
            b if b == "DATE" || b.starts_with("TIME") => TypeCode::DateTime,
            _ => TypeCode::String,
        }
    }

    fn convert_value(
        &self,
        _db_type: &str,
        type_name: &str,
        type_code: TypeCode,
        value: Value,
    ) -> Result<Value> {
        if type_code != TypeCode::Number {
            return Ok(value);
        }
        let text = match value {
            Value::Text(text) => text,
            other => return Ok(other),
        };
        let base = base_type_name(type_name);
        let trimmed = text.trim();
        if is_integer_type(&base) {
            if let Ok(i) = trimmed.parse::<i64>() {
                return Ok(Value::Integer(i));
            }
        } else if is_float_type(&base) {
            if let Ok(f) = trimmed.parse::<f64>() {
                return Ok(Value::Float(f));
            }
        }
        // Decimals keep their exact text form.
        Ok(Value::Text(text))
    }
}
