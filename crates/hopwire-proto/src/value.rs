//! Transport-serializable argument and result values

use crate::ProtocolError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A value that can cross the wire as a call argument or result
///
/// Primitives map to dedicated variants. Any other `serde` type travels as
/// [`Value::Object`], bincode-encoded and tagged with its Rust type name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Object { type_name: String, payload: Vec<u8> },
}

impl Value {
    /// Wrap an arbitrary serializable type
    pub fn object<T: Serialize>(value: &T) -> Result<Self, ProtocolError> {
        Ok(Value::Object {
            type_name: std::any::type_name::<T>().to_string(),
            payload: bincode::serialize(value)?,
        })
    }

    /// Decode an [`Value::Object`] payload back into `T`
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        match self {
            Value::Object { payload, .. } => Ok(bincode::deserialize(payload)?),
            other => Err(other.type_error("object")),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Object { .. } => "object",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Result<bool, ProtocolError> {
        match self {
            Value::Bool(b) => Ok(*b),
            other => Err(other.type_error("bool")),
        }
    }

    pub fn as_i64(&self) -> Result<i64, ProtocolError> {
        match self {
            Value::Int(i) => Ok(*i),
            other => Err(other.type_error("int")),
        }
    }

    pub fn as_f64(&self) -> Result<f64, ProtocolError> {
        match self {
            Value::Float(f) => Ok(*f),
            Value::Int(i) => Ok(*i as f64),
            other => Err(other.type_error("float")),
        }
    }

    pub fn as_str(&self) -> Result<&str, ProtocolError> {
        match self {
            Value::Str(s) => Ok(s),
            other => Err(other.type_error("string")),
        }
    }

    pub fn into_string(self) -> Result<String, ProtocolError> {
        match self {
            Value::Str(s) => Ok(s),
            other => Err(other.type_error("string")),
        }
    }

    fn type_error(&self, expected: &'static str) -> ProtocolError {
        ProtocolError::ValueType {
            expected,
            found: self.type_name(),
        }
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::Null
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<u32> for Value {
    fn from(i: u32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        opt.map(Into::into).unwrap_or(Value::Null)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::List(items.into_iter().map(Into::into).collect())
    }
}
