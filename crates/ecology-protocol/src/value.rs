//! Dynamically typed values carried in ecology messages.
//!
//! Every value maps to exactly one wire tag (see [`crate::codec`]).

use bytes::Bytes;
use std::fmt;

/// A self-describing value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Signed 32-bit integer (`i`).
    Int32(i32),
    /// Unsigned 32-bit integer held widened to 64 bits (`u`).
    ///
    /// Values above `u32::MAX` cannot be encoded.
    UInt32(u64),
    /// Signed 64-bit integer (`h`).
    Int64(i64),
    /// Single precision float (`f`).
    Float32(f32),
    /// Double precision float (`d`).
    Float64(f64),
    /// UTF-8 string (`s`). Must not contain NUL.
    String(String),
    /// Raw bytes (`b`).
    Blob(Bytes),
    /// Unicode scalar value (`c` when ASCII, `C` otherwise).
    Char(char),
    /// Boolean (`T` / `F`).
    Bool(bool),
    /// Null (`N`).
    Null,
    /// Ordered list (`[` ... `]`).
    List(Vec<Value>),
    /// Ordered key/value pairs (`{` ... `}`).
    Map(Vec<(Value, Value)>),
}

impl Value {
    /// Wire tag of this value. Containers report their opening delimiter.
    #[must_use]
    pub fn tag(&self) -> char {
        match self {
            Value::Int32(_) => 'i',
            Value::UInt32(_) => 'u',
            Value::Int64(_) => 'h',
            Value::Float32(_) => 'f',
            Value::Float64(_) => 'd',
            Value::String(_) => 's',
            Value::Blob(_) => 'b',
            Value::Char(c) if c.is_ascii() => 'c',
            Value::Char(_) => 'C',
            Value::Bool(true) => 'T',
            Value::Bool(false) => 'F',
            Value::Null => 'N',
            Value::List(_) => '[',
            Value::Map(_) => '{',
        }
    }

    /// Short name of the variant, used in error messages.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Int32(_) => "int32",
            Value::UInt32(_) => "uint32",
            Value::Int64(_) => "int64",
            Value::Float32(_) => "float32",
            Value::Float64(_) => "float64",
            Value::String(_) => "string",
            Value::Blob(_) => "blob",
            Value::Char(_) => "char",
            Value::Bool(_) => "bool",
            Value::Null => "null",
            Value::List(_) => "list",
            Value::Map(_) => "map",
        }
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::Int32(v) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int32(v) => Some(i64::from(*v)),
            Value::Int64(v) => Some(*v),
            Value::UInt32(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_map(&self) -> Option<&[(Value, Value)]> {
        match self {
            Value::Map(entries) => Some(entries),
            _ => None,
        }
    }

    /// Consume the value, returning the owned string if it is one.
    #[must_use]
    pub fn into_string(self) -> Option<String> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int32(v) => write!(f, "{v}"),
            Value::UInt32(v) => write!(f, "{v}"),
            Value::Int64(v) => write!(f, "{v}"),
            Value::Float32(v) => write!(f, "{v}"),
            Value::Float64(v) => write!(f, "{v}"),
            Value::String(s) => write!(f, "{s:?}"),
            Value::Blob(b) => write!(f, "<{} bytes>", b.len()),
            Value::Char(c) => write!(f, "{c:?}"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Null => f.write_str("null"),
            Value::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Value::Map(entries) => {
                f.write_str("{")?;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                f.write_str("}")
            }
        }
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int32(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::UInt32(u64::from(v))
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float32(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float64(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Bytes> for Value {
    fn from(v: Bytes) -> Self {
        Value::Blob(v)
    }
}

impl From<char> for Value {
    fn from(v: char) -> Self {
        Value::Char(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::List(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags() {
        assert_eq!(Value::from(1).tag(), 'i');
        assert_eq!(Value::from(1u32).tag(), 'u');
        assert_eq!(Value::from('a').tag(), 'c');
        assert_eq!(Value::from('é').tag(), 'C');
        assert_eq!(Value::from(true).tag(), 'T');
        assert_eq!(Value::from(false).tag(), 'F');
        assert_eq!(Value::from(None::<i32>).tag(), 'N');
        assert_eq!(Value::Map(vec![]).tag(), '{');
    }

    #[test]
    fn test_accessors() {
        assert_eq!(Value::from("key").as_str(), Some("key"));
        assert_eq!(Value::from(7).as_i64(), Some(7));
        assert_eq!(Value::UInt32(9).as_i64(), Some(9));
        assert!(Value::from(7).as_str().is_none());
        assert!(Value::Null.is_null());
    }

    #[test]
    fn test_display() {
        let v = Value::List(vec![Value::from(1), Value::from("a"), Value::Null]);
        assert_eq!(v.to_string(), "[1, \"a\", null]");
    }
}
