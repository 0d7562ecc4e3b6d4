//! Conversion between ecology values and JSON for the HTTP endpoints.

use ecology_protocol::Value;
use serde_json::{Map, Number, Value as Json};

/// Render a value as JSON.
///
/// Blobs become arrays of bytes and chars become one-character strings.
/// Maps with non-string keys are rendered as lists of `[key, value]` pairs.
/// Non-finite floats become `null`.
pub fn to_json(value: &Value) -> Json {
    match value {
        Value::Int32(i) => Json::from(*i),
        Value::UInt32(u) => Json::from(*u),
        Value::Int64(i) => Json::from(*i),
        Value::Float32(f) => Number::from_f64(f64::from(*f)).map_or(Json::Null, Json::Number),
        Value::Float64(f) => Number::from_f64(*f).map_or(Json::Null, Json::Number),
        Value::String(s) => Json::String(s.clone()),
        Value::Blob(b) => Json::Array(b.iter().map(|byte| Json::from(*byte)).collect()),
        Value::Char(c) => Json::String(c.to_string()),
        Value::Bool(b) => Json::Bool(*b),
        Value::Null => Json::Null,
        Value::List(items) => Json::Array(items.iter().map(to_json).collect()),
        Value::Map(pairs) => {
            if pairs.iter().all(|(k, _)| k.as_str().is_some()) {
                let object: Map<String, Json> = pairs
                    .iter()
                    .filter_map(|(k, v)| k.as_str().map(|k| (k.to_string(), to_json(v))))
                    .collect();
                Json::Object(object)
            } else {
                Json::Array(
                    pairs
                        .iter()
                        .map(|(k, v)| Json::Array(vec![to_json(k), to_json(v)]))
                        .collect(),
                )
            }
        }
    }
}

/// Convert JSON into a value.
///
/// Integers become `Int32` when they fit and `Int64` otherwise. Everything
/// else numeric becomes `Float64`.
pub fn from_json(json: &Json) -> Value {
    match json {
        Json::Null => Value::Null,
        Json::Bool(b) => Value::Bool(*b),
        Json::Number(n) => {
            if let Some(i) = n.as_i64() {
                i32::try_from(i).map_or(Value::Int64(i), Value::Int32)
            } else {
                Value::Float64(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        Json::String(s) => Value::String(s.clone()),
        Json::Array(items) => Value::List(items.iter().map(from_json).collect()),
        Json::Object(object) => Value::Map(
            object
                .iter()
                .map(|(k, v)| (Value::String(k.clone()), from_json(v)))
                .collect(),
        ),
    }
}
