//! Value transformation between caller types and storage-ready values.
//!
//! Any `Serialize` type can be coerced into a [`Value`] and read back with
//! [`from_value`]. Values entering the store pass through [`normalize`],
//! which rejects mapping keys that cannot be addressed as a prefix segment.

use crate::error::{Result, StoreError};
use crate::types::{validate_key, Value};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Coerce any serializable value into a storage-ready [`Value`].
pub fn to_value<T: Serialize + ?Sized>(value: &T) -> Result<Value> {
    let json = serde_json::to_value(value)?;
    normalize(Value::from(json))
}

/// Decode a stored [`Value`] into a caller type.
pub fn from_value<T: DeserializeOwned>(value: Value) -> Result<T> {
    serde_json::from_value(to_json(value))
        .map_err(|e| StoreError::Deserialization(e.to_string()))
}

/// Convert a stored value into JSON. Bytes become arrays of numbers and
/// non-finite floats become `null`.
pub fn to_json(value: Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(b),
        Value::Int(i) => serde_json::Value::from(i),
        Value::Float(f) => serde_json::Number::from_f64(f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Value::Str(s) => serde_json::Value::String(s),
        Value::Bytes(bytes) => serde_json::Value::Array(
            bytes.into_iter().map(serde_json::Value::from).collect(),
        ),
        Value::Array(items) => serde_json::Value::Array(items.into_iter().map(to_json).collect()),
        Value::Map(map) => {
            serde_json::Value::Object(map.into_iter().map(|(k, v)| (k, to_json(v))).collect())
        }
    }
}

/// Prepare a value for storage.
///
/// Nested mapping keys become prefix segments in the backing store, so every
/// one of them must be a valid key.
pub fn normalize(value: Value) -> Result<Value> {
    match value {
        Value::Map(map) => {
            let mut normalized = std::collections::BTreeMap::new();
            for (key, value) in map {
                validate_key(&key)?;
                normalized.insert(key, normalize(value)?);
            }
            Ok(Value::Map(normalized))
        }
        Value::Array(items) => Ok(Value::Array(
            items
                .into_iter()
                .map(normalize)
                .collect::<Result<Vec<_>>>()?,
        )),
        other => Ok(other),
    }
}

/// Shape of a rectangular nested array, `None` for ragged or non-array values.
///
/// A level mixing arrays and scalars counts as ragged.
pub fn shape(value: &Value) -> Option<Vec<usize>> {
    let items = value.as_array()?;
    let mut inner: Option<Vec<usize>> = None;
    for item in items {
        let item_shape = match item {
            Value::Array(_) => shape(item)?,
            Value::Map(_) => return None,
            _ => Vec::new(),
        };
        match inner.take() {
            None => inner = Some(item_shape),
            Some(expected) if expected == item_shape => inner = Some(expected),
            Some(_) => return None,
        }
    }
    let mut dims = vec![items.len()];
    dims.extend(inner.unwrap_or_default());
    Some(dims)
}
