//! Conversions between `serde_json::Value` and the CRDT value model.
//!
//! Leaf values stored in the tree are yrs [`Any`] values. Consumers see
//! plain JSON; integers stay integers (`Any::BigInt`), every other number is
//! stored as a float. Integers are signed 64-bit: unsigned values above
//! `i64::MAX` are rejected rather than rounded through a float.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map as JsonMap, Number, Value};
use std::collections::HashMap;
use std::sync::Arc;
use yrs::Any;

use crate::error::{CollabError, Result};

/// Convert a JSON value into a CRDT leaf value.
pub fn json_to_any(value: &Value) -> Result<Any> {
    let any = match value {
        Value::Null => Any::Null,
        Value::Bool(b) => Any::Bool(*b),
        Value::Number(n) => number_to_any(n)?,
        Value::String(s) => Any::String(Arc::from(s.as_str())),
        Value::Array(items) => {
            let items = items.iter().map(json_to_any).collect::<Result<Vec<Any>>>()?;
            Any::Array(items.into())
        }
        Value::Object(fields) => {
            let fields = fields
                .iter()
                .map(|(k, v)| Ok((k.clone(), json_to_any(v)?)))
                .collect::<Result<HashMap<String, Any>>>()?;
            Any::Map(Arc::new(fields))
        }
    };
    Ok(any)
}

fn number_to_any(n: &Number) -> Result<Any> {
    if let Some(i) = n.as_i64() {
        return Ok(Any::BigInt(i));
    }
    if let Some(u) = n.as_u64() {
        return Err(CollabError::InvalidValue(format!("integer {u} exceeds i64::MAX")));
    }
    Ok(Any::Number(n.as_f64().unwrap_or(f64::NAN)))
}

/// Fail with [`CollabError::InvalidValue`] if `value` holds a number the tree cannot store.
pub(crate) fn check_storable(value: &Value) -> Result<()> {
    match value {
        Value::Number(n) => number_to_any(n).map(drop),
        Value::Array(items) => items.iter().try_for_each(check_storable),
        Value::Object(fields) => fields.values().try_for_each(check_storable),
        Value::Null | Value::Bool(_) | Value::String(_) => Ok(()),
    }
}

/// Convert a CRDT leaf value back to JSON. `Undefined` map entries are omitted.
pub fn any_to_json(value: &Any) -> Value {
    match value {
        Any::Null | Any::Undefined => Value::Null,
        Any::Bool(b) => Value::Bool(*b),
        Any::Number(f) => Number::from_f64(*f).map(Value::Number).unwrap_or(Value::Null),
        Any::BigInt(i) => Value::Number((*i).into()),
        Any::String(s) => Value::String(s.to_string()),
        Any::Buffer(bytes) => Value::Array(bytes.iter().map(|b| Value::from(*b)).collect()),
        Any::Array(items) => Value::Array(items.iter().map(any_to_json).collect()),
        Any::Map(fields) => {
            let mut object = JsonMap::new();
            for (k, v) in fields.iter() {
                if matches!(v, Any::Undefined) {
                    continue;
                }
                object.insert(k.clone(), any_to_json(v));
            }
            Value::Object(object)
        }
    }
}

/// Serialize a typed value into JSON, rejecting unrepresentable values.
pub fn to_json<T: Serialize>(value: &T) -> Result<Value> {
    let value = serde_json::to_value(value).map_err(|e| CollabError::InvalidValue(e.to_string()))?;
    check_storable(&value)?;
    Ok(value)
}

/// Deserialize a JSON value read from the tree into `T`.
pub fn from_json<T: DeserializeOwned>(value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| CollabError::Decode(e.to_string()))
}

// ───────────────────────────────────────────────────────────────────
// Text offsets
// ───────────────────────────────────────────────────────────────────
//
// The tree indexes text in UTF-16 code units; the public API speaks UTF-8
// byte offsets on char boundaries.

/// UTF-16 length of `s[..byte]`.
pub(crate) fn utf16_offset(s: &str, byte: usize) -> u32 {
    s[..byte].encode_utf16().count() as u32
}

/// Byte offset reached by advancing `units` UTF-16 code units from `from`.
pub(crate) fn advance_utf16(s: &str, from: usize, units: u32) -> usize {
    let mut remaining = units as usize;
    let mut offset = from;
    for ch in s[from..].chars() {
        if remaining == 0 {
            break;
        }
        remaining = remaining.saturating_sub(ch.len_utf16());
        offset += ch.len_utf8();
    }
    offset
}

/// Check that `index` is a valid byte offset into `s`.
pub(crate) fn check_boundary(s: &str, index: usize) -> Result<()> {
    if index > s.len() || !s.is_char_boundary(index) {
        return Err(CollabError::InvalidIndex { index, len: s.len() });
    }
    Ok(())
}
