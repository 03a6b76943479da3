//! Slash-delimited path resolution over dynamic JSON values.
//!
//! Paths address into objects by key and into arrays by non-negative index.
//! A missing object key is a [`Error::NotFound`]; a malformed or out-of-range
//! array index is a [`Error::BadPath`]. Empty path segments are skipped, so
//! `"a//b"` and `"a/b"` address the same leaf.

use serde_json::Value;

use crate::{Error, Result};

/// Resolves `path` against `value` and returns the terminal leaf.
pub fn resolve<'a>(value: &'a Value, path: &str) -> Result<&'a Value> {
    let mut current = value;
    for segment in path.split('/') {
        if segment.is_empty() {
            continue;
        }
        current = step(current, segment)?;
    }
    Ok(current)
}

fn step<'a>(current: &'a Value, segment: &str) -> Result<&'a Value> {
    match current {
        Value::Object(map) => map.get(segment).ok_or(Error::NotFound),
        Value::Array(items) => {
            let ix: usize = segment
                .parse()
                .map_err(|_| Error::BadPath(format!("not an array index: {segment:?}")))?;
            items
                .get(ix)
                .ok_or_else(|| Error::BadPath(format!("array index {ix} out of range")))
        }
        // Scalars and null have no addressable children. Optional values
        // serialize as value-or-null, so a vacant option reads as absent.
        _ => Err(Error::NotFound),
    }
}

/// Traverses like [`resolve`] and assigns `new` to the terminal leaf.
///
/// The new value is coerced to the leaf's current scalar shape first, so a
/// string leaf stays a string and an integer leaf stays an integer. Leaves
/// holding `null` accept the new value as-is.
pub fn set(value: &mut Value, path: &str, new: Value) -> Result<()> {
    let mut current = value;
    for segment in path.split('/') {
        if segment.is_empty() {
            continue;
        }
        current = match current {
            Value::Object(map) => map.get_mut(segment).ok_or(Error::NotFound)?,
            Value::Array(items) => {
                let ix: usize = segment
                    .parse()
                    .map_err(|_| Error::BadPath(format!("not an array index: {segment:?}")))?;
                let len = items.len();
                items
                    .get_mut(ix)
                    .ok_or_else(|| Error::BadPath(format!("array index {ix} out of range (len={len})")))?
            }
            _ => return Err(Error::NotFound),
        };
    }
    *current = coerce_like(current, new)?;
    Ok(())
}

/// Coerces `new` to the scalar shape of `like`.
fn coerce_like(like: &Value, new: Value) -> Result<Value> {
    match like {
        Value::Bool(_) => to_bool(&new)
            .map(Value::Bool)
            .ok_or_else(|| Error::BadPath(format!("cannot coerce {new} to bool"))),
        Value::Number(n) if n.is_f64() => to_f64(&new)
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .ok_or_else(|| Error::BadPath(format!("cannot coerce {new} to float"))),
        Value::Number(_) => to_i64(&new)
            .map(|i| Value::Number(i.into()))
            .ok_or_else(|| Error::BadPath(format!("cannot coerce {new} to integer"))),
        Value::String(_) => Ok(Value::String(render(&new))),
        // Null and compound leaves take the new value unchanged.
        _ => Ok(new),
    }
}

/// Scalar conversion helpers shared with the index layer.
pub(crate) fn to_bool(v: &Value) -> Option<bool> {
    match v {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().map(|i| i != 0),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" => Some(true),
            "false" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

pub(crate) fn to_i64(v: &Value) -> Option<i64> {
    match v {
        Value::Bool(b) => Some(i64::from(*b)),
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub(crate) fn to_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Renders a scalar the way it reads in a query literal.
pub(crate) fn render(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
