//! Structural diff between two JSON renditions of an entity.
//!
//! The entity store consumes this as a pure function: an empty changelog
//! means no update is recorded, a changelog is carried by a `changed` event,
//! and a diff error (top-level shape mismatch) makes the store fall back to
//! replacing the entity wholesale.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The kind of a single change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOp {
    /// A value appeared under a path that had none.
    Create,
    /// A value changed under an existing path.
    Update,
    /// A value disappeared from an existing path.
    Delete,
}

/// One entry of a changelog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    /// The kind of change.
    #[serde(rename = "type")]
    pub op: ChangeOp,
    /// Slash path of the changed leaf.
    pub path: String,
    /// The previous value (`null` for creations).
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub from: Value,
    /// The new value (`null` for deletions).
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub to: Value,
}

/// The path-by-path difference from an old to a new entity value.
pub type Changelog = Vec<Change>;

/// The error returned when two values cannot be diffed.
#[derive(Debug, Clone, thiserror::Error)]
#[error("cannot diff: {0}")]
pub struct DiffError(String);

/// Computes the changelog from `old` to `new`.
///
/// Values of the same compound shape are walked recursively; scalar
/// differences become updates. Two top-level values of different JSON kinds
/// have no common structure to walk and fail, signalling the caller to
/// replace instead of patch.
pub fn diff(old: &Value, new: &Value) -> Result<Changelog, DiffError> {
    if kind(old) != kind(new) {
        return Err(DiffError(format!(
            "shape mismatch: {} vs {}",
            kind(old),
            kind(new)
        )));
    }
    let mut changelog = Vec::new();
    walk(old, new, &mut Vec::new(), &mut changelog);
    Ok(changelog)
}

fn kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn walk(old: &Value, new: &Value, path: &mut Vec<String>, out: &mut Changelog) {
    match (old, new) {
        (Value::Object(old_map), Value::Object(new_map)) => {
            for (key, old_value) in old_map {
                path.push(key.clone());
                match new_map.get(key) {
                    Some(new_value) => walk(old_value, new_value, path, out),
                    None => out.push(change(ChangeOp::Delete, path, old_value.clone(), Value::Null)),
                }
                path.pop();
            }
            for (key, new_value) in new_map {
                if !old_map.contains_key(key) {
                    path.push(key.clone());
                    out.push(change(ChangeOp::Create, path, Value::Null, new_value.clone()));
                    path.pop();
                }
            }
        }
        (Value::Array(old_items), Value::Array(new_items)) => {
            for (ix, old_item) in old_items.iter().enumerate() {
                path.push(ix.to_string());
                match new_items.get(ix) {
                    Some(new_item) => walk(old_item, new_item, path, out),
                    None => out.push(change(ChangeOp::Delete, path, old_item.clone(), Value::Null)),
                }
                path.pop();
            }
            for (ix, new_item) in new_items.iter().enumerate().skip(old_items.len()) {
                path.push(ix.to_string());
                out.push(change(ChangeOp::Create, path, Value::Null, new_item.clone()));
                path.pop();
            }
        }
        (old, new) => {
            if old != new {
                out.push(change(ChangeOp::Update, path, old.clone(), new.clone()));
            }
        }
    }
}

fn change(op: ChangeOp, path: &[String], from: Value, to: Value) -> Change {
    Change {
        op,
        path: path.join("/"),
        from,
        to,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn equal_values_diff_empty() {
        let v = json!({"a": 1, "b": {"c": [1, 2]}});
        assert!(diff(&v, &v.clone()).unwrap().is_empty());
    }

    #[test]
    fn scalar_and_nested_changes() {
        let old = json!({"name": "n1", "stats": {"count": 1, "tags": ["a", "b"]}});
        let new = json!({"name": "n2", "stats": {"count": 1, "tags": ["a"]}, "note": "x"});
        let changelog = diff(&old, &new).unwrap();

        assert!(changelog.contains(&Change {
            op: ChangeOp::Update,
            path: "name".into(),
            from: json!("n1"),
            to: json!("n2"),
        }));
        assert!(changelog.contains(&Change {
            op: ChangeOp::Delete,
            path: "stats/tags/1".into(),
            from: json!("b"),
            to: Value::Null,
        }));
        assert!(changelog.contains(&Change {
            op: ChangeOp::Create,
            path: "note".into(),
            from: Value::Null,
            to: json!("x"),
        }));
        assert_eq!(changelog.len(), 3);
    }

    #[test]
    fn shape_mismatch_fails() {
        assert!(diff(&json!({"a": 1}), &json!([1])).is_err());
        assert!(diff(&json!("s"), &json!({"a": 1})).is_err());
    }

    #[test]
    fn changelog_round_trips_as_json() {
        let old = json!({"a": 1});
        let new = json!({"a": 2});
        let changelog = diff(&old, &new).unwrap();
        let wire = serde_json::to_string(&changelog).unwrap();
        let back: Changelog = serde_json::from_str(&wire).unwrap();
        assert_eq!(changelog, back);
    }
}
