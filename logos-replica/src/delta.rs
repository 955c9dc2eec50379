//! Structural deltas between document values.
//!
//! Wire format (JSON, stored in a commit's opaque `delta` field):
//! ```text
//! [new]           value added
//! [old, new]      value replaced
//! [old, 0, 0]     value removed
//! { key: delta }  object edited key-wise
//! ```
//!
//! Arrays and scalars are replaced whole. Deltas keep the old value so they
//! can be reversed ([`unpatch`]) and two sequential deltas can be collapsed
//! into one ([`flatten`]) without access to the original document.

use std::collections::BTreeMap;

use serde_json::{Map, Value};
use thiserror::Error;

/// A structural change to a JSON value.
#[derive(Debug, Clone, PartialEq)]
pub enum Delta {
    Added(Value),
    Replaced { old: Value, new: Value },
    Removed(Value),
    Object(BTreeMap<String, Delta>),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DeltaError {
    #[error("malformed delta: {0}")]
    Malformed(String),
    #[error("object delta applied to non-object value at `{0}`")]
    NotAnObject(String),
    #[error("delta does not apply: {0}")]
    Mismatch(String),
}

/// Computes the delta turning `old` into `new`; `None` when they are equal.
pub fn diff(old: &Value, new: &Value) -> Option<Delta> {
    diff_slot(Some(old), Some(new))
}

fn diff_slot(old: Option<&Value>, new: Option<&Value>) -> Option<Delta> {
    match (old, new) {
        (None, None) => None,
        (None, Some(n)) => Some(Delta::Added(n.clone())),
        (Some(o), None) => Some(Delta::Removed(o.clone())),
        (Some(o), Some(n)) if o == n => None,
        (Some(Value::Object(o)), Some(Value::Object(n))) => {
            let mut changes = BTreeMap::new();
            for key in o.keys().chain(n.keys()) {
                if changes.contains_key(key) {
                    continue;
                }
                if let Some(change) = diff_slot(o.get(key), n.get(key)) {
                    changes.insert(key.clone(), change);
                }
            }
            Some(Delta::Object(changes))
        }
        (Some(o), Some(n)) => Some(Delta::Replaced {
            old: o.clone(),
            new: n.clone(),
        }),
    }
}

/// Applies `delta` to `value`. Removing the root yields `null`.
pub fn patch(value: &Value, delta: &Delta) -> Result<Value, DeltaError> {
    Ok(apply_slot(Some(value), delta, Direction::Forward, "")?.unwrap_or(Value::Null))
}

/// Reverses `delta` on a value it produced.
pub fn unpatch(value: &Value, delta: &Delta) -> Result<Value, DeltaError> {
    Ok(apply_slot(Some(value), delta, Direction::Reverse, "")?.unwrap_or(Value::Null))
}

/// Applies an optional commit delta; `None` leaves the value unchanged.
pub fn patch_opt(value: &Value, delta: Option<&Delta>) -> Result<Value, DeltaError> {
    match delta {
        Some(delta) => patch(value, delta),
        None => Ok(value.clone()),
    }
}

#[derive(Clone, Copy)]
enum Direction {
    Forward,
    Reverse,
}

fn apply_slot(
    slot: Option<&Value>,
    delta: &Delta,
    direction: Direction,
    path: &str,
) -> Result<Option<Value>, DeltaError> {
    match (delta, direction) {
        (Delta::Added(v), Direction::Forward) => Ok(Some(v.clone())),
        (Delta::Added(_), Direction::Reverse) => Ok(None),
        (Delta::Replaced { new, .. }, Direction::Forward) => Ok(Some(new.clone())),
        (Delta::Replaced { old, .. }, Direction::Reverse) => Ok(Some(old.clone())),
        (Delta::Removed(_), Direction::Forward) => Ok(None),
        (Delta::Removed(old), Direction::Reverse) => Ok(Some(old.clone())),
        (Delta::Object(changes), _) => {
            let mut object = match slot {
                Some(Value::Object(map)) => map.clone(),
                _ => return Err(DeltaError::NotAnObject(path.to_string())),
            };
            for (key, change) in changes {
                let child_path = format!("{path}/{key}");
                match apply_slot(object.get(key), change, direction, &child_path)? {
                    Some(v) => {
                        object.insert(key.clone(), v);
                    }
                    None => {
                        object.remove(key);
                    }
                }
            }
            Ok(Some(Value::Object(object)))
        }
    }
}

/// Collapses two sequential deltas into one equivalent delta.
///
/// `patch(patch(v, first), second) == patch(v, flatten(first, second))` for
/// every `v` that `first` applies to. Returns `None` when the pair cancels out.
pub fn flatten(first: &Delta, second: &Delta) -> Result<Option<Delta>, DeltaError> {
    flatten_at(first, second, "")
}

fn flatten_at(first: &Delta, second: &Delta, path: &str) -> Result<Option<Delta>, DeltaError> {
    if let (Delta::Object(a), Delta::Object(b)) = (first, second) {
        let mut merged = BTreeMap::new();
        for key in a.keys().chain(b.keys()) {
            if merged.contains_key(key) {
                continue;
            }
            let child_path = format!("{path}/{key}");
            let combined = match (a.get(key), b.get(key)) {
                (Some(x), Some(y)) => flatten_at(x, y, &child_path)?,
                (Some(x), None) => Some(x.clone()),
                (None, Some(y)) => Some(y.clone()),
                (None, None) => None,
            };
            if let Some(change) = combined {
                merged.insert(key.clone(), change);
            }
        }
        return Ok((!merged.is_empty()).then_some(Delta::Object(merged)));
    }

    // Reconstruct the slot before `first` and after `second`, then diff them.
    let middle = match (first, second) {
        (Delta::Added(v), _) | (Delta::Replaced { new: v, .. }, _) => Some(v.clone()),
        (Delta::Removed(_), _) => None,
        (Delta::Object(_), Delta::Replaced { old, .. }) | (Delta::Object(_), Delta::Removed(old)) => {
            Some(old.clone())
        }
        (Delta::Object(_), _) => {
            return Err(DeltaError::Mismatch(format!(
                "edit at `{path}` followed by an add"
            )))
        }
    };
    let before = apply_slot(middle.as_ref(), first, Direction::Reverse, path)?;
    let after = apply_slot(middle.as_ref(), second, Direction::Forward, path)?;
    Ok(diff_slot(before.as_ref(), after.as_ref()))
}

impl Delta {
    /// Encodes to the JSON wire form.
    pub fn to_json(&self) -> Value {
        match self {
            Delta::Added(v) => Value::Array(vec![v.clone()]),
            Delta::Replaced { old, new } => Value::Array(vec![old.clone(), new.clone()]),
            Delta::Removed(old) => Value::Array(vec![old.clone(), Value::from(0), Value::from(0)]),
            Delta::Object(changes) => Value::Object(
                changes
                    .iter()
                    .map(|(k, d)| (k.clone(), d.to_json()))
                    .collect::<Map<String, Value>>(),
            ),
        }
    }

    /// Decodes the JSON wire form.
    pub fn from_json(value: &Value) -> Result<Delta, DeltaError> {
        match value {
            Value::Array(items) => match items.as_slice() {
                [new] => Ok(Delta::Added(new.clone())),
                [old, new] => Ok(Delta::Replaced {
                    old: old.clone(),
                    new: new.clone(),
                }),
                [old, a, b] if is_zero(a) && is_zero(b) => Ok(Delta::Removed(old.clone())),
                _ => Err(DeltaError::Malformed(format!(
                    "unexpected array of length {}",
                    items.len()
                ))),
            },
            Value::Object(map) => map
                .iter()
                .map(|(k, v)| Ok((k.clone(), Delta::from_json(v)?)))
                .collect::<Result<BTreeMap<_, _>, _>>()
                .map(Delta::Object),
            other => Err(DeltaError::Malformed(format!("unexpected value {other}"))),
        }
    }
}

fn is_zero(value: &Value) -> bool {
    value.as_u64() == Some(0)
}

/// Encodes an optional delta as a commit's `delta` field (`null` = no change).
pub fn encode_opt(delta: Option<&Delta>) -> Value {
    delta.map_or(Value::Null, Delta::to_json)
}

/// Decodes a commit's `delta` field.
pub fn decode_opt(value: &Value) -> Result<Option<Delta>, DeltaError> {
    match value {
        Value::Null => Ok(None),
        other => Delta::from_json(other).map(Some),
    }
}
