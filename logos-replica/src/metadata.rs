//! Commit metadata values and their recursive merge rule.
//!
//! Metadata is opaque to the graph, but the coordinator has to fold
//! relay-assigned metadata into its local copy of a commit. The merge is
//! driven by the shape of each value:
//!
//! | tag      | rule                                   |
//! |----------|----------------------------------------|
//! | Scalar   | incoming replaces                      |
//! | Array    | incoming replaces                      |
//! | Set      | incoming replaces                      |
//! | Map      | key-wise recursion, incoming wins      |
//! | Record   | key-wise recursion, incoming wins      |

use std::collections::{BTreeMap, BTreeSet};

use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq)]
pub enum MetaValue {
    Scalar(Value),
    Array(Vec<MetaValue>),
    Set(BTreeSet<String>),
    Map(BTreeMap<String, MetaValue>),
    Record(BTreeMap<String, MetaValue>),
}

impl MetaValue {
    /// Objects become records, arrays stay arrays, everything else is a scalar.
    pub fn from_json(value: &Value) -> MetaValue {
        match value {
            Value::Object(map) => MetaValue::Record(
                map.iter()
                    .map(|(k, v)| (k.clone(), MetaValue::from_json(v)))
                    .collect(),
            ),
            Value::Array(items) => MetaValue::Array(items.iter().map(MetaValue::from_json).collect()),
            other => MetaValue::Scalar(other.clone()),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            MetaValue::Scalar(v) => v.clone(),
            MetaValue::Array(items) => Value::Array(items.iter().map(MetaValue::to_json).collect()),
            MetaValue::Set(items) => {
                Value::Array(items.iter().cloned().map(Value::String).collect())
            }
            MetaValue::Map(entries) | MetaValue::Record(entries) => Value::Object(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect::<Map<String, Value>>(),
            ),
        }
    }
}

/// Merges `incoming` over `existing`.
pub fn merge(existing: &MetaValue, incoming: &MetaValue) -> MetaValue {
    match (existing, incoming) {
        (MetaValue::Map(old), MetaValue::Map(new)) => MetaValue::Map(merge_entries(old, new)),
        (MetaValue::Record(old), MetaValue::Record(new)) => {
            MetaValue::Record(merge_entries(old, new))
        }
        (_, incoming) => incoming.clone(),
    }
}

fn merge_entries(
    old: &BTreeMap<String, MetaValue>,
    new: &BTreeMap<String, MetaValue>,
) -> BTreeMap<String, MetaValue> {
    let mut merged = old.clone();
    for (key, value) in new {
        let next = match old.get(key) {
            Some(existing) => merge(existing, value),
            None => value.clone(),
        };
        merged.insert(key.clone(), next);
    }
    merged
}

/// Merges two JSON metadata values with the record/array rules above.
///
/// `null` on the incoming side keeps the existing value.
pub fn merge_json(existing: &Value, incoming: &Value) -> Value {
    if incoming.is_null() {
        return existing.clone();
    }
    merge(&MetaValue::from_json(existing), &MetaValue::from_json(incoming)).to_json()
}
