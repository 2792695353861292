//! Views over one FMQL `DESCRIBE` record.
//!
//! FMQL describes every field as `{"type": ..., "value": ...}`. Multiples (child nodes) have type
//! `cnodes` and a list of nested records as value, unless `CSTOP` cut them off, in which case the
//! field carries a `stopped` marker instead of children.

use serde_json::{Map, Value};

pub const CONTAINER_FIELD: &str = "vse:container";

#[derive(Clone, Debug, PartialEq)]
pub struct DescribeResult {
    record: Map<String, Value>,
}

impl DescribeResult {
    /// `None` unless `record` is a JSON object.
    pub fn new(record: Value) -> Option<Self> {
        match record {
            Value::Object(record) => Some(Self { record }),
            _ => None,
        }
    }

    pub fn raw(&self) -> &Map<String, Value> {
        &self.record
    }

    /// The record's URI, e.g. `9_6-2`.
    pub fn id(&self) -> Option<&str> {
        self.record.get("uri")?.get("value")?.as_str()
    }

    /// The record as if fetched with `CSTOP 0`: plain values only.
    pub fn cstopped(&self) -> Map<String, Value> {
        flatten(&self.record, false, false)
    }

    /// Plain values plus every child node that was not cut off.
    pub fn flatten(&self) -> Map<String, Value> {
        flatten(&self.record, true, false)
    }

    pub fn cnode_fields(&self) -> Vec<&str> {
        self.record
            .iter()
            .filter(|(_, value)| is_cnodes(value))
            .map(|(field, _)| field.as_str())
            .collect()
    }

    /// Flattened children of `field`, each tagged with this record's id.
    ///
    /// `None` if the record has no such field; empty if the children were cut off.
    pub fn cnodes(&self, field: &str) -> Option<Vec<Map<String, Value>>> {
        let value = self.record.get(field)?;
        if is_stopped(value) {
            return Some(Vec::new());
        }
        let container = self.id().map(|id| Value::String(id.to_owned()));
        let children = children(value)
            .iter()
            .filter_map(Value::as_object)
            .map(|child| {
                let mut flat = flatten(child, true, true);
                if let Some(container) = &container {
                    flat.insert(CONTAINER_FIELD.to_owned(), container.clone());
                }
                flat
            })
            .collect();
        Some(children)
    }

    /// How many values the record asserts, not counting `uri`, including those of reachable
    /// child nodes.
    pub fn no_specific_values(&self) -> usize {
        count_values(&self.record)
    }
}

fn is_cnodes(value: &Value) -> bool {
    value.get("type").and_then(Value::as_str) == Some("cnodes")
}

fn is_stopped(value: &Value) -> bool {
    value.get("stopped").is_some()
}

fn children(value: &Value) -> &[Value] {
    value
        .get("value")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

fn flatten(
    record: &Map<String, Value>,
    include_cnodes: bool,
    drop_uri: bool,
) -> Map<String, Value> {
    let mut flat = Map::new();
    for (field, value) in record {
        if drop_uri && field == "uri" {
            continue;
        }
        if is_cnodes(value) {
            if include_cnodes && !is_stopped(value) {
                let nested = children(value)
                    .iter()
                    .filter_map(Value::as_object)
                    .map(|child| Value::Object(flatten(child, true, true)))
                    .collect();
                flat.insert(field.clone(), Value::Array(nested));
            }
            continue;
        }
        flat.insert(
            field.clone(),
            value.get("value").cloned().unwrap_or(Value::Null),
        );
    }
    flat
}

fn count_values(record: &Map<String, Value>) -> usize {
    record
        .iter()
        .filter(|(field, _)| field.as_str() != "uri")
        .map(|(_, value)| {
            if !is_cnodes(value) {
                1
            } else if is_stopped(value) {
                0
            } else {
                children(value)
                    .iter()
                    .filter_map(Value::as_object)
                    .map(count_values)
                    .sum()
            }
        })
        .sum()
}
