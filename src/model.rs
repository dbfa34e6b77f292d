//! Core data types shared by every stage of the pipeline.
//!
//! `Value` is the tagged-union column value recommended for dynamic row
//! typing; `ChangeEvent` is the single in-flight record type carried by
//! both bounded queues between the replication consumer, the transform
//! pipeline, and the publishing sink.

use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};
use std::collections::HashMap;

/// A single decoded column value. Untyped maps lose the NULL/number/string
/// distinction the wire format actually carries, so we keep a small
/// tagged union instead and let serde render it as plain JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    I32(i32),
    I64(i64),
    F64(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl Value {
    /// The default string rendering used as input to PII masking (`hash`,
    /// `mask_partial`). Mirrors how the value would print if interpolated.
    pub fn default_string(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Bool(b) => b.to_string(),
            Value::I32(i) => i.to_string(),
            Value::I64(i) => i.to_string(),
            Value::F64(f) => f.to_string(),
            Value::Text(s) => s.clone(),
            Value::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
        }
    }
}

/// Row image: column name to decoded value.
pub type Row = HashMap<String, Value>;

/// Serializes/deserializes as its numeric tag, not the variant name, per
/// the wire contract published events must match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum Operation {
    Update = 0,
    Insert = 1,
    Delete = 2,
}

impl Operation {
    /// The uppercase name used in `PipelineConfig`'s `allowed_operations` lists.
    pub fn as_config_name(&self) -> &'static str {
        match self {
            Operation::Insert => "INSERT",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
        }
    }
}

/// The single in-flight record type. `route` starts empty and is assigned
/// by the transform pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    #[serde(rename = "Operation")]
    pub operation: Operation,
    #[serde(rename = "NameSpace")]
    pub namespace: String,
    #[serde(rename = "Table")]
    pub table: String,
    #[serde(rename = "Before")]
    pub before: Option<Row>,
    #[serde(rename = "After")]
    pub after: Option<Row>,
    #[serde(rename = "Lsn")]
    pub lsn: String,
    #[serde(rename = "Route", default)]
    pub route: String,
    /// Ordered list of replica-identity key column names. Not part of the
    /// wire schema (§6); used internally by the sink to build the
    /// partition key, so it is skipped during serialization.
    #[serde(skip)]
    pub pk: Vec<String>,
}

/// Metadata about a column in a replicated table, cached per relation.
#[derive(Debug, Clone)]
pub struct ColumnDescriptor {
    pub name: String,
    pub type_oid: u32,
    pub is_key: bool,
}

/// Cached schema descriptor for a relation, keyed by the source's
/// relation_id. Replaced wholesale on every `Relation` logical message.
#[derive(Debug, Clone)]
pub struct RelationDescriptor {
    pub relation_id: u32,
    pub namespace: String,
    pub name: String,
    pub replica_identity: char,
    pub columns: Vec<ColumnDescriptor>,
}

impl RelationDescriptor {
    /// `pk = [c.name for c in columns if c.is_key]`, order preserved.
    pub fn key_columns(&self) -> Vec<String> {
        self.columns
            .iter()
            .filter(|c| c.is_key)
            .map(|c| c.name.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_event_serializes_with_capitalized_fields() {
        let mut after = Row::new();
        after.insert("id".to_string(), Value::I32(1));
        let event = ChangeEvent {
            operation: Operation::Insert,
            namespace: "public".to_string(),
            table: "users".to_string(),
            before: None,
            after: Some(after),
            lsn: "0/16B7A30".to_string(),
            route: "user_events".to_string(),
            pk: vec!["id".to_string()],
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["Operation"], 1);
        assert_eq!(json["NameSpace"], "public");
        assert_eq!(json["Before"], serde_json::Value::Null);
        assert_eq!(json["After"]["id"], 1);
    }

    #[test]
    fn operation_tag_order_matches_wire_contract() {
        assert_eq!(Operation::Update as u8, 0);
        assert_eq!(Operation::Insert as u8, 1);
        assert_eq!(Operation::Delete as u8, 2);
    }

    #[test]
    fn key_columns_preserve_order() {
        let relation = RelationDescriptor {
            relation_id: 1,
            namespace: "public".to_string(),
            name: "users".to_string(),
            replica_identity: 'd',
            columns: vec![
                ColumnDescriptor { name: "b".to_string(), type_oid: 23, is_key: false },
                ColumnDescriptor { name: "id".to_string(), type_oid: 23, is_key: true },
            ],
        };
        assert_eq!(relation.key_columns(), vec!["id".to_string()]);
    }
}
