//! Iceberg table metadata documents (format version 2).
//!
//! Field names follow the Iceberg JSON serialization: kebab-case keys,
//! lowercase type names.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

pub const FORMAT_VERSION: u8 = 2;

/// Highest partition field id of an unpartitioned table.
pub const UNPARTITIONED_LAST_PARTITION_ID: i32 = 999;

pub const MAIN_BRANCH: &str = "main";

/// Table metadata document, written as `v{N}.metadata.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TableMetadata {
    pub format_version: u8,
    pub table_uuid: Uuid,
    pub location: String,
    pub last_sequence_number: i64,
    pub last_updated_ms: i64,
    pub last_column_id: i32,
    pub current_schema_id: i32,
    pub schemas: Vec<IcebergSchema>,
    pub default_spec_id: i32,
    pub partition_specs: Vec<PartitionSpec>,
    pub last_partition_id: i32,
    pub default_sort_order_id: i32,
    pub sort_orders: Vec<SortOrder>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_snapshot_id: Option<i64>,
    #[serde(default)]
    pub refs: BTreeMap<String, SnapshotRef>,
    #[serde(default)]
    pub snapshots: Vec<Snapshot>,
    #[serde(default)]
    pub snapshot_log: Vec<SnapshotLogEntry>,
    #[serde(default)]
    pub metadata_log: Vec<MetadataLogEntry>,
}

impl TableMetadata {
    /// Schema with `current-schema-id`.
    pub fn current_schema(&self) -> Option<&IcebergSchema> {
        self.schema(self.current_schema_id)
    }

    pub fn schema(&self, schema_id: i32) -> Option<&IcebergSchema> {
        self.schemas.iter().find(|s| s.schema_id == schema_id)
    }

    /// Snapshot with `current-snapshot-id`.
    pub fn current_snapshot(&self) -> Option<&Snapshot> {
        self.current_snapshot_id.and_then(|id| self.snapshot(id))
    }

    pub fn snapshot(&self, snapshot_id: i64) -> Option<&Snapshot> {
        self.snapshots.iter().find(|s| s.snapshot_id == snapshot_id)
    }

    /// Snapshot ids from the current snapshot back through its parents.
    pub fn ancestry(&self) -> Vec<i64> {
        let mut chain = Vec::new();
        let mut next = self.current_snapshot_id;
        while let Some(id) = next {
            if chain.contains(&id) {
                break;
            }
            chain.push(id);
            next = self.snapshot(id).and_then(|s| s.parent_snapshot_id);
        }
        chain
    }
}

/// Iceberg schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct IcebergSchema {
    #[serde(rename = "type")]
    pub tag: StructTag,
    pub schema_id: i32,
    pub fields: Vec<NestedField>,
}

impl IcebergSchema {
    pub fn new(schema_id: i32, fields: Vec<NestedField>) -> Self {
        Self {
            tag: StructTag::Struct,
            schema_id,
            fields,
        }
    }

    /// Highest field id used anywhere in the schema.
    pub fn max_field_id(&self) -> i32 {
        fn walk(t: &IcebergType) -> i32 {
            match t {
                IcebergType::Primitive(_) => 0,
                IcebergType::List(l) => l.element_id.max(walk(&l.element)),
                IcebergType::Struct(s) => s
                    .fields
                    .iter()
                    .map(|f| f.id.max(walk(&f.field_type)))
                    .max()
                    .unwrap_or(0),
            }
        }
        self.fields
            .iter()
            .map(|f| f.id.max(walk(&f.field_type)))
            .max()
            .unwrap_or(0)
    }
}

/// Field of a schema or struct.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NestedField {
    pub id: i32,
    pub name: String,
    pub required: bool,
    #[serde(rename = "type")]
    pub field_type: IcebergType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc: Option<String>,
}

/// Field type: a primitive name or a nested list/struct object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IcebergType {
    Primitive(PrimitiveType),
    List(ListType),
    Struct(StructType),
}

/// Primitive types produced by inference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrimitiveType {
    Boolean,
    Long,
    Double,
    String,
    Timestamptz,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StructTag {
    #[default]
    Struct,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListTag {
    #[default]
    List,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ListType {
    #[serde(rename = "type")]
    pub tag: ListTag,
    pub element_id: i32,
    pub element: Box<IcebergType>,
    pub element_required: bool,
}

impl ListType {
    pub fn new(element_id: i32, element: IcebergType, element_required: bool) -> Self {
        Self {
            tag: ListTag::List,
            element_id,
            element: Box::new(element),
            element_required,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructType {
    #[serde(rename = "type")]
    pub tag: StructTag,
    pub fields: Vec<NestedField>,
}

impl StructType {
    pub fn new(fields: Vec<NestedField>) -> Self {
        Self {
            tag: StructTag::Struct,
            fields,
        }
    }
}

/// Partition spec. Tables are unpartitioned so `fields` stays empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PartitionSpec {
    pub spec_id: i32,
    #[serde(default)]
    pub fields: Vec<serde_json::Value>,
}

impl PartitionSpec {
    pub fn unpartitioned() -> Self {
        Self {
            spec_id: 0,
            fields: Vec::new(),
        }
    }
}

/// Sort order. Tables are unsorted so `fields` stays empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SortOrder {
    pub order_id: i32,
    #[serde(default)]
    pub fields: Vec<serde_json::Value>,
}

impl SortOrder {
    pub fn unsorted() -> Self {
        Self {
            order_id: 0,
            fields: Vec::new(),
        }
    }
}

/// Named reference to a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SnapshotRef {
    pub snapshot_id: i64,
    #[serde(rename = "type")]
    pub ref_type: String,
}

impl SnapshotRef {
    pub fn branch(snapshot_id: i64) -> Self {
        Self {
            snapshot_id,
            ref_type: "branch".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Snapshot {
    pub snapshot_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_snapshot_id: Option<i64>,
    pub sequence_number: i64,
    pub timestamp_ms: i64,
    pub manifest_list: String,
    pub summary: SnapshotSummary,
    pub schema_id: i32,
}

impl Snapshot {
    pub fn operation(&self) -> Operation {
        self.summary.operation
    }

    /// `total-records` from the summary, when present.
    pub fn total_records(&self) -> Option<u64> {
        self.summary
            .properties
            .get("total-records")
            .and_then(|v| v.parse().ok())
    }
}

/// Snapshot summary: the operation plus string-valued counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotSummary {
    pub operation: Operation,
    #[serde(flatten)]
    pub properties: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Append,
    Overwrite,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Append => f.write_str("APPEND"),
            Operation::Overwrite => f.write_str("OVERWRITE"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SnapshotLogEntry {
    pub timestamp_ms: i64,
    pub snapshot_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MetadataLogEntry {
    pub timestamp_ms: i64,
    pub metadata_file: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_schema_json_shape() {
        let schema = IcebergSchema::new(
            0,
            vec![
                NestedField {
                    id: 1,
                    name: "id".into(),
                    required: true,
                    field_type: IcebergType::Primitive(PrimitiveType::Long),
                    doc: None,
                },
                NestedField {
                    id: 2,
                    name: "tags".into(),
                    required: false,
                    field_type: IcebergType::List(ListType::new(
                        3,
                        IcebergType::Primitive(PrimitiveType::String),
                        true,
                    )),
                    doc: None,
                },
            ],
        );

        let value = serde_json::to_value(&schema).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "struct",
                "schema-id": 0,
                "fields": [
                    {"id": 1, "name": "id", "required": true, "type": "long"},
                    {"id": 2, "name": "tags", "required": false, "type": {
                        "type": "list",
                        "element-id": 3,
                        "element": "string",
                        "element-required": true
                    }}
                ]
            })
        );

        let parsed: IcebergSchema = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, schema);
        assert_eq!(parsed.max_field_id(), 3);
    }

    #[test]
    fn test_nested_struct_type_parses() {
        let value = json!({
            "type": "struct",
            "fields": [{"id": 5, "name": "city", "required": false, "type": "string"}]
        });
        let parsed: IcebergType = serde_json::from_value(value).unwrap();
        assert!(matches!(parsed, IcebergType::Struct(ref s) if s.fields[0].id == 5));
    }

    #[test]
    fn test_snapshot_summary_flattens() {
        let summary = SnapshotSummary {
            operation: Operation::Append,
            properties: [("added-records".to_string(), "2".to_string())]
                .into_iter()
                .collect(),
        };
        let value = serde_json::to_value(&summary).unwrap();
        assert_eq!(value, json!({"operation": "append", "added-records": "2"}));
        assert_eq!(Operation::Append.to_string(), "APPEND");
    }

    #[test]
    fn test_ancestry_stops_on_cycle() {
        let snapshot = |id: i64, parent: Option<i64>| Snapshot {
            snapshot_id: id,
            parent_snapshot_id: parent,
            sequence_number: id,
            timestamp_ms: 0,
            manifest_list: format!("snap-{}-manifest-list.json", id),
            summary: SnapshotSummary {
                operation: Operation::Append,
                properties: BTreeMap::new(),
            },
            schema_id: 0,
        };
        let metadata = TableMetadata {
            format_version: FORMAT_VERSION,
            table_uuid: Uuid::new_v4(),
            location: "memory://b/t".into(),
            last_sequence_number: 2,
            last_updated_ms: 0,
            last_column_id: 0,
            current_schema_id: 0,
            schemas: vec![IcebergSchema::new(0, vec![])],
            default_spec_id: 0,
            partition_specs: vec![PartitionSpec::unpartitioned()],
            last_partition_id: UNPARTITIONED_LAST_PARTITION_ID,
            default_sort_order_id: 0,
            sort_orders: vec![SortOrder::unsorted()],
            properties: BTreeMap::new(),
            current_snapshot_id: Some(2),
            refs: BTreeMap::new(),
            snapshots: vec![snapshot(1, Some(2)), snapshot(2, Some(1))],
            snapshot_log: vec![],
            metadata_log: vec![],
        };
        assert_eq!(metadata.ancestry(), vec![2, 1]);
    }
}
