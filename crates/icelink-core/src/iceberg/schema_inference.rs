//! Schema inference from JSON records.
//!
//! Scans the records, collects the kinds observed at every path and unifies
//! them into a column schema:
//! - INT64 and FLOAT64 promote to FLOAT64
//! - STRING and TIMESTAMP widen to STRING
//! - null or a missing key makes the column nullable
//! - any other mix is a conflict, never a silent coercion to STRING
//!
//! Columns are emitted in first-seen order, depth-first within a record.

use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::fmt;
use tracing::{debug, warn};

use super::schema::{ColumnDescriptor, ColumnType, FieldPath, StructField, TableSchema};
use crate::config::{NestedColumns, SchemaConfig};
use crate::error::SchemaError;

/// Kind of a single JSON value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Null,
    Bool,
    Int,
    Float,
    String,
    Timestamp,
    Array,
    Object,
}

impl Kind {
    fn of(value: &Value, detect_timestamps: bool) -> Self {
        match value {
            Value::Null => Kind::Null,
            Value::Bool(_) => Kind::Bool,
            Value::Number(n) if n.is_i64() => Kind::Int,
            // u64 beyond i64 range and fractions
            Value::Number(_) => Kind::Float,
            Value::String(s) if detect_timestamps && is_timestamp(s) => Kind::Timestamp,
            Value::String(_) => Kind::String,
            Value::Array(_) => Kind::Array,
            Value::Object(_) => Kind::Object,
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Kind::Null => "NULL",
            Kind::Bool => "BOOL",
            Kind::Int => "INT64",
            Kind::Float => "FLOAT64",
            Kind::String => "STRING",
            Kind::Timestamp => "TIMESTAMP",
            Kind::Array => "ARRAY",
            Kind::Object => "STRUCT",
        };
        f.write_str(name)
    }
}

fn is_timestamp(s: &str) -> bool {
    chrono::DateTime::parse_from_rfc3339(s).is_ok()
}

/// Observations at one path.
#[derive(Debug, Default)]
struct FieldStats {
    /// Distinct kinds in first-seen order
    kinds: Vec<Kind>,
    observations: usize,
    nulls: usize,
    objects: usize,
    children: Vec<(String, FieldStats)>,
    /// Merged observations of every array element at this path
    element: Option<Box<FieldStats>>,
}

impl FieldStats {
    fn observe(&mut self, value: &Value, detect_timestamps: bool) {
        self.observations += 1;
        let kind = Kind::of(value, detect_timestamps);
        if !self.kinds.contains(&kind) {
            self.kinds.push(kind);
        }

        match value {
            Value::Null => self.nulls += 1,
            Value::Array(items) => {
                let element = self.element.get_or_insert_with(Default::default);
                for item in items {
                    element.observe(item, detect_timestamps);
                }
            }
            Value::Object(map) => {
                self.objects += 1;
                for (key, child) in map {
                    self.child_mut(key).observe(child, detect_timestamps);
                }
            }
            _ => {}
        }
    }

    fn child_mut(&mut self, key: &str) -> &mut FieldStats {
        let index = match self.children.iter().position(|(k, _)| k == key) {
            Some(index) => index,
            None => {
                self.children.push((key.to_string(), FieldStats::default()));
                self.children.len() - 1
            }
        };
        &mut self.children[index].1
    }

    fn non_null_kinds(&self) -> Vec<Kind> {
        self.kinds
            .iter()
            .copied()
            .filter(|k| *k != Kind::Null)
            .collect()
    }

    fn is_object(&self) -> bool {
        self.non_null_kinds() == [Kind::Object]
    }

    /// Nullable within a parent seen `parent_objects` times.
    fn nullable_in(&self, parent_objects: usize) -> bool {
        self.nulls > 0 || self.observations < parent_objects
    }
}

/// Inference options.
#[derive(Debug, Clone)]
pub struct InferenceOptions {
    /// Records scanned; all when `None`
    pub sample_size: Option<usize>,
    pub nested_columns: NestedColumns,
    pub separator: String,
    pub detect_timestamps: bool,
}

impl Default for InferenceOptions {
    fn default() -> Self {
        Self::from(&SchemaConfig::default())
    }
}

impl From<&SchemaConfig> for InferenceOptions {
    fn from(config: &SchemaConfig) -> Self {
        Self {
            sample_size: config.sample_size,
            nested_columns: config.nested_columns,
            separator: config.column_separator.clone(),
            detect_timestamps: config.detect_timestamps,
        }
    }
}

/// Infers a [`TableSchema`] from JSON records.
#[derive(Debug, Clone, Default)]
pub struct SchemaInferencer {
    options: InferenceOptions,
}

impl SchemaInferencer {
    pub fn new(options: InferenceOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &InferenceOptions {
        &self.options
    }

    /// Infer the schema of `records`. Pure and deterministic.
    pub fn infer(&self, records: &[Value]) -> Result<TableSchema, SchemaError> {
        if records.is_empty() {
            return Err(SchemaError::Empty);
        }

        let sample = self.options.sample_size.unwrap_or(records.len());
        let mut root = FieldStats::default();
        for (index, record) in records.iter().take(sample).enumerate() {
            if !record.is_object() {
                return Err(SchemaError::NotAnObject { index });
            }
            root.observe(record, self.options.detect_timestamps);
        }

        let mut columns = Vec::new();
        for (key, child) in &root.children {
            let nullable = child.nullable_in(root.objects);
            self.collect(child, FieldPath::root().child(key), nullable, &mut columns)?;
        }

        check_collisions(&columns)?;

        debug!(
            scanned = root.objects,
            columns = columns.len(),
            "Inferred schema"
        );
        Ok(TableSchema::new(columns))
    }

    fn collect(
        &self,
        stats: &FieldStats,
        path: FieldPath,
        nullable: bool,
        out: &mut Vec<ColumnDescriptor>,
    ) -> Result<(), SchemaError> {
        if self.options.nested_columns == NestedColumns::Flatten && stats.is_object() {
            for (key, child) in &stats.children {
                let child_nullable = nullable || child.nullable_in(stats.objects);
                self.collect(child, path.child(key), child_nullable, out)?;
            }
            if stats.children.is_empty() {
                warn!(path = %path, "Dropping path that only holds empty objects");
            }
            return Ok(());
        }

        match resolve(stats, &path.to_string(), false)? {
            Some(data_type) => out.push(ColumnDescriptor {
                name: path.join(&self.options.separator),
                data_type,
                nullable,
                source_path: path,
            }),
            None => warn!(path = %path, "Dropping path that only holds empty objects"),
        }
        Ok(())
    }

    /// Check every record against `schema`.
    ///
    /// Inference may have scanned only a sample. A value that does not fit
    /// its column, or a key with data but no column, is a conflict at that
    /// path.
    pub fn check_records(&self, schema: &TableSchema, records: &[Value]) -> Result<(), SchemaError> {
        let columns: HashSet<&FieldPath> = schema.columns.iter().map(|c| &c.source_path).collect();
        let parents: HashSet<FieldPath> = schema
            .columns
            .iter()
            .flat_map(|c| {
                let segments = c.source_path.segments();
                (1..segments.len()).map(move |len| {
                    segments[..len]
                        .iter()
                        .fold(FieldPath::root(), |path, key| path.child(key))
                })
            })
            .collect();

        for (index, record) in records.iter().enumerate() {
            let Value::Object(object) = record else {
                return Err(SchemaError::NotAnObject { index });
            };
            self.check_keys(object, &FieldPath::root(), &columns, &parents)?;
            for column in &schema.columns {
                let value = column.source_path.lookup(record).unwrap_or(&Value::Null);
                self.check_value(
                    value,
                    &column.data_type,
                    column.nullable,
                    &column.source_path.to_string(),
                )?;
            }
        }

        debug!(records = records.len(), "Records match the schema");
        Ok(())
    }

    fn check_value(
        &self,
        value: &Value,
        data_type: &ColumnType,
        nullable: bool,
        path: &str,
    ) -> Result<(), SchemaError> {
        let kind = Kind::of(value, self.options.detect_timestamps);
        let mismatch = || SchemaError::Conflict {
            path: path.to_string(),
            types: vec![data_type.to_string(), kind.to_string()],
        };

        match (data_type, value) {
            (_, Value::Null) if nullable => Ok(()),
            (_, Value::Null) => Err(mismatch()),
            (ColumnType::Int64, _) if kind == Kind::Int => Ok(()),
            (ColumnType::Float64, _) if matches!(kind, Kind::Int | Kind::Float) => Ok(()),
            (ColumnType::String, _) if matches!(kind, Kind::String | Kind::Timestamp) => Ok(()),
            (ColumnType::Bool, _) if kind == Kind::Bool => Ok(()),
            (ColumnType::Timestamp, _) if kind == Kind::Timestamp => Ok(()),
            (
                ColumnType::Array {
                    element,
                    contains_null,
                },
                Value::Array(items),
            ) => items
                .iter()
                .try_for_each(|item| self.check_value(item, element, *contains_null, path)),
            (ColumnType::Struct(fields), Value::Object(map)) => {
                for field in fields {
                    self.check_value(
                        map.get(&field.name).unwrap_or(&Value::Null),
                        &field.data_type,
                        field.nullable,
                        &format!("{}.{}", path, field.name),
                    )?;
                }
                match map
                    .iter()
                    .find(|(key, child)| !fields.iter().any(|f| &f.name == *key) && holds_data(child))
                {
                    Some((key, child)) => Err(self.unknown_key(&format!("{}.{}", path, key), child)),
                    None => Ok(()),
                }
            }
            _ => Err(mismatch()),
        }
    }

    fn check_keys(
        &self,
        object: &Map<String, Value>,
        path: &FieldPath,
        columns: &HashSet<&FieldPath>,
        parents: &HashSet<FieldPath>,
    ) -> Result<(), SchemaError> {
        for (key, value) in object {
            let child = path.child(key);
            if columns.contains(&child) {
                continue;
            }
            if parents.contains(&child) {
                match value {
                    Value::Object(map) => self.check_keys(map, &child, columns, parents)?,
                    Value::Null => {}
                    other => {
                        return Err(SchemaError::Conflict {
                            path: child.to_string(),
                            types: vec![
                                Kind::Object.to_string(),
                                Kind::of(other, self.options.detect_timestamps).to_string(),
                            ],
                        })
                    }
                }
            } else if holds_data(value) {
                return Err(self.unknown_key(&child.to_string(), value));
            }
        }
        Ok(())
    }

    fn unknown_key(&self, path: &str, value: &Value) -> SchemaError {
        SchemaError::Conflict {
            path: path.to_string(),
            types: vec![
                "no column".to_string(),
                Kind::of(value, self.options.detect_timestamps).to_string(),
            ],
        }
    }
}

/// Whether dropping `value` would lose anything.
fn holds_data(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Object(map) => map.values().any(holds_data),
        Value::Array(items) => items.iter().any(holds_data),
        _ => true,
    }
}

/// Unify the kinds at one path. `None` for objects that never had keys.
fn resolve(stats: &FieldStats, path: &str, array_element: bool) -> Result<Option<ColumnType>, SchemaError> {
    let kinds = stats.non_null_kinds();
    let all = |allowed: &[Kind]| kinds.iter().all(|k| allowed.contains(k));

    let data_type = if kinds.is_empty() {
        // Only nulls seen
        ColumnType::String
    } else if all(&[Kind::Int, Kind::Float]) {
        if kinds.contains(&Kind::Float) {
            ColumnType::Float64
        } else {
            ColumnType::Int64
        }
    } else if all(&[Kind::String, Kind::Timestamp]) {
        if kinds == [Kind::Timestamp] {
            ColumnType::Timestamp
        } else {
            ColumnType::String
        }
    } else if kinds == [Kind::Bool] {
        ColumnType::Bool
    } else if kinds == [Kind::Array] {
        match stats.element.as_deref() {
            Some(element) if element.observations > 0 => match resolve(element, path, true)? {
                Some(element_type) => ColumnType::Array {
                    element: Box::new(element_type),
                    contains_null: element.nulls > 0,
                },
                None => return Ok(None),
            },
            // Only empty arrays seen
            _ => ColumnType::Array {
                element: Box::new(ColumnType::String),
                contains_null: true,
            },
        }
    } else if kinds == [Kind::Object] {
        let mut fields = Vec::new();
        for (key, child) in &stats.children {
            let child_path = format!("{}.{}", path, key);
            if let Some(data_type) = resolve(child, &child_path, false)? {
                fields.push(StructField {
                    name: key.clone(),
                    data_type,
                    nullable: child.nullable_in(stats.objects),
                });
            }
        }
        if fields.is_empty() {
            return Ok(None);
        }
        ColumnType::Struct(fields)
    } else {
        let types = kinds.iter().map(Kind::to_string).collect();
        let path = path.to_string();
        return Err(if array_element {
            SchemaError::HeterogeneousArray { path, types }
        } else {
            SchemaError::Conflict { path, types }
        });
    };

    Ok(Some(data_type))
}

fn check_collisions(columns: &[ColumnDescriptor]) -> Result<(), SchemaError> {
    let mut seen: HashMap<&str, &FieldPath> = HashMap::new();
    for column in columns {
        if let Some(first) = seen.insert(column.name.as_str(), &column.source_path) {
            return Err(SchemaError::NameCollision {
                name: column.name.clone(),
                first: first.to_string(),
                second: column.source_path.to_string(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn infer(records: Vec<Value>) -> Result<TableSchema, SchemaError> {
        SchemaInferencer::default().infer(&records)
    }

    fn summary(schema: &TableSchema) -> Vec<(String, String, bool)> {
        schema
            .columns
            .iter()
            .map(|c| (c.name.clone(), c.data_type.to_string(), c.nullable))
            .collect()
    }

    #[test]
    fn test_employee_records() {
        let schema = infer(vec![
            json!({"id": 1, "name": "A", "age": 30}),
            json!({"id": 2, "name": "B", "age": null}),
        ])
        .unwrap();

        assert_eq!(
            summary(&schema),
            vec![
                ("id".into(), "INT64".into(), false),
                ("name".into(), "STRING".into(), false),
                ("age".into(), "INT64".into(), true),
            ]
        );
        assert_eq!(schema.schema_id, 0);
    }

    #[test]
    fn test_int_float_promotion() {
        let schema = infer(vec![json!({"x": 5}), json!({"x": 5.5})]).unwrap();
        assert_eq!(summary(&schema), vec![("x".into(), "FLOAT64".into(), false)]);
    }

    #[test]
    fn test_null_makes_nullable() {
        let schema = infer(vec![json!({"x": 5}), json!({"x": null})]).unwrap();
        assert_eq!(summary(&schema), vec![("x".into(), "INT64".into(), true)]);
    }

    #[test]
    fn test_missing_key_makes_nullable() {
        let schema = infer(vec![json!({"x": 1, "y": true}), json!({"x": 2})]).unwrap();
        assert_eq!(
            summary(&schema),
            vec![
                ("x".into(), "INT64".into(), false),
                ("y".into(), "BOOL".into(), true),
            ]
        );
    }

    #[test]
    fn test_string_vs_struct_conflict() {
        let err = infer(vec![json!({"x": "x"}), json!({"x": {"y": 1}})]).unwrap_err();
        assert_eq!(
            err,
            SchemaError::Conflict {
                path: "x".into(),
                types: vec!["STRING".into(), "STRUCT".into()],
            }
        );
    }

    #[test]
    fn test_no_silent_string_coercion() {
        let err = infer(vec![json!({"v": 1}), json!({"v": "one"})]).unwrap_err();
        assert!(matches!(err, SchemaError::Conflict { ref path, .. } if path == "v"));
    }

    #[test]
    fn test_deterministic() {
        let records = vec![
            json!({"b": 1, "a": {"z": "x", "y": [1, 2]}}),
            json!({"c": "2024-01-15T10:30:00Z", "a": {"y": [3.5]}}),
        ];
        let first = SchemaInferencer::default().infer(&records).unwrap();
        let second = SchemaInferencer::default().infer(&records).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_first_seen_depth_first_order() {
        let schema = infer(vec![
            json!({"b": 1, "a": {"z": "x", "y": 2}}),
            json!({"c": true, "a": {"w": 1}}),
        ])
        .unwrap();
        let names: Vec<_> = schema.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["b", "a_z", "a_y", "a_w", "c"]);

        let a_w = schema.column("a_w").unwrap();
        assert!(a_w.nullable);
        assert_eq!(a_w.source_path.to_string(), "a.w");
    }

    #[test]
    fn test_struct_mode() {
        let inferencer = SchemaInferencer::new(InferenceOptions {
            nested_columns: NestedColumns::Struct,
            ..InferenceOptions::default()
        });
        let schema = inferencer
            .infer(&[
                json!({"address": {"city": "Oslo", "zip": 150}}),
                json!({"address": {"city": "Bergen"}}),
            ])
            .unwrap();

        assert_eq!(
            summary(&schema),
            vec![("address".into(), "STRUCT<city STRING, zip INT64>".into(), false)]
        );
        match &schema.columns[0].data_type {
            ColumnType::Struct(fields) => {
                assert!(!fields[0].nullable);
                assert!(fields[1].nullable);
            }
            other => panic!("expected struct, got {}", other),
        }
    }

    #[test]
    fn test_arrays() {
        let schema = infer(vec![
            json!({"tags": ["a", "b"], "scores": [1, 2.5], "empty": []}),
            json!({"tags": [], "scores": [3], "empty": []}),
        ])
        .unwrap();

        assert_eq!(
            summary(&schema),
            vec![
                ("tags".into(), "ARRAY<STRING>".into(), false),
                ("scores".into(), "ARRAY<FLOAT64>".into(), false),
                ("empty".into(), "ARRAY<STRING>".into(), false),
            ]
        );
    }

    #[test]
    fn test_heterogeneous_array() {
        let err = infer(vec![json!({"mixed": [1, "a"]})]).unwrap_err();
        assert_eq!(
            err,
            SchemaError::HeterogeneousArray {
                path: "mixed".into(),
                types: vec!["INT64".into(), "STRING".into()],
            }
        );
    }

    #[test]
    fn test_array_of_objects_conflict_names_nested_path() {
        let err = infer(vec![json!({"items": [{"q": 1}, {"q": "x"}]})]).unwrap_err();
        assert!(matches!(err, SchemaError::Conflict { ref path, .. } if path == "items.q"));
    }

    #[test]
    fn test_timestamps() {
        let schema = infer(vec![
            json!({"at": "2024-01-15T10:30:00Z", "label": "2024-01-15T10:30:00Z"}),
            json!({"at": "2024-02-01T00:00:00+02:00", "label": "soon"}),
        ])
        .unwrap();
        assert_eq!(
            summary(&schema),
            vec![
                ("at".into(), "TIMESTAMP".into(), false),
                ("label".into(), "STRING".into(), false),
            ]
        );

        let plain = SchemaInferencer::new(InferenceOptions {
            detect_timestamps: false,
            ..InferenceOptions::default()
        })
        .infer(&[json!({"at": "2024-01-15T10:30:00Z"})])
        .unwrap();
        assert_eq!(plain.columns[0].data_type, ColumnType::String);
    }

    #[test]
    fn test_null_only_column() {
        let schema = infer(vec![json!({"x": null}), json!({"x": null})]).unwrap();
        assert_eq!(summary(&schema), vec![("x".into(), "STRING".into(), true)]);
    }

    #[test]
    fn test_name_collision() {
        let err = infer(vec![json!({"a_b": 1, "a": {"b": 2}})]).unwrap_err();
        assert_eq!(
            err,
            SchemaError::NameCollision {
                name: "a_b".into(),
                first: "a_b".into(),
                second: "a.b".into(),
            }
        );
    }

    #[test]
    fn test_sample_size() {
        let inferencer = SchemaInferencer::new(InferenceOptions {
            sample_size: Some(1),
            ..InferenceOptions::default()
        });
        let schema = inferencer
            .infer(&[json!({"x": 1}), json!({"x": "ignored", "y": 2})])
            .unwrap();
        assert_eq!(summary(&schema), vec![("x".into(), "INT64".into(), false)]);
    }

    #[test]
    fn test_records_outside_sample_are_checked() {
        let inferencer = SchemaInferencer::new(InferenceOptions {
            sample_size: Some(1),
            ..InferenceOptions::default()
        });
        let records = vec![json!({"x": 5}), json!({"x": 5.5, "y": "dropped"})];
        let schema = inferencer.infer(&records).unwrap();

        assert_eq!(
            inferencer.check_records(&schema, &records).unwrap_err(),
            SchemaError::Conflict {
                path: "y".into(),
                types: vec!["no column".into(), "STRING".into()],
            }
        );

        let records = vec![json!({"x": 5}), json!({"x": 5.5})];
        assert_eq!(
            inferencer.check_records(&schema, &records).unwrap_err(),
            SchemaError::Conflict {
                path: "x".into(),
                types: vec!["INT64".into(), "FLOAT64".into()],
            }
        );
    }

    #[test]
    fn test_check_records_accepts_inferred_records() {
        let records = vec![
            json!({"id": 1, "score": 2, "address": {"city": "Leeds"}, "tags": ["a"]}),
            json!({"id": 2, "score": 2.5, "address": null, "tags": [], "extra": {}}),
        ];
        let inferencer = SchemaInferencer::default();
        let schema = inferencer.infer(&records).unwrap();
        assert!(inferencer.check_records(&schema, &records).is_ok());
    }

    #[test]
    fn test_check_records_nested_paths() {
        let inferencer = SchemaInferencer::new(InferenceOptions {
            sample_size: Some(1),
            ..InferenceOptions::default()
        });
        let schema = inferencer
            .infer(&[json!({"address": {"city": "Leeds"}})])
            .unwrap();

        assert_eq!(
            inferencer
                .check_records(&schema, &[json!({"address": "Leeds"})])
                .unwrap_err(),
            SchemaError::Conflict {
                path: "address".into(),
                types: vec!["STRUCT".into(), "STRING".into()],
            }
        );
        assert_eq!(
            inferencer
                .check_records(&schema, &[json!({"address": {"city": "York", "zip": "Y1"}})])
                .unwrap_err(),
            SchemaError::Conflict {
                path: "address.zip".into(),
                types: vec!["no column".into(), "STRING".into()],
            }
        );
        assert!(inferencer
            .check_records(&schema, &[json!({"address": {"city": null}})])
            .is_err());
    }

    #[test]
    fn test_check_records_struct_mode() {
        let inferencer = SchemaInferencer::new(InferenceOptions {
            sample_size: Some(1),
            nested_columns: NestedColumns::Struct,
            ..InferenceOptions::default()
        });
        let schema = inferencer.infer(&[json!({"pos": {"x": 1}})]).unwrap();
        assert_eq!(
            inferencer
                .check_records(&schema, &[json!({"pos": {"x": 1, "y": 2}})])
                .unwrap_err(),
            SchemaError::Conflict {
                path: "pos.y".into(),
                types: vec!["no column".into(), "INT64".into()],
            }
        );
    }

    #[test]
    fn test_rejects_non_objects() {
        assert_eq!(infer(vec![]).unwrap_err(), SchemaError::Empty);
        assert_eq!(
            infer(vec![json!({"x": 1}), json!([1, 2])]).unwrap_err(),
            SchemaError::NotAnObject { index: 1 }
        );
    }
}
