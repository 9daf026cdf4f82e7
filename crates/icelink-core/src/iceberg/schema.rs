//! Column schema inferred from JSON records and its Iceberg form.

use serde::Serialize;
use std::fmt;

use super::metadata::{
    IcebergSchema, IcebergType, ListType, NestedField, PrimitiveType, StructType,
};

/// Column data type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ColumnType {
    Int64,
    Float64,
    String,
    Bool,
    Timestamp,
    Array {
        element: Box<ColumnType>,
        contains_null: bool,
    },
    Struct(Vec<StructField>),
}

/// Field of a STRUCT column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StructField {
    pub name: String,
    pub data_type: ColumnType,
    pub nullable: bool,
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnType::Int64 => f.write_str("INT64"),
            ColumnType::Float64 => f.write_str("FLOAT64"),
            ColumnType::String => f.write_str("STRING"),
            ColumnType::Bool => f.write_str("BOOL"),
            ColumnType::Timestamp => f.write_str("TIMESTAMP"),
            ColumnType::Array { element, .. } => write!(f, "ARRAY<{}>", element),
            ColumnType::Struct(fields) => {
                f.write_str("STRUCT<")?;
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{} {}", field.name, field.data_type)?;
                }
                f.write_str(">")
            }
        }
    }
}

/// Path of a value inside a record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct FieldPath(Vec<String>);

impl FieldPath {
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn child(&self, key: &str) -> Self {
        let mut segments = self.0.clone();
        segments.push(key.to_string());
        Self(segments)
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// Segments joined by `separator`.
    pub fn join(&self, separator: &str) -> String {
        self.0.join(separator)
    }

    /// Value at this path, if every segment is present.
    pub fn lookup<'a>(&self, record: &'a serde_json::Value) -> Option<&'a serde_json::Value> {
        self.0
            .iter()
            .try_fold(record, |value, key| value.as_object()?.get(key))
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("."))
    }
}

/// One output column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnDescriptor {
    pub name: String,
    pub data_type: ColumnType,
    pub nullable: bool,
    pub source_path: FieldPath,
}

/// Ordered column list with its schema id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableSchema {
    pub schema_id: i32,
    pub columns: Vec<ColumnDescriptor>,
}

impl TableSchema {
    pub fn new(columns: Vec<ColumnDescriptor>) -> Self {
        Self {
            schema_id: 0,
            columns,
        }
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDescriptor> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Iceberg schema with field ids assigned depth-first from `last_column_id + 1`.
    ///
    /// Top-level columns whose name and shape match a field of `base` keep
    /// that field's ids.
    pub fn to_iceberg(
        &self,
        schema_id: i32,
        base: Option<&IcebergSchema>,
        last_column_id: &mut i32,
    ) -> IcebergSchema {
        let fields = self
            .columns
            .iter()
            .map(|column| {
                let reused = base.and_then(|b| {
                    b.fields.iter().find(|f| {
                        f.name == column.name
                            && f.required == !column.nullable
                            && same_shape(&f.field_type, &column.data_type)
                    })
                });
                match reused {
                    Some(field) => field.clone(),
                    None => {
                        let id = next_id(last_column_id);
                        NestedField {
                            id,
                            name: column.name.clone(),
                            required: !column.nullable,
                            field_type: iceberg_type(&column.data_type, last_column_id),
                            doc: None,
                        }
                    }
                }
            })
            .collect();

        IcebergSchema::new(schema_id, fields)
    }

    /// Whether `schema` describes exactly these columns, ignoring field ids.
    pub fn matches(&self, schema: &IcebergSchema) -> bool {
        self.columns.len() == schema.fields.len()
            && self.columns.iter().zip(&schema.fields).all(|(c, f)| {
                c.name == f.name && c.nullable == !f.required && same_shape(&f.field_type, &c.data_type)
            })
    }
}

fn next_id(last: &mut i32) -> i32 {
    *last += 1;
    *last
}

fn iceberg_type(data_type: &ColumnType, last_column_id: &mut i32) -> IcebergType {
    match data_type {
        ColumnType::Int64 => IcebergType::Primitive(PrimitiveType::Long),
        ColumnType::Float64 => IcebergType::Primitive(PrimitiveType::Double),
        ColumnType::String => IcebergType::Primitive(PrimitiveType::String),
        ColumnType::Bool => IcebergType::Primitive(PrimitiveType::Boolean),
        ColumnType::Timestamp => IcebergType::Primitive(PrimitiveType::Timestamptz),
        ColumnType::Array {
            element,
            contains_null,
        } => {
            let element_id = next_id(last_column_id);
            IcebergType::List(ListType::new(
                element_id,
                iceberg_type(element, last_column_id),
                !contains_null,
            ))
        }
        ColumnType::Struct(fields) => {
            // Ids for direct children first, then their nested types
            let ids: Vec<i32> = fields.iter().map(|_| next_id(last_column_id)).collect();
            let nested = fields
                .iter()
                .zip(ids)
                .map(|(field, id)| NestedField {
                    id,
                    name: field.name.clone(),
                    required: !field.nullable,
                    field_type: iceberg_type(&field.data_type, last_column_id),
                    doc: None,
                })
                .collect();
            IcebergType::Struct(StructType::new(nested))
        }
    }
}

/// Structural equality between an Iceberg type and a column type.
fn same_shape(iceberg: &IcebergType, column: &ColumnType) -> bool {
    match (iceberg, column) {
        (IcebergType::Primitive(p), c) => matches!(
            (p, c),
            (PrimitiveType::Long, ColumnType::Int64)
                | (PrimitiveType::Double, ColumnType::Float64)
                | (PrimitiveType::String, ColumnType::String)
                | (PrimitiveType::Boolean, ColumnType::Bool)
                | (PrimitiveType::Timestamptz, ColumnType::Timestamp)
        ),
        (
            IcebergType::List(list),
            ColumnType::Array {
                element,
                contains_null,
            },
        ) => list.element_required == !contains_null && same_shape(&list.element, element),
        (IcebergType::Struct(st), ColumnType::Struct(fields)) => {
            st.fields.len() == fields.len()
                && st.fields.iter().zip(fields).all(|(n, f)| {
                    n.name == f.name && n.required == !f.nullable && same_shape(&n.field_type, &f.data_type)
                })
        }
        _ => false,
    }
}
