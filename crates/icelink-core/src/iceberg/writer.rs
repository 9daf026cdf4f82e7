//! Parquet data file writer.
//!
//! ## Write Flow
//!
//! 1. Project each record onto the schema's columns (flattened paths)
//! 2. Decode the rows into an Arrow RecordBatch typed by the Iceberg schema
//! 3. Encode Parquet bytes, carrying Iceberg field ids in the Parquet schema
//! 4. Upload under `data/` with a name derived from the row content
//!
//! Content-derived names make a re-run over the same input produce the same
//! paths, so callers can tell whether a batch is already committed.

use arrow::datatypes::{DataType, Field, Fields, Schema, SchemaRef, TimeUnit};
use arrow::json::ReaderBuilder;
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use crc32fast::Hasher;
use parquet::arrow::{ArrowWriter, PARQUET_FIELD_ID_META_KEY};
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

use super::layout::TableLayout;
use super::manifest::{ColumnStats, DataFile, FileFormat};
use super::metadata::{IcebergSchema, IcebergType, NestedField, PrimitiveType};
use super::schema::TableSchema;
use crate::config::{DataConfig, ParquetCompression};
use crate::storage::ObjectStorage;
use crate::{Error, Result};

/// A data file encoded in memory, not yet uploaded.
#[derive(Debug, Clone)]
pub struct EncodedFile {
    /// Bucket-relative path
    pub path: String,
    pub bytes: Bytes,
    pub data_file: DataFile,
}

/// Writes records as Parquet data files.
pub struct DataFileWriter {
    storage: Arc<dyn ObjectStorage>,
    compression: ParquetCompression,
    rows_per_file: usize,
}

impl DataFileWriter {
    pub fn new(storage: Arc<dyn ObjectStorage>, config: &DataConfig) -> Self {
        Self {
            storage,
            compression: config.compression,
            rows_per_file: config.rows_per_file.max(1),
        }
    }

    /// Encode records into Parquet files of at most `rows_per_file` rows.
    pub fn encode(
        &self,
        records: &[Value],
        schema: &TableSchema,
        iceberg: &IcebergSchema,
        layout: &TableLayout,
    ) -> Result<Vec<EncodedFile>> {
        let arrow_schema = arrow_schema(iceberg);

        records
            .chunks(self.rows_per_file)
            .enumerate()
            .map(|(index, chunk)| {
                let rows = project_rows(chunk, schema);
                let name = file_name(index, &rows, self.compression, iceberg.schema_id)?;
                let batch = to_record_batch(&rows, arrow_schema.clone())?;
                let bytes = self.to_parquet(&batch)?;
                let path = layout.data_file(&name);

                let data_file = DataFile {
                    file_path: layout.uri(&path),
                    file_format: FileFormat::Parquet,
                    record_count: batch.num_rows() as u64,
                    file_size_in_bytes: bytes.len() as u64,
                    column_stats: column_stats(&batch, iceberg),
                };

                debug!(
                    path = %path,
                    rows = data_file.record_count,
                    bytes = data_file.file_size_in_bytes,
                    "Encoded data file"
                );
                Ok(EncodedFile {
                    path,
                    bytes,
                    data_file,
                })
            })
            .collect()
    }

    /// Upload encoded files. Data files are write-once so existing ones are skipped.
    pub async fn upload(&self, files: &[EncodedFile]) -> Result<Vec<DataFile>> {
        let mut written = Vec::with_capacity(files.len());
        for file in files {
            if self.storage.exists(&file.path).await? {
                debug!(path = %file.path, "Data file already present");
            } else {
                self.storage.put(&file.path, file.bytes.clone()).await?;
            }
            written.push(file.data_file.clone());
        }

        info!(
            files = written.len(),
            records = written.iter().map(|f| f.record_count).sum::<u64>(),
            "Uploaded data files"
        );
        Ok(written)
    }

    fn to_parquet(&self, batch: &RecordBatch) -> Result<Bytes> {
        let compression = match self.compression {
            ParquetCompression::Snappy => Compression::SNAPPY,
            ParquetCompression::Gzip => Compression::GZIP(Default::default()),
            ParquetCompression::Lz4 => Compression::LZ4,
            ParquetCompression::Zstd => Compression::ZSTD(Default::default()),
            ParquetCompression::None => Compression::UNCOMPRESSED,
        };

        let props = WriterProperties::builder()
            .set_compression(compression)
            .set_max_row_group_size(128 * 1024)
            .build();

        let mut buffer = Vec::new();
        let mut writer = ArrowWriter::try_new(&mut buffer, batch.schema(), Some(props))?;
        writer.write(batch)?;
        writer.close()?;

        Ok(Bytes::from(buffer))
    }
}

/// Arrow schema for an Iceberg schema, with Parquet field ids in field metadata.
pub fn arrow_schema(schema: &IcebergSchema) -> SchemaRef {
    Arc::new(Schema::new(
        schema.fields.iter().map(arrow_field).collect::<Vec<_>>(),
    ))
}

fn arrow_field(field: &NestedField) -> Field {
    with_field_id(
        Field::new(&field.name, arrow_type(&field.field_type), !field.required),
        field.id,
    )
}

fn with_field_id(field: Field, id: i32) -> Field {
    field.with_metadata(HashMap::from([(
        PARQUET_FIELD_ID_META_KEY.to_string(),
        id.to_string(),
    )]))
}

fn arrow_type(field_type: &IcebergType) -> DataType {
    match field_type {
        IcebergType::Primitive(PrimitiveType::Long) => DataType::Int64,
        IcebergType::Primitive(PrimitiveType::Double) => DataType::Float64,
        IcebergType::Primitive(PrimitiveType::String) => DataType::Utf8,
        IcebergType::Primitive(PrimitiveType::Boolean) => DataType::Boolean,
        IcebergType::Primitive(PrimitiveType::Timestamptz) => {
            DataType::Timestamp(TimeUnit::Microsecond, Some("+00:00".into()))
        }
        IcebergType::List(list) => DataType::List(Arc::new(with_field_id(
            Field::new("element", arrow_type(&list.element), !list.element_required),
            list.element_id,
        ))),
        IcebergType::Struct(st) => DataType::Struct(Fields::from(
            st.fields.iter().map(arrow_field).collect::<Vec<_>>(),
        )),
    }
}

/// One JSON object per record keyed by column name. Missing paths become null.
fn project_rows(records: &[Value], schema: &TableSchema) -> Vec<Value> {
    records
        .iter()
        .map(|record| {
            let row: Map<String, Value> = schema
                .columns
                .iter()
                .map(|column| {
                    let value = column
                        .source_path
                        .lookup(record)
                        .cloned()
                        .unwrap_or(Value::Null);
                    (column.name.clone(), value)
                })
                .collect();
            Value::Object(row)
        })
        .collect()
}

/// Name derived from everything that shapes the file's bytes.
fn file_name(
    index: usize,
    rows: &[Value],
    compression: ParquetCompression,
    schema_id: i32,
) -> Result<String> {
    let mut hasher = Hasher::new();
    hasher.update(compression.as_str().as_bytes());
    hasher.update(&schema_id.to_le_bytes());
    for row in rows {
        hasher.update(&serde_json::to_vec(row)?);
        hasher.update(b"\n");
    }
    Ok(format!("part-{:05}-{:08x}.parquet", index, hasher.finalize()))
}

fn to_record_batch(rows: &[Value], schema: SchemaRef) -> Result<RecordBatch> {
    let mut decoder = ReaderBuilder::new(schema.clone())
        .with_batch_size(rows.len().max(1))
        .build_decoder()?;
    decoder.serialize(rows)?;
    match decoder.flush()? {
        Some(batch) => Ok(batch),
        None => Ok(RecordBatch::new_empty(schema)),
    }
}

fn column_stats(batch: &RecordBatch, schema: &IcebergSchema) -> BTreeMap<i32, ColumnStats> {
    schema
        .fields
        .iter()
        .zip(batch.columns())
        .map(|(field, column)| {
            (
                field.id,
                ColumnStats {
                    value_count: column.len() as u64,
                    null_count: column.null_count() as u64,
                },
            )
        })
        .collect()
}

/// Count the rows of a Parquet file by decoding every batch.
pub fn parquet_row_count(bytes: Bytes) -> Result<u64> {
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;

    let reader = ParquetRecordBatchReaderBuilder::try_new(bytes)?.build()?;
    let mut rows = 0u64;
    for batch in reader {
        rows += batch?.num_rows() as u64;
    }
    Ok(rows)
}

/// Decode Parquet bytes back into JSON rows.
pub fn read_rows(bytes: Bytes, limit: usize) -> Result<Vec<Map<String, Value>>> {
    use arrow::json::ArrayWriter;
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;

    let reader = ParquetRecordBatchReaderBuilder::try_new(bytes)?.build()?;
    let mut rows = Vec::new();
    for batch in reader {
        let batch = batch?;
        let mut writer = ArrayWriter::new(Vec::new());
        writer.write(&batch)?;
        writer.finish()?;
        let decoded: Vec<Map<String, Value>> = serde_json::from_slice(&writer.into_inner())
            .map_err(|e| Error::DataFile(e.to_string()))?;
        rows.extend(decoded);
        if rows.len() >= limit {
            rows.truncate(limit);
            break;
        }
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iceberg::schema_inference::SchemaInferencer;
    use crate::storage::MemoryStorage;
    use serde_json::json;

    fn setup(rows_per_file: usize) -> (MemoryStorage, DataFileWriter, TableLayout) {
        let storage = MemoryStorage::with_bucket("lake");
        let config = DataConfig {
            rows_per_file,
            ..DataConfig::default()
        };
        let writer = DataFileWriter::new(Arc::new(storage.clone()), &config);
        let layout = TableLayout::new(&storage, "iceberg-tables", "t");
        (storage, writer, layout)
    }

    fn employees() -> Vec<Value> {
        vec![
            json!({"id": 1, "name": "A", "age": 30, "joined": "2024-01-15T10:30:00Z"}),
            json!({"id": 2, "name": "B", "age": null, "joined": "2024-02-01T08:00:00Z"}),
            json!({"id": 3, "name": "C", "address": {"city": "Oslo"}, "joined": "2024-03-01T00:00:00Z", "tags": ["x"]}),
        ]
    }

    #[tokio::test]
    async fn test_write_parquet() {
        let (storage, writer, layout) = setup(1000);
        let records = employees();
        let schema = SchemaInferencer::default().infer(&records).unwrap();
        let mut last = 0;
        let iceberg = schema.to_iceberg(0, None, &mut last);

        let encoded = writer.encode(&records, &schema, &iceberg, &layout).unwrap();
        let files = writer.upload(&encoded).await.unwrap();
        assert_eq!(files.len(), 1);

        let file = &files[0];
        assert_eq!(file.record_count, 3);
        assert!(file.file_path.starts_with("memory://lake/iceberg-tables/t/data/part-00000-"));
        assert!(file.file_path.ends_with(".parquet"));

        // age (field 3) has one null and one missing value
        assert_eq!(
            file.column_stats[&3],
            ColumnStats {
                value_count: 3,
                null_count: 2
            }
        );

        let path = layout.resolve(&file.file_path).unwrap();
        let bytes = storage.get(&path).await.unwrap();
        assert_eq!(&bytes[0..4], b"PAR1");
        assert_eq!(bytes.len() as u64, file.file_size_in_bytes);

        assert_eq!(parquet_row_count(bytes.clone()).unwrap(), 3);
        assert!(parquet_row_count(Bytes::from_static(b"garbage")).is_err());

        let rows = read_rows(bytes, 10).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0]["name"], json!("A"));
        assert_eq!(rows[2]["address_city"], json!("Oslo"));
    }

    #[test]
    fn test_names_are_content_addressed() {
        let (_, writer, layout) = setup(2);
        let records = employees();
        let schema = SchemaInferencer::default().infer(&records).unwrap();
        let mut last = 0;
        let iceberg = schema.to_iceberg(0, None, &mut last);

        let first = writer.encode(&records, &schema, &iceberg, &layout).unwrap();
        let second = writer.encode(&records, &schema, &iceberg, &layout).unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].path, second[0].path);
        assert_eq!(first[1].data_file.record_count, 1);
        assert!(first[1].path.contains("part-00001-"));

        let changed = vec![json!({"id": 9, "name": "Z", "age": 1, "joined": "2024-01-15T10:30:00Z"})];
        let other = writer.encode(&changed, &schema, &iceberg, &layout).unwrap();
        assert_ne!(other[0].path, first[0].path);
    }

    #[test]
    fn test_names_cover_codec_and_schema() {
        let (storage, writer, layout) = setup(1000);
        let records = employees();
        let schema = SchemaInferencer::default().infer(&records).unwrap();
        let mut last = 0;
        let iceberg = schema.to_iceberg(0, None, &mut last);
        let snappy = writer.encode(&records, &schema, &iceberg, &layout).unwrap();

        let zstd = DataFileWriter::new(
            Arc::new(storage.clone()),
            &DataConfig {
                compression: ParquetCompression::Zstd,
                ..DataConfig::default()
            },
        );
        let recompressed = zstd.encode(&records, &schema, &iceberg, &layout).unwrap();
        assert_ne!(recompressed[0].path, snappy[0].path);

        let mut evolved = iceberg.clone();
        evolved.schema_id = 1;
        let rewritten = writer.encode(&records, &schema, &evolved, &layout).unwrap();
        assert_ne!(rewritten[0].path, snappy[0].path);
    }

    #[tokio::test]
    async fn test_upload_skips_existing() {
        let (storage, writer, layout) = setup(1000);
        let records = employees();
        let schema = SchemaInferencer::default().infer(&records).unwrap();
        let mut last = 0;
        let iceberg = schema.to_iceberg(0, None, &mut last);
        let files = writer.encode(&records, &schema, &iceberg, &layout).unwrap();

        writer.upload(&files).await.unwrap();
        writer.upload(&files).await.unwrap();
        assert_eq!(storage.put_calls(), 1);
    }

    #[test]
    fn test_arrow_schema_carries_field_ids() {
        let records = vec![json!({"id": 1, "tags": ["a"]})];
        let schema = SchemaInferencer::default().infer(&records).unwrap();
        let mut last = 0;
        let iceberg = schema.to_iceberg(0, None, &mut last);

        let arrow = arrow_schema(&iceberg);
        let id = arrow.field_with_name("id").unwrap();
        assert_eq!(id.data_type(), &DataType::Int64);
        assert!(!id.is_nullable());
        assert_eq!(id.metadata()[PARQUET_FIELD_ID_META_KEY], "1");

        match arrow.field_with_name("tags").unwrap().data_type() {
            DataType::List(element) => {
                assert_eq!(element.metadata()[PARQUET_FIELD_ID_META_KEY], "3");
            }
            other => panic!("expected list, got {:?}", other),
        }
    }
}
