use arrow::array::*;
use arrow::datatypes::{DataType, Field, SchemaRef};
use arrow::record_batch::RecordBatch;
use chrono::DateTime;
use parquet::arrow::AsyncArrowWriter;
use parquet::basic::{Compression, Encoding};
use parquet::file::properties::{WriterProperties, WriterVersion};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::File;

use crate::domains::export::schemas::infer_schema;
use crate::domains::export::types::Row;
use crate::errors::{ExportError, PipelineResult};

/// Single-file columnar writer. The schema is fixed by the first batch.
pub struct ColumnarEncoder {
    path: PathBuf,
    dataset: String,
    writer: Option<AsyncArrowWriter<File>>,
    schema: Option<SchemaRef>,
    closed: bool,
    rows_written: u64,
}

impl std::fmt::Debug for ColumnarEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ColumnarEncoder")
            .field("path", &self.path)
            .field("schema", &self.schema)
            .field("closed", &self.closed)
            .field("rows_written", &self.rows_written)
            .field("writer", &"<AsyncArrowWriter>")
            .finish()
    }
}

impl ColumnarEncoder {
    pub fn new(path: &Path, dataset: &str) -> Self {
        Self {
            path: path.to_path_buf(),
            dataset: dataset.to_string(),
            writer: None,
            schema: None,
            closed: false,
            rows_written: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn writer_properties() -> WriterProperties {
        WriterProperties::builder()
            .set_compression(Compression::SNAPPY)
            .set_dictionary_enabled(true)
            .set_writer_version(WriterVersion::PARQUET_2_0)
            .set_created_by("export-pipeline-core".to_string())
            .set_encoding(Encoding::PLAIN)
            .build()
    }

    async fn open(&mut self, rows: &[Row]) -> PipelineResult<()> {
        let schema = Arc::new(infer_schema(rows));
        if schema.fields().is_empty() {
            return Err(ExportError::Schema(format!(
                "Rows for dataset '{}' have no fields",
                self.dataset
            )));
        }

        let file = File::create(&self.path).await?;
        let writer = AsyncArrowWriter::try_new(file, schema.clone(), Some(Self::writer_properties()))?;

        log::debug!(
            "Opened columnar writer at {:?} with {} columns",
            self.path,
            schema.fields().len()
        );
        self.schema = Some(schema);
        self.writer = Some(writer);
        Ok(())
    }

    /// Append one batch as a row group slice. Returns the in-memory size of the batch.
    pub async fn append(&mut self, rows: &[Row]) -> PipelineResult<u64> {
        if self.closed {
            return Err(ExportError::WriterClosed(self.path.display().to_string()));
        }
        if rows.is_empty() {
            if self.writer.is_none() {
                return Err(ExportError::EmptyDataset(self.dataset.clone()));
            }
            return Ok(0);
        }
        if self.writer.is_none() {
            self.open(rows).await?;
        }

        let schema = self
            .schema
            .clone()
            .ok_or_else(|| ExportError::Schema("Columnar schema not initialized".to_string()))?;
        let mut builder = RecordBatchBuilder::new(schema);
        for row in rows {
            builder.append_row(row)?;
        }
        let batch = builder.finish()?;

        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| ExportError::WriterClosed(self.path.display().to_string()))?;
        writer.write(&batch).await?;

        self.rows_written += batch.num_rows() as u64;
        Ok(batch.get_array_memory_size() as u64)
    }

    /// Write the footer and release the file. Returns the final file size.
    pub async fn close(&mut self) -> PipelineResult<u64> {
        if self.closed {
            return Err(ExportError::WriterClosed(self.path.display().to_string()));
        }
        let writer = self
            .writer
            .take()
            .ok_or_else(|| ExportError::EmptyDataset(self.dataset.clone()))?;
        writer.close().await?;
        self.closed = true;

        let size = tokio::fs::metadata(&self.path).await?.len();
        log::info!(
            "Closed columnar file {:?}: {} rows, {} bytes",
            self.path,
            self.rows_written,
            size
        );
        Ok(size)
    }

    /// Drop an unfinished file. Partial columnar output is never resumable.
    pub async fn discard(&mut self) {
        self.writer = None;
        self.closed = true;
        if let Err(e) = tokio::fs::remove_file(&self.path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::warn!("Failed to remove partial columnar file {:?}: {}", self.path, e);
            }
        }
    }
}

/// Builds one record batch from JSON rows against a fixed schema.
pub struct RecordBatchBuilder {
    schema: SchemaRef,
    builders: Vec<Box<dyn ArrayBuilder>>,
}

impl RecordBatchBuilder {
    pub fn new(schema: SchemaRef) -> Self {
        let builders = schema
            .fields()
            .iter()
            .map(|field| Self::create_builder(field))
            .collect();

        Self { schema, builders }
    }

    fn create_builder(field: &Field) -> Box<dyn ArrayBuilder> {
        match field.data_type() {
            DataType::Int64 => Box::new(Int64Builder::new()),
            DataType::Float64 => Box::new(Float64Builder::new()),
            DataType::Boolean => Box::new(BooleanBuilder::new()),
            DataType::Timestamp(_, _) => Box::new(TimestampMillisecondBuilder::new()),
            _ => Box::new(StringBuilder::new()),
        }
    }

    /// Append a row. Missing fields become nulls; fields outside the schema are rejected.
    pub fn append_row(&mut self, row: &Row) -> PipelineResult<()> {
        if let Some(unknown) = row.keys().find(|k| self.schema.index_of(k).is_err()) {
            return Err(ExportError::Schema(format!(
                "Field '{}' is not part of the inferred schema",
                unknown
            )));
        }

        for index in 0..self.schema.fields().len() {
            let field = self.schema.field(index).clone();
            let value = row.get(field.name()).unwrap_or(&Value::Null);
            self.append_value(index, &field, value)?;
        }
        Ok(())
    }

    fn append_value(&mut self, index: usize, field: &Field, value: &Value) -> PipelineResult<()> {
        let mismatch = || {
            ExportError::Schema(format!(
                "Value {} does not fit column '{}' of type {}",
                value,
                field.name(),
                field.data_type()
            ))
        };
        let builder = self.builders[index].as_any_mut();

        match field.data_type() {
            DataType::Int64 => {
                let builder = builder.downcast_mut::<Int64Builder>().ok_or_else(mismatch)?;
                match value {
                    Value::Null => builder.append_null(),
                    Value::Number(n) => builder.append_value(n.as_i64().ok_or_else(mismatch)?),
                    _ => return Err(mismatch()),
                }
            }
            DataType::Float64 => {
                let builder = builder.downcast_mut::<Float64Builder>().ok_or_else(mismatch)?;
                match value {
                    Value::Null => builder.append_null(),
                    Value::Number(n) => builder.append_value(n.as_f64().ok_or_else(mismatch)?),
                    _ => return Err(mismatch()),
                }
            }
            DataType::Boolean => {
                let builder = builder.downcast_mut::<BooleanBuilder>().ok_or_else(mismatch)?;
                match value {
                    Value::Null => builder.append_null(),
                    Value::Bool(b) => builder.append_value(*b),
                    _ => return Err(mismatch()),
                }
            }
            DataType::Timestamp(_, _) => {
                let builder = builder
                    .downcast_mut::<TimestampMillisecondBuilder>()
                    .ok_or_else(mismatch)?;
                match value {
                    Value::Null => builder.append_null(),
                    Value::String(s) => {
                        let parsed = DateTime::parse_from_rfc3339(s).map_err(|_| mismatch())?;
                        builder.append_value(parsed.timestamp_millis());
                    }
                    _ => return Err(mismatch()),
                }
            }
            _ => {
                let builder = builder.downcast_mut::<StringBuilder>().ok_or_else(mismatch)?;
                match value {
                    Value::Null => builder.append_null(),
                    Value::String(s) => builder.append_value(s),
                    other => builder.append_value(other.to_string()),
                }
            }
        }
        Ok(())
    }

    pub fn finish(&mut self) -> PipelineResult<RecordBatch> {
        let arrays: Vec<ArrayRef> = self.builders.iter_mut().map(|builder| builder.finish()).collect();

        self.builders = self
            .schema
            .fields()
            .iter()
            .map(|field| Self::create_builder(field))
            .collect();

        Ok(RecordBatch::try_new(self.schema.clone(), arrays)?)
    }
}
