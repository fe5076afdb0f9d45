pub mod parquet;

pub use parquet::{infer_schema, ColumnType, SCHEMA_SAMPLE_ROWS};
