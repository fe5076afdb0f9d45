pub mod csv_writer;
pub mod json_writer;
pub mod parquet_writer;

pub use csv_writer::CsvEncoder;
pub use json_writer::JsonEncoder;
pub use parquet_writer::{ColumnarEncoder, RecordBatchBuilder};
