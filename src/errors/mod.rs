mod error;

pub use error::{ExportError, StorageError};

/// Result type for export pipeline operations
pub type PipelineResult<T> = Result<T, ExportError>;

/// Result type for object-storage backend calls
pub type StorageResult<T> = Result<T, StorageError>;
