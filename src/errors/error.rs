use serde::Serialize;
use thiserror::Error;

/// Errors raised while producing, transforming or delivering an export.
#[derive(Debug, Error, Clone, Serialize)]
pub enum ExportError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Insufficient memory: heap at {heap_used_mb} MB after forced collection (critical threshold {critical_mb} MB)")]
    InsufficientMemory {
        heap_used_mb: u64,
        critical_mb: u64,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Encryption was requested but no encryption password is configured")]
    MissingEncryptionPassword,

    #[error("Not implemented: {0}")]
    NotImplemented(String),

    #[error("Capability unavailable: {0}")]
    CapabilityUnavailable(String),

    #[error("No data to infer schema for dataset '{0}'")]
    EmptyDataset(String),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Writer already closed: {0}")]
    WriterClosed(String),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Upload failed{}: {message}", .part.map(|p| format!(" (part {})", p)).unwrap_or_default())]
    UploadFailed {
        part: Option<u32>,
        message: String,
    },

    #[error("Incomplete upload: {0}")]
    IncompleteUpload(String),

    #[error("Chunk source error: {0}")]
    Source(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("No checkpoint found for export {0}")]
    CheckpointNotFound(String),

    #[error("Checkpoint for export {0} has expired")]
    CheckpointExpired(String),

    #[error("Webhook delivery failed: {0}")]
    Notification(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl ExportError {
    /// Stable machine-readable code for callers and job history.
    pub fn code(&self) -> &'static str {
        match self {
            ExportError::Io(_) => "IO_ERROR",
            ExportError::Serialization(_) => "SERIALIZATION_ERROR",
            ExportError::InsufficientMemory { .. } => "INSUFFICIENT_MEMORY",
            ExportError::Configuration(_) => "CONFIGURATION_ERROR",
            ExportError::MissingEncryptionPassword => "ENCRYPTION_PASSWORD_MISSING",
            ExportError::NotImplemented(_) => "NOT_IMPLEMENTED",
            ExportError::CapabilityUnavailable(_) => "CAPABILITY_UNAVAILABLE",
            ExportError::EmptyDataset(_) => "NO_DATA",
            ExportError::Schema(_) => "SCHEMA_ERROR",
            ExportError::WriterClosed(_) => "WRITER_CLOSED",
            ExportError::Encryption(_) => "ENCRYPTION_FAILED",
            ExportError::DecryptionFailed(_) => "DECRYPTION_FAILED",
            ExportError::Compression(_) => "COMPRESSION_FAILED",
            ExportError::UploadFailed { .. } => "UPLOAD_FAILED",
            ExportError::IncompleteUpload(_) => "INCOMPLETE_UPLOAD",
            ExportError::Source(_) => "SOURCE_ERROR",
            ExportError::Checkpoint(_) => "CHECKPOINT_ERROR",
            ExportError::CheckpointNotFound(_) => "CHECKPOINT_NOT_FOUND",
            ExportError::CheckpointExpired(_) => "CHECKPOINT_EXPIRED",
            ExportError::Notification(_) => "WEBHOOK_FAILED",
            ExportError::Cancelled => "CANCELLED",
        }
    }

    /// Whether running the same job again may succeed without operator action.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExportError::Io(_)
                | ExportError::InsufficientMemory { .. }
                | ExportError::UploadFailed { .. }
                | ExportError::IncompleteUpload(_)
                | ExportError::Source(_)
                | ExportError::Notification(_)
        )
    }
}

impl From<std::io::Error> for ExportError {
    fn from(error: std::io::Error) -> Self {
        ExportError::Io(error.to_string())
    }
}

impl From<serde_json::Error> for ExportError {
    fn from(error: serde_json::Error) -> Self {
        ExportError::Serialization(error.to_string())
    }
}

impl From<csv::Error> for ExportError {
    fn from(error: csv::Error) -> Self {
        ExportError::Serialization(format!("CSV: {}", error))
    }
}

impl From<arrow::error::ArrowError> for ExportError {
    fn from(error: arrow::error::ArrowError) -> Self {
        ExportError::Schema(error.to_string())
    }
}

impl From<parquet::errors::ParquetError> for ExportError {
    fn from(error: parquet::errors::ParquetError) -> Self {
        ExportError::Serialization(format!("Parquet: {}", error))
    }
}

impl From<tokio::task::JoinError> for ExportError {
    fn from(error: tokio::task::JoinError) -> Self {
        ExportError::Io(format!("Task join error: {}", error))
    }
}

/// Errors reported by an object-storage backend.
#[derive(Debug, Error, Clone, Serialize)]
pub enum StorageError {
    #[error("Transient storage error: {0}")]
    Transient(String),

    #[error("Completion rejected, missing parts: {0:?}")]
    MissingParts(Vec<u32>),

    #[error("Request rejected: {0}")]
    Rejected(String),
}
