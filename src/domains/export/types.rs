use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use crate::domains::compression::CompressionScheme;
use crate::domains::storage::UploadDestination;
use crate::errors::ExportError;

/// One source row: ordered field name to scalar value.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Export formats supported by the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Csv,
    Json,
    #[serde(alias = "parquet")]
    Columnar,
}

impl Default for ExportFormat {
    fn default() -> Self {
        Self::Csv
    }
}

impl ExportFormat {
    /// Get file extension for this format
    pub fn file_extension(&self) -> &'static str {
        match self {
            ExportFormat::Csv => "csv",
            ExportFormat::Json => "json",
            ExportFormat::Columnar => "parquet",
        }
    }

    pub fn content_type(&self) -> mime::Mime {
        match self {
            ExportFormat::Csv => mime::TEXT_CSV,
            ExportFormat::Json => mime::APPLICATION_JSON,
            ExportFormat::Columnar => mime::APPLICATION_OCTET_STREAM,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExportFormat::Csv => "csv",
            ExportFormat::Json => "json",
            ExportFormat::Columnar => "columnar",
        }
    }
}

/// CSV output options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CsvOptions {
    pub delimiter: u8,
    pub quote_char: u8,
    pub include_header: bool,
}

impl Default for CsvOptions {
    fn default() -> Self {
        Self {
            delimiter: b',',
            quote_char: b'"',
            include_header: true,
        }
    }
}

/// Position of a batch inside the artifact, drives JSON/CSV framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchFraming {
    pub first: bool,
    pub last: bool,
}

/// Memory pressure levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryPressureLevel {
    Normal,
    Warning,
    Critical,
}

/// Process memory statistics as seen by the governor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemorySnapshot {
    pub heap_used: u64,
    pub heap_total: u64,
    pub resident: u64,
    pub peak: u64,
    pub rolling_average: u64,
    pub forced_collections: u64,
    pub samples: u64,
}

/// High-level request describing what should be exported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportRequest {
    pub dataset: String,
    #[serde(default)]
    pub format: ExportFormat,
    pub chunk_size: Option<usize>,
    #[serde(default)]
    pub encrypt: bool,
    pub compression: Option<CompressionScheme>,
    pub destination: Option<UploadDestination>,
    #[serde(default)]
    pub resumable: bool,
    #[serde(default)]
    pub csv: CsvOptions,
    /// Opaque options forwarded to the chunk source
    #[serde(default)]
    pub source_options: serde_json::Value,
}

impl ExportRequest {
    pub fn new(dataset: &str, format: ExportFormat) -> Self {
        Self {
            dataset: dataset.to_string(),
            format,
            chunk_size: None,
            encrypt: false,
            compression: None,
            destination: None,
            resumable: false,
            csv: CsvOptions::default(),
            source_options: serde_json::Value::Null,
        }
    }
}

/// Pipeline state of an export job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportState {
    Created,
    Reading,
    Encoding,
    Encrypting,
    Compressing,
    Checksumming,
    Uploading,
    Completed,
    Failed,
}

/// Identity and settings of one export, owned by the worker running it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportJob {
    pub export_id: String,
    pub request: ExportRequest,
    pub chunk_size: usize,
    pub state: ExportState,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ExportJob {
    pub fn new(request: ExportRequest, default_chunk_size: usize, expiration_hours: i64) -> Self {
        let created_at = Utc::now();
        let chunk_size = request.chunk_size.filter(|c| *c > 0).unwrap_or(default_chunk_size);
        Self {
            export_id: Uuid::new_v4().to_string(),
            request,
            chunk_size,
            state: ExportState::Created,
            created_at,
            expires_at: created_at + Duration::hours(expiration_hours),
        }
    }

    pub fn format(&self) -> ExportFormat {
        self.request.format
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Extension of the delivered object, reflecting every transform applied.
    pub fn artifact_extension(&self) -> String {
        let mut ext = self.format().file_extension().to_string();
        if self.request.encrypt {
            ext.push_str(".enc");
        }
        if self.request.compression.is_some() {
            ext.push_str(".gz");
        }
        ext
    }

    pub fn work_dir(&self, output_dir: &Path) -> PathBuf {
        output_dir.join(&self.export_id)
    }

    /// Path of the single artifact every segment is joined into.
    pub fn artifact_path(&self, work_dir: &Path) -> PathBuf {
        work_dir.join(format!("{}.{}", self.export_id, self.format().file_extension()))
    }
}

/// A contiguous, ordered slice of rows written to one artifact segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub index: usize,
    pub start_offset: u64,
    pub end_offset: u64,
    pub row_count: usize,
    pub byte_size: u64,
    pub path: PathBuf,
}

/// Outcome of the reading/encoding phase and of the artifact transforms.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportResult {
    pub export_id: String,
    pub chunks: Vec<Chunk>,
    pub total_rows: u64,
    pub total_bytes: u64,
    pub format: ExportFormat,
    /// Source exhausted and the closing batch written
    pub completed: bool,
    /// Joined artifact, set once every segment is assembled
    pub artifact: Option<PathBuf>,
    pub encrypted: bool,
    pub compressed: bool,
}

impl ExportResult {
    pub fn new(export_id: &str, format: ExportFormat) -> Self {
        Self {
            export_id: export_id.to_string(),
            chunks: Vec::new(),
            total_rows: 0,
            total_bytes: 0,
            format,
            completed: false,
            artifact: None,
            encrypted: false,
            compressed: false,
        }
    }

    pub fn push_chunk(&mut self, chunk: Chunk) {
        self.total_rows += chunk.row_count as u64;
        self.total_bytes += chunk.byte_size;
        self.chunks.push(chunk);
    }

    /// Offset of the first row not yet durably encoded.
    pub fn next_offset(&self) -> u64 {
        self.chunks.last().map(|c| c.end_offset).unwrap_or(0)
    }

    /// Distinct segment files in chunk-index order. Columnar chunks share one file.
    pub fn segment_paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = Vec::new();
        for chunk in &self.chunks {
            if paths.last() != Some(&chunk.path) {
                paths.push(chunk.path.clone());
            }
        }
        paths
    }
}

/// Terminal record of a successful export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportMetadata {
    pub export_id: String,
    pub format: ExportFormat,
    pub row_count: u64,
    pub file_size: u64,
    pub checksum: String,
    pub encrypted: bool,
    pub compressed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cloud_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub memory_stats: MemorySnapshot,
    /// Local file, never sent to webhook receivers
    #[serde(skip)]
    pub artifact_path: PathBuf,
}

/// Progress events broadcast by the orchestrator.
#[derive(Debug, Clone)]
pub enum ExportEvent {
    StateChanged {
        export_id: String,
        state: ExportState,
    },
    ChunkWritten {
        export_id: String,
        index: usize,
        rows_total: u64,
        bytes_total: u64,
    },
    Completed(ExportMetadata),
    Failed {
        export_id: String,
        code: &'static str,
        message: String,
        checkpoint_saved: bool,
    },
}

/// Cooperative cancellation flag shared between a caller and a running export.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Terminal error returned by the orchestrator.
#[derive(Debug, Clone)]
pub struct ExportFailure {
    pub export_id: String,
    pub stage: ExportState,
    pub error: ExportError,
    pub checkpoint_saved: bool,
}

impl ExportFailure {
    pub fn code(&self) -> &'static str {
        self.error.code()
    }

    pub fn message(&self) -> String {
        self.error.to_string()
    }
}

impl std::fmt::Display for ExportFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "export {} failed during {:?} [{}]: {}",
            self.export_id,
            self.stage,
            self.error.code(),
            self.error
        )?;
        if self.checkpoint_saved {
            write!(f, " (checkpoint saved, export can be resumed)")?;
        }
        Ok(())
    }
}

impl std::error::Error for ExportFailure {}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(index: usize, start: u64, rows: usize, path: &str) -> Chunk {
        Chunk {
            index,
            start_offset: start,
            end_offset: start + rows as u64,
            row_count: rows,
            byte_size: 10,
            path: PathBuf::from(path),
        }
    }

    #[test]
    fn test_segment_paths_dedup_shared_files() {
        let mut result = ExportResult::new("x", ExportFormat::Columnar);
        result.push_chunk(chunk(0, 0, 2, "a.parquet"));
        result.push_chunk(chunk(1, 2, 1, "a.parquet"));
        assert_eq!(result.segment_paths(), vec![PathBuf::from("a.parquet")]);
        assert_eq!(result.total_rows, 3);
        assert_eq!(result.next_offset(), 3);
    }

    #[test]
    fn test_artifact_extension_reflects_transforms() {
        let mut request = ExportRequest::new("reviews", ExportFormat::Json);
        request.encrypt = true;
        request.compression = Some(CompressionScheme::Gzip);
        let job = ExportJob::new(request, 100, 24);
        assert_eq!(job.artifact_extension(), "json.enc.gz");
        assert_eq!(
            job.artifact_path(Path::new("/tmp/out")),
            PathBuf::from(format!("/tmp/out/{}.json", job.export_id))
        );
        assert_eq!(job.chunk_size, 100);
        assert!(!job.is_expired(job.created_at));
        assert!(job.is_expired(job.expires_at));
    }

    #[test]
    fn test_format_deserializes_parquet_alias() {
        let format: ExportFormat = serde_json::from_str("\"parquet\"").unwrap();
        assert_eq!(format, ExportFormat::Columnar);
    }

    #[test]
    fn test_cancel_handle_is_shared_between_clones() {
        let handle = CancelHandle::new();
        let observer = handle.clone();
        assert!(!observer.is_cancelled());
        handle.cancel();
        assert!(observer.is_cancelled());
    }

    #[test]
    fn test_failure_display_mentions_checkpoint() {
        let failure = ExportFailure {
            export_id: "abc".into(),
            stage: ExportState::Reading,
            error: ExportError::Source("connection reset".into()),
            checkpoint_saved: true,
        };
        let text = failure.to_string();
        assert!(text.contains("SOURCE_ERROR"));
        assert!(text.contains("can be resumed"));
    }
}
