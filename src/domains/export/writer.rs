use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tokio::task;

use crate::domains::export::types::{BatchFraming, Chunk, ExportFormat, ExportJob, Row};
use crate::domains::export::writers::{ColumnarEncoder, CsvEncoder, JsonEncoder};
use crate::errors::{ExportError, PipelineResult};

/// Row-oriented encoder producing one byte segment per batch.
pub trait TextEncoder: Send {
    fn encode(&mut self, rows: &[Row], framing: BatchFraming) -> PipelineResult<Vec<u8>>;

    /// Column order fixed so far, needed to continue an artifact on resume.
    fn columns(&self) -> Option<Vec<String>> {
        None
    }
}

/// Writes encoded batches to disk for one export.
///
/// Text formats get one segment file per chunk; the columnar format appends
/// every chunk to a single file which is closed with the last batch.
pub enum ArtifactWriter {
    Text {
        encoder: Box<dyn TextEncoder>,
        dir: PathBuf,
        extension: &'static str,
    },
    Columnar(ColumnarEncoder),
}

impl std::fmt::Debug for ArtifactWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArtifactWriter::Text { dir, extension, .. } => f
                .debug_struct("Text")
                .field("dir", dir)
                .field("extension", extension)
                .finish(),
            ArtifactWriter::Columnar(encoder) => f.debug_tuple("Columnar").field(encoder).finish(),
        }
    }
}

impl ArtifactWriter {
    /// Writer for `job` placing files under `dir`. `columns` restores a CSV header on resume.
    pub fn create(job: &ExportJob, dir: &Path, columns: Option<Vec<String>>) -> Self {
        let extension = job.format().file_extension();
        match job.format() {
            ExportFormat::Csv => {
                let options = job.request.csv.clone();
                let encoder = match columns {
                    Some(columns) => CsvEncoder::with_columns(options, columns),
                    None => CsvEncoder::new(options),
                };
                ArtifactWriter::Text {
                    encoder: Box::new(encoder),
                    dir: dir.to_path_buf(),
                    extension,
                }
            }
            ExportFormat::Json => ArtifactWriter::Text {
                encoder: Box::new(JsonEncoder::new()),
                dir: dir.to_path_buf(),
                extension,
            },
            ExportFormat::Columnar => {
                ArtifactWriter::Columnar(ColumnarEncoder::new(&job.artifact_path(dir), &job.request.dataset))
            }
        }
    }

    /// Encode and persist one batch, returning the chunk describing it.
    pub async fn write_chunk(
        &mut self,
        index: usize,
        start_offset: u64,
        rows: &[Row],
        framing: BatchFraming,
    ) -> PipelineResult<Chunk> {
        let (path, byte_size) = match self {
            ArtifactWriter::Text { encoder, dir, extension } => {
                let bytes = encoder.encode(rows, framing)?;
                let path = dir.join(format!("chunk_{:05}.{}", index, extension));
                let mut file = tokio::fs::File::create(&path).await?;
                file.write_all(&bytes).await?;
                file.sync_all().await?;
                (path, bytes.len() as u64)
            }
            ArtifactWriter::Columnar(encoder) => {
                let estimated = encoder.append(rows).await?;
                if framing.last {
                    encoder.close().await?;
                }
                (encoder.path().to_path_buf(), estimated)
            }
        };

        Ok(Chunk {
            index,
            start_offset,
            end_offset: start_offset + rows.len() as u64,
            row_count: rows.len(),
            byte_size,
            path,
        })
    }

    pub fn columns(&self) -> Option<Vec<String>> {
        match self {
            ArtifactWriter::Text { encoder, .. } => encoder.columns(),
            ArtifactWriter::Columnar(_) => None,
        }
    }

    /// Release an unfinished writer after a failure.
    pub async fn abandon(&mut self) {
        if let ArtifactWriter::Columnar(encoder) = self {
            encoder.discard().await;
        }
    }
}

/// Join text segments in order into `target`, then remove the segments.
/// Returns the size of the joined file.
pub async fn assemble_segments(segments: Vec<PathBuf>, target: PathBuf) -> PipelineResult<u64> {
    task::spawn_blocking(move || {
        let dir = target.parent().unwrap_or_else(|| Path::new("."));
        let temp = NamedTempFile::new_in(dir)?;
        let mut output = BufWriter::new(temp.reopen()?);
        let mut size = 0;
        for segment in &segments {
            let mut input = BufReader::new(File::open(segment)?);
            size += io::copy(&mut input, &mut output)?;
        }
        output.flush()?;
        drop(output);
        temp.as_file().sync_all()?;
        temp.persist(&target).map_err(|e| ExportError::Io(e.error.to_string()))?;

        for segment in &segments {
            if let Err(e) = std::fs::remove_file(segment) {
                log::warn!("Failed to remove segment {:?}: {}", segment, e);
            }
        }
        log::debug!("Assembled {} segment(s) into {:?} ({} bytes)", segments.len(), target, size);
        Ok(size)
    })
    .await?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::export::types::ExportRequest;
    use serde_json::json;
    use tempfile::tempdir;

    fn rows(range: std::ops::Range<usize>) -> Vec<Row> {
        range
            .map(|i| json!({ "id": i }).as_object().cloned().unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_text_chunks_get_their_own_files() {
        let dir = tempdir().unwrap();
        let job = ExportJob::new(ExportRequest::new("d", ExportFormat::Json), 2, 24);
        let mut writer = ArtifactWriter::create(&job, dir.path(), None);

        let a = writer
            .write_chunk(0, 0, &rows(0..2), BatchFraming { first: true, last: false })
            .await
            .unwrap();
        let b = writer
            .write_chunk(1, 2, &rows(2..3), BatchFraming { first: false, last: true })
            .await
            .unwrap();

        assert_ne!(a.path, b.path);
        assert_eq!(b.start_offset, 2);
        assert_eq!(b.end_offset, 3);
        let mut doc = std::fs::read(&a.path).unwrap();
        doc.extend(std::fs::read(&b.path).unwrap());
        assert_eq!(String::from_utf8(doc).unwrap(), "[{\"id\":0},{\"id\":1},\n{\"id\":2}]");
        assert_eq!(a.byte_size, std::fs::metadata(&a.path).unwrap().len());
    }

    #[tokio::test]
    async fn test_columnar_chunks_share_one_file() {
        let dir = tempdir().unwrap();
        let job = ExportJob::new(ExportRequest::new("d", ExportFormat::Columnar), 2, 24);
        let mut writer = ArtifactWriter::create(&job, dir.path(), None);

        let a = writer
            .write_chunk(0, 0, &rows(0..2), BatchFraming { first: true, last: false })
            .await
            .unwrap();
        let b = writer
            .write_chunk(1, 2, &rows(2..3), BatchFraming { first: false, last: true })
            .await
            .unwrap();

        assert_eq!(a.path, b.path);
        assert!(std::fs::metadata(&a.path).unwrap().len() > 0);
    }

    #[tokio::test]
    async fn test_csv_resume_keeps_header_columns() {
        let dir = tempdir().unwrap();
        let job = ExportJob::new(ExportRequest::new("d", ExportFormat::Csv), 2, 24);
        let mut writer = ArtifactWriter::create(&job, dir.path(), Some(vec!["id".into()]));
        let chunk = writer
            .write_chunk(3, 6, &rows(6..7), BatchFraming { first: false, last: true })
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(chunk.path).unwrap(), "6\n");
        assert_eq!(writer.columns(), Some(vec!["id".to_string()]));
    }

    #[tokio::test]
    async fn test_assemble_joins_segments_in_order() {
        let dir = tempdir().unwrap();
        let job = ExportJob::new(ExportRequest::new("d", ExportFormat::Json), 2, 24);
        let mut writer = ArtifactWriter::create(&job, dir.path(), None);
        let mut segments = Vec::new();
        for (i, range) in [0..2, 2..4, 4..5].into_iter().enumerate() {
            let framing = BatchFraming {
                first: i == 0,
                last: i == 2,
            };
            let start = range.start as u64;
            let chunk = writer.write_chunk(i, start, &rows(range), framing).await.unwrap();
            segments.push(chunk.path);
        }

        let target = job.artifact_path(dir.path());
        let size = assemble_segments(segments.clone(), target.clone()).await.unwrap();

        let text = std::fs::read_to_string(&target).unwrap();
        assert_eq!(size, text.len() as u64);
        let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed.as_array().unwrap().len(), 5);
        assert!(segments.iter().all(|s| !s.exists()));
    }

    #[tokio::test]
    async fn test_assemble_missing_segment_keeps_the_others() {
        let dir = tempdir().unwrap();
        let present = dir.path().join("chunk_00000.csv");
        std::fs::write(&present, b"id\n1\n").unwrap();
        let target = dir.path().join("joined.csv");

        let err = assemble_segments(vec![present.clone(), dir.path().join("gone.csv")], target.clone())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "IO_ERROR");
        assert!(present.exists());
        assert!(!target.exists());
    }
}
