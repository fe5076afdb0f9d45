//! Gzip compression for export artifacts

use async_trait::async_trait;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tokio::task;

use super::Compressor;
use crate::domains::compression::types::{CompressionResult, CompressionScheme};
use crate::errors::{ExportError, PipelineResult};

/// Gzip compressor using flate2 at the best compression level
#[derive(Debug, Clone, Default)]
pub struct GenericCompressor;

impl GenericCompressor {
    pub fn new() -> Self {
        Self
    }

    fn temp_beside(path: &Path) -> PipelineResult<NamedTempFile> {
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        Ok(NamedTempFile::new_in(dir)?)
    }

    fn compress_blocking(path: PathBuf) -> PipelineResult<CompressionResult> {
        let original_size = std::fs::metadata(&path)?.len();
        let mut input = BufReader::new(File::open(&path)?);
        let temp = Self::temp_beside(&path)?;

        let mut encoder = GzEncoder::new(BufWriter::new(temp.reopen()?), Compression::best());
        io::copy(&mut input, &mut encoder)
            .map_err(|e| ExportError::Compression(format!("Compression write error: {}", e)))?;
        let mut writer = encoder
            .finish()
            .map_err(|e| ExportError::Compression(format!("Compression finish error: {}", e)))?;
        writer.flush()?;
        drop(writer);

        let compressed_size = temp.as_file().metadata()?.len();
        if compressed_size == 0 {
            return Err(ExportError::Compression(format!(
                "Refusing to replace {:?} with an empty file",
                path
            )));
        }
        temp.persist(&path).map_err(|e| ExportError::Io(e.error.to_string()))?;

        Ok(CompressionResult {
            original_size,
            compressed_size,
        })
    }

    fn decompress_blocking(path: PathBuf) -> PipelineResult<u64> {
        let mut decoder = GzDecoder::new(BufReader::new(File::open(&path)?));
        let temp = Self::temp_beside(&path)?;
        let mut writer = BufWriter::new(temp.reopen()?);
        let size = io::copy(&mut decoder, &mut writer)
            .map_err(|e| ExportError::Compression(format!("Decompression error: {}", e)))?;
        writer.flush()?;
        drop(writer);

        temp.persist(&path).map_err(|e| ExportError::Io(e.error.to_string()))?;
        Ok(size)
    }
}

#[async_trait]
impl Compressor for GenericCompressor {
    async fn compress_file(&self, path: &Path) -> PipelineResult<CompressionResult> {
        let path = path.to_path_buf();
        let result = task::spawn_blocking(move || Self::compress_blocking(path)).await??;
        log::debug!(
            "Gzip compressed {} -> {} bytes",
            result.original_size,
            result.compressed_size
        );
        Ok(result)
    }

    async fn decompress_file(&self, path: &Path) -> PipelineResult<u64> {
        let path = path.to_path_buf();
        task::spawn_blocking(move || Self::decompress_blocking(path)).await?
    }

    fn scheme(&self) -> CompressionScheme {
        CompressionScheme::Gzip
    }
}
