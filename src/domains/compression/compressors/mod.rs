//! File compressors, one per supported scheme

pub mod generic_compressor;

use async_trait::async_trait;
use std::path::Path;

use super::types::{CompressionResult, CompressionScheme};
use crate::errors::{ExportError, PipelineResult};

pub use generic_compressor::GenericCompressor;

/// Common trait for all compressors
#[async_trait]
pub trait Compressor: Send + Sync {
    /// Replace the file at `path` with its compressed form
    async fn compress_file(&self, path: &Path) -> PipelineResult<CompressionResult>;

    /// Replace the compressed file at `path` with its original content
    async fn decompress_file(&self, path: &Path) -> PipelineResult<u64>;

    fn scheme(&self) -> CompressionScheme;
}

/// Pick the compressor for a scheme
pub fn compressor_for(scheme: CompressionScheme) -> PipelineResult<Box<dyn Compressor>> {
    match scheme {
        CompressionScheme::Gzip => Ok(Box::new(GenericCompressor::new())),
        CompressionScheme::Zip => Err(ExportError::NotImplemented(
            "Zip compression is not implemented".to_string(),
        )),
    }
}
