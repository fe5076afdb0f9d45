//! Type definitions for the compression domain.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::errors::ExportError;

/// Compression schemes an export may request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionScheme {
    /// Single-member gzip stream at maximum level
    Gzip,

    /// Zip archive, not implemented
    Zip,
}

impl CompressionScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompressionScheme::Gzip => "gzip",
            CompressionScheme::Zip => "zip",
        }
    }

    pub fn file_extension(&self) -> &'static str {
        match self {
            CompressionScheme::Gzip => "gz",
            CompressionScheme::Zip => "zip",
        }
    }
}

impl FromStr for CompressionScheme {
    type Err = ExportError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "gzip" | "gz" => Ok(CompressionScheme::Gzip),
            "zip" => Ok(CompressionScheme::Zip),
            _ => Err(ExportError::Configuration(format!(
                "Invalid compression scheme: {}",
                s
            ))),
        }
    }
}

/// Size accounting for one compressed file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionResult {
    pub original_size: u64,
    pub compressed_size: u64,
}

impl CompressionResult {
    pub fn ratio(&self) -> f64 {
        if self.original_size == 0 {
            return 1.0;
        }
        self.compressed_size as f64 / self.original_size as f64
    }
}
