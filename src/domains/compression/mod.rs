// Declare submodules for the compression domain
pub mod compressors;
pub mod types;

pub use compressors::{compressor_for, Compressor, GenericCompressor};
pub use types::{CompressionResult, CompressionScheme};
