// Public modules
pub mod config;
pub mod domains;
pub mod errors;

pub use config::ExportConfig;
pub use domains::export::{ChunkSource, ExportOrchestrator, ExportRequest};
pub use errors::{ExportError, PipelineResult};

/// Initialize logging from `RUST_LOG`. Safe to call more than once.
pub fn init_logging() {
    // Initialize env_logger if not already initialized
    let _ = env_logger::try_init();
}
