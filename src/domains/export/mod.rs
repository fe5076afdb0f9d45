pub mod checkpoint;
pub mod checksum;
pub mod memory;
pub mod schemas;
pub mod service;
pub mod source;
pub mod types;
pub mod writer;
pub mod writers;

pub use checkpoint::{CheckpointStorage, FileCheckpointStorage, MemoryCheckpointStorage, ResumableState};
pub use memory::{MemoryGovernor, MemoryProbe, MemoryReading, ProcessMemoryProbe};
pub use service::ExportOrchestrator;
pub use source::{ChunkSource, VecChunkSource};
pub use types::{
    CancelHandle, Chunk, ExportEvent, ExportFailure, ExportFormat, ExportJob, ExportMetadata, ExportRequest,
    ExportResult, ExportState, MemoryPressureLevel, MemorySnapshot, Row,
};
pub use writer::{ArtifactWriter, TextEncoder};
