use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::domains::export::memory::MemoryGovernor;
use crate::domains::export::types::Row;
use crate::errors::{ExportError, PipelineResult};

/// Supplier of ordered row batches for a named dataset.
///
/// Returning fewer than `limit` rows (including zero) signals end of data.
#[async_trait]
pub trait ChunkSource: Send + Sync {
    async fn get_chunk(
        &self,
        dataset: &str,
        options: &serde_json::Value,
        offset: u64,
        limit: usize,
    ) -> PipelineResult<Vec<Row>>;
}

/// A batch pulled from the source together with its position.
#[derive(Debug, Clone)]
pub struct SourceBatch {
    pub offset: u64,
    pub rows: Vec<Row>,
}

/// Lazily pull batches from `offset` onward.
///
/// A reader task fetches batch n+1 while the consumer writes batch n. The
/// stream ends after the first short batch or the first error; dropping it
/// stops the reader at its next send.
pub fn batch_stream(
    source: Arc<dyn ChunkSource>,
    governor: Arc<MemoryGovernor>,
    dataset: String,
    options: serde_json::Value,
    start_offset: u64,
    limit: usize,
) -> ReceiverStream<PipelineResult<SourceBatch>> {
    let (tx, rx) = mpsc::channel::<PipelineResult<SourceBatch>>(1);

    tokio::spawn(async move {
        let mut offset = start_offset;
        loop {
            if governor.should_collect() {
                governor.force_collect();
            }

            let result = source
                .get_chunk(&dataset, &options, offset, limit)
                .await
                .map_err(|e| match e {
                    ExportError::Source(_) => e,
                    other => ExportError::Source(other.to_string()),
                });

            match result {
                Ok(rows) => {
                    let row_count = rows.len();
                    log::debug!("Pulled {} rows from '{}' at offset {}", row_count, dataset, offset);
                    if tx.send(Ok(SourceBatch { offset, rows })).await.is_err() {
                        return;
                    }
                    if row_count < limit {
                        return;
                    }
                    offset += row_count as u64;
                }
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            }
        }
    });

    ReceiverStream::new(rx)
}

/// In-memory source backed by a fixed row set.
#[derive(Debug, Clone, Default)]
pub struct VecChunkSource {
    rows: Vec<Row>,
}

impl VecChunkSource {
    pub fn new(rows: Vec<Row>) -> Self {
        Self { rows }
    }
}

#[async_trait]
impl ChunkSource for VecChunkSource {
    async fn get_chunk(
        &self,
        _dataset: &str,
        _options: &serde_json::Value,
        offset: u64,
        limit: usize,
    ) -> PipelineResult<Vec<Row>> {
        let start = (offset as usize).min(self.rows.len());
        let end = (start + limit).min(self.rows.len());
        Ok(self.rows[start..end].to_vec())
    }
}
