use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tokio::sync::Mutex;

use crate::domains::export::types::{Chunk, ExportJob, ExportRequest, ExportResult, ExportState};
use crate::errors::{ExportError, PipelineResult};

/// Everything needed to restart a failed export from its last durable chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumableState {
    pub export_id: String,
    pub dataset: String,
    pub request: ExportRequest,
    pub chunk_size: usize,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Offset of the first row not yet encoded
    pub last_offset: u64,
    pub rows_written: u64,
    pub chunks: Vec<Chunk>,
    /// CSV header order fixed by the first batch
    pub csv_columns: Option<Vec<String>>,
    pub source_exhausted: bool,
    /// Joined artifact, once assembled
    #[serde(default)]
    pub artifact: Option<PathBuf>,
    #[serde(default)]
    pub encrypted: bool,
    #[serde(default)]
    pub compressed: bool,
    pub failed_stage: ExportState,
    pub checkpointed_at: DateTime<Utc>,
}

impl ResumableState {
    pub fn capture(
        job: &ExportJob,
        result: &ExportResult,
        csv_columns: Option<Vec<String>>,
        failed_stage: ExportState,
    ) -> Self {
        Self {
            export_id: job.export_id.clone(),
            dataset: job.request.dataset.clone(),
            request: job.request.clone(),
            chunk_size: job.chunk_size,
            created_at: job.created_at,
            expires_at: job.expires_at,
            last_offset: result.next_offset(),
            rows_written: result.total_rows,
            chunks: result.chunks.clone(),
            csv_columns,
            source_exhausted: result.completed,
            artifact: result.artifact.clone(),
            encrypted: result.encrypted,
            compressed: result.compressed,
            failed_stage,
            checkpointed_at: Utc::now(),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Rebuild the job identity this checkpoint belongs to.
    pub fn job(&self) -> ExportJob {
        ExportJob {
            export_id: self.export_id.clone(),
            request: self.request.clone(),
            chunk_size: self.chunk_size,
            state: ExportState::Created,
            created_at: self.created_at,
            expires_at: self.expires_at,
        }
    }

    /// Rebuild the partial result from the completed chunks.
    pub fn result(&self) -> ExportResult {
        let mut result = ExportResult::new(&self.export_id, self.request.format);
        for chunk in &self.chunks {
            result.push_chunk(chunk.clone());
        }
        result.completed = self.source_exhausted;
        result.artifact = self.artifact.clone();
        result.encrypted = self.encrypted;
        result.compressed = self.compressed;
        result
    }
}

/// Persistence for resumable export state.
#[async_trait]
pub trait CheckpointStorage: Send + Sync {
    async fn save(&self, state: &ResumableState) -> PipelineResult<()>;
    async fn load(&self, export_id: &str) -> PipelineResult<Option<ResumableState>>;
    async fn delete(&self, export_id: &str) -> PipelineResult<()>;
    async fn list(&self) -> PipelineResult<Vec<ResumableState>>;

    /// Load a checkpoint that may still be resumed.
    async fn load_resumable(&self, export_id: &str) -> PipelineResult<ResumableState> {
        let state = self
            .load(export_id)
            .await?
            .ok_or_else(|| ExportError::CheckpointNotFound(export_id.to_string()))?;
        if state.is_expired(Utc::now()) {
            return Err(ExportError::CheckpointExpired(export_id.to_string()));
        }
        Ok(state)
    }
}

/// One JSON document per export under a directory.
#[derive(Debug, Clone)]
pub struct FileCheckpointStorage {
    dir: PathBuf,
}

impl FileCheckpointStorage {
    pub fn new(dir: &Path) -> Self {
        Self { dir: dir.to_path_buf() }
    }

    fn path_for(&self, export_id: &str) -> PathBuf {
        self.dir.join(format!("{}.checkpoint.json", export_id))
    }
}

#[async_trait]
impl CheckpointStorage for FileCheckpointStorage {
    async fn save(&self, state: &ResumableState) -> PipelineResult<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let bytes = serde_json::to_vec_pretty(state)?;
        let dir = self.dir.clone();
        let path = self.path_for(&state.export_id);

        tokio::task::spawn_blocking(move || -> PipelineResult<()> {
            let mut temp = NamedTempFile::new_in(&dir)?;
            temp.write_all(&bytes)?;
            temp.as_file().sync_all()?;
            temp.persist(&path)
                .map_err(|e| ExportError::Checkpoint(format!("Failed to persist checkpoint: {}", e.error)))?;
            Ok(())
        })
        .await??;

        log::debug!("Saved checkpoint for export {} at offset {}", state.export_id, state.last_offset);
        Ok(())
    }

    async fn load(&self, export_id: &str) -> PipelineResult<Option<ResumableState>> {
        match tokio::fs::read(self.path_for(export_id)).await {
            Ok(bytes) => {
                let state = serde_json::from_slice(&bytes)
                    .map_err(|e| ExportError::Checkpoint(format!("Corrupt checkpoint {}: {}", export_id, e)))?;
                Ok(Some(state))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, export_id: &str) -> PipelineResult<()> {
        match tokio::fs::remove_file(self.path_for(export_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> PipelineResult<Vec<ResumableState>> {
        let mut states = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(states),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(export_id) = name.strip_suffix(".checkpoint.json") {
                match self.load(export_id).await {
                    Ok(Some(state)) => states.push(state),
                    Ok(None) => {}
                    Err(e) => log::warn!("Skipping unreadable checkpoint {}: {}", name, e),
                }
            }
        }
        Ok(states)
    }
}

/// Checkpoints kept for the lifetime of the process.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStorage {
    states: Mutex<HashMap<String, ResumableState>>,
}

impl MemoryCheckpointStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStorage for MemoryCheckpointStorage {
    async fn save(&self, state: &ResumableState) -> PipelineResult<()> {
        self.states
            .lock()
            .await
            .insert(state.export_id.clone(), state.clone());
        Ok(())
    }

    async fn load(&self, export_id: &str) -> PipelineResult<Option<ResumableState>> {
        Ok(self.states.lock().await.get(export_id).cloned())
    }

    async fn delete(&self, export_id: &str) -> PipelineResult<()> {
        self.states.lock().await.remove(export_id);
        Ok(())
    }

    async fn list(&self) -> PipelineResult<Vec<ResumableState>> {
        Ok(self.states.lock().await.values().cloned().collect())
    }
}
