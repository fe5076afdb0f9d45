use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::config::ExportConfig;
use crate::domains::compression::{compressor_for, CompressionScheme};
use crate::domains::encryption::encrypt_file;
use crate::domains::export::checkpoint::{
    CheckpointStorage, FileCheckpointStorage, MemoryCheckpointStorage, ResumableState,
};
use crate::domains::export::checksum::{sha256_files, total_size};
use crate::domains::export::memory::MemoryGovernor;
use crate::domains::export::source::{batch_stream, ChunkSource, SourceBatch};
use crate::domains::export::types::*;
use crate::domains::export::writer::{assemble_segments, ArtifactWriter};
use crate::domains::notification::WebhookNotifier;
use crate::domains::storage::{default_object_key, object_options, StorageRegistry, Uploader};
use crate::errors::{ExportError, PipelineResult};

const EVENT_CAPACITY: usize = 256;

type StageResult<T> = Result<T, (ExportState, ExportError)>;

fn at(stage: ExportState) -> impl FnOnce(ExportError) -> (ExportState, ExportError) {
    move |e| (stage, e)
}

/// Per-job record owned by the task running the export.
struct JobContext {
    job: ExportJob,
    result: ExportResult,
    csv_columns: Option<Vec<String>>,
    work_dir: PathBuf,
    resumed: bool,
}

/// Drives an export through reading, encoding, post-processing and delivery.
pub struct ExportOrchestrator {
    config: ExportConfig,
    source: Arc<dyn ChunkSource>,
    governor: Arc<MemoryGovernor>,
    storage: StorageRegistry,
    checkpoints: Arc<dyn CheckpointStorage>,
    notifier: Option<Arc<WebhookNotifier>>,
    events: broadcast::Sender<ExportEvent>,
}

impl std::fmt::Debug for ExportOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExportOrchestrator")
            .field("config", &self.config)
            .field("source", &"<ChunkSource>")
            .field("storage", &self.storage)
            .field("checkpoints", &"<CheckpointStorage>")
            .field("notifier", &self.notifier.is_some())
            .finish()
    }
}

impl ExportOrchestrator {
    pub fn new(config: ExportConfig, source: Arc<dyn ChunkSource>) -> PipelineResult<Self> {
        config.validate()?;

        let checkpoints: Arc<dyn CheckpointStorage> = match &config.checkpoint_dir {
            Some(dir) => Arc::new(FileCheckpointStorage::new(dir)),
            None => Arc::new(MemoryCheckpointStorage::new()),
        };
        let notifier = config.webhook.clone().map(|webhook| Arc::new(WebhookNotifier::new(webhook)));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Ok(Self {
            governor: MemoryGovernor::shared(config.memory),
            config,
            source,
            storage: StorageRegistry::new(),
            checkpoints,
            notifier,
            events,
        })
    }

    pub fn with_governor(mut self, governor: Arc<MemoryGovernor>) -> Self {
        self.governor = governor;
        self
    }

    pub fn with_storage(mut self, storage: StorageRegistry) -> Self {
        self.storage = storage;
        self
    }

    pub fn with_checkpoints(mut self, checkpoints: Arc<dyn CheckpointStorage>) -> Self {
        self.checkpoints = checkpoints;
        self
    }

    pub fn governor(&self) -> Arc<MemoryGovernor> {
        self.governor.clone()
    }

    /// Receive progress events for every export run by this orchestrator.
    pub fn subscribe(&self) -> broadcast::Receiver<ExportEvent> {
        self.events.subscribe()
    }

    pub async fn export(&self, request: ExportRequest) -> Result<ExportMetadata, ExportFailure> {
        self.export_with_cancel(request, &CancelHandle::new()).await
    }

    pub async fn export_with_cancel(
        &self,
        request: ExportRequest,
        cancel: &CancelHandle,
    ) -> Result<ExportMetadata, ExportFailure> {
        let job = ExportJob::new(request, self.config.default_chunk_size, self.config.expiration_hours);
        log::info!(
            "Starting export {} of '{}' as {} (chunk size {})",
            job.export_id,
            job.request.dataset,
            job.format().as_str(),
            job.chunk_size
        );
        let ctx = JobContext {
            result: ExportResult::new(&job.export_id, job.format()),
            work_dir: job.work_dir(&self.config.output_dir),
            job,
            csv_columns: None,
            resumed: false,
        };
        self.run(ctx, cancel).await
    }

    pub async fn resume(&self, export_id: &str) -> Result<ExportMetadata, ExportFailure> {
        self.resume_with_cancel(export_id, &CancelHandle::new()).await
    }

    /// Continue a failed resumable export from its last checkpoint.
    pub async fn resume_with_cancel(
        &self,
        export_id: &str,
        cancel: &CancelHandle,
    ) -> Result<ExportMetadata, ExportFailure> {
        let state = match self.checkpoints.load_resumable(export_id).await {
            Ok(state) => state,
            Err(error) => {
                return Err(ExportFailure {
                    export_id: export_id.to_string(),
                    stage: ExportState::Created,
                    error,
                    checkpoint_saved: false,
                })
            }
        };

        let job = state.job();
        log::info!(
            "Resuming export {} from offset {} ({} chunks done, failed during {:?})",
            job.export_id,
            state.last_offset,
            state.chunks.len(),
            state.failed_stage
        );
        let ctx = JobContext {
            result: state.result(),
            work_dir: job.work_dir(&self.config.output_dir),
            job,
            csv_columns: state.csv_columns.clone(),
            resumed: true,
        };
        self.run(ctx, cancel).await
    }

    /// Remove the artifacts and checkpoint of an export.
    pub async fn cleanup(&self, export_id: &str) -> PipelineResult<()> {
        let work_dir = self.config.output_dir.join(export_id);
        match tokio::fs::remove_dir_all(&work_dir).await {
            Ok(()) => log::debug!("Removed export directory {:?}", work_dir),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.checkpoints.delete(export_id).await
    }

    /// Drop checkpoints and artifacts of exports past their expiry. Returns how many were removed.
    pub async fn purge_expired(&self) -> PipelineResult<usize> {
        let now = chrono::Utc::now();
        let mut purged = 0;
        for state in self.checkpoints.list().await? {
            if state.is_expired(now) {
                self.cleanup(&state.export_id).await?;
                purged += 1;
            }
        }
        if purged > 0 {
            log::info!("Purged {} expired export checkpoint(s)", purged);
        }
        Ok(purged)
    }

    fn emit(&self, event: ExportEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn set_state(&self, ctx: &mut JobContext, state: ExportState) {
        if ctx.job.state == state {
            return;
        }
        log::debug!("Export {}: {:?} -> {:?}", ctx.job.export_id, ctx.job.state, state);
        ctx.job.state = state;
        self.emit(ExportEvent::StateChanged {
            export_id: ctx.job.export_id.clone(),
            state,
        });
    }

    /// Reject requests that cannot succeed before touching the source or disk.
    fn preflight(&self, job: &ExportJob) -> PipelineResult<()> {
        if job.request.encrypt && self.config.encryption_password.is_none() {
            return Err(ExportError::MissingEncryptionPassword);
        }
        if let Some(scheme) = job.request.compression {
            compressor_for(scheme)?;
        }
        if let Some(destination) = &job.request.destination {
            self.storage.get(destination.provider)?;
            if self.config.credentials_for(destination.provider).is_none() {
                return Err(ExportError::Configuration(format!(
                    "No credentials configured for storage provider '{}'",
                    destination.provider.as_str()
                )));
            }
        }
        Ok(())
    }

    async fn run(&self, mut ctx: JobContext, cancel: &CancelHandle) -> Result<ExportMetadata, ExportFailure> {
        let mut writer = ArtifactWriter::create(&ctx.job, &ctx.work_dir, ctx.csv_columns.clone());

        let outcome = match self.preflight(&ctx.job) {
            Ok(()) => self.execute(&mut ctx, &mut writer, cancel).await,
            Err(e) => Err((ExportState::Created, e)),
        };

        match outcome {
            Ok(metadata) => Ok(metadata),
            Err((stage, error)) => Err(self.fail(&mut ctx, &mut writer, stage, error).await),
        }
    }

    async fn execute(
        &self,
        ctx: &mut JobContext,
        writer: &mut ArtifactWriter,
        cancel: &CancelHandle,
    ) -> StageResult<ExportMetadata> {
        self.governor.ensure_headroom().map_err(at(ExportState::Created))?;
        tokio::fs::create_dir_all(&ctx.work_dir)
            .await
            .map_err(|e| (ExportState::Created, e.into()))?;

        if !ctx.result.completed {
            self.read_and_encode(ctx, writer, cancel).await?;
        }

        let artifact = self.finalize_artifact(ctx).await?;

        if ctx.job.request.encrypt {
            self.encrypt_artifact(ctx, &artifact, cancel).await?;
        }
        if let Some(scheme) = ctx.job.request.compression {
            self.compress_artifact(ctx, &artifact, scheme, cancel).await?;
        }

        self.set_state(ctx, ExportState::Checksumming);
        let paths = std::slice::from_ref(&artifact);
        let checksum = sha256_files(paths).await.map_err(at(ExportState::Checksumming))?;
        let file_size = total_size(paths).await.map_err(at(ExportState::Checksumming))?;

        let cloud_url = match ctx.job.request.destination.clone() {
            Some(destination) => {
                self.set_state(ctx, ExportState::Uploading);
                let backend = self.storage.get(destination.provider).map_err(at(ExportState::Uploading))?;
                let key = destination.key.clone().unwrap_or_else(|| default_object_key(&ctx.job));
                let options = object_options(
                    &ctx.job,
                    ctx.result.total_rows,
                    ctx.result.chunks.len(),
                    &self.config.upload,
                );
                let uri = Uploader::new(backend, self.config.upload.clone())
                    .upload(&destination.bucket, &key, &artifact, &options, cancel)
                    .await
                    .map_err(at(ExportState::Uploading))?;
                Some(uri)
            }
            None => None,
        };

        let metadata = ExportMetadata {
            export_id: ctx.job.export_id.clone(),
            format: ctx.job.format(),
            row_count: ctx.result.total_rows,
            file_size,
            checksum,
            encrypted: ctx.job.request.encrypt,
            compressed: ctx.job.request.compression.is_some(),
            cloud_url,
            created_at: ctx.job.created_at,
            expires_at: ctx.job.expires_at,
            memory_stats: self.governor.snapshot(),
            artifact_path: artifact.clone(),
        };

        if ctx.resumed || ctx.job.request.resumable {
            if let Err(e) = self.checkpoints.delete(&ctx.job.export_id).await {
                log::warn!("Failed to delete checkpoint for {}: {}", ctx.job.export_id, e);
            }
        }

        if let Some(notifier) = self.notifier.clone() {
            let delivered = metadata.clone();
            tokio::spawn(async move {
                notifier.notify(&delivered).await;
            });
        }

        self.set_state(ctx, ExportState::Completed);
        log::info!(
            "Export {} completed: {} rows in {} chunk(s), {} bytes",
            metadata.export_id,
            metadata.row_count,
            ctx.result.chunks.len(),
            metadata.file_size
        );
        self.emit(ExportEvent::Completed(metadata.clone()));
        Ok(metadata)
    }

    async fn read_and_encode(
        &self,
        ctx: &mut JobContext,
        writer: &mut ArtifactWriter,
        cancel: &CancelHandle,
    ) -> StageResult<()> {
        self.set_state(ctx, ExportState::Reading);
        let chunk_size = ctx.job.chunk_size;
        let mut stream = batch_stream(
            self.source.clone(),
            self.governor.clone(),
            ctx.job.request.dataset.clone(),
            ctx.job.request.source_options.clone(),
            ctx.result.next_offset(),
            chunk_size,
        );

        // One batch of lookahead decides whether the held batch is the last.
        let mut pending: Option<SourceBatch> = None;
        loop {
            if cancel.is_cancelled() {
                return Err((ctx.job.state, ExportError::Cancelled));
            }

            let next = match stream.next().await {
                Some(Ok(batch)) => Some(batch),
                Some(Err(e)) => {
                    if let Some(held) = pending.take() {
                        self.write_batch(ctx, writer, held, false).await?;
                    }
                    return Err((ExportState::Reading, e));
                }
                None => None,
            };

            if let Some(held) = pending.take() {
                let last = next.as_ref().map_or(true, |b| b.rows.is_empty());
                self.write_batch(ctx, writer, held, last).await?;
                if last {
                    break;
                }
            }

            let batch = next.unwrap_or_else(|| SourceBatch {
                offset: ctx.result.next_offset(),
                rows: Vec::new(),
            });
            if batch.rows.len() < chunk_size {
                self.write_batch(ctx, writer, batch, true).await?;
                break;
            }
            pending = Some(batch);
        }

        log::debug!(
            "Export {} encoded {} rows in {} chunks",
            ctx.job.export_id,
            ctx.result.total_rows,
            ctx.result.chunks.len()
        );
        Ok(())
    }

    async fn write_batch(
        &self,
        ctx: &mut JobContext,
        writer: &mut ArtifactWriter,
        batch: SourceBatch,
        last: bool,
    ) -> StageResult<()> {
        self.set_state(ctx, ExportState::Encoding);
        let index = ctx.result.chunks.len();
        let framing = BatchFraming {
            first: index == 0,
            last,
        };

        let chunk = writer
            .write_chunk(index, batch.offset, &batch.rows, framing)
            .await
            .map_err(at(ExportState::Encoding))?;
        ctx.result.push_chunk(chunk);
        ctx.csv_columns = writer.columns();
        if last {
            ctx.result.completed = true;
        }

        self.emit(ExportEvent::ChunkWritten {
            export_id: ctx.job.export_id.clone(),
            index,
            rows_total: ctx.result.total_rows,
            bytes_total: ctx.result.total_bytes,
        });

        if (index + 1) % self.config.memory_check_interval == 0 {
            self.governor.ensure_headroom().map_err(at(ExportState::Encoding))?;
        }
        Ok(())
    }

    /// Join the encoded segments into the single file every later stage works on.
    async fn finalize_artifact(&self, ctx: &mut JobContext) -> StageResult<PathBuf> {
        if let Some(artifact) = &ctx.result.artifact {
            return Ok(artifact.clone());
        }

        let target = ctx.job.artifact_path(&ctx.work_dir);
        if ctx.job.format() != ExportFormat::Columnar {
            self.set_state(ctx, ExportState::Encoding);
            let bytes = assemble_segments(ctx.result.segment_paths(), target.clone())
                .await
                .map_err(at(ExportState::Encoding))?;
            log::debug!("Export {} assembled into {:?} ({} bytes)", ctx.job.export_id, target, bytes);
        }
        ctx.result.artifact = Some(target.clone());
        Ok(target)
    }

    async fn encrypt_artifact(&self, ctx: &mut JobContext, artifact: &Path, cancel: &CancelHandle) -> StageResult<()> {
        if ctx.result.encrypted {
            return Ok(());
        }
        self.set_state(ctx, ExportState::Encrypting);
        let password = self
            .config
            .encryption_password
            .clone()
            .ok_or((ExportState::Encrypting, ExportError::MissingEncryptionPassword))?;
        if cancel.is_cancelled() {
            return Err((ExportState::Encrypting, ExportError::Cancelled));
        }

        encrypt_file(artifact, &password, &self.config.kdf)
            .await
            .map_err(at(ExportState::Encrypting))?;
        ctx.result.encrypted = true;
        Ok(())
    }

    async fn compress_artifact(
        &self,
        ctx: &mut JobContext,
        artifact: &Path,
        scheme: CompressionScheme,
        cancel: &CancelHandle,
    ) -> StageResult<()> {
        if ctx.result.compressed {
            return Ok(());
        }
        self.set_state(ctx, ExportState::Compressing);
        let compressor = compressor_for(scheme).map_err(at(ExportState::Compressing))?;
        if cancel.is_cancelled() {
            return Err((ExportState::Compressing, ExportError::Cancelled));
        }

        let outcome = compressor
            .compress_file(artifact)
            .await
            .map_err(at(ExportState::Compressing))?;
        log::debug!(
            "Compressed {:?} with {} to {:.1}% of its size",
            artifact,
            compressor.scheme().as_str(),
            outcome.ratio() * 100.0
        );
        ctx.result.compressed = true;
        Ok(())
    }

    async fn fail(
        &self,
        ctx: &mut JobContext,
        writer: &mut ArtifactWriter,
        stage: ExportState,
        error: ExportError,
    ) -> ExportFailure {
        if ctx.job.format() == ExportFormat::Columnar && !ctx.result.completed {
            writer.abandon().await;
            ctx.result = ExportResult::new(&ctx.job.export_id, ctx.job.format());
        }

        let checkpoint_saved = if stage == ExportState::Created {
            ctx.resumed
        } else if ctx.job.request.resumable || ctx.resumed {
            let state = ResumableState::capture(&ctx.job, &ctx.result, ctx.csv_columns.clone(), stage);
            match self.checkpoints.save(&state).await {
                Ok(()) => true,
                Err(e) => {
                    log::error!("Failed to save checkpoint for {}: {}", ctx.job.export_id, e);
                    false
                }
            }
        } else {
            false
        };

        if !checkpoint_saved && !ctx.resumed && stage != ExportState::Created {
            if let Err(e) = tokio::fs::remove_dir_all(&ctx.work_dir).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    log::warn!("Failed to remove partial artifacts {:?}: {}", ctx.work_dir, e);
                }
            }
        }

        self.set_state(ctx, ExportState::Failed);
        let failure = ExportFailure {
            export_id: ctx.job.export_id.clone(),
            stage,
            error,
            checkpoint_saved,
        };
        log::error!("{}", failure);
        self.emit(ExportEvent::Failed {
            export_id: failure.export_id.clone(),
            code: failure.code(),
            message: failure.message(),
            checkpoint_saved,
        });
        failure
    }
}
