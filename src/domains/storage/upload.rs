use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncReadExt;

use crate::config::UploadSettings;
use crate::domains::export::types::{CancelHandle, ExportJob};
use crate::domains::storage::cloud_storage::{CompletedPart, ObjectOptions, ObjectStorage};
use crate::errors::{ExportError, PipelineResult, StorageError};

/// Default object key: `exports/YYYY/MM/DD/{id}/{id}.{ext}`.
pub fn default_object_key(job: &ExportJob) -> String {
    format!(
        "exports/{}/{}/{}.{}",
        job.created_at.format("%Y/%m/%d"),
        job.export_id,
        job.export_id,
        job.artifact_extension()
    )
}

/// Content type, metadata and tags for the delivered object.
pub fn object_options(job: &ExportJob, row_count: u64, chunk_count: usize, settings: &UploadSettings) -> ObjectOptions {
    let content_type = if job.request.encrypt || job.request.compression.is_some() {
        mime::APPLICATION_OCTET_STREAM.to_string()
    } else {
        job.format().content_type().to_string()
    };

    let mut metadata = BTreeMap::new();
    metadata.insert("export-id".to_string(), job.export_id.clone());
    metadata.insert("format".to_string(), job.format().as_str().to_string());
    metadata.insert("row-count".to_string(), row_count.to_string());
    metadata.insert("chunk-count".to_string(), chunk_count.to_string());
    metadata.insert("created-at".to_string(), job.created_at.to_rfc3339());

    let mut tags = BTreeMap::new();
    tags.insert("Project".to_string(), settings.project_tag.clone());
    tags.insert("Type".to_string(), "export".to_string());
    tags.insert("Format".to_string(), job.format().as_str().to_string());
    tags.insert("ExportId".to_string(), job.export_id.clone());
    tags.insert("CreatedDate".to_string(), job.created_at.format("%Y-%m-%d").to_string());

    ObjectOptions {
        content_type,
        server_side_encryption: settings.server_side_encryption,
        metadata,
        tags,
    }
}

/// Delivers an artifact file to one storage backend.
///
/// A file no larger than one part goes up as a single object; anything
/// larger is streamed as ordered, part-sized byte ranges of one multipart
/// object.
pub struct Uploader {
    storage: Arc<dyn ObjectStorage>,
    settings: UploadSettings,
}

impl Uploader {
    pub fn new(storage: Arc<dyn ObjectStorage>, settings: UploadSettings) -> Self {
        Self { storage, settings }
    }

    /// Upload `file` to `bucket/key` and return the canonical URI.
    pub async fn upload(
        &self,
        bucket: &str,
        key: &str,
        file: &Path,
        options: &ObjectOptions,
        cancel: &CancelHandle,
    ) -> PipelineResult<String> {
        let size = tokio::fs::metadata(file).await?.len();
        let part_size = self.settings.part_size_bytes.max(1);
        let parts = if size <= part_size {
            self.upload_single(bucket, key, file, options).await?;
            1
        } else {
            self.upload_multipart(bucket, key, file, size, options, cancel).await?
        };

        let uri = self.storage.object_uri(bucket, key);
        log::info!("Uploaded {} bytes in {} part(s) to {}", size, parts, uri);
        Ok(uri)
    }

    async fn upload_single(
        &self,
        bucket: &str,
        key: &str,
        file: &Path,
        options: &ObjectOptions,
    ) -> PipelineResult<()> {
        let body = tokio::fs::read(file).await?;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.storage.put_object(bucket, key, body.clone(), options).await {
                Ok(()) => return Ok(()),
                Err(StorageError::Transient(message)) if attempt < self.settings.max_part_attempts => {
                    log::warn!("Object upload attempt {} failed: {}", attempt, message);
                    tokio::time::sleep(self.settings.retry_base_delay() * attempt).await;
                }
                Err(e) => {
                    return Err(ExportError::UploadFailed {
                        part: None,
                        message: e.to_string(),
                    })
                }
            }
        }
    }

    async fn upload_part_with_retry(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Vec<u8>,
    ) -> PipelineResult<CompletedPart> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self
                .storage
                .upload_part(bucket, key, upload_id, part_number, body.clone())
                .await
            {
                Ok(etag) => return Ok(CompletedPart { part_number, etag }),
                Err(StorageError::Transient(message)) if attempt < self.settings.max_part_attempts => {
                    log::warn!(
                        "Part {} upload attempt {}/{} failed: {}",
                        part_number,
                        attempt,
                        self.settings.max_part_attempts,
                        message
                    );
                    tokio::time::sleep(self.settings.retry_base_delay() * attempt).await;
                }
                Err(e) => {
                    return Err(ExportError::UploadFailed {
                        part: Some(part_number),
                        message: format!("after {} attempt(s): {}", attempt, e),
                    })
                }
            }
        }
    }

    async fn abort(&self, bucket: &str, key: &str, upload_id: &str) {
        match self.storage.abort_multipart_upload(bucket, key, upload_id).await {
            Ok(()) => log::info!("Aborted multipart upload {}", upload_id),
            Err(e) => log::error!("Failed to abort multipart upload {}: {}", upload_id, e),
        }
    }

    async fn upload_multipart(
        &self,
        bucket: &str,
        key: &str,
        file: &Path,
        size: u64,
        options: &ObjectOptions,
        cancel: &CancelHandle,
    ) -> PipelineResult<u32> {
        let part_size = self.settings.part_size_bytes.max(1);
        let part_count = size.div_ceil(part_size) as u32;
        let upload_id = self
            .storage
            .create_multipart_upload(bucket, key, options)
            .await
            .map_err(|e| ExportError::UploadFailed {
                part: None,
                message: format!("Failed to start multipart upload: {}", e),
            })?;
        log::debug!("Started multipart upload {} with {} parts", upload_id, part_count);

        let mut input = match tokio::fs::File::open(file).await {
            Ok(input) => input,
            Err(e) => {
                self.abort(bucket, key, &upload_id).await;
                return Err(e.into());
            }
        };

        let mut parts = Vec::with_capacity(part_count as usize);
        let mut offset = 0u64;
        for part_number in 1..=part_count {
            if cancel.is_cancelled() {
                self.abort(bucket, key, &upload_id).await;
                return Err(ExportError::Cancelled);
            }

            let mut body = vec![0u8; part_size.min(size - offset) as usize];
            if let Err(e) = input.read_exact(&mut body).await {
                self.abort(bucket, key, &upload_id).await;
                return Err(e.into());
            }
            offset += body.len() as u64;

            match self.upload_part_with_retry(bucket, key, &upload_id, part_number, body).await {
                Ok(part) => parts.push(part),
                Err(e) => {
                    self.abort(bucket, key, &upload_id).await;
                    return Err(e);
                }
            }
        }

        parts.sort_by_key(|p| p.part_number);
        if let Err(e) = self
            .storage
            .complete_multipart_upload(bucket, key, &upload_id, &parts)
            .await
        {
            self.abort(bucket, key, &upload_id).await;
            return Err(match e {
                StorageError::MissingParts(missing) => ExportError::IncompleteUpload(format!(
                    "Upload {} is missing parts {:?}",
                    upload_id, missing
                )),
                other => ExportError::UploadFailed {
                    part: None,
                    message: format!("Failed to complete multipart upload: {}", other),
                },
            });
        }
        Ok(part_count)
    }
}
