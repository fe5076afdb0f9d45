use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domains::encryption::KdfParams;
use crate::domains::storage::StorageProvider;
use crate::errors::{ExportError, PipelineResult};

const MB: u64 = 1024 * 1024;

/// Memory thresholds used by the governor, in MiB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryThresholds {
    pub warning_mb: u64,
    pub critical_mb: u64,
    pub collect_hint_mb: u64,
}

impl Default for MemoryThresholds {
    fn default() -> Self {
        Self {
            warning_mb: 512,
            critical_mb: 1024,
            collect_hint_mb: 256,
        }
    }
}

impl MemoryThresholds {
    pub fn warning_bytes(&self) -> u64 {
        self.warning_mb * MB
    }

    pub fn critical_bytes(&self) -> u64 {
        self.critical_mb * MB
    }

    pub fn collect_hint_bytes(&self) -> u64 {
        self.collect_hint_mb * MB
    }
}

/// Retry and tagging settings for object-storage delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSettings {
    /// Objects larger than this go up as multipart ranges of this size
    pub part_size_bytes: u64,
    pub max_part_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub server_side_encryption: bool,
    pub project_tag: String,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            part_size_bytes: 8 * MB,
            max_part_attempts: 3,
            retry_base_delay_ms: 1000,
            server_side_encryption: true,
            project_tag: "sentiment-workbench".to_string(),
        }
    }
}

impl UploadSettings {
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }
}

/// Webhook endpoint notified after a successful export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub url: String,
    pub secret: String,
    pub max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub timeout_secs: u64,
}

impl WebhookConfig {
    pub fn new(url: &str, secret: &str) -> Self {
        Self {
            url: url.to_string(),
            secret: secret.to_string(),
            max_attempts: 3,
            retry_base_delay_ms: 1000,
            timeout_secs: 10,
        }
    }
}

/// Credentials handed to storage backends at construction.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct StorageCredentials {
    pub access_key: String,
    pub secret_key: String,
    pub region: Option<String>,
}

impl std::fmt::Debug for StorageCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageCredentials")
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .field("region", &self.region)
            .finish()
    }
}

/// Validated configuration passed to the orchestrator at construction.
#[derive(Clone, Serialize, Deserialize)]
pub struct ExportConfig {
    pub memory: MemoryThresholds,
    /// Number of chunks encoded between two full memory checks
    pub memory_check_interval: usize,
    pub default_chunk_size: usize,
    pub expiration_hours: i64,
    pub output_dir: PathBuf,
    pub checkpoint_dir: Option<PathBuf>,
    pub encryption_password: Option<String>,
    pub kdf: KdfParams,
    pub webhook: Option<WebhookConfig>,
    pub upload: UploadSettings,
    pub credentials: HashMap<StorageProvider, StorageCredentials>,
}

impl std::fmt::Debug for ExportConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExportConfig")
            .field("memory", &self.memory)
            .field("memory_check_interval", &self.memory_check_interval)
            .field("default_chunk_size", &self.default_chunk_size)
            .field("expiration_hours", &self.expiration_hours)
            .field("output_dir", &self.output_dir)
            .field("checkpoint_dir", &self.checkpoint_dir)
            .field("encryption_password", &self.encryption_password.as_ref().map(|_| "<redacted>"))
            .field("kdf", &self.kdf)
            .field("webhook", &self.webhook.as_ref().map(|w| &w.url))
            .field("upload", &self.upload)
            .field("credentials", &self.credentials)
            .finish()
    }
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            memory: MemoryThresholds::default(),
            memory_check_interval: 10,
            default_chunk_size: 10_000,
            expiration_hours: 24,
            output_dir: std::env::temp_dir().join("exports"),
            checkpoint_dir: None,
            encryption_password: None,
            kdf: KdfParams::default(),
            webhook: None,
            upload: UploadSettings::default(),
            credentials: HashMap::new(),
        }
    }
}

impl ExportConfig {
    /// Load `.env` if present, then read configuration from the process environment.
    pub fn from_env() -> PipelineResult<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from any key lookup, starting from defaults.
    pub fn from_lookup<F>(lookup: F) -> PipelineResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = parse_var::<u64, _>(&lookup, "EXPORT_MEMORY_WARNING_MB")? {
            config.memory.warning_mb = v;
        }
        if let Some(v) = parse_var::<u64, _>(&lookup, "EXPORT_MEMORY_CRITICAL_MB")? {
            config.memory.critical_mb = v;
        }
        if let Some(v) = parse_var::<u64, _>(&lookup, "EXPORT_MEMORY_GC_MB")? {
            config.memory.collect_hint_mb = v;
        }
        if let Some(v) = parse_var::<usize, _>(&lookup, "EXPORT_MEMORY_CHECK_INTERVAL")? {
            config.memory_check_interval = v;
        }
        if let Some(v) = parse_var::<usize, _>(&lookup, "EXPORT_CHUNK_SIZE")? {
            config.default_chunk_size = v;
        }
        if let Some(v) = parse_var::<i64, _>(&lookup, "EXPORT_EXPIRATION_HOURS")? {
            config.expiration_hours = v;
        }
        if let Some(dir) = lookup("EXPORT_OUTPUT_DIR") {
            config.output_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("EXPORT_CHECKPOINT_DIR") {
            config.checkpoint_dir = Some(PathBuf::from(dir));
        }
        config.encryption_password = lookup("EXPORT_ENCRYPTION_PASSWORD").filter(|p| !p.is_empty());

        if let Some(url) = lookup("EXPORT_WEBHOOK_URL").filter(|u| !u.is_empty()) {
            let secret = lookup("EXPORT_WEBHOOK_SECRET").unwrap_or_default();
            config.webhook = Some(WebhookConfig::new(&url, &secret));
        }

        if let Some(v) = parse_var::<u32, _>(&lookup, "EXPORT_UPLOAD_MAX_ATTEMPTS")? {
            config.upload.max_part_attempts = v;
        }
        if let Some(v) = parse_var::<u64, _>(&lookup, "EXPORT_UPLOAD_RETRY_DELAY_MS")? {
            config.upload.retry_base_delay_ms = v;
        }
        if let Some(v) = parse_var::<u64, _>(&lookup, "EXPORT_UPLOAD_PART_SIZE_MB")? {
            config.upload.part_size_bytes = v * MB;
        }

        if let (Some(access_key), Some(secret_key)) =
            (lookup("AWS_ACCESS_KEY_ID"), lookup("AWS_SECRET_ACCESS_KEY"))
        {
            config.credentials.insert(
                StorageProvider::S3,
                StorageCredentials {
                    access_key,
                    secret_key,
                    region: lookup("AWS_REGION"),
                },
            );
        }
        if let (Some(account), Some(key)) =
            (lookup("AZURE_STORAGE_ACCOUNT"), lookup("AZURE_STORAGE_KEY"))
        {
            config.credentials.insert(
                StorageProvider::Azure,
                StorageCredentials {
                    access_key: account,
                    secret_key: key,
                    region: None,
                },
            );
        }

        config.validate()?;
        Ok(config)
    }

    pub fn credentials_for(&self, provider: StorageProvider) -> Option<&StorageCredentials> {
        self.credentials.get(&provider)
    }

    /// Reject inconsistent settings before any job starts.
    pub fn validate(&self) -> PipelineResult<()> {
        if self.default_chunk_size == 0 {
            return Err(ExportError::Configuration("default chunk size must be greater than zero".to_string()));
        }
        if self.memory_check_interval == 0 {
            return Err(ExportError::Configuration("memory check interval must be greater than zero".to_string()));
        }
        if self.memory.warning_mb >= self.memory.critical_mb {
            return Err(ExportError::Configuration(format!(
                "memory warning threshold ({} MB) must be below the critical threshold ({} MB)",
                self.memory.warning_mb, self.memory.critical_mb
            )));
        }
        if self.memory.collect_hint_mb > self.memory.warning_mb {
            return Err(ExportError::Configuration(format!(
                "collect threshold ({} MB) must not exceed the warning threshold ({} MB)",
                self.memory.collect_hint_mb, self.memory.warning_mb
            )));
        }
        if self.expiration_hours <= 0 {
            return Err(ExportError::Configuration("export expiration must be a positive number of hours".to_string()));
        }
        if self.upload.part_size_bytes == 0 {
            return Err(ExportError::Configuration("upload part size must be greater than zero".to_string()));
        }
        if self.upload.max_part_attempts == 0 {
            return Err(ExportError::Configuration("upload attempts must be at least 1".to_string()));
        }
        if let Some(webhook) = &self.webhook {
            if webhook.secret.is_empty() {
                return Err(ExportError::Configuration("webhook URL configured without a signing secret".to_string()));
            }
            if webhook.max_attempts == 0 {
                return Err(ExportError::Configuration("webhook attempts must be at least 1".to_string()));
            }
        }
        self.kdf.validate()?;
        Ok(())
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> PipelineResult<Option<T>>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ExportError::Configuration(format!("{} has an invalid value: {}", key, raw))),
    }
}
