use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::Serialize;
use sha2::Sha256;
use std::time::Duration;

use crate::config::WebhookConfig;
use crate::domains::export::types::ExportMetadata;
use crate::errors::{ExportError, PipelineResult};

type HmacSha256 = Hmac<Sha256>;

pub const EVENT_EXPORT_COMPLETED: &str = "export_completed";
pub const PAYLOAD_VERSION: &str = "1.0";
pub const SIGNATURE_HEADER: &str = "X-Export-Signature";
pub const EVENT_HEADER: &str = "X-Export-Event";
const REDACTED: &str = "[REDACTED]";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPayload {
    pub event: String,
    pub metadata: ExportMetadata,
    pub timestamp: DateTime<Utc>,
    pub version: String,
}

impl WebhookPayload {
    /// Completion payload with the cloud location redacted.
    pub fn completed(metadata: &ExportMetadata) -> Self {
        let mut metadata = metadata.clone();
        if metadata.cloud_url.is_some() {
            metadata.cloud_url = Some(REDACTED.to_string());
        }
        Self {
            event: EVENT_EXPORT_COMPLETED.to_string(),
            metadata,
            timestamp: Utc::now(),
            version: PAYLOAD_VERSION.to_string(),
        }
    }
}

/// `sha256=<hex>` HMAC of `body` under `secret`.
pub fn sign(secret: &str, body: &[u8]) -> PipelineResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| ExportError::Notification(format!("Invalid webhook secret: {}", e)))?;
    mac.update(body);
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

/// Posts signed export notifications to one endpoint.
#[derive(Clone)]
pub struct WebhookNotifier {
    client: Client,
    config: WebhookConfig,
}

impl WebhookNotifier {
    pub fn new(config: WebhookConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(5))
            .user_agent(concat!("export-pipeline-core/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();

        Self { client, config }
    }

    async fn post_once(&self, body: &[u8], signature: &str) -> PipelineResult<()> {
        let response = self
            .client
            .post(&self.config.url)
            .header(reqwest::header::CONTENT_TYPE, mime::APPLICATION_JSON.as_ref())
            .header(EVENT_HEADER, EVENT_EXPORT_COMPLETED)
            .header(SIGNATURE_HEADER, signature)
            .body(body.to_vec())
            .send()
            .await
            .map_err(|e| ExportError::Notification(format!("Failed to send webhook: {}", e)))?;

        if response.status().is_success() {
            Ok(())
        } else {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to get error details".to_string());
            Err(ExportError::Notification(format!(
                "Webhook endpoint returned {}: {}",
                status, error_text
            )))
        }
    }

    /// Deliver the completion event, retrying with exponential backoff.
    pub async fn send(&self, metadata: &ExportMetadata) -> PipelineResult<()> {
        let payload = WebhookPayload::completed(metadata);
        let body = serde_json::to_vec(&payload)?;
        let signature = sign(&self.config.secret, &body)?;

        let attempts = self.config.max_attempts.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            match self.post_once(&body, &signature).await {
                Ok(()) => {
                    log::info!("Webhook delivered for export {}", metadata.export_id);
                    return Ok(());
                }
                Err(e) => {
                    log::warn!("Webhook attempt {}/{} failed: {}", attempt, attempts, e);
                    last_error = Some(e);
                    if attempt < attempts {
                        let delay = self.config.retry_base_delay_ms * 2u64.pow(attempt - 1);
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                    }
                }
            }
        }
        Err(last_error.unwrap_or_else(|| ExportError::Notification("Webhook was not sent".to_string())))
    }

    /// Send and swallow failures; notification never fails an export.
    pub async fn notify(&self, metadata: &ExportMetadata) -> bool {
        match self.send(metadata).await {
            Ok(()) => true,
            Err(e) => {
                log::error!("Webhook for export {} gave up: {}", metadata.export_id, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::export::types::{ExportFormat, MemorySnapshot};
    use std::path::PathBuf;

    fn metadata() -> ExportMetadata {
        let now = Utc::now();
        ExportMetadata {
            export_id: "abc".into(),
            format: ExportFormat::Csv,
            row_count: 3,
            file_size: 42,
            checksum: "00".into(),
            encrypted: true,
            compressed: false,
            cloud_url: Some("s3://private-bucket/exports/abc.csv.enc".into()),
            created_at: now,
            expires_at: now,
            memory_stats: MemorySnapshot::default(),
            artifact_path: PathBuf::from("/var/exports/abc/abc.csv"),
        }
    }

    #[test]
    fn test_payload_redacts_cloud_url() {
        let payload = WebhookPayload::completed(&metadata());
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["event"], "export_completed");
        assert_eq!(json["version"], "1.0");
        assert_eq!(json["metadata"]["cloudUrl"], "[REDACTED]");
        assert_eq!(json["metadata"]["rowCount"], 3);
        assert!(!json.to_string().contains("private-bucket"));
    }

    #[test]
    fn test_payload_leaves_out_local_paths() {
        let json = serde_json::to_value(WebhookPayload::completed(&metadata())).unwrap();
        assert!(json["metadata"].get("artifactPath").is_none());
        assert!(!json.to_string().contains("/var/exports"));
    }

    #[test]
    fn test_payload_without_cloud_url_omits_field() {
        let mut meta = metadata();
        meta.cloud_url = None;
        let json = serde_json::to_value(WebhookPayload::completed(&meta)).unwrap();
        assert!(json["metadata"].get("cloudUrl").is_none());
    }

    #[test]
    fn test_signature_matches_known_vector() {
        // RFC 4231 test case 2
        let signature = sign("Jefe", b"what do ya want for nothing?").unwrap();
        assert_eq!(
            signature,
            "sha256=5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_does_not_fail() {
        let mut config = WebhookConfig::new("http://127.0.0.1:9/hook", "secret");
        config.max_attempts = 2;
        config.retry_base_delay_ms = 1;
        config.timeout_secs = 1;
        let notifier = WebhookNotifier::new(config);

        assert!(notifier.send(&metadata()).await.is_err());
        assert!(!notifier.notify(&metadata()).await);
    }
}
