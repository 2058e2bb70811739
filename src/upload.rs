//! Webhook delivery client.
//!
//! Uploads a recording plus a JSON metadata part as a multipart POST.
//! HTTP 200 is the only success condition; 403 is reported separately from
//! other failures because it almost always means misconfigured credentials.
//! Retry policy lives in the batch sender, never here.

use chrono::{DateTime, Local};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode};
use serde::Serialize;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

use crate::config::Credentials;

/// Global HTTP client for reuse across requests (avoids TLS handshake overhead).
/// Long timeout: large recordings over slow links take a while.
static HTTP_CLIENT: OnceLock<Client> = OnceLock::new();

fn http_client() -> &'static Client {
    HTTP_CLIENT.get_or_init(|| {
        Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .expect("Failed to build HTTP client")
    })
}

#[derive(Debug)]
pub enum UploadError {
    /// HTTP 403: almost certainly a credentials problem, surfaced verbatim.
    AuthFailure,
    /// Any other non-200 status.
    ServerError { status: u16, body: String },
    /// Transport-level failure (DNS, connect, timeout).
    NetworkError(String),
    FileReadError(String),
    MetadataError(String),
}

impl std::fmt::Display for UploadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UploadError::AuthFailure => {
                write!(f, "authentication failed (HTTP 403) - check credentials")
            }
            UploadError::ServerError { status, body } => {
                write!(f, "server responded with status {}: {}", status, body)
            }
            UploadError::NetworkError(e) => write!(f, "network error: {}", e),
            UploadError::FileReadError(e) => write!(f, "failed to read recording file: {}", e),
            UploadError::MetadataError(e) => write!(f, "failed to build metadata: {}", e),
        }
    }
}

impl std::error::Error for UploadError {}

#[derive(Debug, Clone, Serialize)]
pub struct FileMetadata {
    pub name: String,
    pub path: String,
    pub size_bytes: u64,
    pub size_mb: f64,
    pub created: DateTime<Local>,
    pub modified: DateTime<Local>,
}

/// Metadata part of the upload. Constructed fresh for every delivery
/// attempt from filesystem metadata; never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct UploadMetadata {
    pub event: String,
    pub timestamp: DateTime<Local>,
    pub file: FileMetadata,
    pub source: String,
}

impl UploadMetadata {
    pub fn for_file(path: &Path) -> std::io::Result<Self> {
        let meta = std::fs::metadata(path)?;
        let size_bytes = meta.len();
        let created = meta
            .created()
            .map(DateTime::<Local>::from)
            .unwrap_or_else(|_| Local::now());
        let modified = meta
            .modified()
            .map(DateTime::<Local>::from)
            .unwrap_or_else(|_| Local::now());

        Ok(Self {
            event: "recording".to_string(),
            timestamp: Local::now(),
            file: FileMetadata {
                name: path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default(),
                path: path.display().to_string(),
                size_bytes,
                size_mb: round_mb(size_bytes),
                created,
                modified,
            },
            source: "meeting-recorder".to_string(),
        })
    }
}

fn round_mb(size_bytes: u64) -> f64 {
    let mb = size_bytes as f64 / (1024.0 * 1024.0);
    (mb * 100.0).round() / 100.0
}

/// Content type for the binary part, inferred from the file extension.
fn mime_for(path: &Path) -> &'static str {
    match path
        .extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .as_deref()
    {
        Some("wav") => "audio/wav",
        Some("mp3") => "audio/mpeg",
        _ => "application/octet-stream",
    }
}

pub struct WebhookUploader {
    url: String,
    credentials: Credentials,
}

impl WebhookUploader {
    pub fn new(url: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            url: url.into(),
            credentials,
        }
    }

    /// Upload one file and its metadata. No retries.
    pub async fn upload(&self, path: &Path, metadata: &UploadMetadata) -> Result<(), UploadError> {
        let file_bytes = tokio::fs::read(path)
            .await
            .map_err(|e| UploadError::FileReadError(e.to_string()))?;

        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("recording.wav")
            .to_string();

        log::info!(
            "Uploading: {} ({:.2} MB)",
            filename,
            file_bytes.len() as f64 / (1024.0 * 1024.0)
        );

        let file_part = Part::bytes(file_bytes)
            .file_name(filename)
            .mime_str(mime_for(path))
            .map_err(|e| UploadError::MetadataError(e.to_string()))?;

        let metadata_json = serde_json::to_string(metadata)
            .map_err(|e| UploadError::MetadataError(e.to_string()))?;
        let metadata_part = Part::text(metadata_json)
            .mime_str("application/json")
            .map_err(|e| UploadError::MetadataError(e.to_string()))?;

        let form = Form::new()
            .part("data", file_part)
            .part("metadata", metadata_part);

        let mut request = http_client().post(&self.url).multipart(form);
        if self.credentials.is_configured() {
            log::debug!("Using basic auth: {}", self.credentials.username);
            request = request.basic_auth(
                &self.credentials.username,
                Some(&self.credentials.password),
            );
        }

        let response = request
            .send()
            .await
            .map_err(|e| UploadError::NetworkError(e.to_string()))?;

        match response.status() {
            StatusCode::OK => {
                log::info!("Upload successful");
                Ok(())
            }
            StatusCode::FORBIDDEN => Err(UploadError::AuthFailure),
            status => {
                let body = response.text().await.unwrap_or_default();
                let body = body.chars().take(200).collect::<String>();
                Err(UploadError::ServerError {
                    status: status.as_u16(),
                    body,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn metadata_reflects_file_size() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0u8; 3 * 1024 * 1024]).unwrap();

        let metadata = UploadMetadata::for_file(file.path()).unwrap();
        assert_eq!(metadata.file.size_bytes, 3 * 1024 * 1024);
        assert_eq!(metadata.file.size_mb, 3.0);
        assert_eq!(metadata.event, "recording");
        assert_eq!(metadata.source, "meeting-recorder");
    }

    #[test]
    fn size_mb_rounds_to_two_decimals() {
        // 1.5 MB plus a little noise
        assert_eq!(round_mb(1_572_864 + 3_000), 1.5);
        assert_eq!(round_mb(0), 0.0);
    }

    #[test]
    fn mime_type_follows_extension() {
        assert_eq!(mime_for(Path::new("a.wav")), "audio/wav");
        assert_eq!(mime_for(Path::new("a.WAV")), "audio/wav");
        assert_eq!(mime_for(Path::new("a.mp3")), "audio/mpeg");
        assert_eq!(mime_for(Path::new("a.ogg")), "application/octet-stream");
        assert_eq!(mime_for(Path::new("noext")), "application/octet-stream");
    }

    #[test]
    fn metadata_serializes_expected_fields() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0u8; 2048]).unwrap();

        let metadata = UploadMetadata::for_file(file.path()).unwrap();
        let json = serde_json::to_value(&metadata).unwrap();
        assert!(json["timestamp"].is_string());
        assert_eq!(json["file"]["size_bytes"], 2048);
        assert!(json["file"]["created"].is_string());
        assert!(json["file"]["modified"].is_string());
    }

    #[test]
    fn auth_failure_display_mentions_403() {
        let err = UploadError::AuthFailure;
        assert!(err.to_string().contains("403"));
        assert!(err.to_string().contains("credentials"));
    }
}
