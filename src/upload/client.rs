//! HTTP client for the prepared files API.
//!
//! An upload is three calls:
//! 1. `POST /api/v0/upload` returns a short-lived upload URL and token
//! 2. `PUT <upload_url>` with the file bytes
//! 3. `POST /api/v0/upload/<kind>` commits the token
//!
//! Calls to the files API carry the project key; the PUT goes to a
//! pre-signed URL and does not.

use std::io::Write;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info};

use super::{classify_status, FailureReason, RetryReason, UploadMetadata, UploadOutcome};
use crate::config::{DeviceInfo, HttpApiSettings};

/// Header carrying the project key on authenticated calls.
pub const PROJECT_KEY_HEADER: &str = "Memfault-Project-Key";

const SOFTWARE_TYPE: &str = "android-build";

#[derive(Debug, Clone, Deserialize)]
struct PrepareResult {
    data: PrepareResponse,
}

/// Destination for one upload, valid for a short time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareResponse {
    pub upload_url: String,
    pub token: String,
}

/// Errors that can occur during HTTP client operations.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Server error ({code}): {message}")]
    Status { code: StatusCode, message: String },

    #[error("Failed to parse response: {0}")]
    Parse(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Failed to read upload file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Client configuration error: {0}")]
    Config(String),
}

impl ClientError {
    /// Classify this error into an upload outcome.
    pub fn outcome(&self) -> UploadOutcome {
        match self {
            ClientError::Request(e) if e.is_timeout() => UploadOutcome::Retry(RetryReason::Timeout),
            ClientError::Request(e) => UploadOutcome::Retry(RetryReason::Network(e.to_string())),
            ClientError::Timeout => UploadOutcome::Retry(RetryReason::Timeout),
            ClientError::Status { code, .. } => classify_status(*code),
            ClientError::Parse(e) => UploadOutcome::Failure(FailureReason::MalformedResponse(e.clone())),
            ClientError::Io(e) => UploadOutcome::Failure(FailureReason::Unreadable(e.to_string())),
            ClientError::Config(e) => UploadOutcome::Failure(FailureReason::Client(e.clone())),
        }
    }
}

/// The network side of an upload.
#[async_trait]
pub trait UploadService: Send + Sync {
    async fn prepare(&self) -> Result<PrepareResponse, ClientError>;

    /// Send the file to `upload_url`, gzipped when `compress` is set.
    async fn put(&self, upload_url: &str, file: &Path, compress: bool) -> Result<(), ClientError>;

    async fn commit(&self, token: &str, metadata: &UploadMetadata) -> Result<(), ClientError>;
}

/// Run the full prepare/put/commit exchange and classify the result.
pub(crate) async fn upload_file(
    service: &dyn UploadService,
    file: &Path,
    metadata: &UploadMetadata,
    compress: bool,
) -> UploadOutcome {
    let exchange = async {
        let prepared = service.prepare().await?;
        service.put(&prepared.upload_url, file, compress).await?;
        service.commit(&prepared.token, metadata).await
    };
    match exchange.await {
        Ok(()) => UploadOutcome::Success,
        Err(e) => {
            debug!(error = %e, kind = metadata.kind(), "Upload exchange failed");
            e.outcome()
        }
    }
}

/// reqwest-backed [`UploadService`].
pub struct PreparedUploader {
    /// The underlying HTTP client (reused for connection pooling)
    client: Client,

    base_url: String,

    project_key: String,

    device_info: DeviceInfo,
}

impl PreparedUploader {
    /// # Errors
    ///
    /// Returns `ClientError::Config` if the HTTP client cannot be built.
    pub fn new(settings: &HttpApiSettings, device_info: DeviceInfo) -> Result<Self, ClientError> {
        let client = Client::builder()
            .timeout(settings.request_timeout)
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| ClientError::Config(e.to_string()))?;

        Ok(Self {
            client,
            base_url: settings.files_base_url.trim_end_matches('/').to_string(),
            project_key: settings.project_key.clone(),
            device_info,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn commit_body(&self, token: &str, metadata: &UploadMetadata) -> serde_json::Value {
        match metadata {
            UploadMetadata::DropBoxEntry { metadata, .. } => json!({
                "file": { "token": token },
                "hardware_version": self.device_info.hardware_version,
                "device_serial": self.device_info.device_serial,
                "software_version": self.device_info.software_version,
                "software_type": SOFTWARE_TYPE,
                "metadata": metadata,
            }),
            _ => json!({ "file": { "token": token } }),
        }
    }
}

/// Turn a non-2xx response into `ClientError::Status`.
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());
    Err(ClientError::Status {
        code: status,
        message,
    })
}

#[async_trait]
impl UploadService for PreparedUploader {
    async fn prepare(&self) -> Result<PrepareResponse, ClientError> {
        let url = format!("{}/api/v0/upload", self.base_url);
        let response = self
            .client
            .post(&url)
            .header(PROJECT_KEY_HEADER, &self.project_key)
            .send()
            .await
            .map_err(timeout_aware)?;

        let body = check_status(response).await?.text().await?;
        let result: PrepareResult =
            serde_json::from_str(&body).map_err(|e| ClientError::Parse(e.to_string()))?;
        debug!("Upload prepared");
        Ok(result.data)
    }

    async fn put(&self, upload_url: &str, file: &Path, compress: bool) -> Result<(), ClientError> {
        let mut bytes = tokio::fs::read(file).await?;
        let size = bytes.len();
        let mut request = self
            .client
            .put(upload_url)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream");
        if compress {
            bytes = gzip(&bytes)?;
            request = request.header(reqwest::header::CONTENT_ENCODING, "gzip");
        }
        let sent = bytes.len();
        let response = request.body(bytes).send().await.map_err(timeout_aware)?;
        check_status(response).await?;
        debug!(bytes = size, sent = sent, compressed = compress, "Upload body sent");
        Ok(())
    }

    async fn commit(&self, token: &str, metadata: &UploadMetadata) -> Result<(), ClientError> {
        let url = format!("{}/api/v0/upload/{}", self.base_url, metadata.commit_path());
        let response = self
            .client
            .post(&url)
            .header(PROJECT_KEY_HEADER, &self.project_key)
            .json(&self.commit_body(token, metadata))
            .send()
            .await
            .map_err(timeout_aware)?;
        check_status(response).await?;
        info!(kind = metadata.kind(), "Upload committed");
        Ok(())
    }
}

fn gzip(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    encoder.finish()
}

fn timeout_aware(err: reqwest::Error) -> ClientError {
    if err.is_timeout() {
        ClientError::Timeout
    } else {
        ClientError::Request(err)
    }
}
