//! reqwest-backed multipart upload transport.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use tracing::debug;

use super::{TransportError, TransportResponse, UploadRequest, UploadTransport};

/// Uploads recordings over HTTP with a per-request timeout
pub struct HttpUploadTransport {
    /// HTTP client
    client: reqwest::Client,
}

impl HttpUploadTransport {
    /// Create a transport whose requests time out after `timeout`
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Request(e.to_string()))?;

        Ok(Self { client })
    }
}

#[async_trait]
impl UploadTransport for HttpUploadTransport {
    async fn upload(&self, request: &UploadRequest) -> Result<TransportResponse, TransportError> {
        let file_name = request
            .file_path
            .file_name()
            .unwrap_or_default()
            .to_string_lossy()
            .to_string();

        let file_bytes = tokio::fs::read(&request.file_path).await?;
        debug!(
            url = %request.url,
            bytes = file_bytes.len(),
            "Sending multipart upload"
        );

        let file_part = Part::bytes(file_bytes)
            .file_name(file_name)
            .mime_str(audio_mime(&request.file_path))
            .map_err(|e| TransportError::Request(e.to_string()))?;

        let mut form = Form::new();
        for (name, value) in &request.form_fields {
            form = form.text(name.clone(), value.clone());
        }
        let form = form.part(request.file_field.clone(), file_part);

        let mut builder = self.client.post(&request.url).multipart(form);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.send().await.map_err(classify)?;
        let status_code = response.status().as_u16();
        let body = response.text().await.map_err(classify)?;

        Ok(TransportResponse { status_code, body })
    }
}

fn classify(error: reqwest::Error) -> TransportError {
    if error.is_timeout() {
        TransportError::Timeout(error.to_string())
    } else if error.is_builder() {
        TransportError::Request(error.to_string())
    } else {
        TransportError::Connection(error.to_string())
    }
}

/// Content type for an audio file, by extension
fn audio_mime(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("m4a") | Some("mp4") | Some("aac") => "audio/mp4",
        Some("wav") => "audio/wav",
        Some("mp3") => "audio/mpeg",
        Some("ogg") | Some("opus") => "audio/ogg",
        _ => "application/octet-stream",
    }
}
