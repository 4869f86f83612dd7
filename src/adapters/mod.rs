//! Adapter interfaces for external systems.
//!
//! The upload queue consumes three collaborators through narrow traits:
//! connectivity ([`NetworkMonitor`]), bearer tokens ([`CredentialProvider`])
//! and the multipart upload itself ([`UploadTransport`]). Concrete
//! implementations live in the submodules.

pub mod auth;
pub mod http;
pub mod network;

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::SecondsFormat;
use thiserror::Error;
use tokio::sync::watch;

use crate::domain::Recording;

pub use auth::{
    AuthApi, AuthClient, AuthError, AuthTokens, FileTokenStore, HttpAuthApi, LoginCredentials, User,
};
pub use http::HttpUploadTransport;
pub use network::{ManualNetworkMonitor, ProbeNetworkMonitor};

/// Server path that accepts recording uploads
pub const RECORDINGS_PATH: &str = "/api/v1/recordings";

/// Header carrying the per-recording idempotency key
pub const IDEMPOTENCY_HEADER: &str = "X-Idempotency-Key";

/// Multipart field holding the audio file
pub const FILE_FIELD: &str = "file";

/// A multipart upload to perform
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRequest {
    pub url: String,
    pub file_path: PathBuf,
    pub file_field: String,
    pub headers: BTreeMap<String, String>,
    pub form_fields: BTreeMap<String, String>,
}

impl UploadRequest {
    /// Build the upload for a recording: bearer auth, the recording's
    /// idempotency key, and its metadata as form fields.
    pub fn for_recording(api_base_url: &str, recording: &Recording, token: &str) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert("Authorization".to_string(), format!("Bearer {}", token));
        headers.insert(
            IDEMPOTENCY_HEADER.to_string(),
            recording.idempotency_key.to_string(),
        );

        let mut form_fields = BTreeMap::new();
        form_fields.insert("duration_sec".to_string(), recording.duration_sec.to_string());
        form_fields.insert(
            "started_at".to_string(),
            recording.started_at.to_rfc3339_opts(SecondsFormat::Millis, true),
        );
        form_fields.insert(
            "ended_at".to_string(),
            recording.ended_at.to_rfc3339_opts(SecondsFormat::Millis, true),
        );

        Self {
            url: format!("{}{}", api_base_url.trim_end_matches('/'), RECORDINGS_PATH),
            file_path: recording.local_path.clone(),
            file_field: FILE_FIELD.to_string(),
            headers,
            form_fields,
        }
    }

    /// The idempotency key this request carries
    pub fn idempotency_key(&self) -> Option<&str> {
        self.headers.get(IDEMPOTENCY_HEADER).map(String::as_str)
    }
}

/// Raw HTTP outcome of an upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status_code: u16,
    pub body: String,
}

/// Upload failures that never produced an HTTP status
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("could not build request: {0}")]
    Request(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Performs the multipart file upload
#[async_trait]
pub trait UploadTransport: Send + Sync {
    async fn upload(&self, request: &UploadRequest) -> Result<TransportResponse, TransportError>;
}

/// Supplies a valid bearer token, refreshing internally.
///
/// `None` means the upload cannot proceed (not logged in, or the refresh was
/// refused) and is not worth retrying automatically.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn access_token(&self) -> Option<String>;
}

/// Reports connectivity and its transitions.
///
/// `subscribe` hands out a receiver that observes every transition; dropping
/// the receiver unsubscribes.
#[async_trait]
pub trait NetworkMonitor: Send + Sync {
    /// Point-in-time connectivity check
    async fn is_connected(&self) -> bool;

    fn subscribe(&self) -> watch::Receiver<bool>;
}
