//! Upload failure classification and progress events.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Whether a repeated, identical attempt could plausibly succeed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Network trouble, timeouts, server 5xx
    Retryable,

    /// Client rejection, missing token, missing file
    Permanent,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Retryable => write!(f, "retryable"),
            Self::Permanent => write!(f, "permanent"),
        }
    }
}

/// A failed upload attempt, tagged with its retry classification
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct UploadError {
    pub kind: ErrorKind,
    pub message: String,
}

impl UploadError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Retryable,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Permanent,
            message: message.into(),
        }
    }

    pub fn not_authenticated() -> Self {
        Self::permanent("Not authenticated")
    }

    pub fn file_not_found() -> Self {
        Self::permanent("Recording file not found")
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == ErrorKind::Retryable
    }
}

/// Progress of one recording's upload, in whole percent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProgressEvent {
    pub recording_id: Uuid,
    pub percent: u8,
}

impl ProgressEvent {
    pub fn new(recording_id: Uuid, percent: u8) -> Self {
        Self {
            recording_id,
            percent: percent.min(100),
        }
    }
}
