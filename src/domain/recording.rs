//! Recording entity and its upload lifecycle.
//!
//! A Recording is the durable record-of-intent for one audio file: it is
//! created once when a recording session ends, then driven through the
//! status machine by the upload queue until the server has acknowledged it.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// A recording tracked by the upload queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recording {
    /// Unique identifier, generated at creation
    pub id: Uuid,

    /// Audio file owned by this recording until deletion
    pub local_path: PathBuf,

    /// Duration in seconds (non-negative)
    pub duration_sec: f64,

    /// When the recording session started
    pub started_at: DateTime<Utc>,

    /// When the recording session ended
    pub ended_at: DateTime<Utc>,

    /// Current upload status
    pub status: RecordingStatus,

    /// Number of upload attempts started (never decreases)
    pub upload_attempts: u32,

    /// Last failure message (if any)
    pub last_error: Option<String>,

    /// Server-assigned identifier, set once on the first successful upload
    pub remote_id: Option<String>,

    /// Sent with every attempt so the server can deduplicate retries
    pub idempotency_key: Uuid,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Recording {
    /// Build a new recording from a finished capture session.
    ///
    /// Recordings shorter than `threshold_seconds` are created as
    /// [`RecordingStatus::TooShort`] and never enter the upload queue.
    pub fn from_draft(
        draft: RecordingDraft,
        threshold_seconds: f64,
        now: DateTime<Utc>,
    ) -> Result<Self, InvalidRecording> {
        draft.validate()?;

        let status = if draft.duration_sec < threshold_seconds {
            RecordingStatus::TooShort
        } else {
            RecordingStatus::Queued
        };

        Ok(Self {
            id: Uuid::new_v4(),
            local_path: draft.local_path,
            duration_sec: draft.duration_sec,
            started_at: draft.started_at,
            ended_at: draft.ended_at,
            status,
            upload_attempts: 0,
            last_error: None,
            remote_id: None,
            idempotency_key: Uuid::new_v4(),
            created_at: now,
            updated_at: now,
        })
    }

    /// Check if the recording may be deleted by the user
    pub fn is_deletable(&self) -> bool {
        self.status.is_terminal() || self.status == RecordingStatus::Error
    }

    /// Check if the recording is eligible for an upload attempt
    pub fn is_pending(&self, max_attempts: u32) -> bool {
        matches!(self.status, RecordingStatus::Queued | RecordingStatus::Error)
            && self.upload_attempts < max_attempts
    }
}

/// Output of a finished capture session, before it becomes a Recording
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingDraft {
    pub local_path: PathBuf,
    pub duration_sec: f64,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

impl RecordingDraft {
    pub fn validate(&self) -> Result<(), InvalidRecording> {
        if !self.duration_sec.is_finite() || self.duration_sec < 0.0 {
            return Err(InvalidRecording::Duration(self.duration_sec));
        }
        if self.ended_at < self.started_at {
            return Err(InvalidRecording::EndsBeforeStart {
                started_at: self.started_at,
                ended_at: self.ended_at,
            });
        }
        Ok(())
    }
}

/// Reasons a draft cannot become a Recording
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InvalidRecording {
    #[error("Duration must be a non-negative number of seconds, got {0}")]
    Duration(f64),

    #[error("Recording ends ({ended_at}) before it starts ({started_at})")]
    EndsBeforeStart {
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
    },
}

/// Upload status of a recording
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordingStatus {
    /// Waiting for an upload attempt
    Queued,

    /// An attempt is in flight
    Uploading,

    /// Acknowledged by the server (terminal)
    Uploaded,

    /// Last attempt failed; may be retried
    Error,

    /// Below the duration threshold; never auto-uploaded (terminal)
    TooShort,
}

impl RecordingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Uploading => "uploading",
            Self::Uploaded => "uploaded",
            Self::Error => "error",
            Self::TooShort => "too_short",
        }
    }

    /// Check if no transition leaves this status (other than deletion)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Uploaded | Self::TooShort)
    }

    /// Check if `updateStatus` may move a recording from `self` to `next`.
    ///
    /// `Uploaded` is never reachable here: it is set together with the
    /// remote id. An `uploading` row only returns to `queued` through the
    /// store's claim release and crash recovery, never through a status
    /// update.
    pub fn can_transition_to(&self, next: RecordingStatus) -> bool {
        use RecordingStatus::*;

        if self.is_terminal() {
            return false;
        }

        matches!(
            (self, next),
            (Queued, Queued)
                | (Queued, Uploading)
                | (Uploading, Error)
                | (Error, Error)
                | (Error, Queued)
                | (Error, Uploading)
        )
    }
}

impl fmt::Display for RecordingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "uploading" => Ok(Self::Uploading),
            "uploaded" => Ok(Self::Uploaded),
            "error" => Ok(Self::Error),
            "too_short" => Ok(Self::TooShort),
            other => Err(format!("Unknown recording status: {}", other)),
        }
    }
}

/// Archive filter for listing recordings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordingFilter {
    #[default]
    All,
    Uploaded,
    /// Queued or uploading
    Pending,
    Error,
}
