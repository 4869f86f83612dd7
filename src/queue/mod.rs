//! Upload queue: the single-flight driver that moves recordings from the
//! store to the server.
//!
//! - `processor`: the queue itself (cycles, attempts, user actions)
//! - `retry`: backoff policy and per-recording retry timers
//! - `progress`: observer registry for upload progress
//! - `cycle`: reentrancy lock shared by triggers and explicit cycles

mod cycle;
pub mod processor;
pub mod progress;
pub mod retry;

use thiserror::Error;
use uuid::Uuid;

use crate::domain::{InvalidRecording, RecordingStatus};
use crate::store::StoreError;

pub use processor::{
    interpret_response, AttemptOutcome, CycleOutcome, CycleReport, QueueSettings, UploadQueue,
};
pub use progress::{ObserverId, ProgressNotifier};
pub use retry::{RetryPolicy, RetryScheduler};

/// Errors surfaced by queue operations
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Recording not found: {0}")]
    NotFound(Uuid),

    #[error("Cannot retry recording {id} while it is {from}")]
    InvalidTransition { id: Uuid, from: RecordingStatus },

    #[error("Recording {id} is {status}; wait for the upload to finish or fail")]
    UploadInProgress { id: Uuid, status: RecordingStatus },

    #[error("Invalid recording: {0}")]
    InvalidRecording(#[from] InvalidRecording),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
