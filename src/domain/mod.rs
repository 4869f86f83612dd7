//! Domain types for the upload queue.
//!
//! This module contains the core data structures:
//! - Recording: The durable record-of-intent for one audio file
//! - Upload: Failure classification and progress events

pub mod recording;
pub mod upload;

// Re-export commonly used types
pub use recording::{InvalidRecording, Recording, RecordingDraft, RecordingFilter, RecordingStatus};
pub use upload::{ErrorKind, ProgressEvent, UploadError};
