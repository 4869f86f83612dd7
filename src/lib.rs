//! voicedrop - Durable upload queue for voice recordings
//!
//! Recordings are captured locally and uploaded to a remote API in the
//! background. Capture never waits on the network: every recording is
//! persisted first and the queue drives it to the server later. Pending work
//! survives restarts and flaky connectivity.
//!
//! # Architecture
//!
//! The SQLite store is the single source of truth:
//! - Every recording carries a status (`queued`, `uploading`, `uploaded`,
//!   `error`, `too_short`) and a client-generated idempotency key
//! - The upload queue runs one attempt at a time and classifies failures as
//!   retryable or permanent
//! - Retryable failures are re-attempted with exponential backoff
//!
//! # Modules
//!
//! - `adapters`: Collaborators (HTTP transport, auth, network monitors)
//! - `queue`: Upload processor, retry timers, progress notifications
//! - `store`: Recording persistence (SQLite)
//! - `domain`: Data structures (Recording, UploadError, ProgressEvent)
//! - `config`: Settings and paths
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Sign in and queue a recording
//! voicedrop login me@example.com
//! voicedrop add memo.m4a --duration 42
//!
//! # Upload once, or keep uploading until Ctrl-C
//! voicedrop sync
//! voicedrop run
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod domain;
pub mod queue;
pub mod store;

// Re-export main types at crate root for convenience
pub use adapters::{CredentialProvider, NetworkMonitor, UploadTransport};
pub use domain::{Recording, RecordingDraft, RecordingFilter, RecordingStatus, UploadError};
pub use queue::{CycleOutcome, QueueError, QueueSettings, UploadQueue};
pub use store::{RecordingRepository, SqliteRecordingStore, StoreError};
