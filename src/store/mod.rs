//! Durable persistence for recordings.
//!
//! The store is the single source of truth for upload status. Every mutation
//! is a single-row operation that commits atomically, so a crash between two
//! processor steps can never leave a row half-updated.

pub mod migrations;
pub mod sqlite;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::{Recording, RecordingFilter, RecordingStatus};

pub use sqlite::SqliteRecordingStore;

/// Errors that can occur in the recording store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Recording already exists: {0}")]
    DuplicateKey(Uuid),

    #[error("Invalid status transition for {id}: {from} → {to}")]
    InvalidTransition {
        id: Uuid,
        from: RecordingStatus,
        to: RecordingStatus,
    },

    #[error("Corrupt row for {id}: {reason}")]
    Corrupt { id: String, reason: String },

    #[error("Database connection lock poisoned")]
    LockPoisoned,

    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Repository of recordings.
///
/// The upload queue is the only writer of the status, attempt, error and
/// remote id fields; user actions reach the store through the queue.
#[async_trait]
pub trait RecordingRepository: Send + Sync {
    /// Insert a new recording. Fails with `DuplicateKey` if the id exists.
    async fn create(&self, recording: &Recording) -> Result<(), StoreError>;

    /// Fetch a recording; `None` if absent.
    async fn get_by_id(&self, id: Uuid) -> Result<Option<Recording>, StoreError>;

    /// List recordings newest first, filtered by status group and a
    /// case-insensitive search over the start timestamp and id.
    async fn list_all(
        &self,
        filter: RecordingFilter,
        search: Option<&str>,
    ) -> Result<Vec<Recording>, StoreError>;

    /// Recordings eligible for upload (`queued` or `error`, attempts below
    /// the ceiling), oldest first.
    async fn list_pending_upload(&self, max_attempts: u32) -> Result<Vec<Recording>, StoreError>;

    /// Set status and error message. A missing id is a silent no-op.
    async fn update_status(
        &self,
        id: Uuid,
        status: RecordingStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Atomically increment the attempt counter.
    async fn increment_attempts(&self, id: Uuid) -> Result<(), StoreError>;

    /// Record the server id and mark the recording uploaded, in one
    /// transaction.
    async fn set_remote_id(&self, id: Uuid, remote_id: &str) -> Result<(), StoreError>;

    /// Remove the row. The caller owns local file cleanup.
    async fn delete(&self, id: Uuid) -> Result<(), StoreError>;

    /// Mark a pending recording `uploading` and count the attempt, in one
    /// transaction. Returns the updated row, or `None` if the recording is
    /// gone or no longer claimable.
    async fn claim(&self, id: Uuid) -> Result<Option<Recording>, StoreError>;

    /// Return a claimed recording to `queued` after its attempt could not
    /// be recorded. Only moves a row that is still `uploading`; returns
    /// whether it did.
    async fn release_claim(&self, id: Uuid) -> Result<bool, StoreError>;

    /// Put an `error` or `queued` recording back in the queue and clear its
    /// error, checking and writing in one transaction. Returns the updated
    /// row, `None` if absent, or `InvalidTransition` for any other status.
    async fn requeue(&self, id: Uuid) -> Result<Option<Recording>, StoreError>;

    /// Return rows stranded in `uploading` by a previous process to
    /// `queued`. Returns the number of rows reset.
    async fn reset_interrupted(&self) -> Result<usize, StoreError>;
}
