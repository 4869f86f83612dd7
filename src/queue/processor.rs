//! The upload processor.
//!
//! A cycle reads the pending set oldest first and attempts each recording in
//! turn. Cycles never overlap: a trigger that arrives while one is running is
//! dropped, and a single-permit semaphore keeps at most one transport call in
//! flight even across a stop/start.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::cycle::CycleLock;
use super::progress::ProgressNotifier;
use super::retry::{RetryPolicy, RetryScheduler};
use super::QueueError;
use crate::adapters::{
    CredentialProvider, NetworkMonitor, TransportResponse, UploadRequest, UploadTransport,
};
use crate::domain::{Recording, RecordingDraft, RecordingStatus, UploadError};
use crate::store::{RecordingRepository, StoreError};

/// Default minimum duration for a recording to be uploaded
pub const DEFAULT_THRESHOLD_SECONDS: f64 = 5.0;

/// Default API base URL
pub const DEFAULT_API_BASE_URL: &str = "https://api.example.com";

/// Processor settings, resolved once at startup
#[derive(Debug, Clone, PartialEq)]
pub struct QueueSettings {
    /// Base URL the upload path is appended to
    pub api_base_url: String,

    /// Attempt ceiling and backoff
    pub retry: RetryPolicy,

    /// Recordings shorter than this are stored as `too_short`
    pub threshold_seconds: f64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            retry: RetryPolicy::default(),
            threshold_seconds: DEFAULT_THRESHOLD_SECONDS,
        }
    }
}

/// Result of one attempt on one recording
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Uploaded {
        remote_id: String,
    },

    /// The recording is now `error`; `retry_in` is the armed backoff, if any
    Failed {
        error: UploadError,
        retry_in: Option<Duration>,
    },

    /// The recording was no longer claimable when its turn came
    Skipped,
}

/// Per-recording outcomes of a cycle, in attempt order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    pub attempts: Vec<(Uuid, AttemptOutcome)>,
}

impl CycleReport {
    pub fn uploaded(&self) -> usize {
        self.attempts
            .iter()
            .filter(|(_, o)| matches!(o, AttemptOutcome::Uploaded { .. }))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.attempts
            .iter()
            .filter(|(_, o)| matches!(o, AttemptOutcome::Failed { .. }))
            .count()
    }

    pub fn outcome_for(&self, id: Uuid) -> Option<&AttemptOutcome> {
        self.attempts
            .iter()
            .find(|(attempted, _)| *attempted == id)
            .map(|(_, outcome)| outcome)
    }
}

/// How a cycle ended
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// Another cycle held the guard; nothing was done
    AlreadyRunning,

    /// No connectivity; nothing was touched
    Offline,

    /// The queue was stopped mid-cycle; later recordings were left alone
    Stopped(CycleReport),

    Completed(CycleReport),
}

impl CycleOutcome {
    pub fn report(&self) -> Option<&CycleReport> {
        match self {
            Self::Stopped(report) | Self::Completed(report) => Some(report),
            Self::AlreadyRunning | Self::Offline => None,
        }
    }
}

/// Map a transport response to a remote id or a classified failure.
///
/// 2xx without a usable `id` is retryable: the idempotency key lets the
/// server deduplicate the re-submission.
pub fn interpret_response(response: &TransportResponse) -> Result<String, UploadError> {
    let code = response.status_code;
    match code {
        200..=299 => extract_remote_id(&response.body).ok_or_else(|| {
            UploadError::retryable(format!("Upload failed: {} response without id", code))
        }),
        400..=499 => Err(UploadError::permanent(format!("Upload failed: {}", code))),
        _ => Err(UploadError::retryable(format!("Upload failed: {}", code))),
    }
}

fn extract_remote_id(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    match value.get("id")? {
        serde_json::Value::String(id) if !id.is_empty() => Some(id.clone()),
        serde_json::Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

/// Handle to the upload processor. Cheap to clone.
#[derive(Clone)]
pub struct UploadQueue {
    inner: Arc<Inner>,
}

struct Inner {
    me: Weak<Inner>,
    store: Arc<dyn RecordingRepository>,
    credentials: Arc<dyn CredentialProvider>,
    transport: Arc<dyn UploadTransport>,
    network: Arc<dyn NetworkMonitor>,
    settings: QueueSettings,
    progress: ProgressNotifier,
    retries: RetryScheduler,
    /// One transport call at a time
    upload_slot: Semaphore,
    /// Reentrancy guard for cycles
    cycle: CycleLock,
    started: AtomicBool,
    recovered: AtomicBool,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl UploadQueue {
    pub fn new(
        store: Arc<dyn RecordingRepository>,
        credentials: Arc<dyn CredentialProvider>,
        transport: Arc<dyn UploadTransport>,
        network: Arc<dyn NetworkMonitor>,
        settings: QueueSettings,
    ) -> Self {
        let inner = Arc::new_cyclic(|me| Inner {
            me: me.clone(),
            store,
            credentials,
            transport,
            network,
            settings,
            progress: ProgressNotifier::new(),
            retries: RetryScheduler::new(),
            upload_slot: Semaphore::new(1),
            cycle: CycleLock::new(),
            started: AtomicBool::new(false),
            recovered: AtomicBool::new(false),
            listener: Mutex::new(None),
        });

        Self { inner }
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.inner.settings
    }

    pub fn progress(&self) -> &ProgressNotifier {
        &self.inner.progress
    }

    pub fn retries(&self) -> &RetryScheduler {
        &self.inner.retries
    }

    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::Acquire)
    }

    pub fn is_processing(&self) -> bool {
        self.inner.cycle.is_held()
    }

    /// Start automatic processing and run a first cycle.
    ///
    /// The first start also returns recordings stranded in `uploading` by a
    /// previous process to `queued`.
    pub async fn start(&self) -> Result<CycleOutcome, QueueError> {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            debug!("Upload queue already started");
            return self.run_cycle().await;
        }

        if !self.inner.recovered.swap(true, Ordering::AcqRel) {
            let reset = self.inner.store.reset_interrupted().await?;
            if reset > 0 {
                info!(count = reset, "Re-queued interrupted uploads");
            }
        }

        self.spawn_connectivity_listener();
        info!("Upload queue started");

        self.run_cycle().await
    }

    /// Stop automatic processing.
    ///
    /// Detaches the connectivity listener, cancels every retry timer and
    /// releases the reentrancy guard. An attempt already in flight completes
    /// and its status update is applied; the rest of its cycle is skipped.
    pub fn stop(&self) {
        self.inner.started.store(false, Ordering::Release);

        if let Some(listener) = self
            .inner
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            listener.abort();
        }

        let cancelled = self.inner.retries.cancel_all();
        self.inner.cycle.interrupt();

        info!(cancelled_retries = cancelled, "Upload queue stopped");
    }

    /// Request a cycle in the background. No-op while stopped or while a
    /// cycle is running.
    pub fn trigger(&self) {
        self.inner.trigger();
    }

    /// Run one cycle on the caller's task, regardless of start state
    pub async fn run_cycle(&self) -> Result<CycleOutcome, QueueError> {
        self.inner.process_queue().await
    }

    /// Persist a finished capture and, if it is long enough, trigger a cycle
    pub async fn enqueue(&self, draft: RecordingDraft) -> Result<Recording, QueueError> {
        let recording =
            Recording::from_draft(draft, self.inner.settings.threshold_seconds, Utc::now())?;
        self.inner.store.create(&recording).await?;

        info!(
            recording_id = %recording.id,
            status = %recording.status,
            duration_sec = recording.duration_sec,
            "Recording saved"
        );

        if recording.status == RecordingStatus::Queued {
            self.trigger();
        }

        Ok(recording)
    }

    /// Put a failed recording back in the queue and trigger a cycle
    pub async fn retry(&self, id: Uuid) -> Result<(), QueueError> {
        let recording = match self.inner.store.requeue(id).await {
            Ok(Some(recording)) => recording,
            Ok(None) => return Err(QueueError::NotFound(id)),
            Err(StoreError::InvalidTransition { from, .. }) => {
                return Err(QueueError::InvalidTransition { id, from })
            }
            Err(e) => return Err(e.into()),
        };
        self.inner.retries.cancel(id);

        if !recording.is_pending(self.inner.settings.retry.max_attempts) {
            warn!(
                recording_id = %id,
                attempts = recording.upload_attempts,
                "Recording has used all upload attempts; it will stay queued"
            );
        }

        info!(recording_id = %id, "Recording re-queued");
        self.trigger();
        Ok(())
    }

    /// Delete a recording that is not waiting on an upload, along with its
    /// local audio file
    pub async fn delete(&self, id: Uuid) -> Result<Recording, QueueError> {
        let recording = self
            .inner
            .store
            .get_by_id(id)
            .await?
            .ok_or(QueueError::NotFound(id))?;

        if !recording.is_deletable() {
            return Err(QueueError::UploadInProgress {
                id,
                status: recording.status,
            });
        }

        self.inner.retries.cancel(id);

        match tokio::fs::remove_file(&recording.local_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(recording_id = %id, "Audio file already gone");
            }
            Err(e) => return Err(e.into()),
        }

        self.inner.store.delete(id).await?;
        info!(recording_id = %id, "Recording deleted");
        Ok(recording)
    }

    fn spawn_connectivity_listener(&self) {
        let mut changes = self.inner.network.subscribe();
        let inner = Weak::clone(&self.inner.me);

        let listener = tokio::spawn(async move {
            while changes.changed().await.is_ok() {
                let connected = *changes.borrow_and_update();
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                if connected {
                    info!("Connectivity regained");
                    inner.trigger();
                }
            }
        });

        let previous = self
            .inner
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(listener);
        if let Some(previous) = previous {
            previous.abort();
        }
    }
}

impl Inner {
    fn trigger(&self) {
        if !self.started.load(Ordering::Acquire) {
            debug!("Upload queue stopped, trigger ignored");
            return;
        }
        if self.cycle.is_held() {
            debug!("Upload cycle already running, trigger ignored");
            return;
        }
        let Some(inner) = self.me.upgrade() else {
            return;
        };

        tokio::spawn(async move {
            if let Err(e) = inner.process_queue().await {
                error!(error = %e, "Upload cycle aborted");
            }
        });
    }

    #[instrument(skip(self))]
    async fn process_queue(&self) -> Result<CycleOutcome, QueueError> {
        let Some(guard) = self.cycle.acquire() else {
            debug!("Upload cycle already running");
            return Ok(CycleOutcome::AlreadyRunning);
        };

        if !self.network.is_connected().await {
            info!("Offline, skipping upload cycle");
            return Ok(CycleOutcome::Offline);
        }

        let pending = self
            .store
            .list_pending_upload(self.settings.retry.max_attempts)
            .await?;
        debug!(count = pending.len(), "Pending uploads");

        let mut report = CycleReport::default();
        for recording in &pending {
            if guard.stop_requested() {
                info!(
                    remaining = pending.len() - report.attempts.len(),
                    "Stop requested, leaving remaining uploads for the next cycle"
                );
                return Ok(CycleOutcome::Stopped(report));
            }

            let outcome = self.upload_recording(recording.id).await?;
            report.attempts.push((recording.id, outcome));
        }

        if report.attempts.is_empty() {
            debug!("Upload cycle finished with nothing to do");
        } else {
            info!(
                uploaded = report.uploaded(),
                failed = report.failed(),
                "Upload cycle finished"
            );
        }

        Ok(CycleOutcome::Completed(report))
    }

    #[instrument(skip(self), fields(recording_id = %id))]
    async fn upload_recording(&self, id: Uuid) -> Result<AttemptOutcome, QueueError> {
        let Ok(_slot) = self.upload_slot.acquire().await else {
            return Ok(AttemptOutcome::Skipped);
        };

        let Some(recording) = self.store.claim(id).await? else {
            debug!("Recording no longer claimable");
            return Ok(AttemptOutcome::Skipped);
        };
        // Any armed timer for this recording is superseded by this attempt
        self.retries.cancel(id);
        let attempt = recording.upload_attempts;
        debug!(attempt, "Upload attempt started");
        self.progress.notify(id, 0);

        let result = self.attempt(&recording).await;
        match self.record_result(id, attempt, result).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.release_claim(id).await;
                Err(e)
            }
        }
    }

    /// Persist the outcome of an attempt on a claimed recording
    async fn record_result(
        &self,
        id: Uuid,
        attempt: u32,
        result: Result<String, UploadError>,
    ) -> Result<AttemptOutcome, QueueError> {
        match result {
            Ok(remote_id) => {
                self.store.set_remote_id(id, &remote_id).await?;
                self.progress.notify(id, 100);
                info!(attempt, remote_id = %remote_id, "Upload completed");
                Ok(AttemptOutcome::Uploaded { remote_id })
            }
            Err(error) => {
                self.store
                    .update_status(id, RecordingStatus::Error, Some(&error.message))
                    .await?;
                let retry_in = self.schedule_retry(id, attempt, &error);
                warn!(
                    attempt,
                    kind = %error.kind,
                    error = %error.message,
                    retry_in_ms = retry_in.map(|d| d.as_millis() as u64),
                    "Upload failed"
                );
                Ok(AttemptOutcome::Failed { error, retry_in })
            }
        }
    }

    /// Hand a claimed recording back to the pending set after its outcome
    /// could not be written. Best effort: the cycle is aborting anyway.
    async fn release_claim(&self, id: Uuid) {
        match self.store.release_claim(id).await {
            Ok(true) => warn!(
                recording_id = %id,
                "Attempt result not recorded, recording re-queued"
            ),
            Ok(false) => {}
            Err(e) => error!(
                recording_id = %id,
                error = %e,
                "Failed to release claimed recording; it stays uploading until restart"
            ),
        }
    }

    /// One upload attempt; every failure comes back classified
    async fn attempt(&self, recording: &Recording) -> Result<String, UploadError> {
        let token = self
            .credentials
            .access_token()
            .await
            .ok_or_else(UploadError::not_authenticated)?;

        match tokio::fs::metadata(&recording.local_path).await {
            Ok(meta) if meta.is_file() => {}
            _ => return Err(UploadError::file_not_found()),
        }

        let request = UploadRequest::for_recording(&self.settings.api_base_url, recording, &token);
        let response = self
            .transport
            .upload(&request)
            .await
            .map_err(|e| UploadError::retryable(format!("Upload failed: {}", e)))?;
        debug!(status_code = response.status_code, "Upload response");

        interpret_response(&response)
    }

    /// Arm a backoff timer when the failure is retryable, attempts remain and
    /// the queue is running
    fn schedule_retry(&self, id: Uuid, attempt: u32, error: &UploadError) -> Option<Duration> {
        let policy = &self.settings.retry;
        if !error.is_retryable() || !policy.should_retry(attempt) {
            return None;
        }
        if !self.started.load(Ordering::Acquire) {
            debug!(recording_id = %id, "Upload queue stopped, retry not armed");
            return None;
        }

        let delay = policy.delay_for_attempt(attempt);
        let inner = Weak::clone(&self.me);
        self.retries.schedule(id, delay, move || {
            if let Some(inner) = inner.upgrade() {
                inner.trigger();
            }
        });
        Some(delay)
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(listener) = self
            .listener
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            listener.abort();
        }
    }
}
