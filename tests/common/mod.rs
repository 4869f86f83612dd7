//! Shared fixtures for integration tests.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tempfile::TempDir;
use tokio::sync::Notify;
use uuid::Uuid;

use voicedrop::adapters::{
    CredentialProvider, ManualNetworkMonitor, TransportError, TransportResponse, UploadRequest,
    UploadTransport,
};
use voicedrop::domain::{Recording, RecordingDraft, RecordingFilter, RecordingStatus};
use voicedrop::queue::{QueueSettings, RetryPolicy, UploadQueue};
use voicedrop::store::{RecordingRepository, SqliteRecordingStore, StoreError};

/// One scripted transport result
#[derive(Debug, Clone)]
pub enum Scripted {
    Respond(u16, String),
    ConnectionFailure,
}

impl Scripted {
    pub fn ok(id: &str) -> Self {
        Self::Respond(200, format!(r#"{{"id":"{}"}}"#, id))
    }

    pub fn status(code: u16) -> Self {
        Self::Respond(code, String::new())
    }
}

/// Lets a test pause the transport mid-upload
#[derive(Default)]
pub struct Gate {
    pub entered: Notify,
    pub release: Notify,
}

/// Upload transport that replays a script, records every request and tracks
/// the peak number of concurrent calls
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Scripted>>,
    fallback: Scripted,
    requests: Mutex<Vec<UploadRequest>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    latency: Duration,
    gate: Option<Arc<Gate>>,
}

impl ScriptedTransport {
    pub fn new(fallback: Scripted) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback,
            requests: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            latency: Duration::ZERO,
            gate: None,
        }
    }

    /// Responses consumed in order before the fallback applies
    pub fn with_script(self, script: Vec<Scripted>) -> Self {
        *self.script.lock().unwrap() = script.into();
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_gate(mut self, gate: Arc<Gate>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<UploadRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UploadTransport for ScriptedTransport {
    async fn upload(&self, request: &UploadRequest) -> Result<TransportResponse, TransportError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());

        if let Some(gate) = &self.gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let next = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match next {
            Scripted::Respond(status_code, body) => Ok(TransportResponse { status_code, body }),
            Scripted::ConnectionFailure => {
                Err(TransportError::Connection("connection reset".to_string()))
            }
        }
    }
}

/// Credential provider with a fixed token
pub struct StaticCredentials(pub Option<String>);

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn access_token(&self) -> Option<String> {
        self.0.clone()
    }
}

/// Store wrapper that can be told to fail pending-set reads, or the next
/// write that records an attempt's result
pub struct FlakyStore {
    pub inner: SqliteRecordingStore,
    pub fail_listing: AtomicBool,
    pub fail_next_write: AtomicBool,
}

impl FlakyStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            inner: SqliteRecordingStore::open(path).unwrap(),
            fail_listing: AtomicBool::new(false),
            fail_next_write: AtomicBool::new(false),
        }
    }

    fn write_fails(&self) -> bool {
        self.fail_next_write.swap(false, Ordering::SeqCst)
    }
}

#[async_trait]
impl RecordingRepository for FlakyStore {
    async fn create(&self, recording: &Recording) -> Result<(), StoreError> {
        self.inner.create(recording).await
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<Recording>, StoreError> {
        self.inner.get_by_id(id).await
    }

    async fn list_all(
        &self,
        filter: RecordingFilter,
        search: Option<&str>,
    ) -> Result<Vec<Recording>, StoreError> {
        self.inner.list_all(filter, search).await
    }

    async fn list_pending_upload(&self, max_attempts: u32) -> Result<Vec<Recording>, StoreError> {
        if self.fail_listing.load(Ordering::SeqCst) {
            return Err(StoreError::LockPoisoned);
        }
        self.inner.list_pending_upload(max_attempts).await
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: RecordingStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        if self.write_fails() {
            return Err(StoreError::LockPoisoned);
        }
        self.inner.update_status(id, status, error).await
    }

    async fn increment_attempts(&self, id: Uuid) -> Result<(), StoreError> {
        self.inner.increment_attempts(id).await
    }

    async fn set_remote_id(&self, id: Uuid, remote_id: &str) -> Result<(), StoreError> {
        if self.write_fails() {
            return Err(StoreError::LockPoisoned);
        }
        self.inner.set_remote_id(id, remote_id).await
    }

    async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        self.inner.delete(id).await
    }

    async fn claim(&self, id: Uuid) -> Result<Option<Recording>, StoreError> {
        self.inner.claim(id).await
    }

    async fn release_claim(&self, id: Uuid) -> Result<bool, StoreError> {
        self.inner.release_claim(id).await
    }

    async fn requeue(&self, id: Uuid) -> Result<Option<Recording>, StoreError> {
        self.inner.requeue(id).await
    }

    async fn reset_interrupted(&self) -> Result<usize, StoreError> {
        self.inner.reset_interrupted().await
    }
}

/// Settings with a given attempt ceiling and base delay
pub fn test_settings(max_attempts: u32, initial_delay_ms: u64) -> QueueSettings {
    QueueSettings {
        api_base_url: "http://uploads.test".to_string(),
        retry: RetryPolicy {
            max_attempts,
            initial_delay_ms,
            max_delay_ms: 600_000,
        },
        threshold_seconds: 5.0,
    }
}

/// A queue wired to fakes, plus handles to each fake
pub struct TestQueue {
    pub dir: TempDir,
    pub store: Arc<SqliteRecordingStore>,
    pub network: Arc<ManualNetworkMonitor>,
    pub transport: Arc<ScriptedTransport>,
    pub queue: UploadQueue,
}

impl TestQueue {
    /// Write a small audio file into the fixture directory
    pub fn audio_file(&self, name: &str) -> PathBuf {
        create_audio_file(self.dir.path(), name)
    }

    /// Draft for a recording of `duration_sec` backed by a real file
    pub fn draft(&self, duration_sec: f64) -> RecordingDraft {
        let path = self.audio_file(&format!("recording_{}.m4a", Uuid::new_v4()));
        create_draft(path, duration_sec)
    }

    /// Insert a queued recording directly, bypassing the queue's trigger
    pub async fn insert(&self, duration_sec: f64, created_at: DateTime<Utc>) -> Recording {
        let recording = Recording::from_draft(self.draft(duration_sec), 5.0, created_at).unwrap();
        self.store.create(&recording).await.unwrap();
        recording
    }

    pub async fn get(&self, id: Uuid) -> Recording {
        self.store.get_by_id(id).await.unwrap().unwrap()
    }

    /// Poll until the recording reaches `status`
    pub async fn wait_for_status(&self, id: Uuid, status: RecordingStatus) -> Recording {
        let store = Arc::clone(&self.store);
        tokio::time::timeout(Duration::from_secs(60), async move {
            loop {
                let recording = store.get_by_id(id).await.unwrap().unwrap();
                if recording.status == status {
                    return recording;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("recording {} never reached {}", id, status))
    }
}

pub fn create_test_queue(transport: ScriptedTransport, settings: QueueSettings) -> TestQueue {
    create_test_queue_with(transport, settings, Some("test-token"))
}

pub fn create_test_queue_with(
    transport: ScriptedTransport,
    settings: QueueSettings,
    token: Option<&str>,
) -> TestQueue {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(SqliteRecordingStore::open(dir.path().join("voicedrop.db")).unwrap());
    let network = Arc::new(ManualNetworkMonitor::new(true));
    let transport = Arc::new(transport);

    let queue = UploadQueue::new(
        store.clone(),
        Arc::new(StaticCredentials(token.map(String::from))),
        transport.clone(),
        network.clone(),
        settings,
    );

    TestQueue {
        dir,
        store,
        network,
        transport,
        queue,
    }
}

pub fn create_audio_file(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, b"\x00\x00\x00\x18ftypM4A fake audio").unwrap();
    path
}

pub fn create_draft(local_path: PathBuf, duration_sec: f64) -> RecordingDraft {
    let ended_at = Utc::now();
    RecordingDraft {
        local_path,
        duration_sec,
        started_at: ended_at - chrono::Duration::milliseconds((duration_sec * 1000.0) as i64),
        ended_at,
    }
}
