//! Idempotency Integration Tests
//!
//! Every attempt for a recording carries the same idempotency key, so the
//! server can collapse retried submissions into one upload.

mod common;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use tempfile::TempDir;

use common::{
    create_audio_file, create_draft, create_test_queue, test_settings, Scripted,
    ScriptedTransport, StaticCredentials,
};
use voicedrop::adapters::{
    ManualNetworkMonitor, TransportError, TransportResponse, UploadRequest, UploadTransport,
};
use voicedrop::domain::RecordingStatus;
use voicedrop::queue::UploadQueue;
use voicedrop::store::{RecordingRepository, SqliteRecordingStore};

/// Server that stores one upload per idempotency key and drops the first
/// response it sends for each key
struct DedupServer {
    uploads: Mutex<HashMap<String, String>>,
    lost_responses: Mutex<HashSet<String>>,
}

#[async_trait]
impl UploadTransport for DedupServer {
    async fn upload(&self, request: &UploadRequest) -> Result<TransportResponse, TransportError> {
        let key = request.idempotency_key().unwrap().to_string();

        let remote_id = {
            let mut uploads = self.uploads.lock().unwrap();
            let next = format!("srv-{}", uploads.len() + 1);
            uploads.entry(key.clone()).or_insert(next).clone()
        };

        if self.lost_responses.lock().unwrap().insert(key) {
            return Err(TransportError::Timeout("response lost".to_string()));
        }

        Ok(TransportResponse {
            status_code: 201,
            body: format!(r#"{{"id":"{}"}}"#, remote_id),
        })
    }
}

#[tokio::test(start_paused = true)]
async fn test_key_is_stable_across_retries() {
    let transport = ScriptedTransport::new(Scripted::ok("srv-1")).with_script(vec![
        Scripted::status(500),
        Scripted::ConnectionFailure,
        Scripted::status(503),
    ]);
    let t = create_test_queue(transport, test_settings(5, 1000));
    t.queue.start().await.unwrap();

    let recording = t.queue.enqueue(t.draft(30.0)).await.unwrap();
    t.wait_for_status(recording.id, RecordingStatus::Uploaded).await;

    let requests = t.transport.requests();
    assert_eq!(requests.len(), 4);
    let expected = recording.idempotency_key.to_string();
    for request in &requests {
        assert_eq!(request.idempotency_key(), Some(expected.as_str()));
    }
}

#[tokio::test]
async fn test_keys_differ_between_recordings() {
    let t = create_test_queue(ScriptedTransport::new(Scripted::ok("srv")), test_settings(5, 1000));
    t.insert(30.0, Utc::now()).await;
    t.insert(30.0, Utc::now()).await;

    t.queue.run_cycle().await.unwrap();

    let keys: HashSet<String> = t
        .transport
        .requests()
        .iter()
        .map(|r| r.idempotency_key().unwrap().to_string())
        .collect();
    assert_eq!(keys.len(), 2);
}

#[tokio::test]
async fn test_lost_response_does_not_duplicate_upload() {
    let server = Arc::new(DedupServer {
        uploads: Mutex::new(HashMap::new()),
        lost_responses: Mutex::new(HashSet::new()),
    });
    let dir = TempDir::new().unwrap();
    let store = Arc::new(SqliteRecordingStore::open(dir.path().join("voicedrop.db")).unwrap());
    let queue = UploadQueue::new(
        store.clone(),
        Arc::new(StaticCredentials(Some("t".to_string()))),
        server.clone(),
        Arc::new(ManualNetworkMonitor::new(true)),
        test_settings(5, 1000),
    );

    let path = create_audio_file(dir.path(), "memo.m4a");
    let recording = queue.enqueue(create_draft(path, 30.0)).await.unwrap();

    // First response is lost after the server stored the upload
    queue.run_cycle().await.unwrap();
    assert_eq!(
        store.get_by_id(recording.id).await.unwrap().unwrap().status,
        RecordingStatus::Error
    );
    queue.run_cycle().await.unwrap();

    let uploaded = store.get_by_id(recording.id).await.unwrap().unwrap();
    assert_eq!(uploaded.status, RecordingStatus::Uploaded);
    assert_eq!(uploaded.upload_attempts, 2);
    assert_eq!(uploaded.remote_id.as_deref(), Some("srv-1"));
    assert_eq!(server.uploads.lock().unwrap().len(), 1);
}
