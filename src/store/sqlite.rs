//! SQLite-backed recording store.

use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{ffi, params, params_from_iter, Connection, OptionalExtension, Row};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{migrations, RecordingRepository, StoreError};
use crate::domain::{Recording, RecordingFilter, RecordingStatus};

const COLUMNS: &str = "id, local_path, duration_sec, started_at, ended_at, status, \
     upload_attempts, last_error, remote_id, idempotency_key, created_at, updated_at";

/// Recording store that owns a single SQLite connection
pub struct SqliteRecordingStore {
    conn: Mutex<Connection>,
    db_path: Option<PathBuf>,
}

impl SqliteRecordingStore {
    /// Open (or create) the database at `db_path` and run migrations
    pub fn open(db_path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let db_path = db_path.into();

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&db_path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        conn.busy_timeout(Duration::from_secs(5))?;
        migrations::run_migrations(&conn)?;

        info!(path = %db_path.display(), "Recording store opened");

        Ok(Self {
            conn: Mutex::new(conn),
            db_path: Some(db_path),
        })
    }

    /// Open a private in-memory database (tests, dry runs)
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        migrations::run_migrations(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
            db_path: None,
        })
    }

    /// Path of the database file (`None` for in-memory stores)
    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    fn with_connection<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError>,
    {
        let mut conn = self.conn.lock().map_err(|_| StoreError::LockPoisoned)?;
        f(&mut conn)
    }
}

#[async_trait]
impl RecordingRepository for SqliteRecordingStore {
    async fn create(&self, recording: &Recording) -> Result<(), StoreError> {
        self.with_connection(|conn| {
            let result = conn.execute(
                &format!(
                    "INSERT INTO recordings ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                    COLUMNS
                ),
                params![
                    recording.id.to_string(),
                    recording.local_path.to_string_lossy().into_owned(),
                    recording.duration_sec,
                    timestamp(&recording.started_at),
                    timestamp(&recording.ended_at),
                    recording.status.as_str(),
                    recording.upload_attempts,
                    recording.last_error,
                    recording.remote_id,
                    recording.idempotency_key.to_string(),
                    timestamp(&recording.created_at),
                    timestamp(&recording.updated_at),
                ],
            );

            match result {
                Ok(_) => {
                    debug!(recording_id = %recording.id, status = %recording.status, "Recording created");
                    Ok(())
                }
                Err(rusqlite::Error::SqliteFailure(err, _))
                    if err.extended_code == ffi::SQLITE_CONSTRAINT_PRIMARYKEY
                        || err.extended_code == ffi::SQLITE_CONSTRAINT_UNIQUE =>
                {
                    Err(StoreError::DuplicateKey(recording.id))
                }
                Err(e) => Err(e.into()),
            }
        })
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<Recording>, StoreError> {
        self.with_connection(|conn| fetch(conn, id))
    }

    async fn list_all(
        &self,
        filter: RecordingFilter,
        search: Option<&str>,
    ) -> Result<Vec<Recording>, StoreError> {
        let mut conditions: Vec<&str> = Vec::new();
        let mut values: Vec<String> = Vec::new();

        match filter {
            RecordingFilter::All => {}
            RecordingFilter::Uploaded => conditions.push("status = 'uploaded'"),
            RecordingFilter::Pending => conditions.push("status IN ('queued', 'uploading')"),
            RecordingFilter::Error => conditions.push("status = 'error'"),
        }

        if let Some(term) = search.map(str::trim).filter(|t| !t.is_empty()) {
            conditions.push(
                "(lower(started_at) LIKE ? ESCAPE '\\' OR lower(id) LIKE ? ESCAPE '\\')",
            );
            let pattern = format!("%{}%", escape_like(&term.to_lowercase()));
            values.push(pattern.clone());
            values.push(pattern);
        }

        let mut sql = format!("SELECT {} FROM recordings", COLUMNS);
        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }
        sql.push_str(" ORDER BY created_at DESC, rowid DESC");

        self.with_connection(|conn| query(conn, &sql, params_from_iter(values.iter())))
    }

    async fn list_pending_upload(&self, max_attempts: u32) -> Result<Vec<Recording>, StoreError> {
        let sql = format!(
            "SELECT {} FROM recordings \
             WHERE status IN ('queued', 'error') AND upload_attempts < ?1 \
             ORDER BY created_at ASC, rowid ASC",
            COLUMNS
        );

        self.with_connection(|conn| query(conn, &sql, params![max_attempts]))
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: RecordingStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        self.with_connection(|conn| {
            let tx = conn.transaction()?;

            let Some(current) = current_status(&tx, id)? else {
                debug!(recording_id = %id, "Status update for missing recording ignored");
                return Ok(());
            };

            if !current.can_transition_to(status) {
                return Err(StoreError::InvalidTransition {
                    id,
                    from: current,
                    to: status,
                });
            }

            tx.execute(
                "UPDATE recordings SET status = ?1, last_error = ?2, updated_at = ?3 WHERE id = ?4",
                params![status.as_str(), error, timestamp(&Utc::now()), id.to_string()],
            )?;
            tx.commit()?;

            Ok(())
        })
    }

    async fn increment_attempts(&self, id: Uuid) -> Result<(), StoreError> {
        self.with_connection(|conn| {
            conn.execute(
                "UPDATE recordings SET upload_attempts = upload_attempts + 1, updated_at = ?1 WHERE id = ?2",
                params![timestamp(&Utc::now()), id.to_string()],
            )?;
            Ok(())
        })
    }

    async fn set_remote_id(&self, id: Uuid, remote_id: &str) -> Result<(), StoreError> {
        self.with_connection(|conn| {
            let tx = conn.transaction()?;

            let existing: Option<(String, Option<String>)> = tx
                .query_row(
                    "SELECT status, remote_id FROM recordings WHERE id = ?1",
                    params![id.to_string()],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            let Some((status, current_remote)) = existing else {
                debug!(recording_id = %id, "Remote id for missing recording ignored");
                return Ok(());
            };

            if let Some(current_remote) = current_remote {
                if current_remote != remote_id {
                    warn!(
                        recording_id = %id,
                        %current_remote,
                        "Recording already has a remote id; keeping the first one"
                    );
                }
                return Ok(());
            }

            let status: RecordingStatus =
                status.parse().map_err(|e| corrupt(&id.to_string(), e))?;
            if status == RecordingStatus::TooShort {
                return Err(StoreError::InvalidTransition {
                    id,
                    from: status,
                    to: RecordingStatus::Uploaded,
                });
            }

            tx.execute(
                "UPDATE recordings SET remote_id = ?1, status = 'uploaded', last_error = NULL, updated_at = ?2 \
                 WHERE id = ?3",
                params![remote_id, timestamp(&Utc::now()), id.to_string()],
            )?;
            tx.commit()?;

            Ok(())
        })
    }

    async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        self.with_connection(|conn| {
            conn.execute("DELETE FROM recordings WHERE id = ?1", params![id.to_string()])?;
            Ok(())
        })
    }

    async fn claim(&self, id: Uuid) -> Result<Option<Recording>, StoreError> {
        self.with_connection(|conn| {
            let tx = conn.transaction()?;

            match current_status(&tx, id)? {
                Some(status) if status.can_transition_to(RecordingStatus::Uploading) => {}
                _ => return Ok(None),
            }

            tx.execute(
                "UPDATE recordings SET status = 'uploading', upload_attempts = upload_attempts + 1, \
                 last_error = NULL, updated_at = ?1 WHERE id = ?2",
                params![timestamp(&Utc::now()), id.to_string()],
            )?;
            let claimed = fetch(&tx, id)?;
            tx.commit()?;

            Ok(claimed)
        })
    }

    async fn release_claim(&self, id: Uuid) -> Result<bool, StoreError> {
        self.with_connection(|conn| {
            let count = conn.execute(
                "UPDATE recordings SET status = 'queued', updated_at = ?1 \
                 WHERE id = ?2 AND status = 'uploading'",
                params![timestamp(&Utc::now()), id.to_string()],
            )?;
            Ok(count > 0)
        })
    }

    async fn requeue(&self, id: Uuid) -> Result<Option<Recording>, StoreError> {
        self.with_connection(|conn| {
            let tx = conn.transaction()?;

            let Some(current) = current_status(&tx, id)? else {
                return Ok(None);
            };
            if !matches!(current, RecordingStatus::Error | RecordingStatus::Queued) {
                return Err(StoreError::InvalidTransition {
                    id,
                    from: current,
                    to: RecordingStatus::Queued,
                });
            }

            tx.execute(
                "UPDATE recordings SET status = 'queued', last_error = NULL, updated_at = ?1 \
                 WHERE id = ?2",
                params![timestamp(&Utc::now()), id.to_string()],
            )?;
            let requeued = fetch(&tx, id)?;
            tx.commit()?;

            Ok(requeued)
        })
    }

    async fn reset_interrupted(&self) -> Result<usize, StoreError> {
        self.with_connection(|conn| {
            let count = conn.execute(
                "UPDATE recordings SET status = 'queued', updated_at = ?1 WHERE status = 'uploading'",
                params![timestamp(&Utc::now())],
            )?;

            if count > 0 {
                info!(count, "Reset interrupted uploads to queued");
            }

            Ok(count)
        })
    }
}

/// Raw column values, converted into a Recording after the row is read
struct RecordingRow {
    id: String,
    local_path: String,
    duration_sec: f64,
    started_at: String,
    ended_at: String,
    status: String,
    upload_attempts: i64,
    last_error: Option<String>,
    remote_id: Option<String>,
    idempotency_key: String,
    created_at: String,
    updated_at: String,
}

impl RecordingRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            local_path: row.get(1)?,
            duration_sec: row.get(2)?,
            started_at: row.get(3)?,
            ended_at: row.get(4)?,
            status: row.get(5)?,
            upload_attempts: row.get(6)?,
            last_error: row.get(7)?,
            remote_id: row.get(8)?,
            idempotency_key: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
        })
    }

    fn into_recording(self) -> Result<Recording, StoreError> {
        let id = &self.id;

        Ok(Recording {
            id: Uuid::parse_str(id).map_err(|e| corrupt(id, e))?,
            local_path: PathBuf::from(&self.local_path),
            duration_sec: self.duration_sec,
            started_at: parse_timestamp(id, &self.started_at)?,
            ended_at: parse_timestamp(id, &self.ended_at)?,
            status: self.status.parse().map_err(|e| corrupt(id, e))?,
            upload_attempts: u32::try_from(self.upload_attempts).map_err(|e| corrupt(id, e))?,
            last_error: self.last_error,
            remote_id: self.remote_id,
            idempotency_key: Uuid::parse_str(&self.idempotency_key).map_err(|e| corrupt(id, e))?,
            created_at: parse_timestamp(id, &self.created_at)?,
            updated_at: parse_timestamp(id, &self.updated_at)?,
        })
    }
}

fn fetch(conn: &Connection, id: Uuid) -> Result<Option<Recording>, StoreError> {
    let row = conn
        .query_row(
            &format!("SELECT {} FROM recordings WHERE id = ?1", COLUMNS),
            params![id.to_string()],
            RecordingRow::from_row,
        )
        .optional()?;

    row.map(RecordingRow::into_recording).transpose()
}

fn query<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<Vec<Recording>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, RecordingRow::from_row)?;

    let recordings: Result<Vec<Recording>, StoreError> = rows
        .map(|row| row.map_err(StoreError::from).and_then(RecordingRow::into_recording))
        .collect();
    recordings
}

fn current_status(conn: &Connection, id: Uuid) -> Result<Option<RecordingStatus>, StoreError> {
    let status: Option<String> = conn
        .query_row(
            "SELECT status FROM recordings WHERE id = ?1",
            params![id.to_string()],
            |row| row.get(0),
        )
        .optional()?;

    status
        .map(|s| s.parse().map_err(|e| corrupt(&id.to_string(), e)))
        .transpose()
}

/// Fixed-width RFC 3339 so that text ordering matches time ordering
fn timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_timestamp(id: &str, value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| corrupt(id, e))
}

fn escape_like(term: &str) -> String {
    let mut escaped = String::with_capacity(term.len());
    for c in term.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn corrupt(id: &str, reason: impl Display) -> StoreError {
    StoreError::Corrupt {
        id: id.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::RecordingDraft;
    use chrono::Duration as ChronoDuration;

    fn recording(duration_sec: f64) -> Recording {
        let ended_at = Utc::now();
        let draft = RecordingDraft {
            local_path: PathBuf::from("/tmp/test.m4a"),
            duration_sec,
            started_at: ended_at - ChronoDuration::seconds(duration_sec as i64),
            ended_at,
        };
        Recording::from_draft(draft, 5.0, Utc::now()).unwrap()
    }

    #[tokio::test]
    async fn test_create_and_get_roundtrip() {
        let store = SqliteRecordingStore::open_in_memory().unwrap();
        let rec = recording(30.0);

        store.create(&rec).await.unwrap();

        let fetched = store.get_by_id(rec.id).await.unwrap().unwrap();
        assert_eq!(fetched, rec);
    }

    #[tokio::test]
    async fn test_get_missing_returns_none() {
        let store = SqliteRecordingStore::open_in_memory().unwrap();
        assert!(store.get_by_id(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_id_is_rejected() {
        let store = SqliteRecordingStore::open_in_memory().unwrap();
        let rec = recording(30.0);

        store.create(&rec).await.unwrap();
        let err = store.create(&rec).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateKey(id) if id == rec.id));
    }

    #[tokio::test]
    async fn test_claim_marks_uploading_and_counts_attempt() {
        let store = SqliteRecordingStore::open_in_memory().unwrap();
        let rec = recording(30.0);
        store.create(&rec).await.unwrap();

        let claimed = store.claim(rec.id).await.unwrap().unwrap();
        assert_eq!(claimed.status, RecordingStatus::Uploading);
        assert_eq!(claimed.upload_attempts, 1);

        // Already uploading: not claimable again
        assert!(store.claim(rec.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_release_claim_only_moves_uploading() {
        let store = SqliteRecordingStore::open_in_memory().unwrap();
        let rec = recording(30.0);
        store.create(&rec).await.unwrap();

        assert!(!store.release_claim(rec.id).await.unwrap());

        store.claim(rec.id).await.unwrap().unwrap();
        assert!(store.release_claim(rec.id).await.unwrap());

        let fetched = store.get_by_id(rec.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, RecordingStatus::Queued);
        assert_eq!(fetched.upload_attempts, 1);
        assert!(!store.release_claim(Uuid::new_v4()).await.unwrap());
    }

    #[tokio::test]
    async fn test_requeue_rejects_claimed_recording() {
        let store = SqliteRecordingStore::open_in_memory().unwrap();
        let rec = recording(30.0);
        store.create(&rec).await.unwrap();
        store.claim(rec.id).await.unwrap().unwrap();

        let err = store.requeue(rec.id).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::InvalidTransition {
                from: RecordingStatus::Uploading,
                ..
            }
        ));

        store
            .update_status(rec.id, RecordingStatus::Error, Some("Upload failed: 500"))
            .await
            .unwrap();
        let requeued = store.requeue(rec.id).await.unwrap().unwrap();
        assert_eq!(requeued.status, RecordingStatus::Queued);
        assert_eq!(requeued.last_error, None);
        assert!(store.requeue(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reset_interrupted() {
        let store = SqliteRecordingStore::open_in_memory().unwrap();
        let rec = recording(30.0);
        store.create(&rec).await.unwrap();
        store.claim(rec.id).await.unwrap();

        assert_eq!(store.reset_interrupted().await.unwrap(), 1);

        let fetched = store.get_by_id(rec.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, RecordingStatus::Queued);
        assert_eq!(fetched.upload_attempts, 1);
        assert_eq!(store.list_pending_upload(5).await.unwrap().len(), 1);
    }

    #[test]
    fn test_escape_like() {
        assert_eq!(escape_like("50%_off\\"), "50\\%\\_off\\\\");
        assert_eq!(escape_like("2026-10"), "2026-10");
    }

    #[test]
    fn test_open_creates_file() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("nested").join("voicedrop.db");

        let store = SqliteRecordingStore::open(&path).unwrap();
        assert!(path.exists());
        assert_eq!(store.db_path(), Some(path.as_path()));
    }
}
