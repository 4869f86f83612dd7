//! Database migrations for the recording store.

use rusqlite::Connection;
use tracing::info;

use super::StoreError;

/// Current schema version
const SCHEMA_VERSION: i32 = 1;

/// Run all necessary migrations to bring the database up to date
pub fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
    let current_version = schema_version(conn)?;
    if current_version >= SCHEMA_VERSION {
        return Ok(());
    }

    if current_version < 1 {
        migrate_v1(conn)?;
    }

    Ok(())
}

/// Get the current schema version (0 for a fresh database)
pub fn schema_version(conn: &Connection) -> Result<i32, StoreError> {
    let table_exists: bool = conn.query_row(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='schema_version'",
        [],
        |row| row.get(0),
    )?;

    if !table_exists {
        return Ok(0);
    }

    let version: Option<i32> =
        conn.query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))?;

    Ok(version.unwrap_or(0))
}

/// Initial schema (version 1)
fn migrate_v1(conn: &Connection) -> Result<(), StoreError> {
    info!(version = 1, "Running database migration");

    conn.execute_batch(
        r#"
        BEGIN;

        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS recordings (
            id TEXT PRIMARY KEY NOT NULL,
            local_path TEXT NOT NULL,
            duration_sec REAL NOT NULL CHECK (duration_sec >= 0),
            started_at TEXT NOT NULL,
            ended_at TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'queued'
                CHECK (status IN ('queued', 'uploading', 'uploaded', 'error', 'too_short')),
            upload_attempts INTEGER NOT NULL DEFAULT 0 CHECK (upload_attempts >= 0),
            last_error TEXT,
            remote_id TEXT,
            idempotency_key TEXT NOT NULL UNIQUE,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            CHECK ((remote_id IS NOT NULL) = (status = 'uploaded'))
        );

        CREATE INDEX IF NOT EXISTS idx_recordings_status ON recordings(status);
        CREATE INDEX IF NOT EXISTS idx_recordings_created_at ON recordings(created_at);

        INSERT INTO schema_version (version) VALUES (1);

        COMMIT;
        "#,
    )?;

    Ok(())
}
