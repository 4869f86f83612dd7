//! Command-line interface for voicedrop.
//!
//! Provides commands for adding recordings, inspecting and managing the
//! upload queue, running the uploader, and signing in.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use uuid::Uuid;

use crate::adapters::{
    AuthClient, FileTokenStore, HttpAuthApi, HttpUploadTransport, LoginCredentials,
    ManualNetworkMonitor, NetworkMonitor, ProbeNetworkMonitor,
};
use crate::config::{self, Settings};
use crate::domain::{Recording, RecordingDraft, RecordingFilter, RecordingStatus};
use crate::queue::{AttemptOutcome, CycleOutcome, UploadQueue};
use crate::store::{RecordingRepository, SqliteRecordingStore};

/// voicedrop - Durable upload queue for voice recordings
#[derive(Parser, Debug)]
#[command(name = "voicedrop")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Add a finished recording to the queue
    Add {
        /// Audio file
        file: PathBuf,

        /// Duration in seconds
        #[arg(short, long)]
        duration: f64,

        /// When the recording ended (RFC 3339, defaults to now)
        #[arg(long)]
        ended_at: Option<DateTime<Utc>>,

        /// Copy the file into the voicedrop recordings directory
        #[arg(long)]
        copy: bool,
    },

    /// List recordings, newest first
    List {
        /// Filter by upload state
        #[arg(short, long, value_enum, default_value = "all")]
        filter: ListFilter,

        /// Case-insensitive match on start time or id
        #[arg(short, long)]
        search: Option<String>,

        /// Maximum number of recordings to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Show details of a recording
    Show {
        /// Recording ID (UUID)
        recording_id: Uuid,
    },

    /// Re-queue a failed recording
    Retry {
        /// Recording ID (UUID)
        recording_id: Uuid,
    },

    /// Delete a recording and its audio file
    Delete {
        /// Recording ID (UUID)
        recording_id: Uuid,
    },

    /// Run one upload cycle and exit
    Sync,

    /// Upload continuously until interrupted
    Run,

    /// Sign in to the upload server
    Login {
        /// Account email
        email: String,

        /// Account password
        #[arg(long, env = "VOICEDROP_PASSWORD", hide_env_values = true)]
        password: String,
    },

    /// Sign out and forget stored tokens
    Logout,

    /// Show resolved configuration (debug)
    Config,
}

/// Recording filter for CLI (maps to RecordingFilter)
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ListFilter {
    /// Every recording
    All,

    /// Uploaded recordings
    Uploaded,

    /// Waiting for, or in the middle of, an upload
    Pending,

    /// Failed uploads
    Error,
}

impl From<ListFilter> for RecordingFilter {
    fn from(f: ListFilter) -> Self {
        match f {
            ListFilter::All => RecordingFilter::All,
            ListFilter::Uploaded => RecordingFilter::Uploaded,
            ListFilter::Pending => RecordingFilter::Pending,
            ListFilter::Error => RecordingFilter::Error,
        }
    }
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let settings = config::load()?;

        match self.command {
            Commands::Add {
                file,
                duration,
                ended_at,
                copy,
            } => add_recording(&settings, &file, duration, ended_at, copy).await,
            Commands::List {
                filter,
                search,
                limit,
            } => list_recordings(&settings, filter.into(), search.as_deref(), limit).await,
            Commands::Show { recording_id } => show_recording(&settings, recording_id).await,
            Commands::Retry { recording_id } => retry_recording(&settings, recording_id).await,
            Commands::Delete { recording_id } => delete_recording(&settings, recording_id).await,
            Commands::Sync => sync(&settings).await,
            Commands::Run => run(&settings).await,
            Commands::Login { email, password } => login(&settings, email, password).await,
            Commands::Logout => logout(&settings).await,
            Commands::Config => show_config(&settings),
        }
    }
}

fn open_store(settings: &Settings) -> Result<Arc<SqliteRecordingStore>> {
    let path = settings.database_path();
    let store = SqliteRecordingStore::open(&path)
        .with_context(|| format!("Failed to open recording store: {}", path.display()))?;
    Ok(Arc::new(store))
}

fn auth_client(settings: &Settings) -> Result<AuthClient> {
    let api = HttpAuthApi::new(&settings.api_base_url, settings.api_timeout)
        .context("Failed to build auth client")?;
    Ok(AuthClient::new(
        Arc::new(api),
        FileTokenStore::new(settings.token_path()),
        settings.token_refresh_threshold,
    ))
}

/// Wire the queue from its collaborators
async fn build_queue(
    settings: &Settings,
    store: Arc<SqliteRecordingStore>,
    network: Arc<dyn NetworkMonitor>,
) -> Result<UploadQueue> {
    let auth = auth_client(settings)?;
    auth.initialize().await;

    let transport =
        HttpUploadTransport::new(settings.api_timeout).context("Failed to build HTTP client")?;

    Ok(UploadQueue::new(
        store,
        Arc::new(auth),
        Arc::new(transport),
        network,
        settings.queue_settings(),
    ))
}

/// Queue for local-only actions; it is never started, so nothing uploads
async fn offline_queue(settings: &Settings) -> Result<UploadQueue> {
    let store = open_store(settings)?;
    build_queue(settings, store, Arc::new(ManualNetworkMonitor::new(false))).await
}

async fn add_recording(
    settings: &Settings,
    file: &Path,
    duration_sec: f64,
    ended_at: Option<DateTime<Utc>>,
    copy: bool,
) -> Result<()> {
    let source = file
        .canonicalize()
        .with_context(|| format!("Recording file not found: {}", file.display()))?;

    let local_path = if copy {
        let dir = settings.recordings_dir();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        let extension = source
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("m4a");
        let target = dir.join(format!("recording_{}.{}", Utc::now().timestamp_millis(), extension));
        std::fs::copy(&source, &target)
            .with_context(|| format!("Failed to copy recording to {}", target.display()))?;
        target
    } else {
        source
    };

    let ended_at = ended_at.unwrap_or_else(Utc::now);
    let started_at = session_start(ended_at, duration_sec)?;

    let queue = offline_queue(settings).await?;
    let recording = queue
        .enqueue(RecordingDraft {
            local_path,
            duration_sec,
            started_at,
            ended_at,
        })
        .await?;

    println!("Recording ID: {}", recording.id);
    println!("Status: {}", recording.status);
    if recording.status == RecordingStatus::TooShort {
        eprintln!(
            "Shorter than {}s; kept locally and not uploaded",
            settings.threshold_seconds
        );
    } else {
        eprintln!("Queued. Run `voicedrop sync` or `voicedrop run` to upload.");
    }

    Ok(())
}

/// Start of a capture session that ended at `ended_at` and lasted `duration_sec`
fn session_start(ended_at: DateTime<Utc>, duration_sec: f64) -> Result<DateTime<Utc>> {
    chrono::Duration::try_milliseconds((duration_sec * 1000.0) as i64)
        .and_then(|length| ended_at.checked_sub_signed(length))
        .with_context(|| format!("Duration out of range: {}s", duration_sec))
}

async fn list_recordings(
    settings: &Settings,
    filter: RecordingFilter,
    search: Option<&str>,
    limit: usize,
) -> Result<()> {
    let store = open_store(settings)?;
    let recordings = store.list_all(filter, search).await?;

    if recordings.is_empty() {
        println!("No recordings found");
        return Ok(());
    }

    println!(
        "{:<38} {:<10} {:>9} {:<25} {:>8}",
        "RECORDING ID", "STATUS", "DURATION", "STARTED", "ATTEMPTS"
    );
    println!("{}", "-".repeat(94));

    for recording in recordings.iter().take(limit) {
        println!(
            "{:<38} {:<10} {:>8.1}s {:<25} {:>8}",
            recording.id,
            recording.status.as_str(),
            recording.duration_sec,
            recording.started_at.format("%Y-%m-%d %H:%M:%S"),
            recording.upload_attempts
        );
    }

    if recordings.len() > limit {
        eprintln!("({} more not shown)", recordings.len() - limit);
    }

    Ok(())
}

fn print_recording(recording: &Recording) {
    println!("Recording ID: {}", recording.id);
    println!("File: {}", recording.local_path.display());
    println!("Duration: {:.1}s", recording.duration_sec);
    println!("Started: {}", recording.started_at);
    println!("Ended: {}", recording.ended_at);
    println!("Status: {}", recording.status);
    println!("Attempts: {}", recording.upload_attempts);
    if let Some(ref error) = recording.last_error {
        println!("Last error: {}", error);
    }
    if let Some(ref remote_id) = recording.remote_id {
        println!("Remote ID: {}", remote_id);
    }
    println!("Idempotency key: {}", recording.idempotency_key);
    println!("Created: {}", recording.created_at);
    println!("Updated: {}", recording.updated_at);
}

async fn show_recording(settings: &Settings, id: Uuid) -> Result<()> {
    let store = open_store(settings)?;
    let recording = store
        .get_by_id(id)
        .await?
        .with_context(|| format!("Recording not found: {}", id))?;

    print_recording(&recording);
    Ok(())
}

async fn retry_recording(settings: &Settings, id: Uuid) -> Result<()> {
    let queue = offline_queue(settings).await?;
    queue.retry(id).await?;
    eprintln!("Recording {} re-queued", id);
    Ok(())
}

async fn delete_recording(settings: &Settings, id: Uuid) -> Result<()> {
    let queue = offline_queue(settings).await?;
    let recording = queue.delete(id).await?;
    eprintln!(
        "Deleted recording {} ({})",
        recording.id,
        recording.local_path.display()
    );
    Ok(())
}

fn report_cycle(outcome: &CycleOutcome) {
    match outcome {
        CycleOutcome::AlreadyRunning => eprintln!("An upload cycle is already running"),
        CycleOutcome::Offline => eprintln!("Offline; nothing uploaded"),
        CycleOutcome::Stopped(report) | CycleOutcome::Completed(report) => {
            if report.attempts.is_empty() {
                eprintln!("Nothing to upload");
            }
            for (id, attempt) in &report.attempts {
                match attempt {
                    AttemptOutcome::Uploaded { remote_id } => {
                        eprintln!("  {} uploaded as {}", id, remote_id)
                    }
                    AttemptOutcome::Failed { error, retry_in } => match retry_in {
                        Some(delay) => eprintln!(
                            "  {} failed: {} (retry in {}s)",
                            id,
                            error,
                            delay.as_secs()
                        ),
                        None => eprintln!("  {} failed: {}", id, error),
                    },
                    AttemptOutcome::Skipped => eprintln!("  {} skipped", id),
                }
            }
        }
    }
}

async fn sync(settings: &Settings) -> Result<()> {
    let store = open_store(settings)?;
    let network = ProbeNetworkMonitor::new(&settings.api_base_url, settings.api_timeout)
        .context("Failed to build network probe")?;
    let queue = build_queue(settings, store, Arc::new(network)).await?;

    let outcome = queue.run_cycle().await?;
    report_cycle(&outcome);
    Ok(())
}

async fn run(settings: &Settings) -> Result<()> {
    let store = open_store(settings)?;
    let mut network = ProbeNetworkMonitor::new(&settings.api_base_url, settings.api_timeout)
        .context("Failed to build network probe")?;
    network.spawn_polling(settings.probe_interval);
    let queue = build_queue(settings, store, Arc::new(network)).await?;

    queue.progress().subscribe(|event| {
        tracing::info!(
            recording_id = %event.recording_id,
            percent = event.percent,
            "Upload progress"
        );
    });

    let outcome = queue.start().await?;
    report_cycle(&outcome);
    eprintln!("Uploader running. Press Ctrl-C to stop.");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    queue.stop();
    eprintln!("Stopped");
    Ok(())
}

async fn login(settings: &Settings, email: String, password: String) -> Result<()> {
    let auth = auth_client(settings)?;
    let user = auth
        .login(&LoginCredentials { email, password })
        .await
        .context("Login failed")?;

    eprintln!("Logged in as {} ({})", user.email, user.id);
    Ok(())
}

async fn logout(settings: &Settings) -> Result<()> {
    let auth = auth_client(settings)?;
    auth.logout().await.context("Logout failed")?;
    eprintln!("Logged out");
    Ok(())
}

fn show_config(settings: &Settings) -> Result<()> {
    println!("voicedrop configuration");
    println!("=======================");
    println!();

    if let Some(ref config_file) = settings.config_file {
        println!("Config file: {}", config_file.display());
    } else {
        println!("Config file: (none found, using defaults)");
    }
    println!();

    println!("Paths:");
    println!("  home:       {}", settings.home.display());
    println!("  database:   {}", settings.database_path().display());
    println!("  tokens:     {}", settings.token_path().display());
    println!("  recordings: {}", settings.recordings_dir().display());
    println!();

    println!("Upload:");
    println!("  api_base_url:           {}", settings.api_base_url);
    println!("  api_timeout_ms:         {}", settings.api_timeout.as_millis());
    println!("  max_upload_attempts:    {}", settings.retry.max_attempts);
    println!("  initial_retry_delay_ms: {}", settings.retry.initial_delay_ms);
    println!("  max_retry_delay_ms:     {}", settings.retry.max_delay_ms);
    println!("  max_concurrent_uploads: {}", settings.max_concurrent_uploads);
    println!("  threshold_seconds:      {}", settings.threshold_seconds);
    println!();

    println!("Auth:");
    println!(
        "  token_refresh_threshold_ms: {}",
        settings.token_refresh_threshold.as_millis()
    );
    println!();

    println!("Network:");
    println!(
        "  probe_interval_secs: {}",
        settings.probe_interval.as_secs()
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_add() {
        let cli = Cli::try_parse_from(["voicedrop", "add", "memo.m4a", "--duration", "12.5"]).unwrap();
        match cli.command {
            Commands::Add {
                file,
                duration,
                ended_at,
                copy,
            } => {
                assert_eq!(file, PathBuf::from("memo.m4a"));
                assert_eq!(duration, 12.5);
                assert!(ended_at.is_none());
                assert!(!copy);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_cli_parses_list_filter() {
        let cli = Cli::try_parse_from(["voicedrop", "list", "--filter", "pending"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::List {
                filter: ListFilter::Pending,
                ..
            }
        ));
    }

    #[test]
    fn test_session_start() {
        let ended_at = Utc::now();
        let started_at = session_start(ended_at, 12.5).unwrap();
        assert_eq!(ended_at - started_at, chrono::Duration::milliseconds(12_500));
    }

    #[test]
    fn test_session_start_out_of_range_is_error() {
        let err = session_start(Utc::now(), 1e15).unwrap_err();
        assert!(err.to_string().contains("out of range"));
        assert!(session_start(Utc::now(), f64::MAX).is_err());
    }

    #[test]
    fn test_cli_rejects_bad_uuid() {
        assert!(Cli::try_parse_from(["voicedrop", "retry", "not-a-uuid"]).is_err());
    }
}
