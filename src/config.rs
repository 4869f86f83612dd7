//! Configuration for the voicedrop client.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (MAX_UPLOAD_ATTEMPTS, API_BASE_URL, VOICEDROP_HOME, ...)
//! 2. Config file (.voicedrop/config.yaml)
//! 3. Defaults (~/.voicedrop)
//!
//! Config file discovery:
//! - Searches current directory and parents for .voicedrop/config.yaml
//! - Paths in config file are relative to the .voicedrop directory
//!
//! Settings are loaded once at startup and passed down explicitly.

pub mod paths;

use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::warn;

use crate::queue::{QueueSettings, RetryPolicy};

/// Upload concurrency the processor supports
pub const SUPPORTED_CONCURRENCY: usize = 1;

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub recording: RecordingConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub network: NetworkConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// State directory (relative to .voicedrop/)
    pub home: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiConfig {
    pub base_url: Option<String>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UploadConfig {
    pub max_attempts: Option<u32>,
    pub initial_retry_delay_ms: Option<u64>,
    pub max_retry_delay_ms: Option<u64>,
    pub max_concurrent: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RecordingConfig {
    pub threshold_seconds: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    pub token_refresh_threshold_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NetworkConfig {
    pub probe_interval_secs: Option<u64>,
}

/// Resolved settings
#[derive(Debug, Clone)]
pub struct Settings {
    /// Absolute path to the state directory
    pub home: PathBuf,

    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,

    pub api_base_url: String,

    pub api_timeout: Duration,

    /// Upload attempt ceiling and backoff
    pub retry: RetryPolicy,

    /// Always [`SUPPORTED_CONCURRENCY`]
    pub max_concurrent_uploads: usize,

    /// Minimum duration (seconds) for a recording to be uploaded
    pub threshold_seconds: f64,

    /// Refresh the access token when it expires within this window
    pub token_refresh_threshold: Duration,

    pub probe_interval: Duration,
}

impl Settings {
    /// Defaults rooted at `home`
    pub fn with_home(home: PathBuf) -> Self {
        let queue = QueueSettings::default();
        Self {
            home,
            config_file: None,
            api_base_url: queue.api_base_url,
            api_timeout: Duration::from_millis(30_000),
            retry: queue.retry,
            max_concurrent_uploads: SUPPORTED_CONCURRENCY,
            threshold_seconds: queue.threshold_seconds,
            token_refresh_threshold: Duration::from_millis(300_000),
            probe_interval: Duration::from_secs(15),
        }
    }

    pub fn queue_settings(&self) -> QueueSettings {
        QueueSettings {
            api_base_url: self.api_base_url.clone(),
            retry: self.retry,
            threshold_seconds: self.threshold_seconds,
        }
    }

    pub fn database_path(&self) -> PathBuf {
        paths::database(&self.home)
    }

    pub fn token_path(&self) -> PathBuf {
        paths::token_file(&self.home)
    }

    pub fn recordings_dir(&self) -> PathBuf {
        paths::recordings_dir(&self.home)
    }
}

/// Find config file by searching `start` and its parents
pub fn find_config_file(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();

    loop {
        let config_path = current.join(paths::CONFIG_DIR).join(paths::CONFIG_FILE);
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
pub fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to `base`
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}

/// Parse an environment value, naming the variable on failure
fn env_value<T>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    match env(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("Invalid value for {}: {:?} ({})", key, raw, e)),
        None => Ok(None),
    }
}

/// Load settings from the process environment and the discovered config file
pub fn load() -> Result<Settings> {
    let cwd = std::env::current_dir().context("Failed to determine current directory")?;
    let config_file = find_config_file(&cwd);
    load_from(config_file.as_deref(), |key| std::env::var(key).ok())
}

/// Load settings from an explicit config file and environment lookup
pub fn load_from(
    config_path: Option<&Path>,
    env: impl Fn(&str) -> Option<String>,
) -> Result<Settings> {
    let config = match config_path {
        Some(path) => load_config_file(path)?,
        None => ConfigFile::default(),
    };

    // Home: env, then config (relative to .voicedrop/), then ~/.voicedrop
    let home = if let Some(env_home) = env("VOICEDROP_HOME") {
        PathBuf::from(env_home)
    } else if let (Some(home_path), Some(path)) = (config.paths.home.as_deref(), config_path) {
        let config_dir = path.parent().unwrap_or(Path::new("."));
        resolve_path(config_dir, home_path)
    } else {
        paths::default_home()?
    };

    let mut settings = Settings::with_home(home);
    settings.config_file = config_path.map(Path::to_path_buf);

    if let Some(base_url) = env("API_BASE_URL").or(config.api.base_url) {
        settings.api_base_url = base_url;
    }
    if let Some(ms) = env_value(&env, "API_TIMEOUT_MS")?.or(config.api.timeout_ms) {
        settings.api_timeout = Duration::from_millis(ms);
    }
    if let Some(n) = env_value(&env, "MAX_UPLOAD_ATTEMPTS")?.or(config.upload.max_attempts) {
        settings.retry.max_attempts = n;
    }
    if let Some(ms) =
        env_value(&env, "INITIAL_RETRY_DELAY_MS")?.or(config.upload.initial_retry_delay_ms)
    {
        settings.retry.initial_delay_ms = ms;
    }
    if let Some(ms) = env_value(&env, "MAX_RETRY_DELAY_MS")?.or(config.upload.max_retry_delay_ms) {
        settings.retry.max_delay_ms = ms;
    }
    if let Some(n) =
        env_value::<usize>(&env, "MAX_CONCURRENT_UPLOADS")?.or(config.upload.max_concurrent)
    {
        if n != SUPPORTED_CONCURRENCY {
            warn!(
                requested = n,
                supported = SUPPORTED_CONCURRENCY,
                "Uploads are serialized; ignoring MAX_CONCURRENT_UPLOADS"
            );
        }
    }
    if let Some(secs) =
        env_value::<f64>(&env, "THRESHOLD_SECONDS")?.or(config.recording.threshold_seconds)
    {
        anyhow::ensure!(
            secs.is_finite() && secs >= 0.0,
            "THRESHOLD_SECONDS must be a non-negative number, got {}",
            secs
        );
        settings.threshold_seconds = secs;
    }
    if let Some(ms) =
        env_value(&env, "TOKEN_REFRESH_THRESHOLD_MS")?.or(config.auth.token_refresh_threshold_ms)
    {
        settings.token_refresh_threshold = Duration::from_millis(ms);
    }
    if let Some(secs) =
        env_value(&env, "NETWORK_PROBE_INTERVAL_SECS")?.or(config.network.probe_interval_secs)
    {
        anyhow::ensure!(secs > 0, "NETWORK_PROBE_INTERVAL_SECS must be positive");
        settings.probe_interval = Duration::from_secs(secs);
    }

    anyhow::ensure!(
        settings.retry.max_attempts > 0,
        "MAX_UPLOAD_ATTEMPTS must be at least 1"
    );

    Ok(settings)
}
