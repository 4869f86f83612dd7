//! Canonical paths for voicedrop state.
//!
//! Single source of truth - import this instead of hardcoding paths.
//!
//! ## Layout
//!
//! | Location | Purpose |
//! |----------|---------|
//! | `<home>/voicedrop.db` | Recording store (SQLite) |
//! | `<home>/auth.json` | Persisted token pair |
//! | `<home>/recordings/` | Audio files imported with `add --copy` |

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Config directory searched for in the working directory and its parents
pub const CONFIG_DIR: &str = ".voicedrop";

/// Config file name inside [`CONFIG_DIR`]
pub const CONFIG_FILE: &str = "config.yaml";

pub const DATABASE_FILE: &str = "voicedrop.db";

pub const TOKEN_FILE: &str = "auth.json";

pub const RECORDINGS_DIR: &str = "recordings";

/// Default state directory (~/.voicedrop)
pub fn default_home() -> Result<PathBuf> {
    Ok(dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(CONFIG_DIR))
}

pub fn database(home: &Path) -> PathBuf {
    home.join(DATABASE_FILE)
}

pub fn token_file(home: &Path) -> PathBuf {
    home.join(TOKEN_FILE)
}

pub fn recordings_dir(home: &Path) -> PathBuf {
    home.join(RECORDINGS_DIR)
}
