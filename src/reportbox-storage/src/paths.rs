//! OS-aware path detection for reportbox storage.
//!
//! - **Windows**: `%APPDATA%\reportbox\`
//! - **macOS**: `~/Library/Application Support/reportbox/`
//! - **Linux**: `~/.local/share/reportbox/`
//!
//! `REPORTBOX_DATA_DIR` overrides the platform default. When running in a
//! read-only container, mount the data directory as a writable volume: it
//! holds the records snapshot and, unless configured elsewhere, the uploads.

use std::path::PathBuf;
use tracing::debug;

use crate::error::{Result, StorageError};

/// Application name used for storage directories.
pub const APP_NAME: &str = "reportbox";

pub const RECORDS_FILE: &str = "records.json";
pub const LOCK_FILE: &str = "records.lock";
pub const UPLOADS_DIR: &str = "uploads";

/// Storage paths container.
#[derive(Debug, Clone)]
pub struct StoragePaths {
    /// Root data directory (platform-specific).
    pub data_dir: PathBuf,
    /// JSON snapshot of users, tasks and reports.
    pub records_file: PathBuf,
    /// Advisory lock guarding snapshot writes across processes.
    pub lock_file: PathBuf,
    /// Directory that local report files are resolved against.
    pub uploads_dir: PathBuf,
}

impl StoragePaths {
    /// Create paths with automatic OS detection.
    pub fn new() -> Result<Self> {
        let data_dir = reportbox_data_dir()?;
        Ok(Self::from_root(data_dir))
    }

    /// Create paths from a custom root directory.
    pub fn from_root(data_dir: PathBuf) -> Self {
        Self {
            records_file: data_dir.join(RECORDS_FILE),
            lock_file: data_dir.join(LOCK_FILE),
            uploads_dir: data_dir.join(UPLOADS_DIR),
            data_dir,
        }
    }

    /// Use a different uploads directory.
    pub fn with_uploads_dir(mut self, uploads_dir: impl Into<PathBuf>) -> Self {
        self.uploads_dir = uploads_dir.into();
        self
    }

    /// Ensure all directories exist.
    pub async fn ensure_dirs(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.data_dir).await?;
        tokio::fs::create_dir_all(&self.uploads_dir).await?;
        debug!(data_dir = %self.data_dir.display(), "Storage directories initialized");
        Ok(())
    }
}

/// Get the reportbox data directory based on the current OS.
pub fn reportbox_data_dir() -> Result<PathBuf> {
    if let Ok(val) = std::env::var("REPORTBOX_DATA_DIR") {
        if !val.is_empty() {
            let path = PathBuf::from(val);
            debug!(path = %path.display(), "Using REPORTBOX_DATA_DIR override");
            return Ok(path);
        }
    }

    let base = dirs::data_dir().ok_or(StorageError::HomeDirNotFound)?;
    Ok(base.join(APP_NAME))
}
