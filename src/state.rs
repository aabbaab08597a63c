//! Persisted update state.
//!
//! A single flat JSON record at a fixed path under the host's system data
//! directory. The orchestrator is the only writer; writes are merge-writes
//! of partial patches over the stored record.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Errors from status store operations.
#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("state record error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Lifecycle status of the update state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpdateStatus {
    /// Initial and terminal state.
    UpToDate,
    /// A newer release was observed on the feed.
    DownloadAvailable,
    /// Manifest and images are being fetched.
    Downloading,
    /// Fetched release is ready to apply.
    UpdateAvailable,
    /// Services are being recreated onto the new release.
    Updating,
    /// Services are being force-recreated in place.
    Restarting,
}

impl UpdateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UpToDate => "up-to-date",
            Self::DownloadAvailable => "download-available",
            Self::Downloading => "downloading",
            Self::UpdateAvailable => "update-available",
            Self::Updating => "updating",
            Self::Restarting => "restarting",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "up-to-date" => Some(Self::UpToDate),
            "download-available" => Some(Self::DownloadAvailable),
            "downloading" => Some(Self::Downloading),
            "update-available" => Some(Self::UpdateAvailable),
            "updating" => Some(Self::Updating),
            "restarting" => Some(Self::Restarting),
            _ => None,
        }
    }
}

impl fmt::Display for UpdateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The persisted record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateState {
    pub status: UpdateStatus,
    /// Identifier of the currently running release.
    pub version: String,
    /// Identifier of a pending release, empty when none.
    pub available_version: String,
    /// Unix milliseconds of the last completed update.
    pub updated_at: i64,
}

impl UpdateState {
    fn initial() -> Self {
        Self {
            status: UpdateStatus::UpToDate,
            version: "Latest".to_string(),
            available_version: String::new(),
            updated_at: Utc::now().timestamp_millis(),
        }
    }
}

/// Partial update merged over the stored record.
#[derive(Debug, Clone, Default)]
pub struct StatePatch {
    pub status: Option<UpdateStatus>,
    pub version: Option<String>,
    pub available_version: Option<String>,
    pub updated_at: Option<i64>,
}

/// JSON-file backed status store.
pub struct StatusStore {
    path: PathBuf,
}

impl StatusStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the record with defaults when it does not exist yet.
    pub async fn init(&self) -> Result<(), StateStoreError> {
        if tokio::fs::try_exists(&self.path).await? {
            return Ok(());
        }

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        debug!(path = %self.path.display(), "Writing initial update state");
        self.write(&UpdateState::initial()).await
    }

    /// Read the full record.
    pub async fn load(&self) -> Result<UpdateState, StateStoreError> {
        let raw = tokio::fs::read_to_string(&self.path).await?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Merge-write a partial update over the stored record.
    pub async fn merge(&self, patch: StatePatch) -> Result<(), StateStoreError> {
        let mut state = self.load().await?;

        if let Some(status) = patch.status {
            state.status = status;
        }
        if let Some(version) = patch.version {
            state.version = version;
        }
        if let Some(available_version) = patch.available_version {
            state.available_version = available_version;
        }
        if let Some(updated_at) = patch.updated_at {
            state.updated_at = updated_at;
        }

        self.write(&state).await
    }

    async fn write(&self, state: &UpdateState) -> Result<(), StateStoreError> {
        let raw = serde_json::to_string_pretty(state)?;
        tokio::fs::write(&self.path, raw).await?;
        Ok(())
    }
}
