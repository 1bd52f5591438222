// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Download types: assets, per-file records and session progress.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::errors::{DownloadError, UserFacingError};
use crate::locks::resilient_lock;

/// Minimum reported progress once a download has started, so a running
/// download never looks identical to one that has not started.
pub const MIN_PROGRESS: f64 = 0.001;

/// Kind of purchasable asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AssetType {
    Texture,
    Model,
    #[serde(rename = "HDRI", alias = "Hdri")]
    Hdri,
    Brush,
}

impl std::fmt::Display for AssetType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AssetType::Texture => write!(f, "Textures"),
            AssetType::Model => write!(f, "Models"),
            AssetType::Hdri => write!(f, "HDRIs"),
            AssetType::Brush => write!(f, "Brushes"),
        }
    }
}

/// A texture map the asset offers, with the file formats it exists in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapDescriptor {
    pub map_type: String,
    #[serde(default)]
    pub formats: Vec<String>,
}

/// Asset data as provided by the asset index. Read-only during a download.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    pub asset_id: u64,
    pub asset_name: String,
    #[serde(rename = "type")]
    pub asset_type: AssetType,
    #[serde(default)]
    pub sizes: Vec<String>,
    /// Local files, filled in once the asset has been downloaded.
    #[serde(default)]
    pub files: Vec<PathBuf>,
    /// Map descriptors used by the convention 1 request body.
    #[serde(default)]
    pub maps: Vec<MapDescriptor>,
    /// Legacy map type codes used by the convention 0 request body.
    #[serde(default)]
    pub map_codes: Vec<String>,
    #[serde(default)]
    pub workflows: Vec<String>,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub convention: Option<u8>,
}

impl Asset {
    /// Create a minimal asset record.
    pub fn new(asset_id: u64, asset_name: impl Into<String>, asset_type: AssetType) -> Self {
        Self {
            asset_id,
            asset_name: asset_name.into(),
            asset_type,
            sizes: Vec::new(),
            files: Vec::new(),
            maps: Vec::new(),
            map_codes: Vec::new(),
            workflows: Vec::new(),
            categories: Vec::new(),
            convention: None,
        }
    }

    /// Load an asset record from a JSON file.
    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        use anyhow::Context;
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read asset file: {:?}", path))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse asset file: {:?}", path))
    }
}

/// Status of one file transfer.
///
/// `Done`, `Error` and `Cancelled` are terminal. Transitions are applied with
/// compare-and-set under the file's own lock, so a cancellation can never
/// overwrite a file that already finished or failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileStatus {
    Initialized,
    Waiting,
    Ongoing,
    Done,
    Error,
    Cancelled,
}

impl FileStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, FileStatus::Done | FileStatus::Error | FileStatus::Cancelled)
    }
}

#[derive(Debug)]
struct FileState {
    status: FileStatus,
    error: Option<DownloadError>,
    correlation_id: Option<String>,
}

/// One remote file belonging to an asset.
///
/// Only constructed from a resolver response, so a record always has a URL.
/// `size_downloaded` is written by its worker and read by the aggregator
/// without taking the status lock.
#[derive(Debug)]
pub struct FileDownload {
    pub url: String,
    pub filename: String,
    pub directory: PathBuf,
    pub size_expected: u64,
    pub resolution: Option<String>,
    size_downloaded: AtomicU64,
    state: Mutex<FileState>,
}

impl FileDownload {
    pub fn new(
        url: impl Into<String>,
        filename: impl Into<String>,
        directory: impl Into<PathBuf>,
        size_expected: u64,
    ) -> Self {
        Self {
            url: url.into(),
            filename: filename.into(),
            directory: directory.into(),
            size_expected,
            resolution: None,
            size_downloaded: AtomicU64::new(0),
            state: Mutex::new(FileState {
                status: FileStatus::Initialized,
                error: None,
                correlation_id: None,
            }),
        }
    }

    pub fn with_resolution(mut self, resolution: Option<String>) -> Self {
        self.resolution = resolution;
        self
    }

    /// Final location of the file.
    pub fn final_path(&self) -> PathBuf {
        self.directory.join(&self.filename)
    }

    /// Location while the transfer is running: the filename plus `suffix`.
    pub fn temp_path(&self, suffix: &str) -> PathBuf {
        self.directory.join(format!("{}{}", self.filename, suffix))
    }

    pub fn status(&self) -> FileStatus {
        resilient_lock(&self.state).status
    }

    pub fn error(&self) -> Option<DownloadError> {
        resilient_lock(&self.state).error.clone()
    }

    pub fn correlation_id(&self) -> Option<String> {
        resilient_lock(&self.state).correlation_id.clone()
    }

    pub fn set_correlation_id(&self, id: Option<String>) {
        resilient_lock(&self.state).correlation_id = id;
    }

    pub fn size_downloaded(&self) -> u64 {
        self.size_downloaded.load(Ordering::Acquire)
    }

    pub fn add_downloaded(&self, bytes: u64) {
        self.size_downloaded.fetch_add(bytes, Ordering::AcqRel);
    }

    pub fn set_downloaded(&self, bytes: u64) {
        self.size_downloaded.store(bytes, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.status() == FileStatus::Cancelled
    }

    /// Queue the file for a worker. Only moves out of `Initialized`.
    pub fn mark_waiting(&self) -> bool {
        self.transition(|s| s == FileStatus::Initialized, FileStatus::Waiting)
    }

    /// Move to `Ongoing` unless the file is already terminal (usually
    /// cancelled between scheduling and execution).
    pub fn try_start(&self) -> bool {
        self.transition(|s| !s.is_terminal(), FileStatus::Ongoing)
    }

    /// Mark the transfer complete. Fails if another thread already moved the
    /// file to a terminal state.
    pub fn mark_done(&self) -> bool {
        self.transition(|s| !s.is_terminal(), FileStatus::Done)
    }

    /// Record a failure. A cancelled file stays cancelled.
    pub fn mark_error(&self, error: DownloadError) -> bool {
        let mut state = resilient_lock(&self.state);
        if state.status.is_terminal() {
            return false;
        }
        state.status = FileStatus::Error;
        state.error = Some(error);
        true
    }

    /// Request cancellation. Returns false, and changes nothing, when the
    /// file already reached `Done`, `Error` or `Cancelled`.
    pub fn cancel(&self) -> bool {
        let mut state = resilient_lock(&self.state);
        if state.status.is_terminal() {
            return false;
        }
        state.status = FileStatus::Cancelled;
        state.error = Some(DownloadError::Cancelled);
        true
    }

    fn transition(&self, allowed: impl Fn(FileStatus) -> bool, to: FileStatus) -> bool {
        let mut state = resilient_lock(&self.state);
        if !allowed(state.status) {
            return false;
        }
        state.status = to;
        true
    }
}

/// Coordinator state for one asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Idle,
    Queued,
    RequestingUrls,
    Scheduling,
    Polling,
    Retrying,
    Renaming,
    Done,
    Error,
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Done | SessionState::Error | SessionState::Cancelled)
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal() && !matches!(self, SessionState::Idle | SessionState::Queued)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Idle => "IDLE",
            SessionState::Queued => "QUEUED",
            SessionState::RequestingUrls => "REQUESTING_URLS",
            SessionState::Scheduling => "SCHEDULING",
            SessionState::Polling => "POLLING",
            SessionState::Retrying => "RETRYING",
            SessionState::Renaming => "RENAMING",
            SessionState::Done => "DONE",
            SessionState::Error => "ERROR",
            SessionState::Cancelled => "CANCELLED",
        };
        write!(f, "{}", name)
    }
}

/// One attempt at downloading every file of an asset.
///
/// A retry builds a new session with a new `uuid`; file records are never
/// shared between attempts.
#[derive(Debug)]
pub struct DownloadSession {
    pub asset_id: u64,
    pub asset_name: String,
    pub target_directory: PathBuf,
    pub download_list: Vec<Arc<FileDownload>>,
    pub uuid: String,
    pub total_bytes_expected: u64,
    pub retries_remaining: u32,
}

impl DownloadSession {
    /// Sum of bytes written across all files of this attempt.
    pub fn total_bytes_downloaded(&self) -> u64 {
        self.download_list.iter().map(|f| f.size_downloaded()).sum()
    }
}

/// Progress of one asset as seen by the UI.
#[derive(Debug, Clone)]
pub struct AssetProgress {
    pub asset_id: u64,
    pub asset_name: String,
    pub state: SessionState,
    /// Human-readable status message
    pub message: String,
    pub bytes_downloaded: u64,
    pub bytes_expected: u64,
    /// Fraction in `[MIN_PROGRESS, 1.0]` once transfers started, 0.0 before.
    pub fraction: f64,
    pub attempt: u32,
    pub speed_bps: Option<u64>,
    pub eta_seconds: Option<u64>,
    pub error: Option<UserFacingError>,
}

impl AssetProgress {
    /// Create a new progress update with no byte counts.
    pub fn new(asset_id: u64, asset_name: impl Into<String>, state: SessionState, message: impl Into<String>) -> Self {
        Self {
            asset_id,
            asset_name: asset_name.into(),
            state,
            message: message.into(),
            bytes_downloaded: 0,
            bytes_expected: 0,
            fraction: 0.0,
            attempt: 0,
            speed_bps: None,
            eta_seconds: None,
            error: None,
        }
    }

    /// Get formatted speed string.
    pub fn speed_string(&self) -> Option<String> {
        self.speed_bps.map(|bps| {
            if bps >= 1_073_741_824 {
                format!("{:.1} GB/s", bps as f64 / 1_073_741_824.0)
            } else if bps >= 1_048_576 {
                format!("{:.1} MB/s", bps as f64 / 1_048_576.0)
            } else if bps >= 1024 {
                format!("{:.1} KB/s", bps as f64 / 1024.0)
            } else {
                format!("{} B/s", bps)
            }
        })
    }

    /// Get formatted ETA string.
    pub fn eta_string(&self) -> Option<String> {
        self.eta_seconds.map(|secs| {
            if secs >= 3600 {
                format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
            } else if secs >= 60 {
                format!("{}m {}s", secs / 60, secs % 60)
            } else {
                format!("{}s", secs)
            }
        })
    }
}

/// Final result of a coordinator run.
#[derive(Debug, Clone)]
pub struct DownloadReport {
    pub asset_id: u64,
    pub asset_name: String,
    pub state: SessionState,
    pub attempts: u32,
    /// Correlation ids of every attempt that reached the server, in order.
    pub uuids: Vec<String>,
    pub files: Vec<PathBuf>,
    pub error: Option<UserFacingError>,
}

impl DownloadReport {
    pub fn is_success(&self) -> bool {
        self.state == SessionState::Done
    }
}
