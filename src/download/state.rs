// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Persistent per-asset download history.
//!
//! Records the outcome of the latest download of every asset so the UI can
//! offer a per-asset retry. Shared between processes: readers take a shared
//! lock, writers an exclusive one, and writes go through temp file + rename.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use super::types::{DownloadReport, SessionState};
use crate::errors::UserFacingError;

/// Default timeout for acquiring file locks.
const LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Retry interval when waiting for lock acquisition.
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(50);

const HISTORY_VERSION: u32 = 1;

/// How the latest download of an asset ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadOutcome {
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl DownloadOutcome {
    pub fn from_state(state: SessionState) -> Self {
        match state {
            SessionState::Done => DownloadOutcome::Completed,
            SessionState::Cancelled => DownloadOutcome::Cancelled,
            SessionState::Error => DownloadOutcome::Failed,
            _ => DownloadOutcome::InProgress,
        }
    }

    /// Whether the UI should offer a retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DownloadOutcome::Failed | DownloadOutcome::Cancelled)
    }
}

impl std::fmt::Display for DownloadOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DownloadOutcome::InProgress => write!(f, "in progress"),
            DownloadOutcome::Completed => write!(f, "completed"),
            DownloadOutcome::Failed => write!(f, "failed"),
            DownloadOutcome::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// One asset's latest download.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub asset_id: u64,
    pub asset_name: String,
    pub size: String,
    pub outcome: DownloadOutcome,
    pub attempts: u32,
    pub error: Option<UserFacingError>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl HistoryEntry {
    pub fn started(asset_id: u64, asset_name: impl Into<String>, size: impl Into<String>) -> Self {
        Self {
            asset_id,
            asset_name: asset_name.into(),
            size: size.into(),
            outcome: DownloadOutcome::InProgress,
            attempts: 0,
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Apply a coordinator report.
    pub fn finish(&mut self, report: &DownloadReport) {
        self.outcome = DownloadOutcome::from_state(report.state);
        self.attempts = report.attempts;
        self.error = report.error.clone();
        self.finished_at = Some(Utc::now());
    }
}

/// History file contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadHistory {
    /// Keyed by asset id.
    pub entries: BTreeMap<u64, HistoryEntry>,
    pub last_saved: Option<DateTime<Utc>>,
    pub version: u32,
}

impl Default for DownloadHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl DownloadHistory {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            last_saved: None,
            version: HISTORY_VERSION,
        }
    }

    /// Default history file location.
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .map(|h| h.join(".poliigon-sync").join("downloads").join("history.json"))
            .unwrap_or_else(|| PathBuf::from(".poliigon-sync/downloads/history.json"))
    }

    /// Lock file guarding `path`. Kept separate so the lock survives the
    /// rename of the data file.
    fn lock_path(path: &Path) -> PathBuf {
        path.with_extension("lock")
    }

    fn acquire_exclusive_lock_with_timeout(path: &Path, timeout: Duration) -> Result<File> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory for lock file: {:?}", parent))?;
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("Failed to open lock file: {:?}", path))?;

        let start = Instant::now();
        loop {
            match lock_file.try_lock_exclusive() {
                Ok(()) => return Ok(lock_file),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if start.elapsed() >= timeout {
                        bail!(
                            "Timed out waiting for exclusive lock on {:?} after {:?}. \
                             Another instance may be writing the download history.",
                            path,
                            timeout
                        );
                    }
                    thread::sleep(LOCK_RETRY_INTERVAL);
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to acquire exclusive lock on {:?}", path));
                }
            }
        }
    }

    fn acquire_shared_lock_with_timeout(file: &File, timeout: Duration) -> Result<()> {
        let start = Instant::now();
        loop {
            match FileExt::try_lock_shared(file) {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if start.elapsed() >= timeout {
                        bail!("Timed out waiting for shared lock after {:?}", timeout);
                    }
                    thread::sleep(LOCK_RETRY_INTERVAL);
                }
                Err(e) => {
                    return Err(e).with_context(|| "Failed to acquire shared lock on download history");
                }
            }
        }
    }

    /// Load from the default location.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::default_path())
    }

    /// Load from `path`. A missing file is an empty history.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }

        let lock_path = Self::lock_path(path);
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .with_context(|| format!("Failed to open lock file: {:?}", lock_path))?;
        Self::acquire_shared_lock_with_timeout(&lock_file, LOCK_TIMEOUT)?;

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read download history: {:?}", path))?;
        let history: DownloadHistory = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse download history: {:?}", path))?;
        Ok(history)
    }

    /// Save to the default location.
    pub fn save(&mut self) -> Result<()> {
        self.save_to(&Self::default_path())
    }

    /// Write atomically to `path` while holding the exclusive lock.
    pub fn save_to(&mut self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("Failed to create directory: {:?}", parent))?;
        }

        let _lock_guard = Self::acquire_exclusive_lock_with_timeout(&Self::lock_path(path), LOCK_TIMEOUT)?;
        let temp_path = path.with_extension("tmp");

        self.last_saved = Some(Utc::now());
        let content = serde_json::to_string_pretty(self).with_context(|| "Failed to serialize download history")?;

        {
            let mut temp_file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&temp_path)
                .with_context(|| format!("Failed to create temp file: {:?}", temp_path))?;
            temp_file.write_all(content.as_bytes()).with_context(|| "Failed to write temp file")?;
            temp_file.sync_all().with_context(|| "Failed to sync temp file to disk")?;
        }

        fs::rename(&temp_path, path)
            .with_context(|| format!("Failed to replace download history: {:?} -> {:?}", temp_path, path))?;
        Ok(())
    }

    /// Record that a download started, replacing any previous entry.
    pub fn record_start(&mut self, asset_id: u64, asset_name: &str, size: &str) {
        self.entries
            .insert(asset_id, HistoryEntry::started(asset_id, asset_name, size));
    }

    /// Record the final report of a download.
    pub fn record_report(&mut self, size: &str, report: &DownloadReport) {
        let entry = self
            .entries
            .entry(report.asset_id)
            .or_insert_with(|| HistoryEntry::started(report.asset_id, &report.asset_name, size));
        entry.finish(report);
    }

    pub fn get(&self, asset_id: u64) -> Option<&HistoryEntry> {
        self.entries.get(&asset_id)
    }

    /// Assets whose latest download failed or was cancelled.
    pub fn retryable(&self) -> Vec<&HistoryEntry> {
        self.entries.values().filter(|e| e.outcome.is_retryable()).collect()
    }

    /// Entries newest first.
    pub fn recent(&self) -> Vec<&HistoryEntry> {
        let mut entries: Vec<_> = self.entries.values().collect();
        entries.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        entries
    }

    /// Drop finished entries older than `max_age`.
    pub fn cleanup_old(&mut self, max_age: chrono::Duration) {
        let cutoff = Utc::now() - max_age;
        self.entries
            .retain(|_, e| e.finished_at.map_or(true, |finished| finished > cutoff));
    }

    /// Counts of (in progress, completed, failed, cancelled).
    pub fn outcome_counts(&self) -> (usize, usize, usize, usize) {
        let mut counts = (0, 0, 0, 0);
        for entry in self.entries.values() {
            match entry.outcome {
                DownloadOutcome::InProgress => counts.0 += 1,
                DownloadOutcome::Completed => counts.1 += 1,
                DownloadOutcome::Failed => counts.2 += 1,
                DownloadOutcome::Cancelled => counts.3 += 1,
            }
        }
        counts
    }
}
