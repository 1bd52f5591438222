// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Download manager for background asset downloads.
//!
//! Caps how many assets download at once and gives callers a handle per
//! asset. The coordinator itself is blocking, so each admitted asset runs
//! on the blocking thread pool.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};

use anyhow::Result;
use tokio::sync::{watch, Semaphore};

use super::coordinator::DownloadCoordinator;
use super::progress::CancelFlag;
use super::state::DownloadHistory;
use super::types::{Asset, AssetProgress, DownloadReport, SessionState};
use crate::locks::{resilient_lock, resilient_read, resilient_write};

/// Default number of assets downloading concurrently.
pub const DEFAULT_MAX_PARALLEL_ASSETS: usize = 2;

/// Handle to one asset download.
#[derive(Debug, Clone)]
pub struct DownloadHandle {
    pub asset_id: u64,
    progress_rx: watch::Receiver<AssetProgress>,
    cancel: CancelFlag,
    report: Arc<Mutex<Option<DownloadReport>>>,
}

impl DownloadHandle {
    /// Latest progress.
    pub fn progress(&self) -> AssetProgress {
        self.progress_rx.borrow().clone()
    }

    pub fn is_complete(&self) -> bool {
        self.progress_rx.borrow().state.is_terminal()
    }

    /// Ask the download to stop. Takes effect at the coordinator's next poll.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Final report, once the download has ended.
    pub fn report(&self) -> Option<DownloadReport> {
        resilient_lock(&self.report).clone()
    }

    /// Wait for the download to end and return its final progress.
    pub async fn wait(&mut self) -> AssetProgress {
        loop {
            if self.progress_rx.borrow().state.is_terminal() {
                return self.progress_rx.borrow().clone();
            }
            if self.progress_rx.changed().await.is_err() {
                // Sender dropped
                return self.progress_rx.borrow().clone();
            }
        }
    }
}

/// Manager for background downloads.
pub struct DownloadManager {
    coordinator: Arc<DownloadCoordinator>,
    library_dir: PathBuf,
    permits: Arc<Semaphore>,
    handles: Arc<RwLock<HashMap<u64, DownloadHandle>>>,
    history_path: Option<PathBuf>,
    /// Serializes load-modify-save of the history file within this process.
    history_lock: Arc<Mutex<()>>,
}

impl DownloadManager {
    pub fn new(coordinator: DownloadCoordinator, library_dir: impl Into<PathBuf>, max_parallel_assets: usize) -> Self {
        Self {
            coordinator: Arc::new(coordinator),
            library_dir: library_dir.into(),
            permits: Arc::new(Semaphore::new(max_parallel_assets.max(1))),
            handles: Arc::new(RwLock::new(HashMap::new())),
            history_path: None,
            history_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Record every download in the history file at `path`.
    pub fn with_history(mut self, path: impl Into<PathBuf>) -> Self {
        self.history_path = Some(path.into());
        self
    }

    /// Queue `asset` for download at `size`.
    ///
    /// A request for an asset that is already queued or downloading returns
    /// the existing handle. Must be called inside a tokio runtime.
    pub fn queue_download(&self, asset: Asset, size: impl Into<String>) -> DownloadHandle {
        let size = size.into();
        let asset_id = asset.asset_id;

        let mut handles = resilient_write(&self.handles);
        if let Some(existing) = handles.get(&asset_id) {
            if !existing.is_complete() {
                tracing::debug!(asset_id, "Asset already downloading, reusing handle");
                return existing.clone();
            }
        }

        let initial = AssetProgress::new(asset_id, &asset.asset_name, SessionState::Queued, "Queued for download");
        let (progress_tx, progress_rx) = watch::channel(initial);
        let handle = DownloadHandle {
            asset_id,
            progress_rx,
            cancel: CancelFlag::new(),
            report: Arc::new(Mutex::new(None)),
        };
        handles.insert(asset_id, handle.clone());
        drop(handles);

        let job = DownloadJob {
            coordinator: Arc::clone(&self.coordinator),
            library_dir: self.library_dir.clone(),
            history_path: self.history_path.clone(),
            history_lock: Arc::clone(&self.history_lock),
            cancel: handle.cancel.clone(),
            report_slot: Arc::clone(&handle.report),
            asset,
            size,
        };
        let permits = Arc::clone(&self.permits);

        tokio::spawn(async move {
            let _permit = match permits.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    let failed =
                        AssetProgress::new(asset_id, &job.asset.asset_name, SessionState::Error, "Download manager closed");
                    let _ = progress_tx.send(failed);
                    return;
                }
            };

            let asset_name = job.asset.asset_name.clone();
            let tx = progress_tx.clone();
            let result = tokio::task::spawn_blocking(move || job.run(&tx)).await;

            let final_progress = match result {
                Ok(progress) => progress,
                Err(e) => {
                    tracing::error!(asset_id, error = %e, "Download task panicked");
                    AssetProgress::new(asset_id, asset_name, SessionState::Error, "Download task failed unexpectedly")
                }
            };
            let _ = progress_tx.send(final_progress);
        });

        handle
    }

    /// Latest progress of an asset.
    pub fn get_progress(&self, asset_id: u64) -> Option<AssetProgress> {
        resilient_read(&self.handles).get(&asset_id).map(|h| h.progress())
    }

    /// Cancel a download. Returns false when the asset is unknown.
    pub fn cancel(&self, asset_id: u64) -> bool {
        match resilient_read(&self.handles).get(&asset_id) {
            Some(handle) => {
                handle.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every download that has not ended.
    pub fn cancel_all(&self) {
        for handle in resilient_read(&self.handles).values() {
            if !handle.is_complete() {
                handle.cancel();
            }
        }
    }

    /// Progress of downloads that are currently transferring.
    pub fn active_downloads(&self) -> Vec<AssetProgress> {
        resilient_read(&self.handles)
            .values()
            .map(|h| h.progress())
            .filter(|p| p.state.is_active())
            .collect()
    }
}

/// Everything a blocking download task needs.
struct DownloadJob {
    coordinator: Arc<DownloadCoordinator>,
    library_dir: PathBuf,
    history_path: Option<PathBuf>,
    history_lock: Arc<Mutex<()>>,
    cancel: CancelFlag,
    report_slot: Arc<Mutex<Option<DownloadReport>>>,
    asset: Asset,
    size: String,
}

impl DownloadJob {
    /// Run the coordinator. Terminal progress is held back and returned so
    /// the report is stored before waiters see the download end.
    fn run(self, tx: &watch::Sender<AssetProgress>) -> AssetProgress {
        self.update_history(|h| h.record_start(self.asset.asset_id, &self.asset.asset_name, &self.size));

        let mut terminal = None;
        let report = {
            let mut on_progress = |p: &AssetProgress| {
                if p.state.is_terminal() {
                    terminal = Some(p.clone());
                } else {
                    let _ = tx.send(p.clone());
                }
            };
            self.coordinator
                .run(&self.asset, &self.size, &self.library_dir, &self.cancel, &mut on_progress)
        };

        self.update_history(|h| h.record_report(&self.size, &report));

        let final_progress = terminal.unwrap_or_else(|| {
            AssetProgress::new(report.asset_id, &report.asset_name, report.state, report.state.to_string())
        });
        *resilient_lock(&self.report_slot) = Some(report);
        final_progress
    }

    /// History is best effort: failures are logged, never fatal.
    fn update_history(&self, apply: impl FnOnce(&mut DownloadHistory)) {
        let Some(path) = &self.history_path else {
            return;
        };
        let _guard = resilient_lock(&self.history_lock);
        let result = DownloadHistory::load_from(path).and_then(|mut history| {
            apply(&mut history);
            history.save_to(path)
        });
        if let Err(e) = result {
            tracing::warn!(path = %path.display(), error = %e, "Failed to update download history");
        }
    }
}

impl std::fmt::Debug for DownloadManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadManager")
            .field("library_dir", &self.library_dir)
            .field("available_permits", &self.permits.available_permits())
            .field("history_path", &self.history_path)
            .finish()
    }
}

/// Convenience for callers that only need the report.
pub async fn download_and_wait(manager: &DownloadManager, asset: Asset, size: &str) -> Result<DownloadReport> {
    let mut handle = manager.queue_download(asset, size);
    let progress = handle.wait().await;
    handle
        .report()
        .ok_or_else(|| anyhow::anyhow!("Download of asset {} ended without a report: {}", progress.asset_id, progress.message))
}
