// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Byte-level progress fan-in and cancellation fan-out.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::download::types::{FileDownload, FileStatus, MIN_PROGRESS};
use crate::errors::DownloadError;

/// One-way cancellation latch owned by the caller of a download.
///
/// Cloning shares the latch. Once set it stays set.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Point-in-time view of one attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSnapshot {
    pub bytes_downloaded: u64,
    pub bytes_expected: u64,
    pub fraction: f64,
    pub files_total: usize,
    pub files_done: usize,
    pub files_active: usize,
    /// First failed file in scheduling order, with its error.
    pub first_error: Option<(String, DownloadError)>,
    pub speed_bps: Option<u64>,
    pub eta_seconds: Option<u64>,
}

impl ProgressSnapshot {
    pub fn all_done(&self) -> bool {
        self.files_done == self.files_total
    }
}

/// Sums per-file counters into asset-level progress.
///
/// Reading never mutates file state; the only write is [`cancel_all`],
/// which pushes the cancellation signal to every file.
///
/// [`cancel_all`]: ProgressAggregator::cancel_all
pub struct ProgressAggregator {
    files: Vec<Arc<FileDownload>>,
    bytes_expected: u64,
    started: Instant,
}

impl ProgressAggregator {
    pub fn new(files: Vec<Arc<FileDownload>>, bytes_expected: u64) -> Self {
        Self {
            files,
            bytes_expected,
            started: Instant::now(),
        }
    }

    pub fn bytes_downloaded(&self) -> u64 {
        self.files.iter().map(|f| f.size_downloaded()).sum()
    }

    /// Downloaded over expected, clamped to `[MIN_PROGRESS, 1.0]`.
    pub fn fraction(&self) -> f64 {
        progress_fraction(self.bytes_downloaded(), self.bytes_expected)
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let mut files_done = 0;
        let mut files_active = 0;
        let mut first_error = None;
        let mut bytes_downloaded = 0;

        for file in &self.files {
            bytes_downloaded += file.size_downloaded();
            match file.status() {
                FileStatus::Done => files_done += 1,
                FileStatus::Ongoing | FileStatus::Waiting | FileStatus::Initialized => files_active += 1,
                FileStatus::Error => {
                    if first_error.is_none() {
                        let err = file
                            .error()
                            .unwrap_or_else(|| DownloadError::Stream("unknown failure".to_string()));
                        first_error = Some((file.filename.clone(), err));
                    }
                }
                FileStatus::Cancelled => {}
            }
        }

        let elapsed = self.started.elapsed().as_secs_f64();
        let speed_bps = (elapsed > 0.0 && bytes_downloaded > 0).then(|| (bytes_downloaded as f64 / elapsed) as u64);
        let eta_seconds = speed_bps
            .filter(|speed| *speed > 0)
            .map(|speed| self.bytes_expected.saturating_sub(bytes_downloaded) / speed);

        ProgressSnapshot {
            bytes_downloaded,
            bytes_expected: self.bytes_expected,
            fraction: progress_fraction(bytes_downloaded, self.bytes_expected),
            files_total: self.files.len(),
            files_done,
            files_active,
            first_error,
            speed_bps,
            eta_seconds,
        }
    }

    /// Cancel every file that is not already terminal. Returns how many
    /// files changed state.
    pub fn cancel_all(&self) -> usize {
        self.files.iter().filter(|f| f.cancel()).count()
    }
}

/// Progress ratio with the minimum-visible clamp applied.
pub fn progress_fraction(downloaded: u64, expected: u64) -> f64 {
    if expected == 0 {
        return MIN_PROGRESS;
    }
    (downloaded as f64 / expected as f64).clamp(MIN_PROGRESS, 1.0)
}
