// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Per-asset download state machine.
//!
//! ```text
//! IDLE -> REQUESTING_URLS -> SCHEDULING -> POLLING -> RENAMING -> DONE
//!              ^                              |
//!              +--------- RETRYING <----------+--> ERROR | CANCELLED
//! ```
//!
//! Each pass through `REQUESTING_URLS` is an attempt with its own server
//! uuid, its own file records and exactly one quality event.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::download::finalize::{rename_downloads, write_dynamic_files};
use crate::download::pool::{JobHandle, JobWait, WorkerPool};
use crate::download::progress::{CancelFlag, ProgressAggregator};
use crate::download::resolver::{Convention, DownloadRequest, ResolvedDownloads, UrlResolver};
use crate::download::telemetry::{QualityStatus, QualityTracker};
use crate::download::types::{
    Asset, AssetProgress, DownloadReport, DownloadSession, FileDownload, FileStatus, SessionState,
};
use crate::download::worker::{FileTransferWorker, HttpTransport, DEFAULT_CHUNK_SIZE, DEFAULT_TEMP_SUFFIX};
use crate::errors::{DownloadError, UserFacingError};

/// Marker in filenames of source-format model files.
const SOURCE_MARKER: &str = "_SOURCE";

/// Extensions treated as model files by the source-file rule.
const MODEL_EXTENSIONS: [&str; 8] = ["fbx", "blend", "obj", "gltf", "glb", "max", "c4d", "usd"];

/// Tunables for one coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub max_parallel_files: usize,
    pub poll_interval: Duration,
    pub chunk_size: usize,
    pub temp_suffix: String,
    /// How long to wait for each worker to return after cancellation.
    pub cancel_wait_timeout: Duration,
    pub default_convention: Convention,
    pub include_lods: bool,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_parallel_files: 8,
            poll_interval: Duration::from_millis(250),
            chunk_size: DEFAULT_CHUNK_SIZE,
            temp_suffix: DEFAULT_TEMP_SUFFIX.to_string(),
            cancel_wait_timeout: Duration::from_secs(60),
            default_convention: Convention::Descriptor,
            include_lods: false,
        }
    }
}

/// How one attempt ended.
enum AttemptOutcome {
    Done(Vec<PathBuf>),
    Cancelled,
    Failed(DownloadError),
}

type WorkerJobs = Vec<(Arc<FileDownload>, JobHandle<FileStatus>)>;

/// Drives one asset from URL resolution to renamed files on disk.
pub struct DownloadCoordinator {
    resolver: Arc<dyn UrlResolver>,
    transport: Arc<dyn HttpTransport>,
    telemetry: Arc<QualityTracker>,
    options: CoordinatorOptions,
}

impl DownloadCoordinator {
    pub fn new(
        resolver: Arc<dyn UrlResolver>,
        transport: Arc<dyn HttpTransport>,
        telemetry: Arc<QualityTracker>,
        options: CoordinatorOptions,
    ) -> Self {
        Self {
            resolver,
            transport,
            telemetry,
            options,
        }
    }

    pub fn options(&self) -> &CoordinatorOptions {
        &self.options
    }

    /// Download `asset` at `size` into `<library_dir>/<asset_name>`.
    ///
    /// Blocks until the asset reaches `Done`, `Error` or `Cancelled`.
    /// `cancel` is polled; `on_progress` is called from this thread on every
    /// state change and poll tick.
    pub fn run(
        &self,
        asset: &Asset,
        size: &str,
        library_dir: &Path,
        cancel: &CancelFlag,
        on_progress: &mut dyn FnMut(&AssetProgress),
    ) -> DownloadReport {
        let target_dir = library_dir.join(&asset.asset_name);
        let request = DownloadRequest::for_asset(asset, size, self.options.default_convention, self.options.include_lods);
        let mut retries_remaining = self.options.max_retries;
        let mut attempt: u32 = 0;
        let mut uuids = Vec::new();

        tracing::info!(
            asset_id = asset.asset_id,
            asset_name = %asset.asset_name,
            size,
            convention = ?request.convention,
            "Starting asset download"
        );

        loop {
            if cancel.is_cancelled() {
                return self.finish(asset, SessionState::Cancelled, attempt, uuids, Vec::new(), Some(DownloadError::Cancelled), on_progress);
            }
            attempt += 1;

            let mut progress = AssetProgress::new(asset.asset_id, &asset.asset_name, SessionState::RequestingUrls, "Requesting download links");
            progress.attempt = attempt;
            on_progress(&progress);

            let resolved = match self.resolver.resolve(&request, attempt > 1) {
                Ok(resolved) => resolved,
                Err(err) => {
                    if err.is_retryable() && retries_remaining > 0 && !cancel.is_cancelled() {
                        retries_remaining -= 1;
                        self.emit_retry(asset, attempt, retries_remaining, &err, on_progress);
                        continue;
                    }
                    return self.finish(asset, SessionState::Error, attempt, uuids, Vec::new(), Some(err), on_progress);
                }
            };

            let uuid = resolved.uuid.clone();
            uuids.push(uuid.clone());
            let session = self.plan_session(asset, &request, &resolved, &target_dir, retries_remaining);

            match self.run_attempt(asset, &session, &resolved, cancel, attempt, on_progress) {
                AttemptOutcome::Done(files) => {
                    self.telemetry.report_once(&uuid, asset.asset_id, QualityStatus::Success, None);
                    return self.finish(asset, SessionState::Done, attempt, uuids, files, None, on_progress);
                }
                AttemptOutcome::Cancelled => {
                    self.telemetry.report_once(&uuid, asset.asset_id, QualityStatus::Canceled, None);
                    return self.finish(asset, SessionState::Cancelled, attempt, uuids, Vec::new(), Some(DownloadError::Cancelled), on_progress);
                }
                AttemptOutcome::Failed(err) => {
                    let cancelled = cancel.is_cancelled();
                    let status = if cancelled { QualityStatus::Canceled } else { QualityStatus::Failed };
                    self.telemetry
                        .report_once(&uuid, asset.asset_id, status, Some(err.label().to_string()));
                    // A worker stuck past the cancel deadline is surfaced as is, never retried.
                    if matches!(err, DownloadError::CancelTimeout(_)) {
                        return self.finish(asset, SessionState::Error, attempt, uuids, Vec::new(), Some(err), on_progress);
                    }
                    // Cancellation observed during a failure wins over retrying.
                    if cancelled {
                        return self.finish(asset, SessionState::Cancelled, attempt, uuids, Vec::new(), Some(DownloadError::Cancelled), on_progress);
                    }
                    if err.is_retryable() && retries_remaining > 0 {
                        retries_remaining -= 1;
                        self.emit_retry(asset, attempt, retries_remaining, &err, on_progress);
                        continue;
                    }
                    return self.finish(asset, SessionState::Error, attempt, uuids, Vec::new(), Some(err), on_progress);
                }
            }
        }
    }

    /// Build the file records for one attempt.
    fn plan_session(
        &self,
        asset: &Asset,
        request: &DownloadRequest,
        resolved: &ResolvedDownloads,
        target_dir: &Path,
        retries_remaining: u32,
    ) -> DownloadSession {
        let files = plan_files(asset.asset_id, request.convention, resolved, target_dir);
        let total_bytes_expected = files.iter().map(|f| f.size_expected).sum();
        if total_bytes_expected != resolved.size_asset {
            tracing::debug!(
                asset_id = asset.asset_id,
                planned = total_bytes_expected,
                size_asset = resolved.size_asset,
                "Planned bytes differ from server total"
            );
        }
        DownloadSession {
            asset_id: asset.asset_id,
            asset_name: asset.asset_name.clone(),
            target_directory: target_dir.to_path_buf(),
            download_list: files.into_iter().map(Arc::new).collect(),
            uuid: resolved.uuid.clone(),
            total_bytes_expected,
            retries_remaining,
        }
    }

    fn run_attempt(
        &self,
        asset: &Asset,
        session: &DownloadSession,
        resolved: &ResolvedDownloads,
        cancel: &CancelFlag,
        attempt: u32,
        on_progress: &mut dyn FnMut(&AssetProgress),
    ) -> AttemptOutcome {
        if session.download_list.is_empty() {
            return AttemptOutcome::Failed(DownloadError::EmptyUrlList);
        }

        let mut progress = AssetProgress::new(asset.asset_id, &asset.asset_name, SessionState::Scheduling, "Scheduling downloads");
        progress.attempt = attempt;
        progress.bytes_expected = session.total_bytes_expected;
        on_progress(&progress);

        let workers = self.options.max_parallel_files.clamp(1, session.download_list.len());
        let pool = match WorkerPool::new(workers, &format!("dl-{}", asset.asset_id)) {
            Ok(pool) => pool,
            Err(e) => return AttemptOutcome::Failed(DownloadError::from_io(&e, &session.target_directory)),
        };

        tracing::debug!(
            asset_id = asset.asset_id,
            uuid = %session.uuid,
            files = session.download_list.len(),
            workers,
            "Scheduling file transfers"
        );

        let mut jobs: WorkerJobs = Vec::with_capacity(session.download_list.len());
        for file in &session.download_list {
            file.mark_waiting();
            let job_file = Arc::clone(file);
            let transport = Arc::clone(&self.transport);
            let chunk_size = self.options.chunk_size;
            let suffix = self.options.temp_suffix.clone();
            let handle = pool.submit(move || FileTransferWorker::new(transport.as_ref(), chunk_size, &suffix).run(&job_file));
            jobs.push((Arc::clone(file), handle));
        }

        let aggregator = ProgressAggregator::new(session.download_list.clone(), session.total_bytes_expected);

        loop {
            if cancel.is_cancelled() {
                tracing::info!(asset_id = asset.asset_id, uuid = %session.uuid, "Cancellation requested");
                let cancelled = aggregator.cancel_all();
                tracing::debug!(asset_id = asset.asset_id, cancelled, "Signalled file workers");
                return match self.wait_for_workers(jobs) {
                    Ok(()) => {
                        pool.join();
                        AttemptOutcome::Cancelled
                    }
                    Err(err) => AttemptOutcome::Failed(err),
                };
            }

            mark_panicked_workers(&mut jobs);
            let snapshot = aggregator.snapshot();

            let mut progress = AssetProgress::new(asset.asset_id, &asset.asset_name, SessionState::Polling, "Downloading");
            progress.attempt = attempt;
            progress.bytes_downloaded = snapshot.bytes_downloaded;
            progress.bytes_expected = snapshot.bytes_expected;
            progress.fraction = snapshot.fraction;
            progress.speed_bps = snapshot.speed_bps;
            progress.eta_seconds = snapshot.eta_seconds;
            on_progress(&progress);

            if let Some((filename, err)) = snapshot.first_error {
                tracing::warn!(
                    asset_id = asset.asset_id,
                    uuid = %session.uuid,
                    filename = %filename,
                    error = %err,
                    "File failed, cancelling remaining transfers"
                );
                aggregator.cancel_all();
                return match self.wait_for_workers(jobs) {
                    Ok(()) => {
                        pool.join();
                        AttemptOutcome::Failed(err)
                    }
                    Err(timeout) => AttemptOutcome::Failed(timeout),
                };
            }

            if snapshot.all_done() {
                break;
            }

            thread::sleep(self.options.poll_interval);
        }

        pool.join();
        self.finalize(asset, session, resolved, attempt, on_progress)
    }

    fn finalize(
        &self,
        asset: &Asset,
        session: &DownloadSession,
        resolved: &ResolvedDownloads,
        attempt: u32,
        on_progress: &mut dyn FnMut(&AssetProgress),
    ) -> AttemptOutcome {
        let mut progress = AssetProgress::new(asset.asset_id, &asset.asset_name, SessionState::Renaming, "Finishing files");
        progress.attempt = attempt;
        progress.bytes_downloaded = session.total_bytes_downloaded();
        progress.bytes_expected = session.total_bytes_expected;
        progress.fraction = 1.0;
        on_progress(&progress);

        let mut files = match write_dynamic_files(&session.target_directory, &resolved.dynamic_files) {
            Ok(written) => written,
            Err(err) => return AttemptOutcome::Failed(err),
        };

        let report = rename_downloads(&session.download_list, &self.options.temp_suffix);
        if let Some(first) = report.failures.into_iter().next() {
            return AttemptOutcome::Failed(first);
        }
        files.extend(report.finalized);
        AttemptOutcome::Done(files)
    }

    /// Wait for every worker to return after cancellation was signalled.
    ///
    /// A worker that does not return within the deadline is an unexpected
    /// condition that ends the download with `CancelTimeout`; its pool
    /// thread is detached.
    fn wait_for_workers(&self, jobs: WorkerJobs) -> Result<(), DownloadError> {
        let timeout = self.options.cancel_wait_timeout;
        for (file, handle) in jobs {
            match handle.wait_timeout(timeout) {
                JobWait::Finished(status) => {
                    tracing::trace!(filename = %file.filename, ?status, "Worker returned");
                }
                JobWait::Panicked(message) => {
                    tracing::error!(filename = %file.filename, panic = %message, "File worker panicked");
                }
                JobWait::TimedOut => {
                    tracing::error!(
                        filename = %file.filename,
                        timeout_secs = timeout.as_secs(),
                        "File worker did not stop after cancellation"
                    );
                    return Err(DownloadError::CancelTimeout(timeout));
                }
            }
        }
        Ok(())
    }

    fn emit_retry(
        &self,
        asset: &Asset,
        attempt: u32,
        retries_remaining: u32,
        err: &DownloadError,
        on_progress: &mut dyn FnMut(&AssetProgress),
    ) {
        tracing::warn!(
            asset_id = asset.asset_id,
            attempt,
            retries_remaining,
            error = %err,
            "Attempt failed, retrying with fresh links"
        );
        let mut progress = AssetProgress::new(
            asset.asset_id,
            &asset.asset_name,
            SessionState::Retrying,
            format!("{}, retrying ({} left)", err.label(), retries_remaining),
        );
        progress.attempt = attempt;
        on_progress(&progress);
    }

    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        asset: &Asset,
        state: SessionState,
        attempts: u32,
        uuids: Vec<String>,
        files: Vec<PathBuf>,
        error: Option<DownloadError>,
        on_progress: &mut dyn FnMut(&AssetProgress),
    ) -> DownloadReport {
        self.telemetry.release(&uuids);
        let user_error = error.map(|e| UserFacingError::for_asset(&e, asset.asset_id, &asset.asset_name));

        let message = match (&state, &user_error) {
            (SessionState::Done, _) => "Download complete".to_string(),
            (SessionState::Cancelled, _) => "Download cancelled".to_string(),
            (_, Some(e)) => e.label.clone(),
            (_, None) => "Download failed".to_string(),
        };
        let mut progress = AssetProgress::new(asset.asset_id, &asset.asset_name, state, message);
        progress.attempt = attempts;
        progress.fraction = if state == SessionState::Done { 1.0 } else { 0.0 };
        progress.error = user_error.clone();
        on_progress(&progress);

        match state {
            SessionState::Done => tracing::info!(asset_id = asset.asset_id, attempts, files = files.len(), "Asset download complete"),
            _ => tracing::info!(asset_id = asset.asset_id, attempts, state = %state, "Asset download ended"),
        }

        DownloadReport {
            asset_id: asset.asset_id,
            asset_name: asset.asset_name.clone(),
            state,
            attempts,
            uuids,
            files,
            error: user_error,
        }
    }
}

/// A worker that panicked leaves its file non-terminal; record it as a
/// stream failure so the poll loop sees it.
fn mark_panicked_workers(jobs: &mut WorkerJobs) {
    for (file, handle) in jobs.iter_mut() {
        if handle.is_finished() && !file.status().is_terminal() {
            tracing::error!(filename = %file.filename, "File worker exited without a result");
            file.mark_error(DownloadError::Stream("worker exited unexpectedly".to_string()));
        }
    }
}

/// Turn the server's file list into file records, smallest first.
///
/// - Duplicates of the same path and size are dropped. A duplicate with a
///   different size is logged as an integrity anomaly and the first entry
///   is kept.
/// - `_SOURCE` files are dropped, except source model files when the asset
///   has no other model file.
/// - Convention 1 files nest under their resolution directory.
pub fn plan_files(
    asset_id: u64,
    convention: Convention,
    resolved: &ResolvedDownloads,
    target_dir: &Path,
) -> Vec<FileDownload> {
    let mut first_size: HashMap<PathBuf, u64> = HashMap::new();
    let mut unique = Vec::with_capacity(resolved.downloads.len());

    for remote in &resolved.downloads {
        let directory = match (convention, &remote.resolution) {
            (Convention::Descriptor, Some(res)) if !res.is_empty() => target_dir.join(res),
            _ => target_dir.to_path_buf(),
        };
        let key = directory.join(&remote.name);
        match first_size.get(&key) {
            Some(&bytes) if bytes == remote.bytes => {
                tracing::debug!(asset_id, filename = %remote.name, "Dropping duplicate file entry");
            }
            Some(&bytes) => {
                let anomaly = DownloadError::DuplicateFileSize {
                    filename: remote.name.clone(),
                    first: bytes,
                    other: remote.bytes,
                };
                tracing::warn!(asset_id, error = %anomaly, "Keeping first entry of conflicting duplicate");
            }
            None => {
                first_size.insert(key, remote.bytes);
                unique.push(
                    FileDownload::new(&remote.url, &remote.name, directory, remote.bytes)
                        .with_resolution(remote.resolution.clone()),
                );
            }
        }
    }

    let has_regular_model = unique.iter().any(|f| is_model(&f.filename) && !is_source(&f.filename));
    let mut planned: Vec<FileDownload> = Vec::with_capacity(unique.len());
    for file in unique {
        if !is_source(&file.filename) {
            planned.push(file);
        } else if is_model(&file.filename) && !has_regular_model {
            tracing::warn!(asset_id, filename = %file.filename, "Only source model available, downloading it");
            planned.push(file);
        } else {
            tracing::debug!(asset_id, filename = %file.filename, "Skipping source file");
        }
    }

    planned.sort_by_key(|f| f.size_expected);
    planned
}

fn is_source(filename: &str) -> bool {
    filename.contains(SOURCE_MARKER)
}

fn is_model(filename: &str) -> bool {
    Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|ext| MODEL_EXTENSIONS.iter().any(|m| m.eq_ignore_ascii_case(ext)))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::resolver::RemoteFile;

    fn remote(name: &str, bytes: u64, resolution: Option<&str>) -> RemoteFile {
        RemoteFile {
            url: format!("https://cdn.test/{}", name),
            name: name.into(),
            bytes,
            resolution: resolution.map(str::to_string),
        }
    }

    fn resolved(downloads: Vec<RemoteFile>) -> ResolvedDownloads {
        ResolvedDownloads {
            uuid: "u".into(),
            size_asset: downloads.iter().map(|d| d.bytes).sum(),
            downloads,
            dynamic_files: Vec::new(),
        }
    }

    fn names(files: &[FileDownload]) -> Vec<&str> {
        files.iter().map(|f| f.filename.as_str()).collect()
    }

    #[test]
    fn test_plan_sorts_smallest_first() {
        let r = resolved(vec![remote("a", 100, None), remote("b", 50, None), remote("c", 200, None)]);
        let files = plan_files(1, Convention::Legacy, &r, Path::new("/lib/A"));
        assert_eq!(names(&files), vec!["b", "a", "c"]);
    }

    #[test]
    fn test_plan_duplicate_keeps_first() {
        let r = resolved(vec![remote("a", 100, None), remote("a", 100, None), remote("a", 90, None)]);
        let files = plan_files(1, Convention::Legacy, &r, Path::new("/lib/A"));
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].size_expected, 100);
    }

    #[test]
    fn test_plan_source_files_dropped_when_regular_model_exists() {
        let r = resolved(vec![
            remote("Chair.fbx", 10, None),
            remote("Chair_SOURCE.blend", 20, None),
            remote("Chair_COL_SOURCE.jpg", 5, None),
        ]);
        let files = plan_files(1, Convention::Legacy, &r, Path::new("/lib/Chair"));
        assert_eq!(names(&files), vec!["Chair.fbx"]);
    }

    #[test]
    fn test_plan_source_model_kept_when_only_model() {
        let r = resolved(vec![remote("Chair_SOURCE.blend", 20, None), remote("Chair_COL.jpg", 5, None)]);
        let files = plan_files(1, Convention::Legacy, &r, Path::new("/lib/Chair"));
        assert_eq!(names(&files), vec!["Chair_COL.jpg", "Chair_SOURCE.blend"]);
    }

    #[test]
    fn test_plan_descriptor_nests_resolution() {
        let r = resolved(vec![remote("a.jpg", 1, Some("2K")), remote("b.jpg", 2, None)]);
        let files = plan_files(1, Convention::Descriptor, &r, Path::new("/lib/A"));
        assert_eq!(files[0].final_path(), PathBuf::from("/lib/A/2K/a.jpg"));
        assert_eq!(files[1].final_path(), PathBuf::from("/lib/A/b.jpg"));

        let legacy = plan_files(1, Convention::Legacy, &r, Path::new("/lib/A"));
        assert_eq!(legacy[0].final_path(), PathBuf::from("/lib/A/a.jpg"));
    }

    #[test]
    fn test_is_model() {
        assert!(is_model("x.FBX"));
        assert!(!is_model("x.jpg"));
        assert!(!is_model("noext"));
    }
}
