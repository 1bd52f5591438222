// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! End-to-end download scenarios against in-memory resolver and transport.

use std::collections::{HashMap, VecDeque};
use std::io::{Cursor, Read};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tempfile::TempDir;

use poliigon_sync::download::{
    Asset, AssetProgress, AssetType, CancelFlag, CoordinatorOptions, DownloadCoordinator, DownloadHistory,
    DownloadManager, DownloadOutcome, DownloadRequest, DynamicFile, FileDownload, FileStatus, FileTransferWorker,
    HttpTransport, ProgressAggregator, QualityEvent, QualitySink, QualityStatus, QualityTracker, RemoteFile,
    ResolvedDownloads, SessionState, TransferStream, UrlResolver, MIN_PROGRESS,
};
use poliigon_sync::errors::{DownloadError, ErrorCategory};

// =============================================================================
// FAKES
// =============================================================================

/// Hands out queued responses and records the retry flag of every call.
#[derive(Default)]
struct ScriptedResolver {
    responses: Mutex<VecDeque<ResolvedDownloads>>,
    retry_flags: Mutex<Vec<bool>>,
}

impl ScriptedResolver {
    fn new(responses: Vec<ResolvedDownloads>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            retry_flags: Mutex::new(Vec::new()),
        }
    }

    fn calls(&self) -> usize {
        self.retry_flags.lock().unwrap().len()
    }
}

impl UrlResolver for ScriptedResolver {
    fn resolve(&self, _request: &DownloadRequest, is_retry: bool) -> Result<ResolvedDownloads, DownloadError> {
        self.retry_flags.lock().unwrap().push(is_retry);
        self.responses.lock().unwrap().pop_front().ok_or(DownloadError::EmptyUrlList)
    }
}

/// Reader that sleeps before every chunk.
struct SlowReader {
    inner: Cursor<Vec<u8>>,
    delay: Duration,
}

impl Read for SlowReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        thread::sleep(self.delay);
        self.inner.read(buf)
    }
}

#[derive(Default)]
struct MemoryTransport {
    bodies: HashMap<String, Vec<u8>>,
    /// URLs under this prefix answer as expired links.
    expired_prefix: Option<String>,
    read_delay: Option<Duration>,
    /// Per-chunk delay for single files, by file name.
    slow: HashMap<String, Duration>,
    calls: AtomicUsize,
}

impl MemoryTransport {
    fn serving(responses: &[&ResolvedDownloads]) -> Self {
        let mut bodies = HashMap::new();
        for response in responses {
            for remote in &response.downloads {
                bodies.insert(remote.url.clone(), vec![b'x'; remote.bytes as usize]);
            }
        }
        Self {
            bodies,
            ..Self::default()
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl HttpTransport for MemoryTransport {
    fn open(&self, url: &str) -> Result<TransferStream, DownloadError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(prefix) = &self.expired_prefix {
            if url.starts_with(prefix.as_str()) {
                return Err(DownloadError::UrlExpired { status: 403 });
            }
        }
        let body = self.bodies.get(url).cloned().ok_or_else(|| DownloadError::Http {
            status: 404,
            message: url.to_string(),
        })?;
        let length = body.len() as u64;
        let name = url.rsplit('/').next().unwrap_or(url);
        let delay = self.slow.get(name).copied().or(self.read_delay);
        let body: Box<dyn Read + Send> = match delay {
            Some(delay) => Box::new(SlowReader {
                inner: Cursor::new(body),
                delay,
            }),
            None => Box::new(Cursor::new(body)),
        };
        Ok(TransferStream {
            content_length: Some(length),
            correlation_id: Some("ray-test".to_string()),
            body,
        })
    }
}

struct Recording(Arc<Mutex<Vec<QualityEvent>>>);

impl QualitySink for Recording {
    fn send(&self, event: &QualityEvent) {
        self.0.lock().unwrap().push(event.clone());
    }
}

// =============================================================================
// HELPERS
// =============================================================================

fn response(uuid: &str, files: &[(&str, u64)]) -> ResolvedDownloads {
    let downloads: Vec<RemoteFile> = files
        .iter()
        .map(|(name, bytes)| RemoteFile {
            url: format!("https://cdn.test/{}/{}", uuid, name),
            name: name.to_string(),
            bytes: *bytes,
            resolution: None,
        })
        .collect();
    ResolvedDownloads {
        uuid: uuid.to_string(),
        size_asset: downloads.iter().map(|d| d.bytes).sum(),
        downloads,
        dynamic_files: Vec::new(),
    }
}

fn asset() -> Asset {
    let mut asset = Asset::new(4242, "Bricks001", AssetType::Texture);
    asset.convention = Some(0);
    asset
}

struct Harness {
    coordinator: DownloadCoordinator,
    resolver: Arc<ScriptedResolver>,
    transport: Arc<MemoryTransport>,
    tracker: Arc<QualityTracker>,
    events: Arc<Mutex<Vec<QualityEvent>>>,
}

fn harness(responses: Vec<ResolvedDownloads>, transport: MemoryTransport, max_retries: u32) -> Harness {
    let options = CoordinatorOptions {
        max_retries,
        poll_interval: Duration::from_millis(5),
        chunk_size: 16,
        cancel_wait_timeout: Duration::from_secs(5),
        ..CoordinatorOptions::default()
    };
    harness_with(responses, transport, options)
}

fn harness_with(responses: Vec<ResolvedDownloads>, transport: MemoryTransport, options: CoordinatorOptions) -> Harness {
    let resolver = Arc::new(ScriptedResolver::new(responses));
    let transport = Arc::new(transport);
    let events = Arc::new(Mutex::new(Vec::new()));
    let tracker = Arc::new(QualityTracker::new(Box::new(Recording(Arc::clone(&events)))));
    let coordinator = DownloadCoordinator::new(resolver.clone(), transport.clone(), tracker.clone(), options);
    Harness {
        coordinator,
        resolver,
        transport,
        tracker,
        events,
    }
}

fn statuses(events: &Mutex<Vec<QualityEvent>>) -> Vec<(String, QualityStatus)> {
    events.lock().unwrap().iter().map(|e| (e.uuid.clone(), e.status)).collect()
}

fn no_files_named(dir: &Path, names: &[&str]) -> bool {
    names.iter().all(|n| !dir.join(n).exists())
}

// =============================================================================
// COORDINATOR SCENARIOS
// =============================================================================

#[test]
fn test_happy_path_downloads_every_file() {
    let library = TempDir::new().unwrap();
    let resolved = response("u-1", &[("a.jpg", 100), ("b.jpg", 50), ("c.jpg", 200)]);
    let transport = MemoryTransport::serving(&[&resolved]);
    let h = harness(vec![resolved], transport, 3);

    let mut seen: Vec<AssetProgress> = Vec::new();
    let report = h
        .coordinator
        .run(&asset(), "2K", library.path(), &CancelFlag::new(), &mut |p| seen.push(p.clone()));

    assert!(report.is_success());
    assert_eq!(report.attempts, 1);
    assert_eq!(report.uuids, vec!["u-1".to_string()]);
    assert_eq!(report.files.len(), 3);

    let target = library.path().join("Bricks001");
    for (name, size) in [("a.jpg", 100u64), ("b.jpg", 50), ("c.jpg", 200)] {
        assert_eq!(std::fs::metadata(target.join(name)).unwrap().len(), size);
        assert!(!target.join(format!("{}dl", name)).exists());
    }

    // Progress never leaves [0, 1] and never moves backwards within the attempt.
    let fractions: Vec<f64> = seen.iter().map(|p| p.fraction).collect();
    assert!(fractions.iter().all(|f| (0.0..=1.0).contains(f)));
    assert!(fractions.windows(2).all(|w| w[0] <= w[1]));
    let last = seen.last().unwrap();
    assert_eq!(last.state, SessionState::Done);
    assert_eq!(last.fraction, 1.0);

    assert_eq!(statuses(&h.events), vec![("u-1".to_string(), QualityStatus::Success)]);
}

#[test]
fn test_cancel_mid_download_keeps_finished_file_for_resume() {
    let library = TempDir::new().unwrap();
    let resolved = response("u-1", &[("small.jpg", 50), ("large.jpg", 100)]);
    let mut transport = MemoryTransport::serving(&[&resolved]);
    transport.slow.insert("large.jpg".to_string(), Duration::from_millis(15));
    let h = harness(vec![resolved], transport, 3);

    // Small file finished, large file past half way.
    let cancel = CancelFlag::new();
    let trigger = cancel.clone();
    let report = h.coordinator.run(&asset(), "2K", library.path(), &cancel, &mut |p| {
        if p.state == SessionState::Polling && p.bytes_downloaded >= 100 {
            trigger.cancel();
        }
    });

    assert_eq!(report.state, SessionState::Cancelled);
    assert_eq!(report.attempts, 1);
    assert!(report.files.is_empty());
    assert_eq!(h.resolver.calls(), 1);
    assert_eq!(statuses(&h.events), vec![("u-1".to_string(), QualityStatus::Canceled)]);

    let target = library.path().join("Bricks001");
    assert!(no_files_named(&target, &["small.jpg", "large.jpg", "large.jpgdl"]));
    assert_eq!(std::fs::metadata(target.join("small.jpgdl")).unwrap().len(), 50);
}

#[test]
fn test_cancel_leaves_done_file_done_and_stops_the_other() {
    let dir = TempDir::new().unwrap();
    let resolved = response("u-1", &[("small.jpg", 50), ("large.jpg", 100)]);
    let mut transport = MemoryTransport::serving(&[&resolved]);
    transport.slow.insert("large.jpg".to_string(), Duration::from_millis(15));
    let transport = Arc::new(transport);

    let small = Arc::new(FileDownload::new(&resolved.downloads[0].url, "small.jpg", dir.path(), 50));
    let large = Arc::new(FileDownload::new(&resolved.downloads[1].url, "large.jpg", dir.path(), 100));
    let aggregator = ProgressAggregator::new(vec![small.clone(), large.clone()], 150);

    assert_eq!(FileTransferWorker::new(transport.as_ref(), 16, "dl").run(&small), FileStatus::Done);
    let worker = {
        let (transport, large) = (transport.clone(), large.clone());
        thread::spawn(move || FileTransferWorker::new(transport.as_ref(), 16, "dl").run(&large))
    };
    while large.size_downloaded() < 50 {
        thread::sleep(Duration::from_millis(2));
    }

    assert_eq!(aggregator.cancel_all(), 1);
    assert_eq!(worker.join().unwrap(), FileStatus::Cancelled);

    assert_eq!(small.status(), FileStatus::Done);
    assert_eq!(small.size_downloaded(), 50);
    assert_eq!(large.status(), FileStatus::Cancelled);
    assert!(large.size_downloaded() < 100);
    assert!(no_files_named(dir.path(), &["small.jpg", "large.jpg", "large.jpgdl"]));
}

#[test]
fn test_worker_stuck_past_cancel_deadline_is_reported() {
    let library = TempDir::new().unwrap();
    let resolved = response("u-1", &[("a.jpg", 32)]);
    let mut transport = MemoryTransport::serving(&[&resolved]);
    transport.read_delay = Some(Duration::from_millis(500));
    let options = CoordinatorOptions {
        max_retries: 3,
        poll_interval: Duration::from_millis(5),
        chunk_size: 16,
        cancel_wait_timeout: Duration::from_millis(100),
        ..CoordinatorOptions::default()
    };
    let h = harness_with(vec![resolved], transport, options);

    // A few poll ticks in, the worker is blocked inside its first read.
    let cancel = CancelFlag::new();
    let trigger = cancel.clone();
    let mut polls = 0;
    let report = h.coordinator.run(&asset(), "2K", library.path(), &cancel, &mut |p| {
        if p.state == SessionState::Polling {
            polls += 1;
            if polls == 3 {
                trigger.cancel();
            }
        }
    });

    assert_eq!(report.state, SessionState::Error);
    assert_eq!(report.attempts, 1);
    assert_eq!(h.resolver.calls(), 1);
    let error = report.error.unwrap();
    assert_eq!(error.label, "Download stuck");
    assert_eq!(error.category, ErrorCategory::Protocol);
    assert_eq!(statuses(&h.events), vec![("u-1".to_string(), QualityStatus::Canceled)]);
}

#[test]
fn test_progress_is_bounded_and_monotonic_while_active() {
    let library = TempDir::new().unwrap();
    let resolved = response("u-1", &[("a.jpg", 120), ("b.jpg", 64), ("c.jpg", 200)]);
    let mut transport = MemoryTransport::serving(&[&resolved]);
    transport.read_delay = Some(Duration::from_millis(2));
    let h = harness(vec![resolved], transport, 0);

    let mut seen: Vec<AssetProgress> = Vec::new();
    let report = h
        .coordinator
        .run(&asset(), "2K", library.path(), &CancelFlag::new(), &mut |p| seen.push(p.clone()));
    assert!(report.is_success());

    let active: Vec<&AssetProgress> = seen
        .iter()
        .filter(|p| matches!(p.state, SessionState::Polling | SessionState::Renaming))
        .collect();
    assert!(active.len() > 2);
    for p in &active {
        assert!(p.bytes_downloaded <= p.bytes_expected, "{} > {}", p.bytes_downloaded, p.bytes_expected);
        assert!(p.fraction >= MIN_PROGRESS && p.fraction <= 1.0, "fraction {}", p.fraction);
    }
    assert!(active.windows(2).all(|w| w[0].fraction <= w[1].fraction));
    assert!(active.windows(2).all(|w| w[0].bytes_downloaded <= w[1].bytes_downloaded));
}

#[test]
fn test_file_counters_never_exceed_expected_size() {
    let dir = TempDir::new().unwrap();
    let resolved = response("u-1", &[("a.jpg", 90), ("b.jpg", 40), ("c.jpg", 130)]);
    let mut transport = MemoryTransport::serving(&[&resolved]);
    transport.read_delay = Some(Duration::from_millis(1));
    let transport = Arc::new(transport);

    let files: Vec<Arc<FileDownload>> = resolved
        .downloads
        .iter()
        .map(|d| Arc::new(FileDownload::new(&d.url, &d.name, dir.path(), d.bytes)))
        .collect();
    let aggregator = ProgressAggregator::new(files.clone(), resolved.size_asset);
    let workers: Vec<_> = files
        .iter()
        .map(|file| {
            let (transport, file) = (transport.clone(), file.clone());
            thread::spawn(move || FileTransferWorker::new(transport.as_ref(), 8, "dl").run(&file))
        })
        .collect();

    let mut last = 0.0;
    loop {
        let snapshot = aggregator.snapshot();
        for file in &files {
            assert!(file.size_downloaded() <= file.size_expected);
        }
        assert!(snapshot.fraction >= MIN_PROGRESS && snapshot.fraction >= last);
        last = snapshot.fraction;
        if snapshot.all_done() {
            break;
        }
        thread::sleep(Duration::from_millis(1));
    }
    for worker in workers {
        assert_eq!(worker.join().unwrap(), FileStatus::Done);
    }
    assert_eq!(aggregator.fraction(), 1.0);
}

#[test]
fn test_finished_sessions_release_their_uuids() {
    let library = TempDir::new().unwrap();
    let first = response("u-1", &[("a.jpg", 10)]);
    let second = response("u-2", &[("a.jpg", 10)]);
    let mut transport = MemoryTransport::serving(&[&first, &second]);
    transport.expired_prefix = Some("https://cdn.test/u-1/".to_string());
    let h = harness(vec![first, second], transport, 3);

    let report = h
        .coordinator
        .run(&asset(), "2K", library.path(), &CancelFlag::new(), &mut |_| {});

    assert!(report.is_success());
    assert_eq!(statuses(&h.events).len(), 2);
    assert_eq!(h.tracker.tracked(), 0);
}

#[test]
fn test_cancel_before_start_makes_no_request() {
    let library = TempDir::new().unwrap();
    let h = harness(vec![response("u-1", &[("a.jpg", 10)])], MemoryTransport::default(), 3);
    let cancel = CancelFlag::new();
    cancel.cancel();

    let report = h.coordinator.run(&asset(), "2K", library.path(), &cancel, &mut |_| {});

    assert_eq!(report.state, SessionState::Cancelled);
    assert_eq!(report.attempts, 0);
    assert_eq!(h.resolver.calls(), 0);
    assert!(statuses(&h.events).is_empty());
}

#[test]
fn test_expired_links_retry_with_new_uuid() {
    let library = TempDir::new().unwrap();
    let first = response("u-1", &[("a.jpg", 100), ("b.jpg", 50)]);
    let second = response("u-2", &[("a.jpg", 100), ("b.jpg", 50)]);
    let mut transport = MemoryTransport::serving(&[&first, &second]);
    transport.expired_prefix = Some("https://cdn.test/u-1/".to_string());
    let h = harness(vec![first, second], transport, 3);

    let report = h
        .coordinator
        .run(&asset(), "2K", library.path(), &CancelFlag::new(), &mut |_| {});

    assert!(report.is_success());
    assert_eq!(report.attempts, 2);
    assert_eq!(report.uuids, vec!["u-1".to_string(), "u-2".to_string()]);
    assert_eq!(*h.resolver.retry_flags.lock().unwrap(), vec![false, true]);
    assert_eq!(
        statuses(&h.events),
        vec![
            ("u-1".to_string(), QualityStatus::Failed),
            ("u-2".to_string(), QualityStatus::Success),
        ]
    );
}

#[test]
fn test_retry_budget_exhausted() {
    let library = TempDir::new().unwrap();
    let responses: Vec<_> = (1..=3).map(|i| response(&format!("u-{}", i), &[("a.jpg", 10)])).collect();
    let mut transport = MemoryTransport::default();
    transport.expired_prefix = Some("https://cdn.test/".to_string());
    let h = harness(responses, transport, 2);

    let report = h
        .coordinator
        .run(&asset(), "2K", library.path(), &CancelFlag::new(), &mut |_| {});

    assert_eq!(report.state, SessionState::Error);
    assert_eq!(report.attempts, 3);
    let error = report.error.unwrap();
    assert_eq!(error.label, "Download link expired");
    assert!(error.reference.starts_with("ERR-"));
    assert_eq!(statuses(&h.events).len(), 3);
}

#[test]
fn test_files_on_disk_skip_the_network() {
    let library = TempDir::new().unwrap();
    let target = library.path().join("Bricks001");
    std::fs::create_dir_all(&target).unwrap();
    std::fs::write(target.join("a.jpg"), vec![b'x'; 100]).unwrap();
    std::fs::write(target.join("b.jpgdl"), vec![b'x'; 50]).unwrap();

    let resolved = response("u-1", &[("a.jpg", 100), ("b.jpg", 50)]);
    let h = harness(vec![resolved], MemoryTransport::default(), 0);

    let report = h
        .coordinator
        .run(&asset(), "2K", library.path(), &CancelFlag::new(), &mut |_| {});

    assert!(report.is_success());
    assert_eq!(h.transport.calls(), 0);
    assert_eq!(std::fs::metadata(target.join("b.jpg")).unwrap().len(), 50);
    assert!(!target.join("b.jpgdl").exists());
}

#[test]
fn test_failed_attempt_leaves_no_final_names() {
    let library = TempDir::new().unwrap();
    let resolved = response("u-1", &[("a.jpg", 30), ("b.jpg", 40)]);
    let mut transport = MemoryTransport::serving(&[&resolved]);
    // b.jpg is served short: an integrity failure, not retried.
    transport.bodies.insert("https://cdn.test/u-1/b.jpg".to_string(), vec![b'x'; 10]);
    let h = harness(vec![resolved], transport, 3);

    let report = h
        .coordinator
        .run(&asset(), "2K", library.path(), &CancelFlag::new(), &mut |_| {});

    assert_eq!(report.state, SessionState::Error);
    assert_eq!(report.attempts, 1);
    assert_eq!(report.error.unwrap().label, "Incomplete file");
    let target = library.path().join("Bricks001");
    assert!(no_files_named(&target, &["a.jpg", "b.jpg"]));
}

#[test]
fn test_dynamic_files_written_with_downloads() {
    let library = TempDir::new().unwrap();
    let mut resolved = response("u-1", &[("a.jpg", 20)]);
    resolved.dynamic_files = vec![DynamicFile {
        name: "Bricks001.mtlx".to_string(),
        contents: "<materialx version=\"1.38\"><nodegraph name=\"NG\"/></materialx>".to_string(),
    }];
    let transport = MemoryTransport::serving(&[&resolved]);
    let h = harness(vec![resolved], transport, 0);

    let report = h
        .coordinator
        .run(&asset(), "2K", library.path(), &CancelFlag::new(), &mut |_| {});

    assert!(report.is_success());
    let target = library.path().join("Bricks001");
    assert!(report.files.contains(&target.join("Bricks001.mtlx")));
    assert!(target.join("a.jpg").exists());
}

#[test]
fn test_malformed_dynamic_file_fails_attempt() {
    let library = TempDir::new().unwrap();
    let mut resolved = response("u-1", &[("a.jpg", 20)]);
    resolved.dynamic_files = vec![DynamicFile {
        name: "Bricks001.mtlx".to_string(),
        contents: "<materialx><nodegraph></materialx>".to_string(),
    }];
    let transport = MemoryTransport::serving(&[&resolved]);
    let h = harness(vec![resolved], transport, 3);

    let report = h
        .coordinator
        .run(&asset(), "2K", library.path(), &CancelFlag::new(), &mut |_| {});

    assert_eq!(report.state, SessionState::Error);
    assert_eq!(report.attempts, 1);
    let target = library.path().join("Bricks001");
    assert!(no_files_named(&target, &["a.jpg", "Bricks001.mtlx"]));
    assert_eq!(statuses(&h.events), vec![("u-1".to_string(), QualityStatus::Failed)]);
}

// =============================================================================
// MANAGER
// =============================================================================

#[tokio::test]
async fn test_manager_reuses_handle_and_records_history() {
    let library = TempDir::new().unwrap();
    let history_path = library.path().join("history.json");
    let resolved = response("u-1", &[("a.jpg", 64), ("b.jpg", 32)]);
    let transport = MemoryTransport::serving(&[&resolved]);
    let h = harness(vec![resolved], transport, 0);
    let resolver = Arc::clone(&h.resolver);

    let manager = DownloadManager::new(h.coordinator, library.path(), 2).with_history(&history_path);
    let mut first = manager.queue_download(asset(), "2K");
    let second = manager.queue_download(asset(), "2K");
    assert_eq!(second.asset_id, first.asset_id);

    let done = first.wait().await;
    assert_eq!(done.state, SessionState::Done);
    assert!(second.is_complete());
    assert_eq!(resolver.calls(), 1);

    let report = first.report().unwrap();
    assert!(report.is_success());
    assert_eq!(manager.get_progress(4242).unwrap().state, SessionState::Done);

    let history = DownloadHistory::load_from(&history_path).unwrap();
    let entry = history.get(4242).unwrap();
    assert_eq!(entry.outcome, DownloadOutcome::Completed);
    assert_eq!(entry.size, "2K");
    assert_eq!(entry.attempts, 1);
}
