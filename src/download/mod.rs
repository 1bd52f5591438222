// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Asset download engine.
//!
//! Resolves signed URLs for an asset, streams every file on a bounded
//! worker pool, aggregates progress, and renames files into place once all
//! of them arrived.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────────┐     ┌────────────────┐
//! │ DownloadManager │────▶│ DownloadCoordinator │────▶│ UrlResolver    │
//! │ (tokio, 2 max)  │     │ (one per asset)     │     └────────────────┘
//! └────────┬────────┘     └──────────┬──────────┘
//!          │                         │ WorkerPool (8 max)
//!          ▼                         ▼
//! ┌─────────────────┐     ┌─────────────────────┐     ┌────────────────┐
//! │ DownloadHistory │     │ FileTransferWorker  │────▶│ HttpTransport  │
//! │ (persistent)    │     │ (one per file)      │     └────────────────┘
//! └─────────────────┘     └─────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use poliigon_sync::download::{
//!     Asset, AssetType, CoordinatorOptions, DownloadCoordinator, DownloadManager,
//!     HttpUrlResolver, QualityTracker, ReqwestTransport,
//! };
//!
//! # async fn example() -> anyhow::Result<()> {
//! let resolver = HttpUrlResolver::new("https://apiv1.poliigon.com/api/v1", None, Duration::from_secs(30))?;
//! let transport = ReqwestTransport::new(Duration::from_secs(30))?;
//! let coordinator = DownloadCoordinator::new(
//!     Arc::new(resolver),
//!     Arc::new(transport),
//!     Arc::new(QualityTracker::logging()),
//!     CoordinatorOptions::default(),
//! );
//! let manager = DownloadManager::new(coordinator, "/tmp/Library", 2);
//!
//! let mut handle = manager.queue_download(Asset::new(1, "Bricks001", AssetType::Texture), "2K");
//! let final_progress = handle.wait().await;
//! println!("{}: {}", final_progress.state, final_progress.message);
//! # Ok(())
//! # }
//! ```

pub mod coordinator;
pub mod finalize;
pub mod manager;
pub mod pool;
pub mod progress;
pub mod resolver;
pub mod state;
pub mod telemetry;
pub mod types;
pub mod worker;

// Re-export commonly used items
pub use coordinator::{plan_files, CoordinatorOptions, DownloadCoordinator};
pub use finalize::{rename_downloads, validate_dynamic_file, write_dynamic_files, RenameReport};
pub use manager::{download_and_wait, DownloadHandle, DownloadManager, DEFAULT_MAX_PARALLEL_ASSETS};
pub use progress::{progress_fraction, CancelFlag, ProgressAggregator, ProgressSnapshot};
pub use resolver::{
    Convention, DownloadRequest, DynamicFile, HttpUrlResolver, RemoteFile, ResolvedDownloads, UrlResolver,
};
pub use state::{DownloadHistory, DownloadOutcome, HistoryEntry};
pub use telemetry::{HttpQualitySink, LogQualitySink, QualityEvent, QualitySink, QualityStatus, QualityTracker};
pub use types::{
    Asset, AssetProgress, AssetType, DownloadReport, DownloadSession, FileDownload, FileStatus, MapDescriptor,
    SessionState, MIN_PROGRESS,
};
pub use worker::{FileTransferWorker, HttpTransport, ReqwestTransport, TransferStream};
