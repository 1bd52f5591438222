// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! poliigon-sync - asset download engine and host/worker sync protocol
//!
//! Downloads purchased Poliigon assets into a local library and hands
//! finished assets to a worker process that saves them into an asset
//! catalog.
//!
//! # Core Modules
//!
//! - [`download`] - URL resolution, parallel file transfer, progress, retries
//! - [`sync`] - Framed command channel with acknowledgements, host and worker
//! - [`config`] - Engine configuration (`~/.poliigon-sync/config.json`)
//! - [`errors`] - Typed errors and user-facing error reports
//! - [`error`] - Terminal formatting for errors

pub mod config;
pub mod download;
pub mod error;
pub mod errors;
pub mod locks;
pub mod sync;

pub use config::EngineConfig;

pub use download::{
    Asset, AssetProgress, AssetType, CancelFlag, DownloadCoordinator, DownloadHandle, DownloadManager,
    DownloadReport, FileDownload, FileStatus, SessionState,
};

pub use errors::{DownloadError, ErrorCategory, SyncError, UserFacingError};

pub use sync::{AssetCatalog, CommandCode, FramedMessageChannel, SyncCommand, SyncHost, SyncWorker};
