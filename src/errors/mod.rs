// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error taxonomy for the download engine and the sync protocol.
//!
//! Errors fall into five families, and the family decides what happens next:
//! - transient (connection, timeout, proxy, expired URL): retried by the
//!   coordinator while budget remains
//! - resource (disk full, permission denied): surfaced immediately
//! - integrity (size mismatch, missing fields, duplicate file sizes):
//!   surfaced immediately
//! - protocol (malformed frame, ack timeout, peer error): bounded
//!   retransmission, then the channel is declared broken
//! - user (cancellation): a terminal state, not a failure
//!
//! Every terminal failure shown to a user goes through [`UserFacingError`],
//! which carries a short label, a longer description and a reference code
//! that is logged next to the full internal details.

use chrono::Utc;
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use std::time::Duration;
use thiserror::Error;

// =============================================================================
// ERROR REFERENCE CODE GENERATION
// =============================================================================

/// Generate a unique error reference code.
/// Format: ERR-YYYYMMDD-XXXXXX (e.g., ERR-20240115-A3F8K2)
pub fn generate_reference_code() -> String {
    let date = Utc::now().format("%Y%m%d");
    let mut rng = rand::thread_rng();
    let chars: Vec<char> = "ABCDEFGHJKLMNPQRSTUVWXYZ23456789".chars().collect();
    let random: String = (0..6)
        .map(|_| chars[rng.gen_range(0..chars.len())])
        .collect();
    format!("ERR-{}-{}", date, random)
}

// =============================================================================
// DOWNLOAD ERRORS
// =============================================================================

/// Family an error belongs to. Drives retry policy and UI presentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Transient,
    Resource,
    Integrity,
    Protocol,
    User,
}

/// ENOSPC
#[cfg(unix)]
const DISK_FULL_OS_CODES: &[i32] = &[28];
/// ERROR_HANDLE_DISK_FULL, ERROR_DISK_FULL
#[cfg(windows)]
const DISK_FULL_OS_CODES: &[i32] = &[39, 112];
#[cfg(not(any(unix, windows)))]
const DISK_FULL_OS_CODES: &[i32] = &[];

/// Failure of one file or of a whole asset download.
///
/// Variants hold strings rather than source errors so a `FileDownload` can
/// keep a copy of its last error behind its status lock.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DownloadError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("proxy error: {0}")]
    Proxy(String),

    #[error("download URL expired (HTTP {status})")]
    UrlExpired { status: u16 },

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("not enough disk space to write {path}")]
    DiskFull { path: String },

    #[error("permission denied writing {path}")]
    PermissionDenied { path: String },

    #[error("file size mismatch for {filename}: expected {expected}, downloaded {downloaded}, server reported {reported:?}")]
    FileSizeMismatch {
        filename: String,
        expected: u64,
        downloaded: u64,
        reported: Option<u64>,
    },

    #[error("response is missing field `{0}`")]
    MissingResponseField(String),

    #[error("duplicate file {filename} with differing sizes ({first} vs {other})")]
    DuplicateFileSize {
        filename: String,
        first: u64,
        other: u64,
    },

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("authentication is invalid or expired")]
    AuthInvalid,

    #[error("server returned no download URLs")]
    EmptyUrlList,

    #[error("dynamic file {name} is invalid: {reason}")]
    DynamicFile { name: String, reason: String },

    #[error("neither temporary nor final file exists for {filename}")]
    RenameMissing { filename: String },

    #[error("stream interrupted: {0}")]
    Stream(String),

    #[error("file system error on {path}: {message}")]
    Io { path: String, message: String },

    #[error("download cancelled")]
    Cancelled,

    #[error("worker did not return within {0:?} after cancellation")]
    CancelTimeout(Duration),
}

impl DownloadError {
    /// Which family this error belongs to.
    pub fn category(&self) -> ErrorCategory {
        match self {
            DownloadError::Connection(_)
            | DownloadError::Timeout(_)
            | DownloadError::Proxy(_)
            | DownloadError::UrlExpired { .. }
            | DownloadError::EmptyUrlList
            | DownloadError::Stream(_) => ErrorCategory::Transient,
            DownloadError::Http { status, .. } if *status >= 500 || *status == 429 => {
                ErrorCategory::Transient
            }
            DownloadError::DiskFull { .. }
            | DownloadError::PermissionDenied { .. }
            | DownloadError::Io { .. } => ErrorCategory::Resource,
            DownloadError::Cancelled => ErrorCategory::User,
            DownloadError::CancelTimeout(_) => ErrorCategory::Protocol,
            DownloadError::Http { .. }
            | DownloadError::FileSizeMismatch { .. }
            | DownloadError::MissingResponseField(_)
            | DownloadError::DuplicateFileSize { .. }
            | DownloadError::MalformedResponse(_)
            | DownloadError::AuthInvalid
            | DownloadError::DynamicFile { .. }
            | DownloadError::RenameMissing { .. } => ErrorCategory::Integrity,
        }
    }

    /// Whether a fresh attempt (new URL resolution) may fix this.
    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::Transient
    }

    /// Short label suitable for a button tooltip or list cell.
    pub fn label(&self) -> &'static str {
        match self {
            DownloadError::Connection(_) => "Connection error",
            DownloadError::Timeout(_) => "Timed out",
            DownloadError::Proxy(_) => "Proxy error",
            DownloadError::UrlExpired { .. } => "Download link expired",
            DownloadError::Http { .. } => "Server error",
            DownloadError::DiskFull { .. } => "Disk full",
            DownloadError::PermissionDenied { .. } => "Permission denied",
            DownloadError::FileSizeMismatch { .. } => "Incomplete file",
            DownloadError::MissingResponseField(_)
            | DownloadError::MalformedResponse(_) => "Invalid server response",
            DownloadError::DuplicateFileSize { .. } => "Inconsistent asset data",
            DownloadError::AuthInvalid => "Login required",
            DownloadError::EmptyUrlList => "No files available",
            DownloadError::DynamicFile { .. } => "Invalid asset metadata",
            DownloadError::RenameMissing { .. } => "Missing file",
            DownloadError::Stream(_) => "Download interrupted",
            DownloadError::Io { .. } => "File system error",
            DownloadError::Cancelled => "Cancelled",
            DownloadError::CancelTimeout(_) => "Download stuck",
        }
    }

    /// Longer, actionable description for the user.
    pub fn description(&self) -> String {
        match self {
            DownloadError::Connection(_) | DownloadError::Proxy(_) => {
                "Could not reach the download server. Check your internet connection or proxy settings and retry.".to_string()
            }
            DownloadError::Timeout(_) => {
                "The server took too long to respond. Retry the download.".to_string()
            }
            DownloadError::UrlExpired { .. } => {
                "The download link expired before the transfer finished. Retry to request a fresh link.".to_string()
            }
            DownloadError::Http { status, .. } => {
                format!("The server answered with HTTP {}. Retry later.", status)
            }
            DownloadError::DiskFull { .. } => {
                "There is not enough free space in the library folder. Free some space and retry.".to_string()
            }
            DownloadError::PermissionDenied { .. } => {
                "The library folder is not writable. Check its permissions or choose another folder.".to_string()
            }
            DownloadError::FileSizeMismatch { filename, .. } => {
                format!("{} did not arrive complete. Retry the download.", filename)
            }
            DownloadError::MissingResponseField(_) | DownloadError::MalformedResponse(_) => {
                "The server response could not be understood. Please report this if it persists.".to_string()
            }
            DownloadError::DuplicateFileSize { filename, .. } => {
                format!("The asset lists {} twice with different sizes. Please report this asset.", filename)
            }
            DownloadError::AuthInvalid => {
                "Your login is no longer valid. Log in again and retry.".to_string()
            }
            DownloadError::EmptyUrlList => {
                "The server did not provide any files for this asset. Retry later.".to_string()
            }
            DownloadError::DynamicFile { name, .. } => {
                format!("The metadata file {} is not valid. Please report this asset.", name)
            }
            DownloadError::RenameMissing { filename } => {
                format!("{} disappeared before it could be finalized. Retry the download.", filename)
            }
            DownloadError::Stream(_) => {
                "The transfer was interrupted. Retry the download.".to_string()
            }
            DownloadError::Io { .. } => {
                "Writing to the library folder failed. Check the folder and retry.".to_string()
            }
            DownloadError::Cancelled => "The download was cancelled.".to_string(),
            DownloadError::CancelTimeout(_) => {
                "A transfer did not stop after cancellation. Restart the application if downloads stay stuck.".to_string()
            }
        }
    }

    /// Classify a file-system error raised while writing `path`.
    pub fn from_io(error: &std::io::Error, path: &std::path::Path) -> Self {
        let path = path.display().to_string();
        let disk_full = error
            .raw_os_error()
            .is_some_and(|code| DISK_FULL_OS_CODES.contains(&code))
            || error.kind() == std::io::ErrorKind::StorageFull;
        if disk_full {
            return DownloadError::DiskFull { path };
        }
        if error.kind() == std::io::ErrorKind::PermissionDenied {
            return DownloadError::PermissionDenied { path };
        }
        DownloadError::Io {
            path,
            message: error.to_string(),
        }
    }

    /// Classify an error raised by the HTTP client.
    pub fn from_reqwest(error: &reqwest::Error) -> Self {
        let message = redact_url(&error.to_string());
        if error.is_timeout() {
            DownloadError::Timeout(message)
        } else if error.is_connect() {
            if message.to_lowercase().contains("proxy") {
                DownloadError::Proxy(message)
            } else {
                DownloadError::Connection(message)
            }
        } else if error.is_decode() {
            DownloadError::MalformedResponse(message)
        } else if let Some(status) = error.status() {
            DownloadError::Http {
                status: status.as_u16(),
                message,
            }
        } else {
            DownloadError::Stream(message)
        }
    }
}

// =============================================================================
// SYNC PROTOCOL ERRORS
// =============================================================================

/// Failure of the host/subprocess sync channel.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("no acknowledgement for {code} after {attempts} attempts")]
    AckTimeout { code: String, attempts: u32 },

    #[error("peer reported an error: {0}")]
    PeerError(String),

    #[error("sync channel is broken")]
    ChannelBroken,

    #[error("timed out waiting for {0}")]
    ResponseTimeout(String),

    #[error("catalog error: {0}")]
    Catalog(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

// =============================================================================
// USER-FACING ERRORS
// =============================================================================

/// A terminal failure as presented to the user, keyed by asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserFacingError {
    pub label: String,
    pub description: String,
    pub reference: String,
    pub asset_id: Option<u64>,
    pub asset_name: Option<String>,
    pub category: ErrorCategory,
}

impl UserFacingError {
    /// Build the user-facing form of a download error, logging the full
    /// internal details under the same reference code.
    pub fn for_asset(error: &DownloadError, asset_id: u64, asset_name: &str) -> Self {
        let reference = generate_reference_code();
        let internal = sanitize_error_details(&error.to_string());

        match error.category() {
            ErrorCategory::User => tracing::info!(
                reference = %reference,
                asset_id,
                asset_name,
                "Download cancelled by user"
            ),
            _ => tracing::error!(
                reference = %reference,
                asset_id,
                asset_name,
                internal_error = %internal,
                "Asset download failed"
            ),
        }

        Self {
            label: error.label().to_string(),
            description: error.description(),
            reference,
            asset_id: Some(asset_id),
            asset_name: Some(asset_name.to_string()),
            category: error.category(),
        }
    }
}

impl std::fmt::Display for UserFacingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.asset_name {
            Some(name) => write!(f, "{} ({}): {} [{}]", self.label, name, self.description, self.reference),
            None => write!(f, "{}: {} [{}]", self.label, self.description, self.reference),
        }
    }
}

// =============================================================================
// LOG REDACTION
// =============================================================================

/// Signed download URLs carry their credentials in the query string.
static URL_QUERY_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(https?://[^\s?#]+)\?[^\s#]*").expect("URL query regex"));

/// Patterns stripped from internal error details before they are logged.
static SANITIZE_PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    vec![
        (Regex::new(r"Bearer [a-zA-Z0-9-._~+/]+=*").expect("Bearer token regex"), "Bearer [TOKEN_REDACTED]"),
        (Regex::new(r"(?i)(token|signature|sig|key)=[^\s&]+").expect("Query secret regex"), "$1=[REDACTED]"),
        (Regex::new(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b").expect("Email regex"), "[EMAIL_REDACTED]"),
    ]
});

/// Drop the query string from every URL in `text`.
pub fn redact_url(text: &str) -> String {
    URL_QUERY_PATTERN.replace_all(text, "$1?[REDACTED]").to_string()
}

/// Remove credentials and PII from error details before logging them.
pub fn sanitize_error_details(error: &str) -> String {
    let mut result = redact_url(error);
    for (pattern, replacement) in SANITIZE_PATTERNS.iter() {
        result = pattern.replace_all(&result, *replacement).to_string();
    }
    result
}

// =============================================================================
// TESTS
// =============================================================================
