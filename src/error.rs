// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Terminal rendering of failures.
//!
//! Every report has a title, then optional causes, fixes and a support
//! reference. Download failures pick their fixes from the error category;
//! sync failures from the protocol error.

use std::fmt;

use crate::errors::{ErrorCategory, SyncError, UserFacingError};

/// Issue tracker for support requests.
pub const SUPPORT_URL: &str = "https://github.com/poliigon/poliigon-sync/issues";

/// A failure report for the terminal.
///
/// ```
/// use poliigon_sync::error::ErrorReport;
///
/// let text = ErrorReport::new("Sync worker stopped responding")
///     .cause("Worker process crashed")
///     .fix("Re-run with -v and check the worker log")
///     .render();
/// assert!(text.starts_with("[✗] Sync worker stopped responding"));
/// ```
#[derive(Debug, Clone, Default)]
pub struct ErrorReport {
    title: String,
    causes: Vec<String>,
    fixes: Vec<String>,
    reference: Option<String>,
}

impl ErrorReport {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }

    /// Report for a failed asset download, keyed by its support reference.
    pub fn download(error: &UserFacingError) -> Self {
        let title = match &error.asset_name {
            Some(name) => format!("{}: {}", name, error.label),
            None => error.label.clone(),
        };
        let report = Self::new(title).cause(error.description.clone());
        let report = category_fixes(error.category)
            .iter()
            .fold(report, |report, fix| report.fix(*fix));
        report.reference(error.reference.clone())
    }

    /// Report for a sync session that stopped, `context` naming where.
    pub fn sync(context: impl Into<String>, error: &SyncError) -> Self {
        let report = Self::new(context).cause(error.to_string());
        match error {
            SyncError::AckTimeout { .. } | SyncError::ChannelBroken | SyncError::ResponseTimeout(_) => report
                .fix("The worker stopped answering; re-run with -v to see its log")
                .fix("Raise the per-asset limit with --timeout for very large assets"),
            SyncError::Catalog(_) => report.fix("Check the catalog file is a valid asset catalog definition"),
            SyncError::Io(_) => report.fix("Check the catalog and library directories are writable"),
            SyncError::MalformedFrame(_) | SyncError::PeerError(_) | SyncError::Json(_) => {
                report.fix("Make sure host and worker are the same poliigon-sync version")
            }
        }
    }

    pub fn cause(mut self, cause: impl Into<String>) -> Self {
        self.causes.push(cause.into());
        self
    }

    pub fn fix(mut self, fix: impl Into<String>) -> Self {
        self.fixes.push(fix.into());
        self
    }

    pub fn reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    pub fn render(&self) -> String {
        let mut out = format!("[✗] {}\n", self.title);

        if !self.causes.is_empty() {
            out.push_str("\nPossible causes:\n");
            for cause in &self.causes {
                out.push_str(&format!("  - {}\n", cause));
            }
        }
        if !self.fixes.is_empty() {
            out.push_str("\nTry these fixes:\n");
            for (i, fix) in self.fixes.iter().enumerate() {
                out.push_str(&format!("  {}. {}\n", i + 1, fix));
            }
        }

        match &self.reference {
            Some(reference) => out.push_str(&format!("\nQuote {} when asking for help: {}", reference, SUPPORT_URL)),
            None => out.push_str(&format!("\nNeed help? {}", SUPPORT_URL)),
        }
        out
    }
}

impl fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

fn category_fixes(category: ErrorCategory) -> &'static [&'static str] {
    match category {
        ErrorCategory::Transient => &[
            "Check your internet connection",
            "Retry the download: poliigon-sync download <asset.json>",
        ],
        ErrorCategory::Resource => &[
            "Free up disk space or choose another library: --dir <path>",
            "Check write permissions on the library directory",
        ],
        ErrorCategory::Integrity => &["Retry the download; if it keeps failing, contact support with the reference below"],
        ErrorCategory::Protocol => &["Re-run with -v to capture a detailed log"],
        ErrorCategory::User => &[],
    }
}
