// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Completion step of a successful attempt: write the inline dynamic files
//! and move every transferred file from its temporary to its final name.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use quick_xml::events::Event;
use quick_xml::Reader;
use sha2::{Digest, Sha256};

use crate::download::resolver::DynamicFile;
use crate::download::types::FileDownload;
use crate::errors::DownloadError;

/// Check that a dynamic file parses as well-formed markup.
pub fn validate_dynamic_file(file: &DynamicFile) -> Result<(), DownloadError> {
    let invalid = |reason: String| DownloadError::DynamicFile {
        name: file.name.clone(),
        reason,
    };

    let mut reader = Reader::from_str(&file.contents);
    let mut depth: usize = 0;
    let mut roots: usize = 0;

    loop {
        match reader.read_event() {
            Ok(Event::Start(_)) => {
                if depth == 0 {
                    roots += 1;
                }
                depth += 1;
            }
            Ok(Event::End(_)) => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| invalid("unexpected closing tag".to_string()))?;
            }
            Ok(Event::Empty(_)) => {
                if depth == 0 {
                    roots += 1;
                }
            }
            Ok(Event::Text(text)) if depth == 0 => {
                let raw = text.into_inner();
                if !raw.iter().all(u8::is_ascii_whitespace) {
                    return Err(invalid("text outside the root element".to_string()));
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                return Err(invalid(format!(
                    "parse error at byte {}: {}",
                    reader.buffer_position(),
                    e
                )))
            }
        }
    }

    if depth != 0 {
        return Err(invalid("unclosed element at end of document".to_string()));
    }
    match roots {
        1 => Ok(()),
        0 => Err(invalid("document has no root element".to_string())),
        _ => Err(invalid("document has more than one root element".to_string())),
    }
}

/// Validate every dynamic file, then write them into `directory`.
///
/// Nothing is written unless all files validate. Each file is written to a
/// temporary name and renamed into place.
pub fn write_dynamic_files(directory: &Path, files: &[DynamicFile]) -> Result<Vec<PathBuf>, DownloadError> {
    for file in files {
        validate_dynamic_file(file)?;
    }
    if files.is_empty() {
        return Ok(Vec::new());
    }

    fs::create_dir_all(directory).map_err(|e| DownloadError::from_io(&e, directory))?;
    let mut written = Vec::with_capacity(files.len());
    for file in files {
        let name = Path::new(&file.name)
            .file_name()
            .ok_or_else(|| DownloadError::DynamicFile {
                name: file.name.clone(),
                reason: "name has no file component".to_string(),
            })?;
        let final_path = directory.join(name);
        let temp_path = final_path.with_extension("dyn.tmp");

        let mut out = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .map_err(|e| DownloadError::from_io(&e, &temp_path))?;
        out.write_all(file.contents.as_bytes())
            .and_then(|_| out.sync_all())
            .map_err(|e| DownloadError::from_io(&e, &temp_path))?;
        drop(out);
        fs::rename(&temp_path, &final_path).map_err(|e| DownloadError::from_io(&e, &final_path))?;
        written.push(final_path);
    }
    Ok(written)
}

/// Result of renaming every file of an attempt.
#[derive(Debug, Default)]
pub struct RenameReport {
    /// Final paths of files that are now in place.
    pub finalized: Vec<PathBuf>,
    /// Per-file failures. Other files were still processed.
    pub failures: Vec<DownloadError>,
}

impl RenameReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Move each file from its temporary name to its final name.
///
/// - temp only: renamed
/// - temp and final: temp deleted, final kept
/// - final only: kept
/// - neither: recorded as a failure; remaining files are still processed
pub fn rename_downloads(files: &[Arc<FileDownload>], temp_suffix: &str) -> RenameReport {
    let mut report = RenameReport::default();

    for file in files {
        let temp_path = file.temp_path(temp_suffix);
        let final_path = file.final_path();

        match (temp_path.is_file(), final_path.is_file()) {
            (true, true) => {
                warn_if_contents_differ(&temp_path, &final_path);
                match fs::remove_file(&temp_path) {
                    Ok(()) => report.finalized.push(final_path),
                    Err(e) => report.failures.push(DownloadError::from_io(&e, &temp_path)),
                }
            }
            (true, false) => match fs::rename(&temp_path, &final_path) {
                Ok(()) => report.finalized.push(final_path),
                Err(e) => report.failures.push(DownloadError::from_io(&e, &final_path)),
            },
            (false, true) => report.finalized.push(final_path),
            (false, false) => {
                tracing::error!(filename = %file.filename, "Neither temp nor final file exists");
                report.failures.push(DownloadError::RenameMissing {
                    filename: file.filename.clone(),
                });
            }
        }
    }

    report
}

/// The final file wins a rename conflict; log when its content differs from
/// the fresh download so silent replacement shows up in diagnostics.
fn warn_if_contents_differ(temp_path: &Path, final_path: &Path) {
    let sizes = (fs::metadata(temp_path), fs::metadata(final_path));
    let (Ok(temp_meta), Ok(final_meta)) = sizes else {
        return;
    };
    if temp_meta.len() != final_meta.len() {
        tracing::warn!(
            temp = %temp_path.display(),
            final_path = %final_path.display(),
            temp_len = temp_meta.len(),
            final_len = final_meta.len(),
            "Keeping existing final file that differs in size from the new download"
        );
        return;
    }
    match (sha256_file(temp_path), sha256_file(final_path)) {
        (Ok(a), Ok(b)) if a != b => tracing::warn!(
            final_path = %final_path.display(),
            temp_sha256 = %a,
            final_sha256 = %b,
            "Keeping existing final file whose content differs from the new download"
        ),
        (Err(e), _) | (_, Err(e)) => {
            tracing::debug!(error = %e, "Could not hash files for rename comparison")
        }
        _ => {}
    }
}

fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
