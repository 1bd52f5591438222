// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Streaming transfer of a single file to its temporary path.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;
use std::time::Duration;

use crate::download::types::{FileDownload, FileStatus};
use crate::errors::{redact_url, DownloadError};

/// Default read size per chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 1024;

/// Default suffix appended to the filename while the transfer runs.
pub const DEFAULT_TEMP_SUFFIX: &str = "dl";

/// Response header carrying the edge CDN request id.
const CORRELATION_HEADER: &str = "cf-ray";

/// An open response body plus the metadata the worker checks against.
///
/// Dropping the stream releases the underlying connection, which happens on
/// every exit path of [`FileTransferWorker::run`].
pub struct TransferStream {
    pub content_length: Option<u64>,
    pub correlation_id: Option<String>,
    pub body: Box<dyn Read + Send>,
}

/// Opens a byte stream for a signed URL.
pub trait HttpTransport: Send + Sync {
    fn open(&self, url: &str) -> Result<TransferStream, DownloadError>;
}

/// Transport backed by the blocking reqwest client.
pub struct ReqwestTransport {
    client: reqwest::blocking::Client,
}

impl ReqwestTransport {
    pub fn new(connect_timeout: Duration) -> Result<Self, DownloadError> {
        // No overall timeout: large files legitimately take long.
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(None::<Duration>)
            .build()
            .map_err(|e| DownloadError::from_reqwest(&e))?;
        Ok(Self { client })
    }
}

impl HttpTransport for ReqwestTransport {
    fn open(&self, url: &str) -> Result<TransferStream, DownloadError> {
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|e| DownloadError::from_reqwest(&e))?;

        let status = response.status().as_u16();
        // Signed CDN links answer 403/410 once their signature has expired.
        if status == 403 || status == 410 {
            return Err(DownloadError::UrlExpired { status });
        }
        if !response.status().is_success() {
            return Err(DownloadError::Http {
                status,
                message: format!("GET {}", redact_url(url)),
            });
        }

        let correlation_id = response
            .headers()
            .get(CORRELATION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        Ok(TransferStream {
            content_length: response.content_length(),
            correlation_id,
            body: Box::new(response),
        })
    }
}

/// Streams one [`FileDownload`] to disk.
pub struct FileTransferWorker<'a> {
    transport: &'a dyn HttpTransport,
    chunk_size: usize,
    temp_suffix: &'a str,
}

impl<'a> FileTransferWorker<'a> {
    pub fn new(transport: &'a dyn HttpTransport, chunk_size: usize, temp_suffix: &'a str) -> Self {
        Self {
            transport,
            chunk_size: chunk_size.max(1),
            temp_suffix,
        }
    }

    /// Run the transfer and return the file's final status.
    ///
    /// A file already on disk (temp or final name) with exactly the expected
    /// size is marked done without touching the network.
    pub fn run(&self, file: &FileDownload) -> FileStatus {
        if !file.try_start() {
            tracing::debug!(filename = %file.filename, "Skipping file cancelled before start");
            return file.status();
        }

        let temp_path = file.temp_path(self.temp_suffix);
        let final_path = file.final_path();

        if has_expected_size(&final_path, file.size_expected) || has_expected_size(&temp_path, file.size_expected) {
            tracing::debug!(filename = %file.filename, "File already present, skipping transfer");
            file.set_downloaded(file.size_expected);
            file.mark_done();
            return file.status();
        }

        match self.stream_to(file, &temp_path) {
            Ok(true) => {
                file.mark_done();
            }
            Ok(false) => {
                // Cancelled mid-stream; a partial file cannot be resumed.
                remove_quietly(&temp_path);
            }
            Err(err) => {
                remove_quietly(&temp_path);
                tracing::warn!(
                    filename = %file.filename,
                    correlation_id = ?file.correlation_id(),
                    error = %err,
                    "File transfer failed"
                );
                file.mark_error(err);
            }
        }
        file.status()
    }

    /// Returns `Ok(false)` when the transfer stopped because of cancellation.
    fn stream_to(&self, file: &FileDownload, temp_path: &Path) -> Result<bool, DownloadError> {
        fs::create_dir_all(&file.directory).map_err(|e| DownloadError::from_io(&e, &file.directory))?;

        let mut stream = self.transport.open(&file.url)?;
        file.set_correlation_id(stream.correlation_id.take());
        file.set_downloaded(0);

        let mut out = File::create(temp_path).map_err(|e| DownloadError::from_io(&e, temp_path))?;
        let mut buf = vec![0u8; self.chunk_size];

        loop {
            if file.is_cancelled() {
                return Ok(false);
            }
            let n = match stream.body.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                    return Err(DownloadError::Timeout(e.to_string()))
                }
                Err(e) => return Err(DownloadError::Stream(e.to_string())),
            };
            out.write_all(&buf[..n]).map_err(|e| DownloadError::from_io(&e, temp_path))?;
            file.add_downloaded(n as u64);
        }

        out.flush().map_err(|e| DownloadError::from_io(&e, temp_path))?;
        out.sync_all().map_err(|e| DownloadError::from_io(&e, temp_path))?;

        let downloaded = file.size_downloaded();
        let reported_ok = stream.content_length.map_or(true, |len| len == file.size_expected);
        if downloaded != file.size_expected || !reported_ok {
            return Err(DownloadError::FileSizeMismatch {
                filename: file.filename.clone(),
                expected: file.size_expected,
                downloaded,
                reported: stream.content_length,
            });
        }
        Ok(true)
    }
}

fn has_expected_size(path: &Path, expected: u64) -> bool {
    fs::metadata(path).map(|m| m.is_file() && m.len() == expected).unwrap_or(false)
}

fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove partial file");
        }
    }
}
