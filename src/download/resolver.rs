// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Signed download URL resolution.
//!
//! One request per call: the resolver never retries. The coordinator owns
//! the retry budget and passes `is_retry` so the server can skip counting a
//! second download event for the same user action.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::download::types::Asset;
use crate::errors::{redact_url, DownloadError};

/// File formats offered for convention 1 maps, most preferred first.
pub const FORMAT_PREFERENCE: [&str; 4] = ["jpg", "png", "tiff", "exr"];

/// Target application sent with every request.
const SOFTWARE_TARGET: &str = "blender";

/// Shape of the download request and response payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Convention {
    /// Legacy per-map-type-code selection.
    Legacy = 0,
    /// Per-map descriptors with file format negotiation.
    Descriptor = 1,
}

impl Convention {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Convention::Legacy),
            1 => Some(Convention::Descriptor),
            _ => None,
        }
    }
}

/// What to download for one asset.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadRequest {
    pub asset_id: u64,
    pub convention: Convention,
    pub size: String,
    pub include_lods: bool,
    pub body: Value,
}

impl DownloadRequest {
    /// Build the request body for `asset` at `size` in the asset's
    /// convention (or `default_convention` when the asset does not say).
    pub fn for_asset(asset: &Asset, size: &str, default_convention: Convention, include_lods: bool) -> Self {
        let convention = asset
            .convention
            .and_then(Convention::from_code)
            .unwrap_or(default_convention);

        let mut entry = json!({
            "id": asset.asset_id,
            "sizes": [size],
            "lods": include_lods,
            "software": SOFTWARE_TARGET,
        });

        match convention {
            Convention::Legacy => {
                entry["workflows"] = json!(asset.workflows);
                entry["map_codes"] = json!(asset.map_codes);
            }
            Convention::Descriptor => {
                let maps: Vec<Value> = asset
                    .maps
                    .iter()
                    .filter_map(|map| {
                        preferred_format(&map.formats).map(|format| {
                            json!({ "type": map.map_type, "format": format })
                        })
                    })
                    .collect();
                entry["maps"] = Value::Array(maps);
            }
        }

        Self {
            asset_id: asset.asset_id,
            convention,
            size: size.to_string(),
            include_lods,
            body: json!({ "assets": [entry] }),
        }
    }

    /// Body as sent on the wire, with the retry marker applied.
    pub fn body_for_attempt(&self, is_retry: bool) -> Value {
        let mut body = self.body.clone();
        body["is_retry"] = Value::Bool(is_retry);
        body
    }
}

/// Pick the first format from [`FORMAT_PREFERENCE`] that the map offers.
pub fn preferred_format(offered: &[String]) -> Option<&'static str> {
    FORMAT_PREFERENCE
        .iter()
        .find(|pref| offered.iter().any(|f| f.eq_ignore_ascii_case(pref)))
        .copied()
}

/// One downloadable file as listed by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFile {
    pub url: String,
    pub name: String,
    pub bytes: u64,
    #[serde(default)]
    pub resolution: Option<String>,
}

/// Small text file delivered inline in the response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DynamicFile {
    pub name: String,
    pub contents: String,
}

/// Parsed response of a URL resolution request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedDownloads {
    pub uuid: String,
    pub size_asset: u64,
    pub downloads: Vec<RemoteFile>,
    pub dynamic_files: Vec<DynamicFile>,
}

/// Source of signed download URLs.
pub trait UrlResolver: Send + Sync {
    fn resolve(&self, request: &DownloadRequest, is_retry: bool) -> Result<ResolvedDownloads, DownloadError>;
}

/// Parse a response body.
///
/// A missing or empty `downloads` list is retryable; any other missing field
/// is an integrity error.
pub fn parse_response(body: &str) -> Result<ResolvedDownloads, DownloadError> {
    let value: Value = serde_json::from_str(body)
        .map_err(|e| DownloadError::MalformedResponse(e.to_string()))?;
    let object = value
        .as_object()
        .ok_or_else(|| DownloadError::MalformedResponse("response is not an object".to_string()))?;

    let downloads = match object.get("downloads") {
        None | Some(Value::Null) => return Err(DownloadError::EmptyUrlList),
        Some(Value::Array(items)) if items.is_empty() => return Err(DownloadError::EmptyUrlList),
        Some(Value::Array(items)) => items
            .iter()
            .enumerate()
            .map(|(i, item)| parse_remote_file(i, item))
            .collect::<Result<Vec<_>, _>>()?,
        Some(_) => {
            return Err(DownloadError::MalformedResponse("`downloads` is not a list".to_string()))
        }
    };

    let uuid = object
        .get("uuid")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| DownloadError::MissingResponseField("uuid".to_string()))?
        .to_string();

    let size_asset = object
        .get("size_asset")
        .and_then(Value::as_u64)
        .unwrap_or_else(|| downloads.iter().map(|d| d.bytes).sum());

    let dynamic_files = match object.get("dynamic_files") {
        None | Some(Value::Null) => Vec::new(),
        Some(v) => serde_json::from_value(v.clone())
            .map_err(|e| DownloadError::MalformedResponse(format!("dynamic_files: {}", e)))?,
    };

    Ok(ResolvedDownloads {
        uuid,
        size_asset,
        downloads,
        dynamic_files,
    })
}

fn parse_remote_file(index: usize, item: &Value) -> Result<RemoteFile, DownloadError> {
    let field = |name: &str| DownloadError::MissingResponseField(format!("downloads[{}].{}", index, name));
    let url = item.get("url").and_then(Value::as_str).ok_or_else(|| field("url"))?;
    let name = item.get("name").and_then(Value::as_str).ok_or_else(|| field("name"))?;
    let bytes = item.get("bytes").and_then(Value::as_u64).ok_or_else(|| field("bytes"))?;
    let resolution = item
        .get("resolution")
        .and_then(Value::as_str)
        .map(str::to_string);
    Ok(RemoteFile {
        url: url.to_string(),
        name: name.to_string(),
        bytes,
        resolution,
    })
}

/// Resolver backed by the remote API.
pub struct HttpUrlResolver {
    client: reqwest::blocking::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpUrlResolver {
    pub fn new(base_url: impl Into<String>, token: Option<String>, timeout: Duration) -> Result<Self, DownloadError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DownloadError::from_reqwest(&e))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    fn endpoint(&self, request: &DownloadRequest) -> String {
        format!("{}/assets/{}/download-urls", self.base_url, request.asset_id)
    }
}

impl UrlResolver for HttpUrlResolver {
    fn resolve(&self, request: &DownloadRequest, is_retry: bool) -> Result<ResolvedDownloads, DownloadError> {
        let url = self.endpoint(request);
        tracing::debug!(
            asset_id = request.asset_id,
            convention = ?request.convention,
            is_retry,
            url = %redact_url(&url),
            "Requesting download URLs"
        );

        let mut builder = self
            .client
            .post(&url)
            .header("X-Download-Convention", (request.convention as u8).to_string())
            .json(&request.body_for_attempt(is_retry));
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().map_err(|e| DownloadError::from_reqwest(&e))?;
        let status = response.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(DownloadError::AuthInvalid);
        }
        let body = response.text().map_err(|e| DownloadError::from_reqwest(&e))?;
        if !status.is_success() {
            return Err(DownloadError::Http {
                status: status.as_u16(),
                message: body.chars().take(200).collect(),
            });
        }

        parse_response(&body)
    }
}
