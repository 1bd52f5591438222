// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Asset catalog definition file and the categories tree.
//!
//! The catalog file is shared with Blender, which parses it strictly:
//!
//! ```text
//! # This is an Asset Catalog Definition file for Blender.
//! # ...
//!
//! VERSION 1
//!
//! 0d5a8f76-5c3e-4a9e-9a4b-7b1c2b0e2f11:Textures/Brick:Textures-Brick
//! ```
//!
//! It is always replaced through a temp file, never edited in place.
//! Comment lines below `VERSION` are kept in front of the entry that
//! followed them when the file was read.

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};

use crate::download::Asset;
use crate::errors::SyncError;

pub const CATALOG_VERSION: u32 = 1;

const DEFAULT_HEADER: &[&str] = &[
    "# This is an Asset Catalog Definition file for Blender.",
    "#",
    "# Empty lines and lines starting with `#` will be ignored.",
    "# The first non-ignored line should be the version indicator.",
    "# Other lines are of the format \"UUID:catalog/path/for/assets:simple catalog name\"",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    pub uuid: String,
    pub path: String,
    pub simple_name: String,
}

#[derive(Debug, Clone)]
pub struct AssetCatalog {
    path: PathBuf,
    header: Vec<String>,
    version: u32,
    entries: Vec<CatalogEntry>,
    /// Comments after the version line, keyed by the index of the entry
    /// they precede.
    comments: Vec<(usize, String)>,
}

impl AssetCatalog {
    /// Empty catalog with the standard header.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            header: DEFAULT_HEADER.iter().map(|l| l.to_string()).collect(),
            version: CATALOG_VERSION,
            entries: Vec::new(),
            comments: Vec::new(),
        }
    }

    /// Read the catalog at `path`. A missing file gives an empty catalog.
    pub fn load(path: &Path) -> Result<Self, SyncError> {
        if !path.exists() {
            return Ok(Self::new(path));
        }
        let text = fs::read_to_string(path)?;
        Self::parse(path, &text)
    }

    pub fn parse(path: &Path, text: &str) -> Result<Self, SyncError> {
        let mut header = Vec::new();
        let mut version = None;
        let mut entries = Vec::new();
        let mut comments = Vec::new();

        for (index, raw) in text.lines().enumerate() {
            let line = raw.trim_end_matches('\r');
            let number = index + 1;

            if line.starts_with('#') {
                if version.is_none() {
                    header.push(line.to_string());
                } else {
                    comments.push((entries.len(), line.to_string()));
                }
                continue;
            }
            if line.trim().is_empty() {
                continue;
            }

            if version.is_none() {
                let value = line
                    .strip_prefix("VERSION ")
                    .and_then(|v| v.trim().parse::<u32>().ok())
                    .ok_or_else(|| SyncError::Catalog(format!("line {}: expected VERSION, got {:?}", number, line)))?;
                if value != CATALOG_VERSION {
                    return Err(SyncError::Catalog(format!("unsupported catalog version {}", value)));
                }
                version = Some(value);
                continue;
            }

            let mut parts = line.splitn(3, ':');
            match (parts.next(), parts.next(), parts.next()) {
                (Some(uuid), Some(path), Some(simple_name)) if !uuid.is_empty() => entries.push(CatalogEntry {
                    uuid: uuid.to_string(),
                    path: path.to_string(),
                    simple_name: simple_name.to_string(),
                }),
                _ => return Err(SyncError::Catalog(format!("line {}: malformed entry {:?}", number, line))),
            }
        }

        if header.is_empty() {
            header = DEFAULT_HEADER.iter().map(|l| l.to_string()).collect();
        }

        Ok(Self {
            path: path.to_path_buf(),
            header,
            version: version.unwrap_or(CATALOG_VERSION),
            entries,
            comments,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    pub fn find_by_path(&self, path: &str) -> Option<&CatalogEntry> {
        let path = normalize(path);
        self.entries.iter().find(|e| e.path == path)
    }

    /// Uuid of the entry for `path`, adding it and any missing parents.
    pub fn ensure_path(&mut self, path: &str) -> String {
        let path = normalize(path);
        let segments: Vec<&str> = path.split('/').collect();
        let mut uuid = String::new();

        for depth in 1..=segments.len() {
            let prefix = segments[..depth].join("/");
            uuid = match self.find_by_path(&prefix) {
                Some(entry) => entry.uuid.clone(),
                None => {
                    let entry = CatalogEntry {
                        uuid: uuid::Uuid::new_v4().to_string(),
                        simple_name: segments[..depth].join("-"),
                        path: prefix,
                    };
                    tracing::debug!(path = %entry.path, uuid = %entry.uuid, "Adding catalog entry");
                    let id = entry.uuid.clone();
                    self.entries.push(entry);
                    id
                }
            };
        }
        uuid
    }

    pub fn to_text(&self) -> String {
        let mut out = String::new();
        for line in &self.header {
            out.push_str(line);
            out.push('\n');
        }
        out.push('\n');
        out.push_str(&format!("VERSION {}\n", self.version));
        out.push('\n');
        let mut comments = self.comments.iter().peekable();
        for (index, entry) in self.entries.iter().enumerate() {
            while let Some((_, comment)) = comments.next_if(|(before, _)| *before <= index) {
                out.push_str(comment);
                out.push('\n');
            }
            out.push_str(&format!("{}:{}:{}\n", entry.uuid, entry.path, entry.simple_name));
        }
        for (_, comment) in comments {
            out.push_str(comment);
            out.push('\n');
        }
        out
    }

    /// Write through a sibling temp file and rename over the catalog.
    pub fn save(&self) -> Result<(), SyncError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| SyncError::Catalog(format!("invalid catalog path {:?}", self.path)))?;
        let temp = self.path.with_file_name(format!("{}.tmp", file_name));

        fs::write(&temp, self.to_text())?;
        if let Err(e) = fs::rename(&temp, &self.path) {
            let _ = fs::remove_file(&temp);
            return Err(e.into());
        }
        Ok(())
    }
}

fn normalize(path: &str) -> String {
    path.split('/')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Category hierarchy per asset type, as shipped in the categories JSON.
#[derive(Debug, Clone, Default)]
pub struct CategoryTree {
    root: Map<String, Value>,
}

impl CategoryTree {
    pub fn load(path: &Path) -> Result<Self, SyncError> {
        let text = fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, SyncError> {
        match serde_json::from_str::<Value>(text)? {
            Value::Object(root) => Ok(Self { root }),
            _ => Err(SyncError::Catalog("categories file must be a JSON object".into())),
        }
    }

    /// Every path in the tree, parents before children.
    pub fn paths(&self) -> Vec<String> {
        let mut out = Vec::new();
        collect_paths(&self.root, "", &mut out);
        out
    }

    /// Catalog path for an asset: its type, then the longest run of the
    /// asset's categories that exists in the tree.
    pub fn resolve(&self, asset: &Asset) -> String {
        let type_name = asset.asset_type.to_string();
        let mut path = vec![type_name.clone()];

        let mut node = self.root.get(&type_name).and_then(Value::as_object);
        let categories = asset
            .categories
            .iter()
            .filter(|c| !c.eq_ignore_ascii_case(&type_name));

        for category in categories {
            let Some(children) = node else { break };
            let Some((key, child)) = children.iter().find(|(k, _)| k.eq_ignore_ascii_case(category)) else {
                break;
            };
            path.push(key.clone());
            node = child.as_object();
        }
        path.join("/")
    }
}

fn collect_paths(node: &Map<String, Value>, prefix: &str, out: &mut Vec<String>) {
    for (key, child) in node {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{}/{}", prefix, key)
        };
        out.push(path.clone());
        if let Some(children) = child.as_object() {
            collect_paths(children, &path, out);
        }
    }
}
