// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Engine configuration.
//!
//! Stored as JSON in `~/.poliigon-sync/config.json`. Every field has a
//! default, so a partial or missing file is valid.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::download::{Convention, CoordinatorOptions};
use crate::sync::ChannelOptions;

/// Environment variable that overrides `api_token`.
pub const TOKEN_ENV_VAR: &str = "POLIIGON_API_TOKEN";

const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default)]
    pub api_token: Option<String>,
    #[serde(default = "default_library_dir")]
    pub library_dir: PathBuf,
    /// Retries after the first attempt of an asset
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_max_parallel_files")]
    pub max_parallel_files: usize,
    #[serde(default = "default_max_parallel_assets")]
    pub max_parallel_assets: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_temp_suffix")]
    pub temp_suffix: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_cancel_wait_timeout_secs")]
    pub cancel_wait_timeout_secs: u64,
    /// Request convention used when an asset does not name one (0 or 1)
    #[serde(default = "default_convention")]
    pub convention: u8,
    #[serde(default = "default_sync_ack_timeout_secs")]
    pub sync_ack_timeout_secs: u64,
    /// Total transmissions of one command before the peer is declared lost
    #[serde(default = "default_sync_max_attempts")]
    pub sync_max_attempts: u32,
    #[serde(default = "default_sync_idle_probe_secs")]
    pub sync_idle_probe_secs: u64,
    #[serde(default = "default_telemetry_enabled")]
    pub telemetry_enabled: bool,
}

fn default_api_url() -> String {
    "https://apiv1.poliigon.com/api/v1".to_string()
}

fn default_library_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join("Poliigon").join("Library"))
        .unwrap_or_else(|| PathBuf::from("Poliigon/Library"))
}

fn default_max_retries() -> u32 {
    3
}

fn default_max_parallel_files() -> usize {
    8
}

fn default_max_parallel_assets() -> usize {
    2
}

fn default_poll_interval_ms() -> u64 {
    250
}

fn default_chunk_size() -> usize {
    1024
}

fn default_temp_suffix() -> String {
    "dl".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_cancel_wait_timeout_secs() -> u64 {
    60
}

fn default_convention() -> u8 {
    1
}

fn default_sync_ack_timeout_secs() -> u64 {
    15
}

fn default_sync_max_attempts() -> u32 {
    3
}

fn default_sync_idle_probe_secs() -> u64 {
    30
}

fn default_telemetry_enabled() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            api_token: None,
            library_dir: default_library_dir(),
            max_retries: default_max_retries(),
            max_parallel_files: default_max_parallel_files(),
            max_parallel_assets: default_max_parallel_assets(),
            poll_interval_ms: default_poll_interval_ms(),
            chunk_size: default_chunk_size(),
            temp_suffix: default_temp_suffix(),
            request_timeout_secs: default_request_timeout_secs(),
            cancel_wait_timeout_secs: default_cancel_wait_timeout_secs(),
            convention: default_convention(),
            sync_ack_timeout_secs: default_sync_ack_timeout_secs(),
            sync_max_attempts: default_sync_max_attempts(),
            sync_idle_probe_secs: default_sync_idle_probe_secs(),
            telemetry_enabled: default_telemetry_enabled(),
        }
    }
}

impl EngineConfig {
    /// `~/.poliigon-sync`, created if missing.
    pub fn config_dir() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Could not find home directory")?;
        let dir = home.join(".poliigon-sync");
        if !dir.exists() {
            fs::create_dir_all(&dir).with_context(|| format!("Failed to create {:?}", dir))?;
        }
        Ok(dir)
    }

    pub fn default_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join(CONFIG_FILE))
    }

    /// Load from `path`, or the default location. A missing file yields
    /// defaults. The token environment variable wins over the file.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::default_path()?,
        };
        let mut config = if path.exists() {
            let content = fs::read_to_string(&path).with_context(|| format!("Failed to read config: {:?}", path))?;
            serde_json::from_str(&content).with_context(|| format!("Failed to parse config: {:?}", path))?
        } else {
            Self::default()
        };
        if let Ok(token) = std::env::var(TOKEN_ENV_VAR) {
            if !token.trim().is_empty() {
                config.api_token = Some(token.trim().to_string());
            }
        }
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("Failed to create {:?}", parent))?;
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content).with_context(|| format!("Failed to write config: {:?}", path))?;
        Ok(())
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if Convention::from_code(self.convention).is_none() {
            anyhow::bail!("convention must be 0 or 1, got {}", self.convention);
        }
        if self.temp_suffix.is_empty() {
            anyhow::bail!("temp_suffix must not be empty");
        }
        if self.sync_max_attempts == 0 {
            anyhow::bail!("sync_max_attempts must be at least 1");
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn coordinator_options(&self) -> CoordinatorOptions {
        CoordinatorOptions {
            max_retries: self.max_retries,
            max_parallel_files: self.max_parallel_files.max(1),
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
            chunk_size: self.chunk_size.max(1),
            temp_suffix: self.temp_suffix.clone(),
            cancel_wait_timeout: Duration::from_secs(self.cancel_wait_timeout_secs),
            default_convention: Convention::from_code(self.convention).unwrap_or(Convention::Descriptor),
            include_lods: false,
        }
    }

    pub fn channel_options(&self) -> ChannelOptions {
        ChannelOptions {
            ack_timeout: Duration::from_secs(self.sync_ack_timeout_secs),
            max_attempts: self.sync_max_attempts.max(1),
        }
    }

    pub fn idle_probe_interval(&self) -> Duration {
        Duration::from_secs(self.sync_idle_probe_secs.max(1))
    }

    /// Display form with the token masked.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        copy.api_token = copy.api_token.map(|t| {
            let visible: String = t.chars().take(4).collect();
            format!("{}…", visible)
        });
        copy
    }
}
