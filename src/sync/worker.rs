// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Worker side of the sync protocol.
//!
//! Runs inside the subprocess, reading jobs from the host and answering
//! each with a result code. Building an asset is delegated to an
//! [`AssetJobHandler`].

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::{json, Value};

use super::catalog::{AssetCatalog, CategoryTree};
use super::channel::FramedMessageChannel;
use super::protocol::{CommandCode, SyncCommand};
use crate::download::Asset;
use crate::errors::SyncError;

/// Builds and saves one asset on the worker side.
pub trait AssetJobHandler {
    /// Returns data for `ASSET_OK`, or a message for `ASSET_ERROR`.
    fn handle(&mut self, asset: &Asset, params: Option<&Value>) -> Result<Value, String>;
}

/// Default handler: writes `<dir>/<asset_name>.asset.json` and registers the
/// asset's category in the catalog file.
///
/// `<dir>` is `params.output_dir` when given, else the directory of the
/// asset's first local file.
pub struct SidecarJobHandler {
    catalog: AssetCatalog,
    categories: CategoryTree,
}

impl SidecarJobHandler {
    pub fn new(catalog: AssetCatalog, categories: CategoryTree) -> Self {
        Self { catalog, categories }
    }

    pub fn open(catalog_path: &Path, categories_path: &Path) -> Result<Self, SyncError> {
        Ok(Self::new(AssetCatalog::load(catalog_path)?, CategoryTree::load(categories_path)?))
    }

    pub fn catalog(&self) -> &AssetCatalog {
        &self.catalog
    }
}

fn output_dir(asset: &Asset, params: Option<&Value>) -> Result<PathBuf, String> {
    if let Some(dir) = params.and_then(|p| p.get("output_dir")).and_then(Value::as_str) {
        return Ok(PathBuf::from(dir));
    }
    asset
        .files
        .first()
        .and_then(|f| f.parent())
        .map(Path::to_path_buf)
        .ok_or_else(|| format!("asset {} has no local files and no output_dir", asset.asset_id))
}

impl AssetJobHandler for SidecarJobHandler {
    fn handle(&mut self, asset: &Asset, params: Option<&Value>) -> Result<Value, String> {
        let dir = output_dir(asset, params)?;
        let catalog_path = self.categories.resolve(asset);
        let catalog_id = self.catalog.ensure_path(&catalog_path);
        self.catalog.save().map_err(|e| format!("could not save catalog: {}", e))?;

        let sidecar = dir.join(format!("{}.asset.json", asset.asset_name));
        let document = json!({
            "asset_id": asset.asset_id,
            "asset_name": asset.asset_name,
            "type": asset.asset_type,
            "sizes": asset.sizes,
            "files": asset.files,
            "catalog_id": catalog_id,
            "catalog_path": catalog_path,
        });
        let text = serde_json::to_string_pretty(&document).map_err(|e| e.to_string())?;
        fs::create_dir_all(&dir).map_err(|e| format!("could not create {}: {}", dir.display(), e))?;
        fs::write(&sidecar, text).map_err(|e| format!("could not write {}: {}", sidecar.display(), e))?;

        tracing::info!(asset_id = asset.asset_id, path = %sidecar.display(), "Saved asset");
        Ok(json!({
            "asset_id": asset.asset_id,
            "catalog_id": catalog_id,
            "path": sidecar,
        }))
    }
}

/// Jobs handled before the host asked the worker to exit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerSummary {
    pub built: usize,
    pub failed: usize,
}

pub struct SyncWorker<H: AssetJobHandler> {
    channel: FramedMessageChannel,
    handler: H,
    idle_probe: Duration,
}

impl<H: AssetJobHandler> SyncWorker<H> {
    /// `idle_probe` is how long the worker waits for a job before sending
    /// `STILL_THERE`.
    pub fn new(channel: FramedMessageChannel, handler: H, idle_probe: Duration) -> Self {
        Self {
            channel,
            handler,
            idle_probe,
        }
    }

    /// Serve jobs until the host sends EXIT or the channel breaks.
    pub fn run(mut self) -> Result<WorkerSummary, SyncError> {
        let mut summary = WorkerSummary::default();
        let result = self.serve(&mut summary);
        self.channel.shutdown(Duration::from_secs(1));
        result.map(|_| summary)
    }

    fn serve(&mut self, summary: &mut WorkerSummary) -> Result<(), SyncError> {
        loop {
            let Some(command) = self.channel.recv_job(self.idle_probe)? else {
                tracing::debug!("No job, probing host");
                self.channel.send(SyncCommand::new(CommandCode::StillThere))?;
                continue;
            };

            match command.code {
                CommandCode::Hello => self.channel.send(SyncCommand::new(CommandCode::HelloOk))?,
                CommandCode::Asset => {
                    let reply = self.build(&command);
                    if reply.code == CommandCode::AssetOk {
                        summary.built += 1;
                    } else {
                        summary.failed += 1;
                    }
                    self.channel.send(reply)?;
                }
                CommandCode::Exit => {
                    tracing::info!(built = summary.built, failed = summary.failed, "Host requested exit");
                    self.channel.send(SyncCommand::new(CommandCode::ExitAck))?;
                    return Ok(());
                }
                CommandCode::StillThere => tracing::trace!("Host idle probe"),
                other => tracing::warn!(code = %other, "Ignoring unexpected command"),
            }
        }
    }

    fn build(&mut self, command: &SyncCommand) -> SyncCommand {
        let asset_id = command.data.as_ref().and_then(|d| d.get("asset_id")).cloned();
        let asset = command
            .data
            .clone()
            .ok_or_else(|| "ASSET without data".to_string())
            .and_then(|data| serde_json::from_value::<Asset>(data).map_err(|e| format!("invalid asset: {}", e)));

        let result = asset.and_then(|asset| self.handler.handle(&asset, command.params.as_ref()));
        match result {
            Ok(data) => SyncCommand::new(CommandCode::AssetOk).with_data(data),
            Err(message) => {
                tracing::warn!(error = %message, "Asset job failed");
                SyncCommand::new(CommandCode::AssetError).with_data(json!({
                    "asset_id": asset_id,
                    "error": message,
                }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::AssetType;
    use tempfile::TempDir;

    fn handler(dir: &Path) -> SidecarJobHandler {
        let catalog = AssetCatalog::new(dir.join("blender_assets.cats.txt"));
        let categories = CategoryTree::from_json(r#"{"Textures": {"Brick": {}}}"#).unwrap();
        SidecarJobHandler::new(catalog, categories)
    }

    #[test]
    fn test_sidecar_written_and_catalog_saved() {
        let dir = TempDir::new().unwrap();
        let mut handler = handler(dir.path());
        let mut asset = Asset::new(7, "Brick007", AssetType::Texture);
        asset.categories = vec!["Brick".into()];
        asset.files = vec![dir.path().join("Brick007").join("Brick007_COL_2K.jpg")];

        let data = handler.handle(&asset, None).unwrap();
        let sidecar = dir.path().join("Brick007").join("Brick007.asset.json");
        assert_eq!(data["path"], json!(sidecar));

        let written: Value = serde_json::from_str(&fs::read_to_string(&sidecar).unwrap()).unwrap();
        assert_eq!(written["catalog_path"], "Textures/Brick");
        assert_eq!(written["type"], "Texture");

        let saved = AssetCatalog::load(&dir.path().join("blender_assets.cats.txt")).unwrap();
        assert_eq!(saved.find_by_path("Textures/Brick").unwrap().uuid, written["catalog_id"]);
        assert!(saved.find_by_path("Textures").is_some());
    }

    #[test]
    fn test_output_dir_param_wins() {
        let dir = TempDir::new().unwrap();
        let mut handler = handler(dir.path());
        let asset = Asset::new(8, "Loose", AssetType::Model);
        let params = json!({"output_dir": dir.path().join("out")});

        handler.handle(&asset, Some(&params)).unwrap();
        assert!(dir.path().join("out").join("Loose.asset.json").exists());
        assert!(handler.catalog().find_by_path("Models").is_some());
    }

    #[test]
    fn test_no_destination_is_an_error() {
        let dir = TempDir::new().unwrap();
        let mut handler = handler(dir.path());
        let err = handler.handle(&Asset::new(9, "Nowhere", AssetType::Hdri), None).unwrap_err();
        assert!(err.contains("no local files"));
    }
}
