// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Host side of the sync protocol: owns the worker process and drives
//! HELLO, ASSET and EXIT exchanges over its stdin/stdout.

use std::io;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::Value;

use super::channel::{ChannelOptions, FramedMessageChannel};
use super::protocol::{CommandCode, SyncCommand};
use crate::download::Asset;
use crate::errors::SyncError;

/// How long the worker gets to exit after the channel closes.
const CHILD_EXIT_WAIT: Duration = Duration::from_secs(5);

/// Result of one ASSET job as reported by the worker.
#[derive(Debug, Clone, PartialEq)]
pub enum AssetOutcome {
    Built { data: Option<Value> },
    Failed { message: String },
}

impl AssetOutcome {
    pub fn is_built(&self) -> bool {
        matches!(self, AssetOutcome::Built { .. })
    }
}

pub struct SyncHost {
    channel: Option<FramedMessageChannel>,
    child: Option<Child>,
    response_timeout: Duration,
}

impl SyncHost {
    /// Start `exe worker -- <catalog> <categories>` and attach a channel to
    /// its pipes. The worker's stderr is inherited so its log stays visible.
    pub fn spawn(
        exe: &Path,
        catalog: &Path,
        categories: &Path,
        options: ChannelOptions,
        response_timeout: Duration,
    ) -> Result<Self, SyncError> {
        let mut child = Command::new(exe)
            .arg("worker")
            .arg("--")
            .arg(catalog)
            .arg(categories)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;

        let pipes = child.stdin.take().zip(child.stdout.take());
        let Some((stdin, stdout)) = pipes else {
            kill_child(&mut child);
            return Err(SyncError::Io(io::Error::new(io::ErrorKind::Other, "worker pipes not captured")));
        };

        let channel = match FramedMessageChannel::spawn("host", stdout, stdin, options) {
            Ok(channel) => channel,
            Err(e) => {
                kill_child(&mut child);
                return Err(e);
            }
        };

        tracing::info!(pid = child.id(), exe = %exe.display(), "Started sync worker");
        Ok(Self {
            channel: Some(channel),
            child: Some(child),
            response_timeout,
        })
    }

    /// Host over an existing channel, without a child process.
    pub fn with_channel(channel: FramedMessageChannel, response_timeout: Duration) -> Self {
        Self {
            channel: Some(channel),
            child: None,
            response_timeout,
        }
    }

    pub fn hello(&mut self) -> Result<(), SyncError> {
        self.request(SyncCommand::new(CommandCode::Hello), &[CommandCode::HelloOk])?;
        tracing::debug!("Sync worker is ready");
        Ok(())
    }

    /// Hand one asset to the worker and wait for its verdict.
    pub fn submit_asset(&mut self, asset: &Asset, params: Option<Value>) -> Result<AssetOutcome, SyncError> {
        let mut command = SyncCommand::new(CommandCode::Asset).with_data(serde_json::to_value(asset)?);
        if let Some(params) = params {
            command = command.with_params(params);
        }

        let reply = self.request(command, &[CommandCode::AssetOk, CommandCode::AssetError])?;
        if reply.code == CommandCode::AssetOk {
            tracing::info!(asset_id = asset.asset_id, "Asset synced");
            return Ok(AssetOutcome::Built { data: reply.data });
        }

        let message = reply
            .data
            .as_ref()
            .and_then(|d| d.get("error"))
            .and_then(Value::as_str)
            .unwrap_or("worker reported an unspecified error")
            .to_string();
        tracing::warn!(asset_id = asset.asset_id, error = %message, "Asset sync failed");
        Ok(AssetOutcome::Failed { message })
    }

    /// Ask the worker to exit, then close the channel and reap the process.
    pub fn exit(mut self) -> Result<(), SyncError> {
        let result = self.request(SyncCommand::new(CommandCode::Exit), &[CommandCode::ExitAck]);
        self.close();
        result.map(|_| ())
    }

    fn request(&mut self, command: SyncCommand, expected: &[CommandCode]) -> Result<SyncCommand, SyncError> {
        let code = command.code;
        let outcome = match &self.channel {
            Some(channel) => channel.send(command).and_then(|_| self.wait_for(channel, code, expected)),
            None => Err(SyncError::ChannelBroken),
        };
        if let Err(e) = &outcome {
            tracing::error!(code = %code, error = %e, "Sync request failed, stopping worker");
            self.abort();
        }
        outcome
    }

    fn wait_for(
        &self,
        channel: &FramedMessageChannel,
        sent: CommandCode,
        expected: &[CommandCode],
    ) -> Result<SyncCommand, SyncError> {
        let deadline = Instant::now() + self.response_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(SyncError::ResponseTimeout(format!("reply to {}", sent)));
            }
            match channel.recv_job(remaining)? {
                Some(reply) if expected.contains(&reply.code) => return Ok(reply),
                Some(reply) if reply.code == CommandCode::StillThere => {
                    tracing::trace!("Worker idle probe");
                }
                Some(reply) => {
                    tracing::warn!(code = %reply.code, waiting_for = %sent, "Ignoring unexpected command");
                }
                None => {}
            }
        }
    }

    /// Orderly close: our write side first so the worker sees end of input.
    fn close(&mut self) {
        if let Some(channel) = self.channel.take() {
            channel.shutdown(CHILD_EXIT_WAIT);
        }
        if let Some(mut child) = self.child.take() {
            let deadline = Instant::now() + CHILD_EXIT_WAIT;
            loop {
                match child.try_wait() {
                    Ok(Some(status)) => {
                        tracing::debug!(status = %status, "Sync worker exited");
                        return;
                    }
                    Ok(None) if Instant::now() < deadline => thread::sleep(Duration::from_millis(20)),
                    Ok(None) => {
                        tracing::warn!("Sync worker did not exit, killing it");
                        kill_child(&mut child);
                        return;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Could not poll sync worker");
                        kill_child(&mut child);
                        return;
                    }
                }
            }
        }
    }

    /// Kill the worker first so its pipes close and the listener unblocks.
    fn abort(&mut self) {
        if let Some(mut child) = self.child.take() {
            kill_child(&mut child);
        }
        if let Some(channel) = self.channel.take() {
            channel.shutdown(Duration::from_secs(1));
        }
    }
}

impl Drop for SyncHost {
    fn drop(&mut self) {
        if self.channel.is_some() || self.child.is_some() {
            self.abort();
        }
    }
}

fn kill_child(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}
