// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Sync protocol over in-memory pipes: framing, acknowledgement and the
//! host/worker conversation.

use std::fs;
use std::io::{self, Read, Write};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::json;
use tempfile::TempDir;

use poliigon_sync::download::{Asset, AssetType};
use poliigon_sync::errors::SyncError;
use poliigon_sync::sync::{
    encode_frame, AssetCatalog, AssetOutcome, CategoryTree, ChannelOptions, CommandCode, Frame, FrameBuffer,
    FramedMessageChannel, SidecarJobHandler, SyncCommand, SyncHost, SyncWorker, END_MARKER,
};

// =============================================================================
// PIPES
// =============================================================================

struct PipeReader {
    rx: Receiver<Vec<u8>>,
    pending: Vec<u8>,
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending.is_empty() {
            match self.rx.recv() {
                Ok(bytes) => self.pending = bytes,
                Err(_) => return Ok(0),
            }
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }
}

struct PipeWriter(Sender<Vec<u8>>);

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .send(buf.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn pipe() -> (PipeWriter, PipeReader) {
    let (tx, rx) = mpsc::channel();
    (PipeWriter(tx), PipeReader { rx, pending: Vec::new() })
}

/// A channel plus the raw ends of a scripted peer.
fn channel_with_raw_peer(options: ChannelOptions) -> (FramedMessageChannel, Sender<Vec<u8>>, Receiver<Vec<u8>>) {
    let (to_channel, channel_in) = pipe();
    let (channel_out, from_channel) = pipe();
    let channel = FramedMessageChannel::spawn("test", channel_in, channel_out, options).unwrap();
    (channel, to_channel.0, from_channel.rx)
}

fn fast(max_attempts: u32) -> ChannelOptions {
    ChannelOptions {
        ack_timeout: Duration::from_millis(50),
        max_attempts,
    }
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

// =============================================================================
// FRAMING
// =============================================================================

#[test]
fn test_frames_survive_arbitrary_chunking() {
    let commands = vec![
        SyncCommand::new(CommandCode::Hello),
        SyncCommand::new(CommandCode::Asset)
            .with_data(json!({"asset_id": 12, "asset_name": "Wood <|odd|> name"}))
            .with_params(json!({"output_dir": "/tmp/x"})),
        SyncCommand::new(CommandCode::Exit),
    ];
    let stream: String = commands.iter().map(|c| encode_frame(c).unwrap()).collect();

    let mut frames = FrameBuffer::new();
    let mut decoded = Vec::new();
    for chunk in stream.as_bytes().chunks(7) {
        frames.push(std::str::from_utf8(chunk).unwrap());
        while let Some(frame) = frames.next_frame() {
            match frame {
                Frame::Command(command) => decoded.push(command),
                Frame::Malformed(reason) => panic!("unexpected malformed frame: {}", reason),
            }
        }
    }

    assert_eq!(decoded, commands);
    assert!(frames.pending().is_empty());
}

#[test]
fn test_markers_inside_data_survive_framing() {
    let command = SyncCommand::new(CommandCode::Asset)
        .with_data(json!({"asset_id": 9, "asset_name": "weird<|/cmd|>name<|cmd|>tail"}))
        .with_params(json!({"note": "<<|/cmd|>>"}));
    let frame = encode_frame(&command).unwrap();
    assert_eq!(frame.matches(END_MARKER).count(), 1);

    let mut frames = FrameBuffer::new();
    frames.push(&frame);
    assert_eq!(frames.next_frame(), Some(Frame::Command(command.clone())));
    assert!(frames.pending().is_empty());

    // Delivered as a job through a live channel, with no CMD_ERROR reply.
    let (channel, to_channel, from_channel) = channel_with_raw_peer(fast(3));
    to_channel.send(frame.into_bytes()).unwrap();
    assert_eq!(channel.recv_job(Duration::from_secs(2)).unwrap(), Some(command));
    let reply = from_channel.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(String::from_utf8(reply).unwrap(), encode_frame(&SyncCommand::done()).unwrap());
}

#[test]
fn test_missing_start_marker_answered_with_cmd_error() {
    let (channel, to_channel, from_channel) = channel_with_raw_peer(fast(3));

    to_channel
        .send(format!("{{\"code\":2}}{}\n", END_MARKER).into_bytes())
        .unwrap();
    let reply = from_channel.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(String::from_utf8(reply).unwrap(), encode_frame(&SyncCommand::error()).unwrap());

    // Nothing reached the job queue and the channel is still usable.
    assert_eq!(channel.recv_job(Duration::from_millis(50)).unwrap(), None);
    assert!(!channel.is_broken());
}

// =============================================================================
// ACKNOWLEDGEMENT
// =============================================================================

#[test]
fn test_unacknowledged_command_breaks_after_three_transmissions() {
    let (channel, _to_channel, from_channel) = channel_with_raw_peer(fast(3));

    channel.send(SyncCommand::new(CommandCode::Hello)).unwrap();
    assert!(wait_until(Duration::from_secs(3), || channel.is_broken()));
    assert_eq!(channel.transmissions(), 3);

    let written: String = from_channel
        .try_iter()
        .map(|bytes| String::from_utf8(bytes).unwrap())
        .collect();
    let hello = encode_frame(&SyncCommand::new(CommandCode::Hello)).unwrap();
    assert_eq!(written.matches(&hello).count(), 3);

    assert!(matches!(
        channel.send(SyncCommand::new(CommandCode::Exit)),
        Err(SyncError::ChannelBroken)
    ));
    assert!(matches!(
        channel.recv_job(Duration::from_millis(10)),
        Err(SyncError::ChannelBroken)
    ));
}

#[test]
fn test_nack_triggers_retransmission() {
    let (channel, to_channel, from_channel) = channel_with_raw_peer(fast(3));

    let peer = thread::spawn(move || {
        let mut frames = FrameBuffer::new();
        let mut answered = 0;
        while answered < 2 {
            let Ok(bytes) = from_channel.recv_timeout(Duration::from_secs(2)) else {
                break;
            };
            frames.push(&String::from_utf8(bytes).unwrap());
            while let Some(Frame::Command(command)) = frames.next_frame() {
                assert_eq!(command.code, CommandCode::StillThere);
                let reply = if answered == 0 {
                    SyncCommand::error()
                } else {
                    SyncCommand::done()
                };
                to_channel.send(encode_frame(&reply).unwrap().into_bytes()).unwrap();
                answered += 1;
            }
        }
        (answered, to_channel)
    });

    channel.send(SyncCommand::new(CommandCode::StillThere)).unwrap();
    let (answered, _keep_open) = peer.join().unwrap();
    assert_eq!(answered, 2);

    thread::sleep(Duration::from_millis(100));
    assert_eq!(channel.transmissions(), 2);
    assert!(!channel.is_broken());
}

#[test]
fn test_results_are_not_retransmitted() {
    let (channel, _to_channel, from_channel) = channel_with_raw_peer(fast(3));

    channel
        .send(SyncCommand::new(CommandCode::AssetOk).with_data(json!({"asset_id": 1})))
        .unwrap();
    assert!(wait_until(Duration::from_secs(1), || channel.transmissions() == 1));
    thread::sleep(Duration::from_millis(200));

    assert_eq!(channel.transmissions(), 1);
    assert!(!channel.is_broken());
    assert_eq!(from_channel.try_iter().count(), 1);
}

// =============================================================================
// HOST AND WORKER
// =============================================================================

const CATALOG: &str = "# This is an Asset Catalog Definition file for Blender.\n\
#\n\
# Empty lines and lines starting with `#` will be ignored.\n\
# The first non-ignored line should be the version indicator.\n\
# Other lines are of the format \"UUID:catalog/path/for/assets:simple catalog name\"\n\
\n\
VERSION 1\n\
\n\
9d3c8b1a-0000-4000-8000-000000000001:Personal:Personal\n";

#[test]
fn test_host_and_worker_conversation() {
    let dir = TempDir::new().unwrap();
    let catalog_path = dir.path().join("blender_assets.cats.txt");
    fs::write(&catalog_path, CATALOG).unwrap();

    let (host_out, worker_in) = pipe();
    let (worker_out, host_in) = pipe();
    let options = ChannelOptions {
        ack_timeout: Duration::from_secs(1),
        max_attempts: 3,
    };
    let host_channel = FramedMessageChannel::spawn("host", host_in, host_out, options).unwrap();
    let worker_channel = FramedMessageChannel::spawn("worker", worker_in, worker_out, options).unwrap();

    let handler = SidecarJobHandler::new(
        AssetCatalog::load(&catalog_path).unwrap(),
        CategoryTree::from_json(r#"{"Textures": {"Brick": {"Old": {}}}}"#).unwrap(),
    );
    let worker = thread::spawn(move || SyncWorker::new(worker_channel, handler, Duration::from_secs(10)).run());

    let mut host = SyncHost::with_channel(host_channel, Duration::from_secs(5));
    host.hello().unwrap();

    let mut bricks = Asset::new(31, "BrickOld031", AssetType::Texture);
    bricks.categories = vec!["Brick".into(), "Old".into()];
    let out_dir = dir.path().join("BrickOld031");
    let outcome = host
        .submit_asset(&bricks, Some(json!({ "output_dir": out_dir })))
        .unwrap();
    let data = match outcome {
        AssetOutcome::Built { data: Some(data) } => data,
        other => panic!("expected a built asset, got {:?}", other),
    };
    assert_eq!(data["asset_id"], 31);
    assert!(out_dir.join("BrickOld031.asset.json").exists());

    let homeless = Asset::new(32, "Floating", AssetType::Model);
    match host.submit_asset(&homeless, None).unwrap() {
        AssetOutcome::Failed { message } => assert!(message.contains("no local files")),
        other => panic!("expected a failure, got {:?}", other),
    }

    host.exit().unwrap();
    let summary = worker.join().unwrap().unwrap();
    assert_eq!((summary.built, summary.failed), (1, 1));

    let catalog = fs::read_to_string(&catalog_path).unwrap();
    assert!(catalog.starts_with(CATALOG));
    assert!(catalog.contains(":Textures/Brick/Old:Textures-Brick-Old\n"));
    // The failed job never reached the catalog.
    assert!(!catalog.contains(":Models:"));
}

#[test]
fn test_idle_worker_probes_and_exits_when_host_leaves() {
    let dir = TempDir::new().unwrap();
    let (host_out, worker_in) = pipe();
    let (worker_out, host_in) = pipe();
    let host_channel = FramedMessageChannel::spawn("host", host_in, host_out, fast(3)).unwrap();
    let worker_channel = FramedMessageChannel::spawn("worker", worker_in, worker_out, fast(3)).unwrap();

    let handler = SidecarJobHandler::new(
        AssetCatalog::new(dir.path().join("cats.txt")),
        CategoryTree::default(),
    );
    let worker = thread::spawn(move || SyncWorker::new(worker_channel, handler, Duration::from_millis(50)).run());

    let probe = host_channel.recv_job(Duration::from_secs(2)).unwrap();
    assert_eq!(probe.map(|c| c.code), Some(CommandCode::StillThere));

    // Closing the host side ends the worker with an error.
    host_channel.shutdown(Duration::from_secs(2));
    assert!(matches!(worker.join().unwrap(), Err(SyncError::ChannelBroken)));
}
