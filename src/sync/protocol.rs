// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Wire format of the host/worker sync channel.
//!
//! A frame is `<|cmd|>{json}<|/cmd|>` followed by a newline. JSON is written
//! compact, so a frame never spans lines, but the receiver does not rely on
//! that: it buffers text until an end marker shows up.

use std::fmt;
use std::sync::mpsc::Sender;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::SyncError;

pub const START_MARKER: &str = "<|cmd|>";
pub const END_MARKER: &str = "<|/cmd|>";

/// Command codes, serialized as their integer value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum CommandCode {
    Hello = 0,
    HelloOk = 1,
    Asset = 2,
    AssetOk = 3,
    AssetError = 4,
    StillThere = 5,
    CmdDone = 6,
    CmdError = 7,
    Exit = 8,
    ExitAck = 9,
}

impl CommandCode {
    /// Codes sent without waiting for an acknowledgement.
    pub fn is_fire_and_forget(self) -> bool {
        matches!(self, CommandCode::AssetOk | CommandCode::AssetError | CommandCode::ExitAck)
    }

    /// Acknowledgement codes. Never acknowledged themselves.
    pub fn is_ack(self) -> bool {
        matches!(self, CommandCode::CmdDone | CommandCode::CmdError)
    }

    /// Whether the receiver answers this code with `CMD_DONE`.
    pub fn expects_ack(self) -> bool {
        !self.is_fire_and_forget() && !self.is_ack()
    }

    pub fn name(self) -> &'static str {
        match self {
            CommandCode::Hello => "HELLO",
            CommandCode::HelloOk => "HELLO_OK",
            CommandCode::Asset => "ASSET",
            CommandCode::AssetOk => "ASSET_OK",
            CommandCode::AssetError => "ASSET_ERROR",
            CommandCode::StillThere => "STILL_THERE",
            CommandCode::CmdDone => "CMD_DONE",
            CommandCode::CmdError => "CMD_ERROR",
            CommandCode::Exit => "EXIT",
            CommandCode::ExitAck => "EXIT_ACK",
        }
    }
}

impl fmt::Display for CommandCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl TryFrom<u8> for CommandCode {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => CommandCode::Hello,
            1 => CommandCode::HelloOk,
            2 => CommandCode::Asset,
            3 => CommandCode::AssetOk,
            4 => CommandCode::AssetError,
            5 => CommandCode::StillThere,
            6 => CommandCode::CmdDone,
            7 => CommandCode::CmdError,
            8 => CommandCode::Exit,
            9 => CommandCode::ExitAck,
            other => return Err(format!("unknown command code {}", other)),
        })
    }
}

impl From<CommandCode> for u8 {
    fn from(code: CommandCode) -> u8 {
        code as u8
    }
}

/// One message on the sync channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncCommand {
    pub code: CommandCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl SyncCommand {
    pub fn new(code: CommandCode) -> Self {
        Self {
            code,
            data: None,
            params: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = Some(params);
        self
    }

    pub fn done() -> Self {
        Self::new(CommandCode::CmdDone)
    }

    pub fn error() -> Self {
        Self::new(CommandCode::CmdError)
    }
}

/// Serialize and wrap a command, newline terminated.
///
/// `<` can only occur inside JSON strings, so writing it as `\u003c` keeps
/// both markers out of the payload without changing what it decodes to.
pub fn encode_frame(command: &SyncCommand) -> Result<String, SyncError> {
    let json = serde_json::to_string(command)?.replace('<', "\\u003c");
    Ok(format!("{}{}{}\n", START_MARKER, json, END_MARKER))
}

/// Result of extracting one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Command(SyncCommand),
    /// A complete span that is not a valid frame. It has been discarded.
    Malformed(String),
}

/// Receive-side accumulation of text.
///
/// Text after an end marker stays buffered for the next frame.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buffer: String,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, text: &str) {
        self.buffer.push_str(text);
    }

    pub fn pending(&self) -> &str {
        &self.buffer
    }

    /// Extract the next complete frame, or `None` if no end marker has
    /// arrived yet.
    pub fn next_frame(&mut self) -> Option<Frame> {
        extract_frame(&mut self.buffer)
    }
}

fn extract_frame(buffer: &mut String) -> Option<Frame> {
    let end = buffer.find(END_MARKER)?;
    let span: String = buffer[..end].to_string();
    buffer.replace_range(..end + END_MARKER.len(), "");
    // A newline terminating the previous frame is not part of the next one.
    if buffer.starts_with('\n') {
        buffer.remove(0);
    }

    let Some(start) = span.rfind(START_MARKER) else {
        return Some(Frame::Malformed(format!("missing start marker in {:?}", truncate(&span))));
    };
    let json = &span[start + START_MARKER.len()..];
    match serde_json::from_str::<SyncCommand>(json) {
        Ok(command) => Some(Frame::Command(command)),
        Err(e) => Some(Frame::Malformed(format!("{} in {:?}", e, truncate(json)))),
    }
}

/// Parse the next frame out of `buffer`.
///
/// Returns `None` when no complete frame is available, and also when the
/// span up to the end marker is malformed; in that case a `CMD_ERROR` is
/// queued on `replies` and the span is dropped.
pub fn parse_frame(buffer: &mut String, replies: &Sender<SyncCommand>) -> Option<SyncCommand> {
    match extract_frame(buffer)? {
        Frame::Command(command) => Some(command),
        Frame::Malformed(reason) => {
            tracing::warn!(reason = %reason, "Discarding malformed frame");
            let _ = replies.send(SyncCommand::error());
            None
        }
    }
}

fn truncate(text: &str) -> String {
    text.chars().take(80).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::mpsc;

    #[test]
    fn test_code_serializes_as_integer() {
        let cmd = SyncCommand::new(CommandCode::Exit);
        assert_eq!(serde_json::to_string(&cmd).unwrap(), r#"{"code":8}"#);
        let back: SyncCommand = serde_json::from_str(r#"{"code":3,"data":{"x":1}}"#).unwrap();
        assert_eq!(back.code, CommandCode::AssetOk);
        assert!(serde_json::from_str::<SyncCommand>(r#"{"code":42}"#).is_err());
    }

    #[test]
    fn test_fire_and_forget_set() {
        let fire: Vec<_> = (0u8..10)
            .filter_map(|c| CommandCode::try_from(c).ok())
            .filter(|c| c.is_fire_and_forget())
            .collect();
        assert_eq!(fire, vec![CommandCode::AssetOk, CommandCode::AssetError, CommandCode::ExitAck]);
        assert!(!CommandCode::CmdDone.expects_ack());
        assert!(CommandCode::StillThere.expects_ack());
    }

    #[test]
    fn test_parse_roundtrip_keeps_leftover() {
        let (tx, rx) = mpsc::channel();
        let first = SyncCommand::new(CommandCode::Asset)
            .with_data(json!({"asset_id": 1}))
            .with_params(json!({"output_dir": "/tmp"}));
        let second = SyncCommand::new(CommandCode::Hello);
        let second_frame = encode_frame(&second).unwrap();

        let mut buffer = encode_frame(&first).unwrap();
        buffer.push_str(&second_frame[..5]);

        assert_eq!(parse_frame(&mut buffer, &tx), Some(first));
        assert_eq!(buffer, &second_frame[..5]);
        assert_eq!(parse_frame(&mut buffer, &tx), None);

        buffer.push_str(&second_frame[5..]);
        assert_eq!(parse_frame(&mut buffer, &tx), Some(second));
        assert!(buffer.is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_missing_start_marker_queues_error() {
        let (tx, rx) = mpsc::channel();
        let mut buffer = format!("{{\"code\":0}}{}\n{}", END_MARKER, START_MARKER);

        assert_eq!(parse_frame(&mut buffer, &tx), None);
        assert_eq!(rx.try_recv().unwrap(), SyncCommand::error());
        assert_eq!(buffer, START_MARKER);
    }

    #[test]
    fn test_invalid_json_is_malformed() {
        let mut frames = FrameBuffer::new();
        frames.push(&format!("{}{{not json{}", START_MARKER, END_MARKER));
        assert!(matches!(frames.next_frame(), Some(Frame::Malformed(_))));
        assert_eq!(frames.pending(), "");
    }

    #[test]
    fn test_garbage_before_start_marker_is_skipped() {
        let mut frames = FrameBuffer::new();
        frames.push(&format!("Blender 4.1 starting\n{}{{\"code\":1}}{}", START_MARKER, END_MARKER));
        assert_eq!(frames.next_frame(), Some(Frame::Command(SyncCommand::new(CommandCode::HelloOk))));
    }
}
