// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Host/worker sync protocol.
//!
//! The host (this tool, or an editor integration) drives a worker process
//! over its stdin/stdout. Every message is a framed [`SyncCommand`]; commands
//! other than results and acknowledgements are answered with `CMD_DONE` and
//! retransmitted until they are.
//!
//! ```text
//! SyncHost ──ASSET──▶ listener ─▶ job queue ─▶ SyncWorker ─▶ AssetJobHandler
//!    ▲   ◀─CMD_DONE──┘                              │
//!    └────────────── ASSET_OK / ASSET_ERROR ◀───────┘
//! ```

pub mod ack;
pub mod catalog;
pub mod channel;
pub mod host;
pub mod protocol;
pub mod worker;

pub use ack::{AckDecision, AckState, CommandAckStateMachine};
pub use catalog::{AssetCatalog, CatalogEntry, CategoryTree, CATALOG_VERSION};
pub use channel::{ChannelOptions, FramedMessageChannel};
pub use host::{AssetOutcome, SyncHost};
pub use protocol::{encode_frame, parse_frame, CommandCode, Frame, FrameBuffer, SyncCommand, END_MARKER, START_MARKER};
pub use worker::{AssetJobHandler, SidecarJobHandler, SyncWorker, WorkerSummary};
