// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Acknowledgement lifecycle of one outbound command.
//!
//! ```text
//! SENT -> WAITING_ACK -> ACKED
//!   ^          |
//!   +----------+-- NACKED | TIMED_OUT  (retransmit while attempts remain)
//!              +-- BROKEN              (attempts exhausted)
//! ```

use std::fmt;

use super::protocol::CommandCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckState {
    /// Created, not yet transmitted.
    Pending,
    Sent,
    WaitingAck,
    Acked,
    TimedOut,
    Nacked,
    Broken,
}

impl AckState {
    pub fn is_terminal(self) -> bool {
        matches!(self, AckState::Acked | AckState::Broken)
    }
}

impl fmt::Display for AckState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AckState::Pending => "PENDING",
            AckState::Sent => "SENT",
            AckState::WaitingAck => "WAITING_ACK",
            AckState::Acked => "ACKED",
            AckState::TimedOut => "TIMED_OUT",
            AckState::Nacked => "NACKED",
            AckState::Broken => "BROKEN",
        };
        f.write_str(name)
    }
}

/// What the sender does after a negative outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckDecision {
    Retransmit,
    GiveUp,
}

/// Tracks one command through transmission attempts.
///
/// `max_attempts` counts transmissions, so a budget of 3 sends the command
/// at most three times.
#[derive(Debug, Clone)]
pub struct CommandAckStateMachine {
    code: CommandCode,
    state: AckState,
    attempts: u32,
    max_attempts: u32,
}

impl CommandAckStateMachine {
    pub fn new(code: CommandCode, max_attempts: u32) -> Self {
        Self {
            code,
            state: AckState::Pending,
            attempts: 0,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn code(&self) -> CommandCode {
        self.code
    }

    pub fn state(&self) -> AckState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Whether the command should be (re)transmitted now.
    pub fn needs_transmission(&self) -> bool {
        matches!(self.state, AckState::Pending | AckState::Nacked | AckState::TimedOut)
    }

    /// Record a transmission. Returns false if the state does not allow one.
    pub fn on_sent(&mut self) -> bool {
        if !self.needs_transmission() {
            return false;
        }
        self.attempts += 1;
        self.state = AckState::Sent;
        true
    }

    pub fn on_waiting(&mut self) -> bool {
        self.advance(AckState::Sent, AckState::WaitingAck)
    }

    pub fn on_ack(&mut self) -> bool {
        self.advance(AckState::WaitingAck, AckState::Acked)
    }

    /// Peer answered `CMD_ERROR`.
    pub fn on_nack(&mut self) -> AckDecision {
        self.fail(AckState::Nacked)
    }

    /// No answer within the ack timeout.
    pub fn on_timeout(&mut self) -> AckDecision {
        self.fail(AckState::TimedOut)
    }

    /// Peer went away; no retransmission can help.
    pub fn on_disconnect(&mut self) {
        self.state = AckState::Broken;
    }

    fn advance(&mut self, from: AckState, to: AckState) -> bool {
        if self.state != from {
            tracing::debug!(code = %self.code, from = %self.state, to = %to, "Ignoring ack transition");
            return false;
        }
        self.state = to;
        true
    }

    fn fail(&mut self, outcome: AckState) -> AckDecision {
        if self.state.is_terminal() {
            return AckDecision::GiveUp;
        }
        if self.attempts >= self.max_attempts {
            self.state = AckState::Broken;
            AckDecision::GiveUp
        } else {
            self.state = outcome;
            AckDecision::Retransmit
        }
    }
}
