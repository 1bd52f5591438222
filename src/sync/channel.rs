// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Framed duplex channel with acknowledged delivery.
//!
//! Two threads per endpoint:
//! - the listener reads lines, extracts frames and routes them: `CMD_DONE`
//!   and `CMD_ERROR` to the ack queue, everything else to the job queue.
//!   It answers received commands that expect an ack with `CMD_DONE`, and
//!   malformed frames with `CMD_ERROR`, by writing directly so replies never
//!   queue behind a command that is itself waiting for an ack.
//! - the sender drains the send queue. Fire-and-forget codes go out once;
//!   everything else is retransmitted until acked or the attempt budget is
//!   spent, at which point the channel is broken and the sender stops.

use std::io::{BufRead, BufReader, ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::ack::{AckDecision, AckState, CommandAckStateMachine};
use super::protocol::{encode_frame, CommandCode, Frame, FrameBuffer, SyncCommand};
use crate::errors::SyncError;
use crate::locks::resilient_lock;

type SharedWriter = Arc<Mutex<Option<Box<dyn Write + Send>>>>;

/// Ack behaviour of the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelOptions {
    pub ack_timeout: Duration,
    /// Transmissions of one command before the peer is declared lost.
    pub max_attempts: u32,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(15),
            max_attempts: 3,
        }
    }
}

/// Items on the job queue.
enum Inbound {
    Command(SyncCommand),
    /// The peer closed its end.
    Closed,
    /// The sender gave up on the peer.
    Broken,
}

/// One endpoint of the sync channel.
pub struct FramedMessageChannel {
    name: String,
    send_tx: Option<Sender<SyncCommand>>,
    job_rx: Receiver<Inbound>,
    writer: SharedWriter,
    broken: Arc<AtomicBool>,
    closed: AtomicBool,
    transmissions: Arc<AtomicU32>,
    listener: Option<JoinHandle<()>>,
    sender: Option<JoinHandle<()>>,
}

impl FramedMessageChannel {
    /// Start the listener on `reader` and the sender on `writer`.
    pub fn spawn<R, W>(name: &str, reader: R, writer: W, options: ChannelOptions) -> Result<Self, SyncError>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let writer: SharedWriter = Arc::new(Mutex::new(Some(Box::new(writer))));
        let (send_tx, send_rx) = mpsc::channel::<SyncCommand>();
        let (job_tx, job_rx) = mpsc::channel::<Inbound>();
        let (ack_tx, ack_rx) = mpsc::channel::<SyncCommand>();
        let broken = Arc::new(AtomicBool::new(false));
        let transmissions = Arc::new(AtomicU32::new(0));

        let listener = {
            let writer = Arc::clone(&writer);
            let job_tx = job_tx.clone();
            let name = name.to_string();
            thread::Builder::new()
                .name(format!("{}-listener", name))
                .spawn(move || run_listener(&name, reader, writer, job_tx, ack_tx))?
        };

        let sender = {
            let sender = SenderLoop {
                name: name.to_string(),
                writer: Arc::clone(&writer),
                ack_rx,
                job_tx,
                options,
                broken: Arc::clone(&broken),
                transmissions: Arc::clone(&transmissions),
            };
            thread::Builder::new()
                .name(format!("{}-sender", name))
                .spawn(move || sender.run(send_rx))?
        };

        Ok(Self {
            name: name.to_string(),
            send_tx: Some(send_tx),
            job_rx,
            writer,
            broken,
            closed: AtomicBool::new(false),
            transmissions,
            listener: Some(listener),
            sender: Some(sender),
        })
    }

    /// Queue a command for transmission.
    pub fn send(&self, command: SyncCommand) -> Result<(), SyncError> {
        if self.is_broken() {
            return Err(SyncError::ChannelBroken);
        }
        match &self.send_tx {
            Some(tx) => tx.send(command).map_err(|_| SyncError::ChannelBroken),
            None => Err(SyncError::ChannelBroken),
        }
    }

    /// Next command from the job queue.
    ///
    /// `Ok(None)` means nothing arrived within `timeout`. An error means the
    /// peer is gone, either closed or declared lost.
    pub fn recv_job(&self, timeout: Duration) -> Result<Option<SyncCommand>, SyncError> {
        if self.closed.load(Ordering::SeqCst) || self.is_broken() {
            return Err(SyncError::ChannelBroken);
        }
        match self.job_rx.recv_timeout(timeout) {
            Ok(Inbound::Command(command)) => Ok(Some(command)),
            Ok(Inbound::Closed) => {
                self.closed.store(true, Ordering::SeqCst);
                tracing::debug!(channel = %self.name, "Peer closed the channel");
                Err(SyncError::ChannelBroken)
            }
            Ok(Inbound::Broken) | Err(RecvTimeoutError::Disconnected) => Err(SyncError::ChannelBroken),
            Err(RecvTimeoutError::Timeout) => {
                if self.is_broken() {
                    Err(SyncError::ChannelBroken)
                } else {
                    Ok(None)
                }
            }
        }
    }

    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::SeqCst)
    }

    /// Frames written by the sender thread, retransmissions included.
    pub fn transmissions(&self) -> u32 {
        self.transmissions.load(Ordering::SeqCst)
    }

    /// Flush queued commands, stop both threads and close the write side.
    ///
    /// The listener can only stop once the peer closes its end; it is given
    /// `listener_wait` to do so and detached otherwise. Returns whether both
    /// threads were joined.
    pub fn shutdown(mut self, listener_wait: Duration) -> bool {
        drop(self.send_tx.take());
        if let Some(sender) = self.sender.take() {
            if sender.join().is_err() {
                tracing::error!(channel = %self.name, "Sender thread panicked");
            }
        }
        drop(resilient_lock(&self.writer).take());

        let Some(listener) = self.listener.take() else {
            return true;
        };
        let deadline = Instant::now() + listener_wait;
        while !listener.is_finished() {
            if Instant::now() >= deadline {
                tracing::debug!(channel = %self.name, "Listener still blocked on read, detaching");
                return false;
            }
            thread::sleep(Duration::from_millis(10));
        }
        if listener.join().is_err() {
            tracing::error!(channel = %self.name, "Listener thread panicked");
        }
        true
    }
}

fn write_frame(writer: &SharedWriter, command: &SyncCommand) -> Result<(), SyncError> {
    let frame = encode_frame(command)?;
    let mut guard = resilient_lock(writer);
    let out = guard.as_mut().ok_or(SyncError::ChannelBroken)?;
    out.write_all(frame.as_bytes())?;
    out.flush()?;
    Ok(())
}

fn run_listener<R: Read>(
    name: &str,
    reader: R,
    writer: SharedWriter,
    job_tx: Sender<Inbound>,
    ack_tx: Sender<SyncCommand>,
) {
    let mut reader = BufReader::new(reader);
    let mut frames = FrameBuffer::new();
    let mut line = String::new();

    loop {
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == ErrorKind::InvalidData => {
                tracing::warn!(channel = %name, "Skipping non UTF-8 input");
                continue;
            }
            Err(e) => {
                tracing::warn!(channel = %name, error = %e, "Read failed, stopping listener");
                break;
            }
        }

        frames.push(&line);
        while let Some(frame) = frames.next_frame() {
            match frame {
                Frame::Command(command) => {
                    tracing::trace!(channel = %name, code = %command.code, "Received");
                    if command.code.is_ack() {
                        let _ = ack_tx.send(command);
                        continue;
                    }
                    if command.code.expects_ack() {
                        reply(name, &writer, SyncCommand::done());
                    }
                    let _ = job_tx.send(Inbound::Command(command));
                }
                Frame::Malformed(reason) => {
                    tracing::warn!(channel = %name, reason = %reason, "Malformed frame");
                    reply(name, &writer, SyncCommand::error());
                }
            }
        }
    }

    tracing::debug!(channel = %name, "Listener reached end of stream");
    let _ = job_tx.send(Inbound::Closed);
}

fn reply(name: &str, writer: &SharedWriter, command: SyncCommand) {
    if let Err(e) = write_frame(writer, &command) {
        tracing::debug!(channel = %name, code = %command.code, error = %e, "Could not send reply");
    }
}

/// State owned by the sender thread.
struct SenderLoop {
    name: String,
    writer: SharedWriter,
    ack_rx: Receiver<SyncCommand>,
    job_tx: Sender<Inbound>,
    options: ChannelOptions,
    broken: Arc<AtomicBool>,
    transmissions: Arc<AtomicU32>,
}

impl SenderLoop {
    fn run(self, send_rx: Receiver<SyncCommand>) {
        while let Ok(command) = send_rx.recv() {
            if !command.code.expects_ack() {
                match write_frame(&self.writer, &command) {
                    Ok(()) => {
                        self.transmissions.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(e) => {
                        tracing::warn!(channel = %self.name, code = %command.code, error = %e, "Write failed");
                        self.give_up(command.code, 1);
                        return;
                    }
                }
                continue;
            }

            let machine = self.deliver(&command);
            if machine.state() == AckState::Broken {
                self.give_up(command.code, machine.attempts());
                return;
            }
        }
    }

    /// Transmit until acked or out of attempts.
    fn deliver(&self, command: &SyncCommand) -> CommandAckStateMachine {
        // Acks still queued belong to earlier commands.
        while self.ack_rx.try_recv().is_ok() {}

        let mut machine = CommandAckStateMachine::new(command.code, self.options.max_attempts);
        while machine.on_sent() {
            if let Err(e) = write_frame(&self.writer, command) {
                tracing::warn!(channel = %self.name, code = %command.code, error = %e, "Write failed");
                machine.on_disconnect();
                break;
            }
            self.transmissions.fetch_add(1, Ordering::SeqCst);
            machine.on_waiting();

            let decision = match self.ack_rx.recv_timeout(self.options.ack_timeout) {
                Ok(ack) if ack.code == CommandCode::CmdDone => {
                    machine.on_ack();
                    continue;
                }
                Ok(_) => machine.on_nack(),
                Err(RecvTimeoutError::Timeout) => machine.on_timeout(),
                Err(RecvTimeoutError::Disconnected) => {
                    machine.on_disconnect();
                    AckDecision::GiveUp
                }
            };
            if decision == AckDecision::Retransmit {
                tracing::warn!(
                    channel = %self.name,
                    code = %command.code,
                    state = %machine.state(),
                    attempt = machine.attempts(),
                    "No acknowledgement, retransmitting"
                );
            }
        }
        machine
    }

    /// Mark the channel broken and close the write side.
    ///
    /// The listener stays blocked on its read until the peer closes its
    /// end: a generic reader cannot be interrupted from here. For a child
    /// process the host kills the child, which closes the pipe; an
    /// in-process peer has to drop its writer. `shutdown` detaches the
    /// listener if neither happens in time.
    fn give_up(&self, code: CommandCode, attempts: u32) {
        let err = SyncError::AckTimeout {
            code: code.to_string(),
            attempts,
        };
        tracing::error!(channel = %self.name, error = %err, "Peer lost, shutting channel down");
        self.broken.store(true, Ordering::SeqCst);
        drop(resilient_lock(&self.writer).take());
        let _ = self.job_tx.send(Inbound::Broken);
    }
}
