//! # Simulated E32 Module
//!
//! A scripted module on the far end of a [`tokio::io::duplex`] pipe. It
//! shares [`MockPins`] with the controller under test and looks at the M0/M1
//! lines to decide what inbound bytes mean:
//!
//! - Sleep: register commands (`C1C1C1`, `C3C3C3`, `C4C4C4`, or a six-byte
//!   `C0`/`C2` write) answered the way the module answers them.
//! - any other mode: air traffic, echoed back when echo is enabled and
//!   swallowed otherwise.
//!
//! AUX drops low while a command is being handled. Replies can be overridden
//! to exercise malformed-reply paths, and arbitrary bytes can be injected
//! towards the host.

use crate::constants::{
    CMD_READ_CONFIG, CMD_READ_VERSION, CMD_RESET, CONFIG_HEAD_PERSISTENT, CONFIG_HEAD_VOLATILE,
    CONFIG_LEN,
};
use crate::device::OperatingMode;
use crate::error::E32Error;
use crate::gpio::MockPins;
use crate::link::encode_frame;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;

const PIPE_CAPACITY: usize = 4096;

/// Version reply of an E32-433T30D.
pub const SIMULATED_VERSION: [u8; 4] = [0xC3, 0x32, 0x27, 0x14];

#[derive(Debug)]
struct SimState {
    config: [u8; CONFIG_LEN],
    version: Vec<u8>,
    config_override: Option<Vec<u8>>,
    echo: bool,
    registers_silent: bool,
    reply_delay: Duration,
    pending: Vec<u8>,
    received: Vec<u8>,
    commands: Vec<Vec<u8>>,
}

type Writer = Arc<tokio::sync::Mutex<Option<WriteHalf<DuplexStream>>>>;

/// Far end of a simulated serial line.
pub struct SimulatedModule {
    state: Arc<Mutex<SimState>>,
    writer: Writer,
    task: JoinHandle<()>,
}

impl SimulatedModule {
    /// Starts the simulation; returns it with the host end of the pipe.
    pub fn spawn(pins: MockPins) -> (Self, DuplexStream) {
        let (host, far) = duplex(PIPE_CAPACITY);
        let (reader, writer) = tokio::io::split(far);

        let state = Arc::new(Mutex::new(SimState {
            config: [0xC0, 0x00, 0x00, 0x1A, 0x17, 0x44],
            version: SIMULATED_VERSION.to_vec(),
            config_override: None,
            echo: true,
            registers_silent: false,
            reply_delay: Duration::from_millis(1),
            pending: Vec::new(),
            received: Vec::new(),
            commands: Vec::new(),
        }));
        let writer: Writer = Arc::new(tokio::sync::Mutex::new(Some(writer)));

        let task = tokio::spawn(run(reader, writer.clone(), state.clone(), pins));
        (
            SimulatedModule {
                state,
                writer,
                task,
            },
            host,
        )
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Echo air traffic back to the host (default on).
    pub fn set_echo(&self, echo: bool) {
        self.state().echo = echo;
    }

    /// Ignore register commands entirely.
    pub fn set_registers_silent(&self, silent: bool) {
        self.state().registers_silent = silent;
    }

    /// Reply to `C1C1C1` and to writes with `reply` instead of the stored register.
    pub fn override_config_reply(&self, reply: &[u8]) {
        self.state().config_override = Some(reply.to_vec());
    }

    /// Reply to `C3C3C3` with `reply`.
    pub fn set_version_reply(&self, reply: &[u8]) {
        self.state().version = reply.to_vec();
    }

    pub fn set_reply_delay(&self, delay: Duration) {
        self.state().reply_delay = delay;
    }

    /// Register contents as the module holds them.
    pub fn config(&self) -> [u8; CONFIG_LEN] {
        self.state().config
    }

    pub fn set_config(&self, config: [u8; CONFIG_LEN]) {
        self.state().config = config;
    }

    /// Every byte the module received, in order.
    pub fn received(&self) -> Vec<u8> {
        self.state().received.clone()
    }

    /// Register commands recognised so far.
    pub fn commands(&self) -> Vec<Vec<u8>> {
        self.state().commands.clone()
    }

    /// Sends raw bytes to the host.
    pub async fn inject(&self, bytes: &[u8]) -> Result<(), E32Error> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(E32Error::Closed)?;
        writer
            .write_all(bytes)
            .await
            .map_err(|e| E32Error::Transport(e.to_string()))
    }

    /// Sends `payload` to the host as a link frame.
    pub async fn inject_frame(&self, payload: &[u8]) -> Result<(), E32Error> {
        let frame = encode_frame(payload)?;
        self.inject(&frame).await
    }

    /// Hangs up; the host sees end of stream.
    pub async fn disconnect(&self) {
        self.task.abort();
        self.writer.lock().await.take();
    }
}

impl Drop for SimulatedModule {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run(
    mut reader: ReadHalf<DuplexStream>,
    writer: Writer,
    state: Arc<Mutex<SimState>>,
    pins: MockPins,
) {
    let mut buf = [0u8; 512];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        let chunk = &buf[..n];

        let (replies, delay) = {
            let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
            state.received.extend_from_slice(chunk);

            let replies = if pins.mode() == OperatingMode::Sleep {
                state.pending.extend_from_slice(chunk);
                handle_commands(&mut state)
            } else {
                state.pending.clear();
                if state.echo {
                    vec![chunk.to_vec()]
                } else {
                    Vec::new()
                }
            };
            (replies, state.reply_delay)
        };

        if replies.is_empty() {
            continue;
        }

        pins.set_ready(false);
        tokio::time::sleep(delay).await;
        {
            let mut guard = writer.lock().await;
            let Some(w) = guard.as_mut() else { break };
            for reply in replies {
                if w.write_all(&reply).await.is_err() {
                    return;
                }
            }
        }
        pins.set_ready(true);
    }
}

/// Consumes complete commands from `state.pending` and returns the replies.
fn handle_commands(state: &mut SimState) -> Vec<Vec<u8>> {
    let mut replies = Vec::new();

    while let Some(&head) = state.pending.first() {
        let consumed = match head {
            CONFIG_HEAD_PERSISTENT | CONFIG_HEAD_VOLATILE => {
                if state.pending.len() < CONFIG_LEN {
                    break;
                }
                let mut written = [0u8; CONFIG_LEN];
                written.copy_from_slice(&state.pending[..CONFIG_LEN]);
                state.commands.push(written.to_vec());
                if !state.registers_silent {
                    state.config = written;
                    replies.push(
                        state
                            .config_override
                            .clone()
                            .unwrap_or_else(|| written.to_vec()),
                    );
                }
                CONFIG_LEN
            }
            0xC1 | 0xC3 | 0xC4 => {
                if state.pending.len() < 3 {
                    break;
                }
                let command = [state.pending[0], state.pending[1], state.pending[2]];
                if command == CMD_READ_CONFIG {
                    state.commands.push(command.to_vec());
                    if !state.registers_silent {
                        let reply = state
                            .config_override
                            .clone()
                            .unwrap_or_else(|| state.config.to_vec());
                        replies.push(reply);
                    }
                    3
                } else if command == CMD_READ_VERSION {
                    state.commands.push(command.to_vec());
                    if !state.registers_silent {
                        replies.push(state.version.clone());
                    }
                    3
                } else if command == CMD_RESET {
                    state.commands.push(command.to_vec());
                    3
                } else {
                    1
                }
            }
            _ => 1,
        };
        state.pending.drain(..consumed);
    }

    replies
}
