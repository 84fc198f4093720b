//! # E32 Error Handling
//!
//! This module defines the error types returned by the e32-link crate. All of
//! them are `Clone` so they can be carried inside the event streams published
//! by the transport, the data link and the layers above it.

use crate::device::OperatingMode;
use std::time::Duration;
use thiserror::Error;

/// Wire data does not have the expected shape.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Input length does not match the fixed structure size.
    #[error("Wrong length: expected {expected} bytes, got {actual}")]
    WrongLength { expected: usize, actual: usize },

    /// Input is structurally invalid (bad magic, truncated, inconsistent length).
    #[error("Malformed data: {0}")]
    Malformed(String),
}

/// A structure parsed correctly but carries an unexpected value.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Bad header: expected 0x{expected:02X}, got 0x{actual:02X}")]
    BadHeader { expected: u8, actual: u8 },
}

/// Faults detected by the data-link layer while reassembling or sending frames.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// Frame check sequence did not match the received bytes.
    #[error("Invalid checksum: expected 0x{expected:04X}, calculated 0x{calculated:04X}")]
    Checksum { expected: u16, calculated: u16 },

    /// Length byte outside the accepted range; the frame start was noise.
    #[error("Invalid frame length: {0}")]
    InvalidLength(usize),

    /// The underlying transport reported a failure.
    #[error("Transport error: {0}")]
    Transport(String),
}

/// Errors raised by a GPIO capability.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GpioError {
    #[error("GPIO initialization failed: {0}")]
    Init(String),

    #[error("Interrupt setup failed for pin {pin}: {reason}")]
    Interrupt { pin: u8, reason: String },
}

/// Represents the different error types that can occur in the e32-link crate.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum E32Error {
    /// Operation attempted in the wrong operating mode.
    #[error("Illegal state: operation requires {required:?} mode, device is in {actual:?}")]
    IllegalState {
        required: OperatingMode,
        actual: OperatingMode,
    },

    /// Framed traffic attempted while the line carries register access.
    #[error("Air traffic suspended: device is in {0:?} mode")]
    TrafficSuspended(OperatingMode),

    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Link error: {0}")]
    Link(#[from] LinkError),

    #[error("GPIO error: {0}")]
    Gpio(#[from] GpioError),

    /// Accessor called before `setup()` completed.
    #[error("Device not ready: setup has not completed")]
    NotReady,

    /// A round trip was requested while another one is outstanding.
    #[error("Busy: a round trip is already in flight")]
    Busy,

    /// The device did not deliver the expected number of bytes in time.
    #[error("Timeout: expected {expected} bytes, received {received}")]
    Timeout { expected: usize, received: usize },

    /// AUX did not signal idle within the allotted time.
    #[error("Timed out after {0:?} waiting for the module to become ready")]
    ReadyTimeout(Duration),

    /// Serial port or stream failure.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The component was closed before or during the operation.
    #[error("Closed")]
    Closed,

    /// A frame payload outside `1..=MAX_FRAME_PAYLOAD`.
    #[error("Invalid frame length: {0}")]
    InvalidFrameLength(usize),

    /// Settings could not be loaded or are inconsistent.
    #[error("Configuration error: {0}")]
    Config(String),
}
