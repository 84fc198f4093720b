//! E32 Protocol Constants
//!
//! Command bytes and register sizes follow the EBYTE E32 user manual; the
//! frame and envelope layouts are this crate's own wire convention.

use std::time::Duration;

// ----------------------------------------------------------------------------
// Register commands (valid in Sleep mode only)
// ----------------------------------------------------------------------------

/// Read the current configuration register
pub const CMD_READ_CONFIG: [u8; 3] = [0xC1, 0xC1, 0xC1];

/// Read the module version
pub const CMD_READ_VERSION: [u8; 3] = [0xC3, 0xC3, 0xC3];

/// Reset the module
pub const CMD_RESET: [u8; 3] = [0xC4, 0xC4, 0xC4];

/// Configuration header: parameters are saved across power cycles
pub const CONFIG_HEAD_PERSISTENT: u8 = 0xC0;

/// Configuration header: parameters are lost on power down
pub const CONFIG_HEAD_VOLATILE: u8 = 0xC2;

/// Version reply header
pub const VERSION_HEAD: u8 = 0xC3;

/// Configuration register size on the wire
pub const CONFIG_LEN: usize = 6;

/// Version reply size on the wire
pub const VERSION_LEN: usize = 4;

/// Wait after the reset command before the register can be read back
pub const RESET_SETTLE: Duration = Duration::from_millis(50);

/// Bound on any register reply
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(1);

/// Silence that marks the end of a late register reply
pub const RESYNC_QUIET: Duration = Duration::from_millis(20);

/// Channel 0 of the E32-433 series sits at 410 MHz
pub const BASE_FREQUENCY_MHZ: u32 = 410;

// ----------------------------------------------------------------------------
// Data-link framing
// ----------------------------------------------------------------------------

/// Start of frame marker
pub const FRAME_START: u8 = 0x7E;

/// Largest payload a single frame can carry (length is one byte)
pub const MAX_FRAME_PAYLOAD: usize = u8::MAX as usize;

/// Start byte + length byte
pub const FRAME_HEADER_LEN: usize = 2;

/// CRC-16 trailer
pub const FRAME_CRC_LEN: usize = 2;

/// Gap between bytes of one frame after which the partial frame is dropped
pub const INTER_BYTE_TIMEOUT: Duration = Duration::from_millis(100);

// ----------------------------------------------------------------------------
// Broadcast envelope
// ----------------------------------------------------------------------------

pub const ENVELOPE_MAGIC: u8 = 0xB5;
pub const ENVELOPE_VERSION: u8 = 0x01;

/// magic, version, source(2), destination(2), sequence, length
pub const ENVELOPE_HEADER_LEN: usize = 8;

/// Largest payload that still fits a single frame once wrapped
pub const MAX_ENVELOPE_PAYLOAD: usize = MAX_FRAME_PAYLOAD - ENVELOPE_HEADER_LEN;

/// Destination that addresses every station
pub const BROADCAST_ADDRESS: u16 = 0xFFFF;

// ----------------------------------------------------------------------------
// Round trips
// ----------------------------------------------------------------------------

/// Time allowed for a reply frame
pub const ROUND_TRIP_TIMEOUT: Duration = Duration::from_secs(3);

/// Default capacity of every event stream
pub const EVENT_CAPACITY: usize = 64;
