//! # Utility Modules
//!
//! Hex helpers and log throttling shared by the transport, the data link and
//! the command-line tool.

pub mod hex;
pub mod logging;

pub use hex::{decode_hex, encode_hex, format_hex_compact};
pub use logging::{log_frame_hex, LogThrottle};
