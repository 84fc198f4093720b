//! # e32-link - Messaging over EBYTE E32 LoRa Modules
//!
//! The e32-link crate drives an EBYTE E32 serial LoRa transceiver from a Linux
//! host and layers framed, addressable messaging on top of its transparent
//! serial link.
//!
//! ## Features
//!
//! - Mode control through the M0/M1 lines, with AUX ready tracking
//! - Sleep-gated register access: configuration read/write, reset, version
//! - Bit-exact codecs for the configuration register and version reply
//! - A data link that rebuilds CRC-checked frames from an arbitrarily chunked
//!   byte stream and reports corrupt and incomplete frames
//! - Request/response round trips with timeout and latency measurement
//! - Addressed one-way broadcast envelopes
//! - An in-process simulated module for tests and dry runs
//!
//! ## Usage
//!
//! ```no_run
//! use e32_link::{MockPins, Settings, Station, FixedWait};
//! use std::time::Duration;
//!
//! # async fn run() -> Result<(), e32_link::E32Error> {
//! let mut station = Station::open(Settings::default(), MockPins::new())?;
//! let config = station.start().await?;
//! println!("module at {} on {} MHz", config.address(), config.frequency_mhz());
//!
//! let result = station
//!     .round_tripper()
//!     .do_round_trip(48, &mut FixedWait(Duration::from_millis(500)))
//!     .await?;
//! println!("latency: {:?}", result.latency());
//! # Ok(())
//! # }
//! ```

pub mod broadcast;
pub mod codec;
pub mod config;
pub mod constants;
pub mod device;
pub mod error;
pub mod gpio;
pub mod link;
pub mod logging;
pub mod round_trip;
pub mod station;
pub mod transport;
pub mod util;

pub use crate::error::{E32Error, GpioError, LinkError, ParseError, ValidationError};
pub use crate::logging::{init_logger, init_logger_with_default};

pub use broadcast::{BroadcastEvent, BroadcastLayer};
pub use codec::{Address, BroadcastEnvelope, ConfigRegister, VersionInfo};
pub use config::Settings;
pub use device::{DeviceConfig, DeviceEvent, OperatingMode, E32};
pub use gpio::{ControlPins, MockPins, PinConfig};
pub use link::{DataLink, DropInfo, DropReason, LinkConfig, LinkEvent, LinkStats};
pub use round_trip::{
    FixedWait, RandomWait, RoundTripConfig, RoundTripEvent, RoundTripOutcome, RoundTripResult,
    RoundTripper, WaitTimeProvider,
};
pub use station::Station;
pub use transport::{SerialConfig, SimulatedModule, Transport, TransportEvent};

#[cfg(feature = "raspberry-pi")]
pub use gpio::RaspberryPiPins;

/// Open the serial port described by `config`.
///
/// # Arguments
/// * `config` - Port path, baud rate and parity
///
/// # Returns
/// * `Ok(Transport)` - Shared handle to the port
/// * `Err(E32Error)` - The port could not be opened
pub fn connect(config: &SerialConfig) -> Result<Transport, E32Error> {
    Transport::open(config)
}
