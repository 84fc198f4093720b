//! # Settings
//!
//! Everything tunable about a station, loaded from a JSON file. Every field
//! has a default, so a file only lists what differs:
//!
//! ```json
//! {
//!   "serial": { "port": "/dev/ttyAMA0" },
//!   "round_trip": { "timeout": 5000 }
//! }
//! ```
//!
//! Durations are given in milliseconds.

use crate::device::DeviceConfig;
use crate::error::E32Error;
use crate::gpio::PinConfig;
use crate::link::LinkConfig;
use crate::round_trip::RoundTripConfig;
use crate::transport::SerialConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub serial: SerialConfig,
    pub pins: PinConfig,
    pub device: DeviceConfig,
    pub link: LinkConfig,
    pub round_trip: RoundTripConfig,
}

impl Settings {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, E32Error> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| E32Error::Config(format!("{}: {e}", path.display())))?;
        let settings = Self::from_json(&text)?;
        log::debug!("Loaded settings from {}", path.display());
        Ok(settings)
    }

    pub fn from_json(text: &str) -> Result<Self, E32Error> {
        let settings: Settings =
            serde_json::from_str(text).map_err(|e| E32Error::Config(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn to_json(&self) -> Result<String, E32Error> {
        serde_json::to_string_pretty(self).map_err(|e| E32Error::Config(e.to_string()))
    }

    fn validate(&self) -> Result<(), E32Error> {
        if self.serial.baudrate == 0 {
            return Err(E32Error::Config("baudrate must be positive".into()));
        }
        if self.round_trip.timeout.is_zero() {
            return Err(E32Error::Config("round trip timeout must be positive".into()));
        }
        if self.round_trip.min_wait > self.round_trip.max_wait {
            return Err(E32Error::Config(format!(
                "min_wait ({:?}) exceeds max_wait ({:?})",
                self.round_trip.min_wait, self.round_trip.max_wait
            )));
        }
        Ok(())
    }
}

/// Serde adapter storing a `Duration` as whole milliseconds.
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
