//! # Mode and Ready Lines
//!
//! The E32 is steered by two outputs, M0 and M1, which select the operating
//! mode, and reports activity on one input, AUX, which is high while the
//! module is idle. The device controller receives these lines as an injected
//! [`ControlPins`] capability.

use crate::error::GpioError;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

pub mod mock;

#[cfg(feature = "raspberry-pi")]
pub mod raspberry_pi;

pub use mock::MockPins;

#[cfg(feature = "raspberry-pi")]
pub use raspberry_pi::RaspberryPiPins;

/// Access to the M0/M1 outputs and the AUX input.
pub trait ControlPins: Send {
    /// Drive M0 and M1 (`true` = high).
    fn set_mode_lines(&mut self, m0: bool, m1: bool);

    /// Instantaneous AUX level; `true` means the module is idle.
    fn read_ready(&self) -> bool;

    /// Forward every AUX edge to `tx`. Replaces an earlier subscription.
    fn watch_ready(&mut self, tx: mpsc::UnboundedSender<bool>) -> Result<(), GpioError>;

    /// Stop forwarding AUX edges. No-op without a subscription.
    fn unwatch_ready(&mut self) -> Result<(), GpioError>;
}

/// BCM pin numbers of the control lines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PinConfig {
    pub m0: u8,
    pub m1: u8,
    pub aux: u8,
}

impl Default for PinConfig {
    fn default() -> Self {
        Self {
            m0: 23,
            m1: 24,
            aux: 18,
        }
    }
}
