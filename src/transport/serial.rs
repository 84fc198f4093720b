//! # Serial Port Transport
//!
//! Opens the UART the E32 hangs off and hands it to [`Transport`]. The module
//! ships at 9600 baud 8N1; the UART parity and rate stored in its
//! configuration register must match what is configured here.

use super::Transport;
use crate::error::E32Error;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_serial::SerialPortBuilderExt;

/// UART parity on the host side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
}

impl From<Parity> for tokio_serial::Parity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Odd => tokio_serial::Parity::Odd,
            Parity::Even => tokio_serial::Parity::Even,
        }
    }
}

/// Configuration for serial connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    pub port: String,
    pub baudrate: u32,
    pub parity: Parity,
    #[serde(with = "crate::config::duration_ms")]
    pub timeout: Duration,
}

impl Default for SerialConfig {
    fn default() -> Self {
        SerialConfig {
            port: "/dev/serial0".to_string(),
            baudrate: 9600,
            parity: Parity::None,
            timeout: Duration::from_secs(1),
        }
    }
}

impl Transport {
    /// Opens the serial port described by `config`.
    ///
    /// Must be called inside a tokio runtime; the port registers with its
    /// reactor.
    pub fn open(config: &SerialConfig) -> Result<Self, E32Error> {
        let port = tokio_serial::new(&config.port, config.baudrate)
            .data_bits(tokio_serial::DataBits::Eight)
            .stop_bits(tokio_serial::StopBits::One)
            .parity(config.parity.into())
            .timeout(config.timeout)
            .open_native_async()
            .map_err(|e| E32Error::Transport(format!("{}: {e}", config.port)))?;

        log::info!(
            "Opened {} at {} baud ({:?} parity)",
            config.port,
            config.baudrate,
            config.parity
        );
        Ok(Transport::new(port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_matches_factory_uart() {
        let config = SerialConfig::default();
        assert_eq!(config.baudrate, 9600);
        assert_eq!(config.parity, Parity::None);
    }

    #[test]
    fn test_parity_names() {
        let parity: Parity = serde_json::from_str("\"even\"").unwrap();
        assert_eq!(parity, Parity::Even);
        assert_eq!(
            tokio_serial::Parity::from(parity),
            tokio_serial::Parity::Even
        );
    }

    #[tokio::test]
    async fn test_open_missing_port_fails() {
        let config = SerialConfig {
            port: "/dev/does-not-exist-e32".to_string(),
            ..SerialConfig::default()
        };
        match Transport::open(&config) {
            Err(E32Error::Transport(msg)) => assert!(msg.contains("does-not-exist")),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("opened a port that does not exist"),
        }
    }
}
