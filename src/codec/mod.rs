//! Stateless wire codecs for the configuration register, the version reply
//! and the broadcast envelope.

pub mod config;
pub mod envelope;
pub mod version;

pub use config::{
    Address, AirDataRate, ConfigRegister, IoDriveMode, Options, Speed, TransmissionMode,
    TransmitPower, UartBaudRate, UartParity, WakeUpTime,
};
pub use envelope::BroadcastEnvelope;
pub use version::VersionInfo;
