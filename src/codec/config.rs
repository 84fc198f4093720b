//! # Configuration Register Codec
//!
//! Bit-exact conversion between the six-byte E32 parameter block and typed
//! fields. Every sub-field covers its whole bit range, so any six bytes parse
//! and serialize back to themselves.
//!
//! ```text
//! byte 0  HEAD    0xC0 (persistent) / 0xC2 (volatile)
//! byte 1  ADDH
//! byte 2  ADDL
//! byte 3  SPED    [7:6] parity  [5:3] UART baud  [2:0] air data rate
//! byte 4  CHAN
//! byte 5  OPTION  [7] fixed  [6] IO drive  [5:3] wake-up  [2] FEC  [1:0] power
//! ```

use crate::constants::{
    BASE_FREQUENCY_MHZ, CONFIG_HEAD_PERSISTENT, CONFIG_HEAD_VOLATILE, CONFIG_LEN,
};
use crate::error::{ParseError, ValidationError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// 16-bit station address, `ADDH << 8 | ADDL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Address(pub u16);

impl Address {
    /// Address that every station accepts.
    pub const BROADCAST: Address = Address(crate::constants::BROADCAST_ADDRESS);

    pub fn from_bytes(high: u8, low: u8) -> Self {
        Address(u16::from_be_bytes([high, low]))
    }

    pub fn high(self) -> u8 {
        self.0.to_be_bytes()[0]
    }

    pub fn low(self) -> u8 {
        self.0.to_be_bytes()[1]
    }
}

impl From<u16> for Address {
    fn from(value: u16) -> Self {
        Address(value)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04X}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UartParity {
    #[default]
    Parity8N1 = 0b00,
    Parity8O1 = 0b01,
    Parity8E1 = 0b10,
    /// Same as 8N1; kept distinct so the register round-trips.
    Parity8N1Alt = 0b11,
}

impl From<u8> for UartParity {
    fn from(value: u8) -> Self {
        match value & 0b11 {
            0b00 => Self::Parity8N1,
            0b01 => Self::Parity8O1,
            0b10 => Self::Parity8E1,
            _ => Self::Parity8N1Alt,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UartBaudRate {
    Bps1200 = 0b000,
    Bps2400 = 0b001,
    Bps4800 = 0b010,
    #[default]
    Bps9600 = 0b011,
    Bps19200 = 0b100,
    Bps38400 = 0b101,
    Bps57600 = 0b110,
    Bps115200 = 0b111,
}

impl UartBaudRate {
    pub fn bits_per_second(self) -> u32 {
        match self {
            Self::Bps1200 => 1200,
            Self::Bps2400 => 2400,
            Self::Bps4800 => 4800,
            Self::Bps9600 => 9600,
            Self::Bps19200 => 19200,
            Self::Bps38400 => 38400,
            Self::Bps57600 => 57600,
            Self::Bps115200 => 115200,
        }
    }
}

impl From<u8> for UartBaudRate {
    fn from(value: u8) -> Self {
        match value & 0b111 {
            0b000 => Self::Bps1200,
            0b001 => Self::Bps2400,
            0b010 => Self::Bps4800,
            0b011 => Self::Bps9600,
            0b100 => Self::Bps19200,
            0b101 => Self::Bps38400,
            0b110 => Self::Bps57600,
            _ => Self::Bps115200,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AirDataRate {
    Bps300 = 0b000,
    Bps1200 = 0b001,
    #[default]
    Bps2400 = 0b010,
    Bps4800 = 0b011,
    Bps9600 = 0b100,
    Bps19200 = 0b101,
    Bps19200Alt = 0b110,
    Bps19200Alt2 = 0b111,
}

impl AirDataRate {
    pub fn bits_per_second(self) -> u32 {
        match self {
            Self::Bps300 => 300,
            Self::Bps1200 => 1200,
            Self::Bps2400 => 2400,
            Self::Bps4800 => 4800,
            Self::Bps9600 => 9600,
            Self::Bps19200 | Self::Bps19200Alt | Self::Bps19200Alt2 => 19200,
        }
    }
}

impl From<u8> for AirDataRate {
    fn from(value: u8) -> Self {
        match value & 0b111 {
            0b000 => Self::Bps300,
            0b001 => Self::Bps1200,
            0b010 => Self::Bps2400,
            0b011 => Self::Bps4800,
            0b100 => Self::Bps9600,
            0b101 => Self::Bps19200,
            0b110 => Self::Bps19200Alt,
            _ => Self::Bps19200Alt2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransmissionMode {
    #[default]
    Transparent = 0b0,
    /// First three bytes of each packet are ADDH, ADDL, CHAN of the target.
    Fixed = 0b1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IoDriveMode {
    OpenCollector = 0b0,
    #[default]
    PushPull = 0b1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WakeUpTime {
    #[default]
    Ms250 = 0b000,
    Ms500 = 0b001,
    Ms750 = 0b010,
    Ms1000 = 0b011,
    Ms1250 = 0b100,
    Ms1500 = 0b101,
    Ms1750 = 0b110,
    Ms2000 = 0b111,
}

impl WakeUpTime {
    pub fn millis(self) -> u32 {
        (self as u32 + 1) * 250
    }
}

impl From<u8> for WakeUpTime {
    fn from(value: u8) -> Self {
        match value & 0b111 {
            0b000 => Self::Ms250,
            0b001 => Self::Ms500,
            0b010 => Self::Ms750,
            0b011 => Self::Ms1000,
            0b100 => Self::Ms1250,
            0b101 => Self::Ms1500,
            0b110 => Self::Ms1750,
            _ => Self::Ms2000,
        }
    }
}

/// Output power levels of the 1 W modules; the 100 mW parts map the same
/// codes to 20/17/14/10 dBm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransmitPower {
    #[default]
    Dbm30 = 0b00,
    Dbm27 = 0b01,
    Dbm24 = 0b10,
    Dbm21 = 0b11,
}

impl From<u8> for TransmitPower {
    fn from(value: u8) -> Self {
        match value & 0b11 {
            0b00 => Self::Dbm30,
            0b01 => Self::Dbm27,
            0b10 => Self::Dbm24,
            _ => Self::Dbm21,
        }
    }
}

/// The SPED byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Speed {
    pub parity: UartParity,
    pub baud_rate: UartBaudRate,
    pub air_data_rate: AirDataRate,
}

impl From<u8> for Speed {
    fn from(value: u8) -> Self {
        Self {
            parity: UartParity::from(value >> 6),
            baud_rate: UartBaudRate::from(value >> 3),
            air_data_rate: AirDataRate::from(value),
        }
    }
}

impl From<Speed> for u8 {
    fn from(speed: Speed) -> Self {
        ((speed.parity as u8) << 6) | ((speed.baud_rate as u8) << 3) | speed.air_data_rate as u8
    }
}

/// The OPTION byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Options {
    pub transmission: TransmissionMode,
    pub io_drive: IoDriveMode,
    pub wake_up_time: WakeUpTime,
    pub fec: bool,
    pub power: TransmitPower,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            transmission: TransmissionMode::Transparent,
            io_drive: IoDriveMode::PushPull,
            wake_up_time: WakeUpTime::Ms250,
            fec: true,
            power: TransmitPower::Dbm30,
        }
    }
}

impl From<u8> for Options {
    fn from(value: u8) -> Self {
        Self {
            transmission: if value & 0x80 != 0 {
                TransmissionMode::Fixed
            } else {
                TransmissionMode::Transparent
            },
            io_drive: if value & 0x40 != 0 {
                IoDriveMode::PushPull
            } else {
                IoDriveMode::OpenCollector
            },
            wake_up_time: WakeUpTime::from(value >> 3),
            fec: value & 0x04 != 0,
            power: TransmitPower::from(value),
        }
    }
}

impl From<Options> for u8 {
    fn from(option: Options) -> Self {
        ((option.transmission as u8) << 7)
            | ((option.io_drive as u8) << 6)
            | ((option.wake_up_time as u8) << 3)
            | ((option.fec as u8) << 2)
            | option.power as u8
    }
}

/// The six-byte parameter block of the module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigRegister {
    pub header: u8,
    pub high_address: u8,
    pub low_address: u8,
    pub speed: Speed,
    pub channel: u8,
    pub options: Options,
}

impl Default for ConfigRegister {
    /// Factory settings: `C0 00 00 1A 17 44`.
    fn default() -> Self {
        Self {
            header: CONFIG_HEAD_PERSISTENT,
            high_address: 0x00,
            low_address: 0x00,
            speed: Speed::default(),
            channel: 0x17,
            options: Options::default(),
        }
    }
}

impl ConfigRegister {
    /// Unpacks a register reply. Fails unless `bytes` is exactly six long.
    pub fn parse(bytes: &[u8]) -> Result<Self, ParseError> {
        let raw: [u8; CONFIG_LEN] =
            bytes.try_into().map_err(|_| ParseError::WrongLength {
                expected: CONFIG_LEN,
                actual: bytes.len(),
            })?;

        Ok(Self {
            header: raw[0],
            high_address: raw[1],
            low_address: raw[2],
            speed: Speed::from(raw[3]),
            channel: raw[4],
            options: Options::from(raw[5]),
        })
    }

    /// Checks the read-back sentinel.
    pub fn validate(self) -> Result<Self, ValidationError> {
        self.expect_header(CONFIG_HEAD_PERSISTENT)
    }

    /// Checks that the header is `expected`, e.g. the header of a write being echoed.
    pub fn expect_header(self, expected: u8) -> Result<Self, ValidationError> {
        if self.header == expected {
            Ok(self)
        } else {
            Err(ValidationError::BadHeader {
                expected,
                actual: self.header,
            })
        }
    }

    pub fn serialize(&self) -> [u8; CONFIG_LEN] {
        [
            self.header,
            self.high_address,
            self.low_address,
            self.speed.into(),
            self.channel,
            self.options.into(),
        ]
    }

    pub fn address(&self) -> Address {
        Address::from_bytes(self.high_address, self.low_address)
    }

    pub fn with_address(mut self, address: Address) -> Self {
        self.high_address = address.high();
        self.low_address = address.low();
        self
    }

    pub fn with_channel(mut self, channel: u8) -> Self {
        self.channel = channel;
        self
    }

    pub fn with_speed(mut self, speed: Speed) -> Self {
        self.speed = speed;
        self
    }

    pub fn with_options(mut self, options: Options) -> Self {
        self.options = options;
        self
    }

    /// Selects whether a write survives a power cycle.
    pub fn with_persistence(mut self, persistent: bool) -> Self {
        self.header = if persistent {
            CONFIG_HEAD_PERSISTENT
        } else {
            CONFIG_HEAD_VOLATILE
        };
        self
    }

    pub fn is_persistent(&self) -> bool {
        self.header == CONFIG_HEAD_PERSISTENT
    }

    /// Carrier frequency for the 433 MHz series.
    pub fn frequency_mhz(&self) -> u32 {
        BASE_FREQUENCY_MHZ + self.channel as u32
    }
}

impl TryFrom<&[u8]> for ConfigRegister {
    type Error = ParseError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        ConfigRegister::parse(value)
    }
}

impl From<ConfigRegister> for [u8; CONFIG_LEN] {
    fn from(cfg: ConfigRegister) -> Self {
        cfg.serialize()
    }
}

impl fmt::Display for ConfigRegister {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "address {} channel {} ({} MHz), uart {} bps {:?}, air {} bps, {:?}, {:?}, wake-up {} ms, fec {}, power {:?}{}",
            self.address(),
            self.channel,
            self.frequency_mhz(),
            self.speed.baud_rate.bits_per_second(),
            self.speed.parity,
            self.speed.air_data_rate.bits_per_second(),
            self.options.transmission,
            self.options.io_drive,
            self.options.wake_up_time.millis(),
            if self.options.fec { "on" } else { "off" },
            self.options.power,
            if self.is_persistent() { "" } else { " (volatile)" },
        )
    }
}
