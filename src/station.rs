//! # Station
//!
//! A [`Station`] wires the pieces for one module together: the controller and
//! the data link share one transport. The controller reserves that transport
//! for register access while in Sleep, so register replies never reach the
//! frame decoder.

use crate::broadcast::BroadcastLayer;
use crate::codec::ConfigRegister;
use crate::config::Settings;
use crate::device::{OperatingMode, E32};
use crate::error::E32Error;
use crate::gpio::ControlPins;
use crate::link::DataLink;
use crate::round_trip::RoundTripper;
use crate::transport::Transport;

pub struct Station<P: ControlPins> {
    device: E32<P>,
    link: DataLink,
    round_trip: RoundTripper,
    settings: Settings,
}

impl<P: ControlPins> Station<P> {
    /// Opens the serial port named in `settings`.
    pub fn open(settings: Settings, pins: P) -> Result<Self, E32Error> {
        let transport = Transport::open(&settings.serial)?;
        Ok(Self::with_transport(transport, pins, settings))
    }

    pub fn with_transport(transport: Transport, pins: P, settings: Settings) -> Self {
        let device = E32::with_config(transport.clone(), pins, settings.device.clone());
        let link = DataLink::with_config(transport, settings.link.clone());
        let round_trip = RoundTripper::with_config(link.clone(), settings.round_trip.clone());

        Station {
            device,
            link,
            round_trip,
            settings,
        }
    }

    /// Reads the registers, then puts the module in Normal mode.
    pub async fn start(&mut self) -> Result<ConfigRegister, E32Error> {
        self.device.setup().await?;
        self.device.set_mode(OperatingMode::Normal);
        self.device
            .wait_until_ready(self.settings.device.reply_timeout)
            .await?;
        self.device.config()
    }

    /// Writes `register` from Sleep and returns to the previous mode,
    /// whether or not the write succeeded.
    pub async fn reconfigure(
        &mut self,
        register: ConfigRegister,
    ) -> Result<ConfigRegister, E32Error> {
        let previous = self.device.mode();
        self.device.set_mode(OperatingMode::Sleep);

        let result = match self
            .device
            .wait_until_ready(self.settings.device.reply_timeout)
            .await
        {
            Ok(()) => self.device.write_config(register).await,
            Err(e) => Err(e),
        };

        self.device.set_mode(previous);
        result
    }

    /// Broadcasts tagged with the module's own address, which follows later
    /// reconfigurations. Requires [`Station::start`].
    pub fn broadcaster(&self) -> Result<BroadcastLayer, E32Error> {
        self.device.config()?;
        Ok(BroadcastLayer::following(
            self.link.clone(),
            self.device.address_watch(),
        ))
    }

    pub fn device(&self) -> &E32<P> {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut E32<P> {
        &mut self.device
    }

    pub fn link(&self) -> &DataLink {
        &self.link
    }

    pub fn round_tripper(&self) -> &RoundTripper {
        &self.round_trip
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Closes the link and the controller. Idempotent.
    pub fn close(&mut self) -> Result<(), E32Error> {
        self.link.close();
        self.device.close()
    }
}
