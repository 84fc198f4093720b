//! # Raspberry Pi Control Lines
//!
//! M0/M1/AUX on the 40-pin header through `rppal`.
//!
//! ```text
//! Pi Pin │ BCM GPIO │ E32 Pin │ Function
//! ───────┼──────────┼─────────┼──────────────────
//! 16     │ GPIO 23  │ M0      │ Mode select (out)
//! 18     │ GPIO 24  │ M1      │ Mode select (out)
//! 12     │ GPIO 18  │ AUX     │ Ready/busy (in)
//! 8      │ GPIO 14  │ RXD     │ UART TX
//! 10     │ GPIO 15  │ TXD     │ UART RX
//! ```

use super::{ControlPins, PinConfig};
use crate::error::GpioError;
use rppal::gpio::{Gpio, InputPin, Level, OutputPin, Trigger};
use tokio::sync::mpsc;

pub struct RaspberryPiPins {
    m0: OutputPin,
    m1: OutputPin,
    aux: InputPin,
    aux_pin: u8,
}

impl RaspberryPiPins {
    /// Claims the pins. Both mode lines start high, i.e. in Sleep.
    pub fn new(config: &PinConfig) -> Result<Self, GpioError> {
        let gpio = Gpio::new().map_err(|e| GpioError::Init(e.to_string()))?;

        let claim = |pin: u8| {
            gpio.get(pin)
                .map_err(|e| GpioError::Init(format!("GPIO {pin}: {e}")))
        };

        let mut m0 = claim(config.m0)?.into_output();
        let mut m1 = claim(config.m1)?.into_output();
        m0.set_high();
        m1.set_high();
        let aux = claim(config.aux)?.into_input_pullup();

        log::info!(
            "Raspberry Pi control lines: M0 GPIO {}, M1 GPIO {}, AUX GPIO {}",
            config.m0,
            config.m1,
            config.aux
        );

        Ok(Self {
            m0,
            m1,
            aux,
            aux_pin: config.aux,
        })
    }
}

fn drive(pin: &mut OutputPin, high: bool) {
    if high {
        pin.set_high();
    } else {
        pin.set_low();
    }
}

impl ControlPins for RaspberryPiPins {
    fn set_mode_lines(&mut self, m0: bool, m1: bool) {
        drive(&mut self.m0, m0);
        drive(&mut self.m1, m1);
    }

    fn read_ready(&self) -> bool {
        self.aux.is_high()
    }

    fn watch_ready(&mut self, tx: mpsc::UnboundedSender<bool>) -> Result<(), GpioError> {
        let pin = self.aux_pin;
        self.aux
            .set_async_interrupt(Trigger::Both, move |level| {
                let _ = tx.send(level == Level::High);
            })
            .map_err(|e| GpioError::Interrupt {
                pin,
                reason: e.to_string(),
            })
    }

    fn unwatch_ready(&mut self) -> Result<(), GpioError> {
        let pin = self.aux_pin;
        self.aux
            .clear_async_interrupt()
            .map_err(|e| GpioError::Interrupt {
                pin,
                reason: e.to_string(),
            })
    }
}
