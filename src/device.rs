//! # E32 Device Controller
//!
//! [`E32`] owns the M0/M1/AUX lines and the record of the current operating
//! mode. Register access (configuration read/write, reset, version) is only
//! valid in [`OperatingMode::Sleep`]; in every other mode the serial line
//! carries air traffic and a register command would be transmitted over the
//! radio instead of being interpreted by the module.
//!
//! ```text
//! Mode          M0  M1  UART            Radio
//! Normal         0   0  open            transmit + receive
//! WakeUp         1   0  open            transmit with wake-up preamble
//! PowerSaving    0   1  closed          periodic listen
//! Sleep          1   1  register access off
//! ```
//!
//! Register replies are collected with [`crate::transport::receive`], bounded
//! by [`DeviceConfig::reply_timeout`].

use crate::codec::{Address, ConfigRegister, VersionInfo};
use crate::constants::{
    CMD_READ_CONFIG, CMD_READ_VERSION, CMD_RESET, CONFIG_HEAD_PERSISTENT, CONFIG_HEAD_VOLATILE,
    CONFIG_LEN, EVENT_CAPACITY, REPLY_TIMEOUT, RESET_SETTLE, RESYNC_QUIET, VERSION_LEN,
};
use crate::error::{E32Error, ValidationError};
use crate::gpio::ControlPins;
use crate::transport::{discard_until_quiet, Transport};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};

/// Operating modes selected by the M0/M1 lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperatingMode {
    Normal,
    WakeUp,
    PowerSaving,
    Sleep,
}

impl OperatingMode {
    /// Line levels `(M0, M1)` for this mode.
    pub fn lines(self) -> (bool, bool) {
        match self {
            OperatingMode::Normal => (false, false),
            OperatingMode::WakeUp => (true, false),
            OperatingMode::PowerSaving => (false, true),
            OperatingMode::Sleep => (true, true),
        }
    }

    pub fn from_lines(m0: bool, m1: bool) -> Self {
        match (m0, m1) {
            (false, false) => OperatingMode::Normal,
            (true, false) => OperatingMode::WakeUp,
            (false, true) => OperatingMode::PowerSaving,
            (true, true) => OperatingMode::Sleep,
        }
    }

    /// Whether the serial line carries air traffic in this mode.
    pub fn allows_traffic(self) -> bool {
        self != OperatingMode::Sleep
    }
}

impl fmt::Display for OperatingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperatingMode::Normal => "normal",
            OperatingMode::WakeUp => "wake-up",
            OperatingMode::PowerSaving => "power-saving",
            OperatingMode::Sleep => "sleep",
        };
        f.write_str(name)
    }
}

impl FromStr for OperatingMode {
    type Err = E32Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "normal" => Ok(OperatingMode::Normal),
            "wake-up" | "wakeup" => Ok(OperatingMode::WakeUp),
            "power-saving" | "powersaving" => Ok(OperatingMode::PowerSaving),
            "sleep" => Ok(OperatingMode::Sleep),
            other => Err(E32Error::Config(format!("unknown operating mode '{other}'"))),
        }
    }
}

/// Timing of register access.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Bound on every register reply.
    #[serde(with = "crate::config::duration_ms")]
    pub reply_timeout: Duration,
    /// Wait between the reset command and the read-back.
    #[serde(with = "crate::config::duration_ms")]
    pub reset_settle: Duration,
    /// AUX polling period in [`E32::wait_until_ready`].
    #[serde(with = "crate::config::duration_ms")]
    pub ready_poll_interval: Duration,
    /// Quiet gap that ends the discard after a failed register exchange.
    #[serde(with = "crate::config::duration_ms")]
    pub resync_quiet: Duration,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            reply_timeout: REPLY_TIMEOUT,
            reset_settle: RESET_SETTLE,
            ready_poll_interval: Duration::from_millis(2),
            resync_quiet: RESYNC_QUIET,
        }
    }
}

/// Notifications published by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEvent {
    ModeChanged(OperatingMode),
    /// AUX edge; `true` means the module went idle.
    ReadyChanged(bool),
}

/// Controller for one E32 module.
pub struct E32<P: ControlPins> {
    transport: Transport,
    pins: P,
    config: DeviceConfig,
    mode: watch::Sender<OperatingMode>,
    events: broadcast::Sender<DeviceEvent>,
    address: watch::Sender<Address>,
    register: Option<ConfigRegister>,
    version: Option<VersionInfo>,
    initialized: bool,
    /// A reply may still be on its way from a failed exchange.
    out_of_step: bool,
    ready_watcher: Option<JoinHandle<()>>,
    closed: bool,
}

impl<P: ControlPins> E32<P> {
    /// Takes ownership of the lines and drives them to Sleep.
    pub fn new(transport: Transport, pins: P) -> Self {
        Self::with_config(transport, pins, DeviceConfig::default())
    }

    pub fn with_config(transport: Transport, mut pins: P, config: DeviceConfig) -> Self {
        let (m0, m1) = OperatingMode::Sleep.lines();
        pins.set_mode_lines(m0, m1);
        transport.set_register_access(true);
        let (mode, _) = watch::channel(OperatingMode::Sleep);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (address, _) = watch::channel(ConfigRegister::default().address());

        E32 {
            transport,
            pins,
            config,
            mode,
            events,
            address,
            register: None,
            version: None,
            initialized: false,
            out_of_step: false,
            ready_watcher: None,
            closed: false,
        }
    }

    /// Drives M0/M1 for `mode`, then records it.
    ///
    /// In Sleep the transport is reserved for register access, so the data
    /// link ignores what arrives. Observers are notified only when the mode
    /// actually changes.
    pub fn set_mode(&mut self, mode: OperatingMode) {
        let (m0, m1) = mode.lines();
        self.pins.set_mode_lines(m0, m1);
        self.transport.set_register_access(!mode.allows_traffic());

        let previous = self.mode.send_replace(mode);
        if previous != mode {
            log::info!("E32 mode {previous} -> {mode}");
            let _ = self.events.send(DeviceEvent::ModeChanged(mode));
        }
    }

    pub fn mode(&self) -> OperatingMode {
        *self.mode.borrow()
    }

    /// Follows mode changes.
    pub fn mode_watch(&self) -> watch::Receiver<OperatingMode> {
        self.mode.subscribe()
    }

    /// Follows the module address as registers are read and written.
    pub fn address_watch(&self) -> watch::Receiver<Address> {
        self.address.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events.subscribe()
    }

    /// Instantaneous AUX level.
    pub fn is_ready(&self) -> bool {
        self.pins.read_ready()
    }

    /// Polls AUX until the module is idle.
    pub async fn wait_until_ready(&self, timeout: Duration) -> Result<(), E32Error> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.pins.read_ready() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                log::warn!("AUX stayed low for {timeout:?}");
                return Err(E32Error::ReadyTimeout(timeout));
            }
            sleep(self.config.ready_poll_interval).await;
        }
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Enters Sleep, starts the ready watcher, and reads configuration and
    /// version. Accessors fail with `NotReady` until this succeeds.
    pub async fn setup(&mut self) -> Result<(), E32Error> {
        if self.closed {
            return Err(E32Error::Closed);
        }

        self.set_mode(OperatingMode::Sleep);
        self.wait_until_ready(self.config.reply_timeout).await?;
        self.start_ready_watcher()?;

        let register = self.read_config().await?;
        let version = self.read_version().await?;
        self.initialized = true;

        log::info!("E32 ready: {version}, {register}");
        Ok(())
    }

    fn start_ready_watcher(&mut self) -> Result<(), E32Error> {
        if self.ready_watcher.is_some() {
            return Ok(());
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        self.pins.watch_ready(tx)?;

        let events = self.events.clone();
        self.ready_watcher = Some(tokio::spawn(async move {
            while let Some(level) = rx.recv().await {
                log::trace!("AUX {}", if level { "high" } else { "low" });
                let _ = events.send(DeviceEvent::ReadyChanged(level));
            }
        }));
        Ok(())
    }

    fn require_sleep(&self) -> Result<(), E32Error> {
        if self.closed {
            return Err(E32Error::Closed);
        }
        let actual = self.mode();
        if actual != OperatingMode::Sleep {
            log::error!("Register access attempted in {actual} mode");
            return Err(E32Error::IllegalState {
                required: OperatingMode::Sleep,
                actual,
            });
        }
        Ok(())
    }

    /// Reads and adopts the configuration register.
    pub async fn read_config(&mut self) -> Result<ConfigRegister, E32Error> {
        self.require_sleep()?;

        let reply = self.exchange(&CMD_READ_CONFIG, CONFIG_LEN).await?;
        let register = ConfigRegister::parse(&reply)?.validate()?;

        log::debug!("Read configuration {register}");
        self.adopt(register);
        Ok(register)
    }

    /// Writes `register` and adopts the module's echo, which may differ from
    /// what was sent.
    pub async fn write_config(
        &mut self,
        register: ConfigRegister,
    ) -> Result<ConfigRegister, E32Error> {
        self.require_sleep()?;

        if register.header != CONFIG_HEAD_PERSISTENT && register.header != CONFIG_HEAD_VOLATILE {
            return Err(ValidationError::BadHeader {
                expected: CONFIG_HEAD_PERSISTENT,
                actual: register.header,
            }
            .into());
        }

        let reply = self.exchange(&register.serialize(), CONFIG_LEN).await?;
        let echoed = ConfigRegister::parse(&reply)?.expect_header(register.header)?;

        if echoed != register {
            log::warn!("Module adjusted the written configuration: sent {register}, kept {echoed}");
        }
        self.adopt(echoed);
        Ok(echoed)
    }

    /// Resets the module and reads the configuration back.
    pub async fn reset_config(&mut self) -> Result<ConfigRegister, E32Error> {
        self.require_sleep()?;
        self.resync().await?;

        self.transport.write(&CMD_RESET).await?;
        log::info!("E32 reset, settling for {:?}", self.config.reset_settle);
        sleep(self.config.reset_settle).await;

        self.read_config().await
    }

    pub async fn read_version(&mut self) -> Result<VersionInfo, E32Error> {
        self.require_sleep()?;

        let reply = self.exchange(&CMD_READ_VERSION, VERSION_LEN).await?;
        let version = VersionInfo::parse(&reply)?;

        self.version = Some(version);
        Ok(version)
    }

    /// Writes `command` and collects the reply, first clearing out any late
    /// reply left over from an earlier failed exchange.
    async fn exchange(&mut self, command: &[u8], reply_len: usize) -> Result<Vec<u8>, E32Error> {
        self.resync().await?;

        let result = self
            .transport
            .request(command, reply_len, self.config.reply_timeout)
            .await;
        match &result {
            Err(E32Error::Timeout { .. }) => self.out_of_step = true,
            Ok(reply) if reply.len() != reply_len => self.out_of_step = true,
            _ => {}
        }
        result
    }

    async fn resync(&mut self) -> Result<(), E32Error> {
        if !self.out_of_step {
            return Ok(());
        }

        let mut rx = self.transport.subscribe();
        self.wait_until_ready(self.config.reply_timeout).await?;
        let discarded =
            discard_until_quiet(&mut rx, self.config.resync_quiet, self.config.reply_timeout)
                .await?;
        if discarded > 0 {
            log::warn!("Discarded {discarded} bytes of a late register reply");
        }
        self.out_of_step = false;
        Ok(())
    }

    fn adopt(&mut self, register: ConfigRegister) {
        self.register = Some(register);
        self.address.send_if_modified(|current| {
            let changed = *current != register.address();
            *current = register.address();
            changed
        });
    }

    /// Last configuration read or written.
    pub fn config(&self) -> Result<ConfigRegister, E32Error> {
        if !self.initialized {
            return Err(E32Error::NotReady);
        }
        self.register.ok_or(E32Error::NotReady)
    }

    pub fn version(&self) -> Result<VersionInfo, E32Error> {
        if !self.initialized {
            return Err(E32Error::NotReady);
        }
        self.version.ok_or(E32Error::NotReady)
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Releases the ready watcher. Register operations fail with `Closed`
    /// afterwards; the transport stays open for the data link.
    pub fn close(&mut self) -> Result<(), E32Error> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        if let Some(watcher) = self.ready_watcher.take() {
            watcher.abort();
            self.pins.unwatch_ready()?;
        }
        log::debug!("E32 controller closed");
        Ok(())
    }
}

impl<P: ControlPins> Drop for E32<P> {
    fn drop(&mut self) {
        if let Some(watcher) = self.ready_watcher.take() {
            watcher.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpio::MockPins;
    use tokio::io::{duplex, AsyncReadExt};

    #[test]
    fn test_mode_line_table() {
        for mode in [
            OperatingMode::Normal,
            OperatingMode::WakeUp,
            OperatingMode::PowerSaving,
            OperatingMode::Sleep,
        ] {
            let (m0, m1) = mode.lines();
            assert_eq!(OperatingMode::from_lines(m0, m1), mode);
        }
        assert_eq!(OperatingMode::WakeUp.lines(), (true, false));
        assert_eq!(OperatingMode::PowerSaving.lines(), (false, true));
        assert!(!OperatingMode::Sleep.allows_traffic());
        assert!(OperatingMode::PowerSaving.allows_traffic());
    }

    #[test]
    fn test_mode_from_str() {
        assert_eq!("Sleep".parse::<OperatingMode>().unwrap(), OperatingMode::Sleep);
        assert_eq!("wake-up".parse::<OperatingMode>().unwrap(), OperatingMode::WakeUp);
        assert!("turbo".parse::<OperatingMode>().is_err());
    }

    #[tokio::test]
    async fn test_construction_drives_sleep() {
        let (host, _far) = duplex(64);
        let pins = MockPins::new();
        let device = E32::new(Transport::new(host), pins.clone());

        assert_eq!(device.mode(), OperatingMode::Sleep);
        assert_eq!(pins.mode(), OperatingMode::Sleep);
        assert!(device.transport().is_register_access());
    }

    #[tokio::test]
    async fn test_set_mode_drives_lines_and_notifies() {
        let (host, _far) = duplex(64);
        let pins = MockPins::new();
        let mut device = E32::new(Transport::new(host), pins.clone());
        let mut events = device.subscribe();
        let mut watch = device.mode_watch();

        device.set_mode(OperatingMode::Normal);
        device.set_mode(OperatingMode::Normal);

        assert_eq!(pins.mode_lines(), (false, false));
        assert!(!device.transport().is_register_access());
        assert_eq!(
            events.try_recv().unwrap(),
            DeviceEvent::ModeChanged(OperatingMode::Normal)
        );
        assert!(events.try_recv().is_err());
        assert!(watch.has_changed().unwrap());
        assert_eq!(*watch.borrow_and_update(), OperatingMode::Normal);
    }

    #[tokio::test]
    async fn test_register_access_outside_sleep_writes_nothing() {
        let (host, mut far) = duplex(64);
        let mut device = E32::new(Transport::new(host), MockPins::new());
        device.set_mode(OperatingMode::Normal);

        let err = device.read_config().await.unwrap_err();
        assert_eq!(
            err,
            E32Error::IllegalState {
                required: OperatingMode::Sleep,
                actual: OperatingMode::Normal
            }
        );
        assert!(device.read_version().await.is_err());
        assert!(device.reset_config().await.is_err());

        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_millis(30), far.read(&mut buf)).await;
        assert!(read.is_err(), "controller wrote to the transport");
    }

    #[tokio::test]
    async fn test_accessors_before_setup() {
        let (host, _far) = duplex(64);
        let device = E32::new(Transport::new(host), MockPins::new());
        assert_eq!(device.config(), Err(E32Error::NotReady));
        assert_eq!(device.version(), Err(E32Error::NotReady));
    }

    #[tokio::test]
    async fn test_wait_until_ready_times_out() {
        let (host, _far) = duplex(64);
        let pins = MockPins::new();
        pins.set_ready(false);
        let device = E32::new(Transport::new(host), pins.clone());

        let timeout = Duration::from_millis(20);
        assert_eq!(
            device.wait_until_ready(timeout).await,
            Err(E32Error::ReadyTimeout(timeout))
        );

        pins.set_ready(true);
        assert!(device.wait_until_ready(timeout).await.is_ok());
    }

    #[tokio::test]
    async fn test_write_rejects_unknown_header() {
        let (host, _far) = duplex(64);
        let mut device = E32::new(Transport::new(host), MockPins::new());
        let register = ConfigRegister {
            header: 0xAA,
            ..ConfigRegister::default()
        };

        assert!(matches!(
            device.write_config(register).await,
            Err(E32Error::Validation(ValidationError::BadHeader { actual: 0xAA, .. }))
        ));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_final() {
        let (host, _far) = duplex(64);
        let mut device = E32::new(Transport::new(host), MockPins::new());

        device.close().unwrap();
        device.close().unwrap();

        assert!(device.is_closed());
        assert_eq!(device.read_config().await, Err(E32Error::Closed));
        assert_eq!(device.setup().await, Err(E32Error::Closed));
    }
}
