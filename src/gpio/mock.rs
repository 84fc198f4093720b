//! In-memory control lines.
//!
//! Used by the tests, by the simulated module, and by the command-line tool
//! on hosts without GPIO access. Clones share state, so a test can keep one
//! handle while the device owns another.

use super::ControlPins;
use crate::device::OperatingMode;
use crate::error::GpioError;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

#[derive(Debug)]
struct PinState {
    m0: bool,
    m1: bool,
    aux: bool,
    watcher: Option<mpsc::UnboundedSender<bool>>,
    history: Vec<OperatingMode>,
}

#[derive(Debug, Clone)]
pub struct MockPins {
    state: Arc<Mutex<PinState>>,
}

impl Default for MockPins {
    fn default() -> Self {
        Self::new()
    }
}

impl MockPins {
    /// Lines start low with AUX high (idle).
    pub fn new() -> Self {
        MockPins {
            state: Arc::new(Mutex::new(PinState {
                m0: false,
                m1: false,
                aux: true,
                watcher: None,
                history: Vec::new(),
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, PinState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current (M0, M1) levels.
    pub fn mode_lines(&self) -> (bool, bool) {
        let state = self.state();
        (state.m0, state.m1)
    }

    /// Mode currently selected by the lines.
    pub fn mode(&self) -> OperatingMode {
        let (m0, m1) = self.mode_lines();
        OperatingMode::from_lines(m0, m1)
    }

    /// Every mode the lines were driven to, oldest first.
    pub fn history(&self) -> Vec<OperatingMode> {
        self.state().history.clone()
    }

    /// Simulate an AUX transition; watchers see only real edges.
    pub fn set_ready(&self, level: bool) {
        let mut state = self.state();
        if state.aux == level {
            return;
        }
        state.aux = level;
        if let Some(tx) = &state.watcher {
            let _ = tx.send(level);
        }
    }

    pub fn is_watched(&self) -> bool {
        self.state().watcher.is_some()
    }
}

impl ControlPins for MockPins {
    fn set_mode_lines(&mut self, m0: bool, m1: bool) {
        let mut state = self.state();
        state.m0 = m0;
        state.m1 = m1;
        state.history.push(OperatingMode::from_lines(m0, m1));
    }

    fn read_ready(&self) -> bool {
        self.state().aux
    }

    fn watch_ready(&mut self, tx: mpsc::UnboundedSender<bool>) -> Result<(), GpioError> {
        self.state().watcher = Some(tx);
        Ok(())
    }

    fn unwatch_ready(&mut self) -> Result<(), GpioError> {
        self.state().watcher = None;
        Ok(())
    }
}
