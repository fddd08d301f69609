use super::{MasterTimer, SerialPort, Timer};
use crate::error::{ModbusError, Result};
use crate::types::LineSettings;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// Shared record of port calls, used to assert ordering across layers
pub type CallLog = Arc<Mutex<Vec<String>>>;

pub fn call_log() -> CallLog {
    Arc::new(Mutex::new(Vec::new()))
}

#[derive(Debug, Default)]
struct SerialState {
    settings: Option<LineSettings>,
    rx: VecDeque<u8>,
    tx: Vec<u8>,
    rx_enabled: bool,
    tx_enabled: bool,
    closed: u32,
}

/// Mock serial port. Clones share the same state so a test can keep a
/// handle after moving the port into a framer.
#[derive(Clone, Default)]
pub struct MockSerial {
    state: Arc<Mutex<SerialState>>,
    fail_init: bool,
    has_close: bool,
}

impl MockSerial {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a mock port whose low-level init fails
    pub fn new_error() -> Self {
        Self {
            fail_init: true,
            ..Self::default()
        }
    }

    /// Creates a mock port that exposes a close operation
    pub fn with_close() -> Self {
        Self {
            has_close: true,
            ..Self::default()
        }
    }

    /// Queues bytes to be returned by subsequent `get_byte` calls
    pub fn feed(&self, bytes: &[u8]) {
        self.state.lock().rx.extend(bytes.iter().copied());
    }

    /// Takes all bytes written so far
    pub fn take_written(&self) -> Vec<u8> {
        std::mem::take(&mut self.state.lock().tx)
    }

    pub fn settings(&self) -> Option<LineSettings> {
        self.state.lock().settings
    }

    pub fn rx_enabled(&self) -> bool {
        self.state.lock().rx_enabled
    }

    pub fn tx_enabled(&self) -> bool {
        self.state.lock().tx_enabled
    }

    pub fn close_count(&self) -> u32 {
        self.state.lock().closed
    }
}

impl SerialPort for MockSerial {
    fn init(&mut self, settings: &LineSettings) -> Result<()> {
        if self.fail_init {
            return Err(ModbusError::PortError("mock init failure".into()));
        }
        self.state.lock().settings = Some(*settings);
        Ok(())
    }

    fn enable(&mut self, rx_enable: bool, tx_enable: bool) {
        let mut state = self.state.lock();
        state.rx_enabled = rx_enable;
        state.tx_enabled = tx_enable;
    }

    fn get_byte(&mut self) -> Option<u8> {
        self.state.lock().rx.pop_front()
    }

    fn put_byte(&mut self, byte: u8) -> bool {
        self.state.lock().tx.push(byte);
        true
    }

    fn supports_close(&self) -> bool {
        self.has_close
    }

    fn close(&mut self) -> Result<()> {
        self.state.lock().closed += 1;
        Ok(())
    }
}

/// Mock inter-frame timer tracking its period and whether it is armed
#[derive(Clone, Default)]
pub struct MockTimer {
    armed: Arc<Mutex<bool>>,
    timeout_50us: Arc<Mutex<Option<u16>>>,
}

impl MockTimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_armed(&self) -> bool {
        *self.armed.lock()
    }

    /// Period passed to `init`, if it was called
    pub fn timeout_50us(&self) -> Option<u16> {
        *self.timeout_50us.lock()
    }
}

impl Timer for MockTimer {
    fn init(&mut self, timeout_50us: u16) -> Result<()> {
        *self.timeout_50us.lock() = Some(timeout_50us);
        Ok(())
    }

    fn enable(&mut self) {
        *self.armed.lock() = true;
    }

    fn disable(&mut self) {
        *self.armed.lock() = false;
    }
}

/// Mock response timer that records every call into a [`CallLog`]
#[derive(Clone)]
pub struct MockMasterTimer {
    log: CallLog,
    armed: Arc<Mutex<Option<u32>>>,
}

impl MockMasterTimer {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            armed: Arc::new(Mutex::new(None)),
        }
    }

    pub fn armed_timeout(&self) -> Option<u32> {
        *self.armed.lock()
    }
}

impl MasterTimer for MockMasterTimer {
    fn enable(&mut self, timeout_ms: u32) {
        self.log.lock().push(format!("timer.enable({})", timeout_ms));
        *self.armed.lock() = Some(timeout_ms);
    }

    fn disable(&mut self) {
        self.log.lock().push("timer.disable".to_string());
        *self.armed.lock() = None;
    }
}
