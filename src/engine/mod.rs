//! Master-mode protocol engine.
//!
//! The engine owns the lifecycle state, the transport binding selected at
//! init, the function handler table and the response turnaround timer. The
//! host application drives it by calling [`Engine::poll`] in a loop; every
//! call handles at most one event from the queue:
//!
//! ```text
//! FrameSent      -> arm response timer
//! FrameReceived  -> disarm timer, decode frame, post Execute
//! Execute        -> dispatch the PDU to its function handler
//! Timeout        -> record the turnaround failure
//! ```
//!
//! # Examples
//!
//! ```rust,no_run
//! use libmodbus::engine::{Engine, EngineConfig};
//! use libmodbus::event::{EventQueue, FifoQueue};
//! use libmodbus::function::{handler, Exception, FUNC_READ_HOLDING_REGISTER};
//! use libmodbus::port::DeadlineTimer;
//! use libmodbus::transport::PortIo;
//! use libmodbus::types::{Mode, Parity};
//! use std::sync::Arc;
//!
//! # fn run(io: PortIo) -> libmodbus::error::Result<()> {
//! let queue: Arc<dyn EventQueue> = Arc::new(FifoQueue::default());
//! let timer = DeadlineTimer::new(queue.clone());
//! let mut engine = Engine::new(EngineConfig::default(), queue, timer.clone())?;
//!
//! engine.init(Mode::Rtu, 0x01, 1, 19200, Parity::Even, io)?;
//! engine.register_handler(
//!     FUNC_READ_HOLDING_REGISTER,
//!     Some(handler(|_pdu, _len| Exception::None)),
//! )?;
//! engine.enable()?;
//!
//! engine.send_frame(&[0x11, 0x03, 0x00, 0x6B, 0x00, 0x03])?;
//! loop {
//!     timer.check_expired();
//!     let _ = engine.poll();
//! }
//! # }
//! ```

pub mod retry;

pub use retry::{Exhausted, RetryPolicy};

use crate::error::{ModbusError, Result};
use crate::event::{Event, EventQueue};
use crate::function::{Exception, FunctionHandler, FunctionTable, FUNC_ERROR, FUNC_NONE, PDU_FUNC_OFF};
use crate::port::MasterTimer;
use crate::transport::{
    Adu, AsciiTransport, PortIo, RtuTransport, TcpTransport, Transport, TransportBinding,
};
use crate::types::{Config, Mode, ModeSupport, Parity, TCP_DEFAULT_PORT};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, warn};

/// Engine lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    NotInitialized,
    Disabled,
    Enabled,
}

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub response_timeout_ms: u32, // Turnaround window armed after each request
    pub send_retry: RetryPolicy,
    pub modes: ModeSupport,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            response_timeout_ms: 5000,
            send_retry: RetryPolicy::default(),
            modes: ModeSupport::default(),
        }
    }
}

impl Config for EngineConfig {
    fn validate(&self) -> Result<()> {
        if self.response_timeout_ms == 0 {
            return Err(ModbusError::InvalidArgument);
        }
        self.send_retry.validate()
    }
}

/// The most recently received frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub address: u8,
    pub pdu: Vec<u8>,
    pub length: usize,
    /// Exception reported by the slave, if the response is an exception response
    pub exception: Option<Exception>,
}

impl From<Adu> for Transaction {
    fn from(adu: Adu) -> Self {
        let exception = match adu.pdu.as_slice() {
            [code, ex, ..] if code & FUNC_ERROR != 0 => Some(Exception::from_code(*ex)),
            _ => None,
        };
        Self {
            address: adu.address,
            length: adu.pdu.len(),
            pdu: adu.pdu,
            exception,
        }
    }
}

impl Transaction {
    pub fn function_code(&self) -> u8 {
        self.pdu.get(PDU_FUNC_OFF).copied().unwrap_or(FUNC_NONE)
    }
}

/// Entry points for the port layer's interrupt handlers.
///
/// Obtained from [`Engine::port_handle`] after init; clones refer to the
/// same binding.
#[derive(Clone)]
pub struct PortHandle {
    binding: Arc<Mutex<TransportBinding>>,
}

impl PortHandle {
    pub fn mode(&self) -> Mode {
        self.binding.lock().mode()
    }

    /// Call from the receive interrupt
    pub fn byte_received(&self) -> bool {
        self.binding.lock().byte_received()
    }

    /// Call from the transmit-register-empty interrupt
    pub fn transmitter_empty(&self) -> bool {
        self.binding.lock().transmitter_empty()
    }

    /// Call when the binding's inter-frame timer expires
    pub fn timer_expired(&self) -> bool {
        self.binding.lock().timer_expired()
    }
}

/// Modbus master engine
pub struct Engine {
    config: EngineConfig,
    state: State,
    binding: Option<Arc<Mutex<TransportBinding>>>,
    queue: Arc<dyn EventQueue>,
    timer: Box<dyn MasterTimer>,
    handlers: FunctionTable,
    transaction: Option<Transaction>,
    awaiting_response: bool,
    last_exception: Option<Exception>,
    last_error: Option<ModbusError>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        queue: Arc<dyn EventQueue>,
        timer: impl MasterTimer + 'static,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            state: State::NotInitialized,
            binding: None,
            queue,
            timer: Box::new(timer),
            handlers: FunctionTable::new(),
            transaction: None,
            awaiting_response: false,
            last_exception: None,
            last_error: None,
        })
    }

    /// Binds a serial transport. `Mode::Tcp` ignores the serial parameters
    /// and listens on the default Modbus TCP port.
    pub fn init(
        &mut self,
        mode: Mode,
        address: u8,
        port: u8,
        baud_rate: u32,
        parity: Parity,
        io: PortIo,
    ) -> Result<()> {
        self.check_init(mode)?;

        let transport: Box<dyn Transport> = match mode {
            Mode::Rtu => Box::new(RtuTransport::init(
                address,
                port,
                baud_rate,
                parity,
                io,
                self.queue.clone(),
            )?),
            Mode::Ascii => Box::new(AsciiTransport::init(
                address,
                port,
                baud_rate,
                parity,
                io,
                self.queue.clone(),
            )?),
            Mode::Tcp => Box::new(TcpTransport::init(TCP_DEFAULT_PORT, io, self.queue.clone())?),
        };
        self.bind(TransportBinding::new(mode, transport))
    }

    /// Binds a TCP transport listening on `port`
    pub fn init_tcp(&mut self, port: u16, io: PortIo) -> Result<()> {
        self.check_init(Mode::Tcp)?;
        let transport = TcpTransport::init(port, io, self.queue.clone())?;
        self.bind(TransportBinding::new(Mode::Tcp, Box::new(transport)))
    }

    /// Binds an application supplied transport for `mode`
    pub fn init_with_transport(&mut self, mode: Mode, transport: Box<dyn Transport>) -> Result<()> {
        self.check_init(mode)?;
        self.bind(TransportBinding::new(mode, transport))
    }

    fn check_init(&self, mode: Mode) -> Result<()> {
        if self.state != State::NotInitialized {
            return Err(ModbusError::IllegalState);
        }
        if !self.config.modes.supports(mode) {
            return Err(ModbusError::InvalidArgument);
        }
        Ok(())
    }

    fn bind(&mut self, binding: TransportBinding) -> Result<()> {
        if !self.queue.init() {
            return Err(ModbusError::PortError("event queue init failed".into()));
        }
        debug!("Bound {:?} transport", binding.mode());
        self.binding = Some(Arc::new(Mutex::new(binding)));
        self.state = State::Disabled;
        Ok(())
    }

    fn binding(&self) -> Result<&Arc<Mutex<TransportBinding>>> {
        self.binding.as_ref().ok_or(ModbusError::IllegalState)
    }

    pub fn enable(&mut self) -> Result<()> {
        if self.state != State::Disabled {
            return Err(ModbusError::IllegalState);
        }
        self.binding()?.lock().start();
        self.state = State::Enabled;
        Ok(())
    }

    pub fn disable(&mut self) -> Result<()> {
        match self.state {
            State::Enabled => {
                self.binding()?.lock().stop();
                self.timer.disable();
                self.awaiting_response = false;
                self.state = State::Disabled;
                Ok(())
            }
            State::Disabled => Ok(()),
            State::NotInitialized => Err(ModbusError::IllegalState),
        }
    }

    /// Releases the binding's port resources. The engine stays disabled.
    pub fn close(&mut self) -> Result<()> {
        if self.state != State::Disabled {
            return Err(ModbusError::IllegalState);
        }
        match self.binding()?.lock().close() {
            Some(result) => result,
            None => Ok(()),
        }
    }

    /// Registers `handler` for `code`, or removes the handler for `code`
    /// when `handler` is `None`.
    pub fn register_handler(&self, code: u8, handler: Option<FunctionHandler>) -> Result<()> {
        self.handlers.register(code, handler)
    }

    pub fn register_illegal_handler(&self, handler: FunctionHandler) -> Result<()> {
        self.handlers.register_illegal(handler);
        Ok(())
    }

    pub fn handlers(&self) -> &FunctionTable {
        &self.handlers
    }

    /// Handles at most one pending event.
    ///
    /// Returns `Ok(())` when the queue is empty. A frame that fails to decode
    /// abandons the transaction and its error is returned; the engine keeps
    /// running and the next call handles the next event.
    pub fn poll(&mut self) -> Result<()> {
        if self.state != State::Enabled {
            return Err(ModbusError::IllegalState);
        }

        let Some(event) = self.queue.try_get() else {
            return Ok(());
        };

        match event {
            Event::Ready => {
                debug!("EV_READY");
            }
            Event::FrameReceived => {
                debug!("EV_FRAME_RECEIVED");
                // Disarm before decoding so the turnaround timer cannot fire mid-parse.
                self.timer.disable();
                self.awaiting_response = false;

                let received = self.binding()?.lock().receive();
                match received {
                    Ok(adu) => {
                        debug!("Rx frame from {:#04x}, {} bytes", adu.address, adu.pdu.len());
                        self.transaction = Some(Transaction::from(adu));
                        if !self.queue.post(Event::Execute) {
                            warn!("Event queue full, dropping execute");
                            return Err(ModbusError::PortError("event queue full".into()));
                        }
                    }
                    Err(e) => {
                        warn!("Rx error: {}", e);
                        self.last_error = Some(e.clone());
                        return Err(e);
                    }
                }
            }
            Event::Execute => {
                debug!("EV_EXECUTE");
                self.execute();
            }
            Event::FrameSent => {
                debug!("EV_FRAME_SENT");
                self.timer.enable(self.config.response_timeout_ms);
                self.awaiting_response = true;
            }
            Event::Timeout => {
                if !self.awaiting_response {
                    debug!("Ignoring response timeout with no request outstanding");
                    return Ok(());
                }
                warn!(
                    "No response within {} ms",
                    self.config.response_timeout_ms
                );
                self.awaiting_response = false;
                self.last_error = Some(ModbusError::Timeout);
                return Err(ModbusError::Timeout);
            }
        }
        Ok(())
    }

    fn execute(&mut self) {
        let Some(transaction) = self.transaction.as_mut() else {
            debug!("Execute without a received frame");
            return;
        };

        let code = transaction.function_code();
        debug!("Rx execute: {:#04x}", code);
        let exception = self
            .handlers
            .dispatch(code, &mut transaction.pdu, &mut transaction.length);
        transaction.length = transaction.length.min(transaction.pdu.len());
        self.last_exception = Some(exception);
    }

    /// Sends a request. `frame[0]` is the destination address, the rest is
    /// the PDU; the binding appends the integrity check.
    ///
    /// A busy binding is retried according to the configured
    /// [`RetryPolicy`], blocking the caller between attempts.
    pub fn send_frame(&mut self, frame: &[u8]) -> Result<()> {
        if self.state != State::Enabled {
            return Err(ModbusError::IllegalState);
        }
        let (&address, pdu) = frame.split_first().ok_or(ModbusError::InvalidArgument)?;
        if pdu.is_empty() {
            return Err(ModbusError::InvalidArgument);
        }

        debug!("Send frame to {:#04x}, len={}", address, frame.len());
        let binding = self.binding()?.clone();
        match self.config.send_retry.run(|| binding.lock().send(address, pdu)) {
            Ok(()) => Ok(()),
            Err(e) => match self.config.send_retry.on_exhausted {
                Exhausted::Fail => {
                    self.last_error = Some(e.clone());
                    Err(e)
                }
                Exhausted::Ignore => {
                    warn!("Send to {:#04x} not accepted, reporting success", address);
                    Ok(())
                }
            },
        }
    }

    /// Returns the interrupt entry points once a transport is bound
    pub fn port_handle(&self) -> Option<PortHandle> {
        self.binding.as_ref().map(|binding| PortHandle {
            binding: binding.clone(),
        })
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn mode(&self) -> Option<Mode> {
        self.binding.as_ref().map(|binding| binding.lock().mode())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn transaction(&self) -> Option<&Transaction> {
        self.transaction.as_ref()
    }

    /// Status returned by the handler of the last executed frame
    pub fn last_exception(&self) -> Option<Exception> {
        self.last_exception
    }

    /// Last receive, timeout or send failure
    pub fn last_error(&self) -> Option<&ModbusError> {
        self.last_error.as_ref()
    }
}

#[cfg(test)]
mod tests;
