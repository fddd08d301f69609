//! Transport bindings for the Modbus master engine.
//!
//! A binding turns the byte stream of a port into validated frames and back:
//! - RTU: binary frames delimited by a 3.5 character gap, CRC-16 checked
//! - ASCII: `:`-prefixed hex lines terminated by CR LF, LRC checked
//! - TCP: MBAP-prefixed frames on a stream socket
//!
//! Each binding exposes the five operations the engine drives (start, stop,
//! send, receive, close) and the three event drivers the port layer calls
//! from interrupt context (byte received, transmitter empty, timer expired).

pub mod ascii;
pub mod rtu;
pub mod tcp;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use ascii::AsciiTransport;
pub use rtu::RtuTransport;
pub use tcp::TcpTransport;

use crate::error::Result;
use crate::event::{Event, EventQueue};
use crate::port::{SerialPort, Timer};
use crate::types::Mode;
use std::sync::Arc;

/// A decoded frame: source address and protocol data unit
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Adu {
    pub address: u8,
    pub pdu: Vec<u8>,
}

/// Transport trait that must be implemented by every binding
pub trait Transport: Send {
    fn start(&mut self);
    fn stop(&mut self);
    fn send(&mut self, address: u8, pdu: &[u8]) -> Result<()>;
    fn receive(&mut self) -> Result<Adu>;

    fn supports_close(&self) -> bool {
        false
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }

    /// Receive state machine driver, called once per received byte
    fn byte_received(&mut self) -> bool;
    /// Transmit state machine driver, called when the transmit register empties
    fn transmitter_empty(&mut self) -> bool;
    /// Called when the binding's own inter-frame timer expires
    fn timer_expired(&mut self) -> bool;
}

/// Hardware resources a built-in binding is constructed over
pub struct PortIo {
    pub serial: Box<dyn SerialPort>,
    pub timer: Box<dyn Timer>,
}

impl PortIo {
    pub fn new(serial: impl SerialPort + 'static, timer: impl Timer + 'static) -> Self {
        Self {
            serial: Box::new(serial),
            timer: Box::new(timer),
        }
    }
}

/// The transport selected at init, tagged with its mode
pub struct TransportBinding {
    mode: Mode,
    transport: Box<dyn Transport>,
}

impl TransportBinding {
    pub fn new(mode: Mode, transport: Box<dyn Transport>) -> Self {
        Self { mode, transport }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn start(&mut self) {
        self.transport.start()
    }

    pub fn stop(&mut self) {
        self.transport.stop()
    }

    pub fn send(&mut self, address: u8, pdu: &[u8]) -> Result<()> {
        self.transport.send(address, pdu)
    }

    pub fn receive(&mut self) -> Result<Adu> {
        self.transport.receive()
    }

    /// Runs the binding's close operation, or returns `None` if it has none
    pub fn close(&mut self) -> Option<Result<()>> {
        if self.transport.supports_close() {
            Some(self.transport.close())
        } else {
            None
        }
    }

    pub fn byte_received(&mut self) -> bool {
        self.transport.byte_received()
    }

    pub fn transmitter_empty(&mut self) -> bool {
        self.transport.transmitter_empty()
    }

    pub fn timer_expired(&mut self) -> bool {
        self.transport.timer_expired()
    }
}

/// Transmit half shared by the built-in bindings. Bytes are shifted out one
/// per transmitter-empty interrupt; `FrameSent` is posted after the last one.
#[derive(Debug, Default)]
pub(crate) struct Transmitter {
    buffer: Vec<u8>,
    pos: usize,
    busy: bool,
}

impl Transmitter {
    pub(crate) fn is_busy(&self) -> bool {
        self.busy
    }

    pub(crate) fn load(&mut self, bytes: Vec<u8>) {
        self.buffer = bytes;
        self.pos = 0;
        self.busy = true;
    }

    pub(crate) fn reset(&mut self) {
        self.buffer.clear();
        self.pos = 0;
        self.busy = false;
    }

    pub(crate) fn on_empty(&mut self, port: &mut dyn SerialPort, queue: &Arc<dyn EventQueue>) -> bool {
        if !self.busy {
            // Spurious interrupt: fall back to receive mode.
            port.enable(true, false);
            return false;
        }

        if let Some(&byte) = self.buffer.get(self.pos) {
            port.put_byte(byte);
            self.pos += 1;
            false
        } else {
            self.reset();
            port.enable(true, false);
            queue.post(Event::FrameSent)
        }
    }
}

/// Formats bytes as upper-case hex for trace output
pub(crate) fn hex_dump(data: &[u8]) -> String {
    hex::encode_upper(data)
}
