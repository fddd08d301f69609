use super::{Adu, PortIo, Transmitter, Transport};
use crate::error::{ModbusError, Result};
use crate::event::{Event, EventQueue};
use crate::port::{SerialPort, Timer};
use crate::types::{is_station_address, LineSettings, Parity, PDU_SIZE_MAX};
use std::sync::Arc;
use tracing::trace;

// ASCII framing characters
pub const ASCII_START: u8 = b':';
pub const ASCII_CR: u8 = b'\r';
pub const ASCII_LF: u8 = b'\n';

// Binary frame limits: address + function code + LRC, and the line maximum
pub const ASCII_ADU_SIZE_MIN: usize = 3;
pub const ASCII_ADU_SIZE_MAX: usize = 256;

/// Inter-character timeout: one second in 50us ticks
pub const ASCII_TIMEOUT_50US: u16 = 20_000;

/// Longitudinal redundancy check: two's complement of the byte sum
pub fn lrc(data: &[u8]) -> u8 {
    data.iter()
        .fold(0u8, |sum, &byte| sum.wrapping_add(byte))
        .wrapping_neg()
}

/// Builds an ASCII line: `:` + hex(address, PDU, LRC) + CR LF
pub fn encode_adu(address: u8, pdu: &[u8]) -> Vec<u8> {
    let mut binary = Vec::with_capacity(pdu.len() + 2);
    binary.push(address);
    binary.extend_from_slice(pdu);
    binary.push(lrc(&binary));

    let mut line = Vec::with_capacity(binary.len() * 2 + 3);
    line.push(ASCII_START);
    line.extend_from_slice(hex::encode_upper(&binary).as_bytes());
    line.push(ASCII_CR);
    line.push(ASCII_LF);
    line
}

/// Decodes the hex characters between `:` and CR LF and checks the LRC
pub fn decode_adu(chars: &[u8]) -> Result<Adu> {
    let binary = hex::decode(chars)
        .map_err(|e| ModbusError::MalformedFrame(format!("invalid ASCII frame: {}", e)))?;

    if binary.len() < ASCII_ADU_SIZE_MIN || binary.len() > ASCII_ADU_SIZE_MAX {
        return Err(ModbusError::MalformedFrame(format!(
            "ASCII frame length {} out of range",
            binary.len()
        )));
    }

    let (body, tail) = binary.split_at(binary.len() - 1);
    let expected = lrc(body);
    if expected != tail[0] {
        return Err(ModbusError::Checksum {
            expected: expected as u16,
            actual: tail[0] as u16,
        });
    }

    Ok(Adu {
        address: body[0],
        pdu: body[1..].to_vec(),
    })
}

// ASCII receiver states
#[derive(Debug, Clone, Copy, PartialEq)]
enum RxState {
    Idle,
    Receiving,
    WaitEol,
}

/// Modbus ASCII binding. The timer bounds the gap between two characters
/// of the same line; on expiry a partial line is discarded.
pub struct AsciiTransport {
    port: Box<dyn SerialPort>,
    timer: Box<dyn Timer>,
    queue: Arc<dyn EventQueue>,
    address: u8,
    rx_state: RxState,
    rx: Vec<u8>,
    tx: Transmitter,
}

impl AsciiTransport {
    pub fn init(
        address: u8,
        port: u8,
        baud_rate: u32,
        parity: Parity,
        mut io: PortIo,
        queue: Arc<dyn EventQueue>,
    ) -> Result<Self> {
        if !is_station_address(address) || baud_rate == 0 {
            return Err(ModbusError::InvalidArgument);
        }

        io.serial.init(&LineSettings::Serial {
            port,
            baud_rate,
            parity,
        })?;
        io.timer.init(ASCII_TIMEOUT_50US)?;

        Ok(Self {
            port: io.serial,
            timer: io.timer,
            queue,
            address,
            rx_state: RxState::Idle,
            rx: Vec::with_capacity(ASCII_ADU_SIZE_MAX * 2),
            tx: Transmitter::default(),
        })
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    fn restart_line(&mut self) {
        self.rx.clear();
        self.rx_state = RxState::Receiving;
        self.timer.enable();
    }

    fn drop_line(&mut self) {
        self.rx.clear();
        self.rx_state = RxState::Idle;
        self.timer.disable();
    }
}

impl Transport for AsciiTransport {
    fn start(&mut self) {
        self.rx_state = RxState::Idle;
        self.port.enable(true, false);
        // No start-up gap in ASCII mode.
        self.queue.post(Event::Ready);
    }

    fn stop(&mut self) {
        self.port.enable(false, false);
        self.timer.disable();
        self.tx.reset();
    }

    fn send(&mut self, address: u8, pdu: &[u8]) -> Result<()> {
        if pdu.is_empty() || pdu.len() > PDU_SIZE_MAX {
            return Err(ModbusError::InvalidArgument);
        }
        if self.rx_state != RxState::Idle {
            return Err(ModbusError::Io("receiver not idle".into()));
        }
        if self.tx.is_busy() {
            return Err(ModbusError::Io("transmitter busy".into()));
        }

        let line = encode_adu(address, pdu);
        trace!("ASCII send: {}", String::from_utf8_lossy(&line).trim_end());
        self.tx.load(line);
        self.port.enable(false, true);
        Ok(())
    }

    fn receive(&mut self) -> Result<Adu> {
        trace!("ASCII receive: {}", String::from_utf8_lossy(&self.rx));
        decode_adu(&self.rx)
    }

    fn supports_close(&self) -> bool {
        self.port.supports_close()
    }

    fn close(&mut self) -> Result<()> {
        self.port.close()
    }

    fn byte_received(&mut self) -> bool {
        let Some(byte) = self.port.get_byte() else {
            return false;
        };

        // A start character always begins a new line.
        if byte == ASCII_START {
            self.restart_line();
            return false;
        }

        match self.rx_state {
            RxState::Idle => false,
            RxState::Receiving => {
                if byte == ASCII_CR {
                    self.rx_state = RxState::WaitEol;
                    self.timer.enable();
                } else if byte.is_ascii_hexdigit() && self.rx.len() < ASCII_ADU_SIZE_MAX * 2 {
                    self.rx.push(byte);
                    self.timer.enable();
                } else {
                    self.drop_line();
                }
                false
            }
            RxState::WaitEol => {
                if byte == ASCII_LF {
                    self.timer.disable();
                    self.rx_state = RxState::Idle;
                    self.queue.post(Event::FrameReceived)
                } else {
                    self.drop_line();
                    false
                }
            }
        }
    }

    fn transmitter_empty(&mut self) -> bool {
        self.tx.on_empty(self.port.as_mut(), &self.queue)
    }

    fn timer_expired(&mut self) -> bool {
        if self.rx_state != RxState::Idle {
            trace!("ASCII character timeout, dropping {} chars", self.rx.len());
        }
        self.drop_line();
        false
    }
}
