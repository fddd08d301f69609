use super::{hex_dump, Adu, PortIo, Transmitter, Transport};
use crate::error::{ModbusError, Result};
use crate::event::{Event, EventQueue};
use crate::port::{SerialPort, Timer};
use crate::types::{LineSettings, PDU_SIZE_MAX, TCP_PSEUDO_ADDRESS};
use std::sync::Arc;
use tracing::trace;

// MBAP header: transaction id, protocol id, length, unit id
pub const MBAP_HEADER_SIZE: usize = 7;
pub const MBAP_PROTOCOL_ID: u16 = 0;
pub const TCP_ADU_SIZE_MAX: usize = MBAP_HEADER_SIZE + PDU_SIZE_MAX;

/// Builds an MBAP-framed request
pub fn encode_adu(transaction_id: u16, unit_id: u8, pdu: &[u8]) -> Vec<u8> {
    let mut adu = Vec::with_capacity(MBAP_HEADER_SIZE + pdu.len());
    adu.extend_from_slice(&transaction_id.to_be_bytes());
    adu.extend_from_slice(&MBAP_PROTOCOL_ID.to_be_bytes());
    adu.extend_from_slice(&((pdu.len() + 1) as u16).to_be_bytes());
    adu.push(unit_id);
    adu.extend_from_slice(pdu);
    adu
}

/// Validates an MBAP frame and returns its transaction id with the decoded frame
pub fn decode_adu(adu: &[u8]) -> Result<(u16, Adu)> {
    if adu.len() <= MBAP_HEADER_SIZE || adu.len() > TCP_ADU_SIZE_MAX {
        return Err(ModbusError::MalformedFrame(format!(
            "TCP frame length {} out of range",
            adu.len()
        )));
    }

    let transaction_id = u16::from_be_bytes([adu[0], adu[1]]);
    let protocol_id = u16::from_be_bytes([adu[2], adu[3]]);
    let length = u16::from_be_bytes([adu[4], adu[5]]) as usize;

    if protocol_id != MBAP_PROTOCOL_ID {
        return Err(ModbusError::MalformedFrame(format!(
            "unknown protocol id {}",
            protocol_id
        )));
    }
    if length != adu.len() - 6 {
        return Err(ModbusError::MalformedFrame(format!(
            "MBAP length {} does not match {} received bytes",
            length,
            adu.len() - 6
        )));
    }

    Ok((
        transaction_id,
        Adu {
            address: adu[6],
            pdu: adu[MBAP_HEADER_SIZE..].to_vec(),
        },
    ))
}

// TCP receiver states
#[derive(Debug, Clone, Copy, PartialEq)]
enum RxState {
    Idle,
    Receiving,
    Complete,
}

/// Modbus TCP binding over a byte stream. A frame is complete once the
/// number of bytes announced in the MBAP length field has arrived.
pub struct TcpTransport {
    port: Box<dyn SerialPort>,
    timer: Box<dyn Timer>,
    queue: Arc<dyn EventQueue>,
    listen_port: u16,
    address: u8,
    next_transaction_id: u16,
    pending_transaction_id: Option<u16>,
    rx_state: RxState,
    rx: Vec<u8>,
    tx: Transmitter,
}

impl TcpTransport {
    pub fn init(listen_port: u16, mut io: PortIo, queue: Arc<dyn EventQueue>) -> Result<Self> {
        io.serial.init(&LineSettings::Tcp { port: listen_port })?;

        Ok(Self {
            port: io.serial,
            timer: io.timer,
            queue,
            listen_port,
            address: TCP_PSEUDO_ADDRESS,
            next_transaction_id: 1,
            pending_transaction_id: None,
            rx_state: RxState::Idle,
            rx: Vec::with_capacity(TCP_ADU_SIZE_MAX),
            tx: Transmitter::default(),
        })
    }

    pub fn listen_port(&self) -> u16 {
        self.listen_port
    }

    /// Station address: TCP has no serial address, so the pseudo unit id
    pub fn address(&self) -> u8 {
        self.address
    }

    /// Number of bytes the frame in progress will have, once the header is in
    fn expected_len(&self) -> Option<usize> {
        if self.rx.len() < 6 {
            return None;
        }
        Some(6 + u16::from_be_bytes([self.rx[4], self.rx[5]]) as usize)
    }
}

impl Transport for TcpTransport {
    fn start(&mut self) {
        self.rx.clear();
        self.rx_state = RxState::Idle;
        self.port.enable(true, false);
        self.queue.post(Event::Ready);
    }

    fn stop(&mut self) {
        self.port.enable(false, false);
        self.timer.disable();
        self.tx.reset();
        self.pending_transaction_id = None;
    }

    fn send(&mut self, address: u8, pdu: &[u8]) -> Result<()> {
        if pdu.is_empty() || pdu.len() > PDU_SIZE_MAX {
            return Err(ModbusError::InvalidArgument);
        }
        if self.rx_state == RxState::Receiving {
            return Err(ModbusError::Io("receiver not idle".into()));
        }
        if self.tx.is_busy() {
            return Err(ModbusError::Io("transmitter busy".into()));
        }

        let transaction_id = self.next_transaction_id;
        self.next_transaction_id = self.next_transaction_id.wrapping_add(1);
        self.pending_transaction_id = Some(transaction_id);

        let adu = encode_adu(transaction_id, address, pdu);
        trace!("TCP send: {}", hex_dump(&adu));
        self.tx.load(adu);
        self.port.enable(false, true);
        Ok(())
    }

    fn receive(&mut self) -> Result<Adu> {
        trace!("TCP receive: {}", hex_dump(&self.rx));
        let (transaction_id, adu) = decode_adu(&self.rx)?;
        if let Some(pending) = self.pending_transaction_id {
            if pending != transaction_id {
                return Err(ModbusError::MalformedFrame(format!(
                    "transaction id {} does not match request {}",
                    transaction_id, pending
                )));
            }
        }
        self.pending_transaction_id = None;
        Ok(adu)
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

        if self.rx_state != RxState::Receiving {
            self.rx.clear();
            self.rx_state = RxState::Receiving;
        }
        self.rx.push(byte);
        self.timer.enable();

        match self.expected_len() {
            Some(expected) if expected > TCP_ADU_SIZE_MAX || expected <= MBAP_HEADER_SIZE => {
                trace!("TCP frame announces invalid length {}", expected);
                self.rx_state = RxState::Idle;
                self.timer.disable();
                false
            }
            Some(expected) if self.rx.len() == expected => {
                self.rx_state = RxState::Complete;
                self.timer.disable();
                self.queue.post(Event::FrameReceived)
            }
            _ => false,
        }
    }

    fn transmitter_empty(&mut self) -> bool {
        self.tx.on_empty(self.port.as_mut(), &self.queue)
    }

    fn timer_expired(&mut self) -> bool {
        if self.rx_state == RxState::Receiving {
            trace!("TCP frame timeout, dropping {} bytes", self.rx.len());
            self.rx.clear();
            self.rx_state = RxState::Idle;
        }
        self.timer.disable();
        false
    }
}
