use super::{hex_dump, Adu, PortIo, Transmitter, Transport};
use crate::error::{ModbusError, Result};
use crate::event::{Event, EventQueue};
use crate::port::{t35_timeout_50us, SerialPort, Timer};
use crate::types::{is_station_address, LineSettings, Parity, PDU_SIZE_MAX};
use crc::{Crc, CRC_16_MODBUS};
use std::sync::Arc;
use tracing::trace;

// RTU frame limits: address + function code + CRC, and the serial line maximum
pub const RTU_ADU_SIZE_MIN: usize = 4;
pub const RTU_ADU_SIZE_MAX: usize = 256;

const CRC_MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// CRC-16/MODBUS over `data`
pub fn crc16(data: &[u8]) -> u16 {
    CRC_MODBUS.checksum(data)
}

/// Builds an RTU frame: address, PDU, CRC low byte, CRC high byte
pub fn encode_adu(address: u8, pdu: &[u8]) -> Vec<u8> {
    let mut adu = Vec::with_capacity(pdu.len() + 3);
    adu.push(address);
    adu.extend_from_slice(pdu);
    let crc = crc16(&adu);
    adu.extend_from_slice(&crc.to_le_bytes());
    adu
}

/// Validates length and CRC of an RTU frame and splits it into address and PDU
pub fn decode_adu(adu: &[u8]) -> Result<Adu> {
    if adu.len() < RTU_ADU_SIZE_MIN || adu.len() > RTU_ADU_SIZE_MAX {
        return Err(ModbusError::MalformedFrame(format!(
            "RTU frame length {} out of range",
            adu.len()
        )));
    }

    let (body, tail) = adu.split_at(adu.len() - 2);
    let expected = crc16(body);
    let actual = u16::from_le_bytes([tail[0], tail[1]]);
    if expected != actual {
        return Err(ModbusError::Checksum { expected, actual });
    }

    Ok(Adu {
        address: body[0],
        pdu: body[1..].to_vec(),
    })
}

// RTU receiver states
#[derive(Debug, Clone, Copy, PartialEq)]
enum RxState {
    Init,
    Idle,
    Receiving,
    Error,
}

/// Modbus RTU binding. Frame boundaries are detected by the t3.5 timer,
/// which is re-armed on every received byte.
pub struct RtuTransport {
    port: Box<dyn SerialPort>,
    timer: Box<dyn Timer>,
    queue: Arc<dyn EventQueue>,
    address: u8,
    t35_50us: u16,
    rx_state: RxState,
    rx: Vec<u8>,
    tx: Transmitter,
}

impl RtuTransport {
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
        let t35_50us = t35_timeout_50us(baud_rate);
        io.timer.init(t35_50us)?;

        Ok(Self {
            port: io.serial,
            timer: io.timer,
            queue,
            address,
            t35_50us,
            rx_state: RxState::Init,
            rx: Vec::with_capacity(RTU_ADU_SIZE_MAX),
            tx: Transmitter::default(),
        })
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    /// Inter-frame gap the port timer was configured with, in 50us ticks
    pub fn t35_50us(&self) -> u16 {
        self.t35_50us
    }
}

impl Transport for RtuTransport {
    fn start(&mut self) {
        // Wait one full gap before accepting the first frame.
        self.rx_state = RxState::Init;
        self.port.enable(true, false);
        self.timer.enable();
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

        let adu = encode_adu(address, pdu);
        trace!("RTU send: {}", hex_dump(&adu));
        self.tx.load(adu);
        self.port.enable(false, true);
        Ok(())
    }

    fn receive(&mut self) -> Result<Adu> {
        trace!("RTU receive: {}", hex_dump(&self.rx));
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

        match self.rx_state {
            // Still inside the start-up gap or recovering from an overrun:
            // keep pushing the frame boundary out.
            RxState::Init | RxState::Error => {}
            RxState::Idle => {
                self.rx.clear();
                self.rx.push(byte);
                self.rx_state = RxState::Receiving;
            }
            RxState::Receiving => {
                if self.rx.len() < RTU_ADU_SIZE_MAX {
                    self.rx.push(byte);
                } else {
                    self.rx_state = RxState::Error;
                }
            }
        }
        self.timer.enable();
        false
    }

    fn transmitter_empty(&mut self) -> bool {
        self.tx.on_empty(self.port.as_mut(), &self.queue)
    }

    fn timer_expired(&mut self) -> bool {
        let need_poll = match self.rx_state {
            RxState::Init => self.queue.post(Event::Ready),
            RxState::Receiving => self.queue.post(Event::FrameReceived),
            RxState::Idle | RxState::Error => false,
        };
        self.timer.disable();
        self.rx_state = RxState::Idle;
        need_poll
    }
}
