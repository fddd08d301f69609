//! Port layer contracts for the Modbus master engine.
//!
//! The port layer is the hardware boundary of the stack:
//! - A serial (or socket) byte port with receive/transmit enables
//! - The inter-frame timer used by the framers to detect gaps
//! - The master response timer bounding each request/response turnaround
//!
//! Interrupt handlers do not call into global callback slots. They use the
//! [`crate::engine::PortHandle`] obtained from the engine after init.

#[cfg(any(test, feature = "mock"))]
pub mod mock;

use crate::error::Result;
use crate::event::{Event, EventQueue};
use crate::types::LineSettings;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Byte-level port driven by receive/transmit interrupts
pub trait SerialPort: Send {
    /// Low-level port initialisation
    fn init(&mut self, settings: &LineSettings) -> Result<()>;
    /// Switches the receiver and transmitter interrupts on or off
    fn enable(&mut self, rx_enable: bool, tx_enable: bool);
    /// Reads the byte that triggered a receive interrupt
    fn get_byte(&mut self) -> Option<u8>;
    /// Loads one byte into the transmit register
    fn put_byte(&mut self, byte: u8) -> bool;

    fn supports_close(&self) -> bool {
        false
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Inter-frame / inter-character timer owned by a framer
pub trait Timer: Send {
    /// Configures the expiry period in 50us ticks
    fn init(&mut self, timeout_50us: u16) -> Result<()>;
    fn enable(&mut self);
    fn disable(&mut self);
}

/// Response turnaround timer owned by the engine
pub trait MasterTimer: Send {
    fn enable(&mut self, timeout_ms: u32);
    fn disable(&mut self);
}

/// Returns the RTU t3.5 character gap in 50us ticks for the given baud rate.
///
/// Above 19200 baud the gap is fixed at 1750us. Below, one character is
/// 11 bits, so 3.5 characters take `3.5 * 11 / baud` seconds. Gaps longer
/// than the timer can count saturate at `u16::MAX`.
pub fn t35_timeout_50us(baud_rate: u32) -> u16 {
    if baud_rate == 0 {
        return 0;
    }
    if baud_rate > 19200 {
        35
    } else {
        u16::try_from((7u32 * 220_000) / (2 * baud_rate)).unwrap_or(u16::MAX)
    }
}

/// Software response timer for hosted targets.
///
/// The engine arms and disarms it through [`MasterTimer`]. The host loop
/// calls [`DeadlineTimer::check_expired`] on a clone of the timer; once the
/// armed deadline has passed it posts [`Event::Timeout`] exactly once.
#[derive(Clone)]
pub struct DeadlineTimer {
    deadline: Arc<Mutex<Option<Instant>>>,
    queue: Arc<dyn EventQueue>,
}

impl DeadlineTimer {
    pub fn new(queue: Arc<dyn EventQueue>) -> Self {
        Self {
            deadline: Arc::new(Mutex::new(None)),
            queue,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.lock().is_some()
    }

    pub fn check_expired(&self) -> bool {
        self.check_expired_at(Instant::now())
    }

    pub fn check_expired_at(&self, now: Instant) -> bool {
        let mut deadline = self.deadline.lock();
        match *deadline {
            Some(at) if now >= at => {
                *deadline = None;
                self.queue.post(Event::Timeout)
            }
            _ => false,
        }
    }
}

impl MasterTimer for DeadlineTimer {
    fn enable(&mut self, timeout_ms: u32) {
        *self.deadline.lock() = Some(Instant::now() + Duration::from_millis(timeout_ms as u64));
    }

    fn disable(&mut self) {
        *self.deadline.lock() = None;
    }
}
