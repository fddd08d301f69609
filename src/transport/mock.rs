use super::{Adu, Transport};
use crate::error::{ModbusError, Result};
use crate::port::mock::CallLog;

/// Mock receive handler function type
pub type MockReceiveHandler = Box<dyn FnMut() -> Result<Adu> + Send>;

/// Mock send handler function type
pub type MockSendHandler = Box<dyn FnMut(u8, &[u8]) -> Result<()> + Send>;

/// Mock transport binding that records every operation into a [`CallLog`]
pub struct MockTransport {
    log: CallLog,
    receive_handler: Option<MockReceiveHandler>,
    send_handler: Option<MockSendHandler>,
    has_close: bool,
}

impl MockTransport {
    /// Creates a new mock transport with custom handlers
    pub fn new(
        log: CallLog,
        receive_handler: Option<MockReceiveHandler>,
        send_handler: Option<MockSendHandler>,
    ) -> Self {
        Self {
            log,
            receive_handler,
            send_handler,
            has_close: false,
        }
    }

    /// Creates a mock transport whose receive always yields `adu`
    pub fn with_response(log: CallLog, adu: Adu) -> Self {
        Self::new(log, Some(Box::new(move || Ok(adu.clone()))), None)
    }

    /// Creates a mock transport whose send always fails
    pub fn new_send_error(log: CallLog) -> Self {
        Self::new(
            log,
            None,
            Some(Box::new(|_: u8, _: &[u8]| {
                Err(ModbusError::Io("mock send failure".into()))
            })),
        )
    }

    /// Makes the mock expose a close operation
    pub fn with_close(mut self) -> Self {
        self.has_close = true;
        self
    }

    fn record(&self, call: String) {
        self.log.lock().push(call);
    }
}

impl Transport for MockTransport {
    fn start(&mut self) {
        self.record("start".into());
    }

    fn stop(&mut self) {
        self.record("stop".into());
    }

    fn send(&mut self, address: u8, pdu: &[u8]) -> Result<()> {
        self.record(format!("send({:#04x}, {:02X?})", address, pdu));
        match &mut self.send_handler {
            Some(handler) => handler(address, pdu),
            None => Ok(()),
        }
    }

    fn receive(&mut self) -> Result<Adu> {
        self.record("receive".into());
        match &mut self.receive_handler {
            Some(handler) => handler(),
            None => Err(ModbusError::MalformedFrame("no frame buffered".into())),
        }
    }

    fn supports_close(&self) -> bool {
        self.has_close
    }

    fn close(&mut self) -> Result<()> {
        self.record("close".into());
        Ok(())
    }

    fn byte_received(&mut self) -> bool {
        self.record("byte_received".into());
        false
    }

    fn transmitter_empty(&mut self) -> bool {
        self.record("transmitter_empty".into());
        false
    }

    fn timer_expired(&mut self) -> bool {
        self.record("timer_expired".into());
        false
    }
}
