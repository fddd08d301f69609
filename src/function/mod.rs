//! Function codes, exception codes and the handler dispatch table.
//!
//! In master mode a function handler parses the response to a request the
//! application issued earlier. Handlers are registered per function code in
//! a fixed-capacity [`FunctionTable`]; responses whose code has no handler go
//! to the illegal-function handler.

pub mod table;

pub use table::{FunctionTable, FUNC_HANDLERS_MAX};

use std::sync::Arc;

// Modbus function codes
pub const FUNC_NONE: u8 = 0x00;
pub const FUNC_READ_COILS: u8 = 0x01;
pub const FUNC_READ_DISCRETE_INPUTS: u8 = 0x02;
pub const FUNC_READ_HOLDING_REGISTER: u8 = 0x03;
pub const FUNC_READ_INPUT_REGISTER: u8 = 0x04;
pub const FUNC_WRITE_SINGLE_COIL: u8 = 0x05;
pub const FUNC_WRITE_REGISTER: u8 = 0x06;
pub const FUNC_WRITE_MULTIPLE_COILS: u8 = 0x0F;
pub const FUNC_WRITE_MULTIPLE_REGISTERS: u8 = 0x10;
pub const FUNC_OTHER_REPORT_SLAVEID: u8 = 0x11;
pub const FUNC_READWRITE_MULTIPLE_REGISTERS: u8 = 0x17;

/// Set in the function code of an exception response
pub const FUNC_ERROR: u8 = 0x80;

/// Highest function code a handler can be registered for
pub const FUNC_CODE_MAX: u8 = 127;

/// Offset of the function code within a PDU
pub const PDU_FUNC_OFF: usize = 0;

/// Modbus exception codes, as returned by function handlers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exception {
    None,
    IllegalFunction,
    IllegalDataAddress,
    IllegalDataValue,
    SlaveDeviceFailure,
    Acknowledge,
    SlaveBusy,
    MemoryParityError,
    GatewayPathFailed,
    GatewayTargetFailed,
    Other(u8),
}

impl Exception {
    pub fn code(&self) -> u8 {
        match self {
            Exception::None => 0x00,
            Exception::IllegalFunction => 0x01,
            Exception::IllegalDataAddress => 0x02,
            Exception::IllegalDataValue => 0x03,
            Exception::SlaveDeviceFailure => 0x04,
            Exception::Acknowledge => 0x05,
            Exception::SlaveBusy => 0x06,
            Exception::MemoryParityError => 0x08,
            Exception::GatewayPathFailed => 0x0A,
            Exception::GatewayTargetFailed => 0x0B,
            Exception::Other(code) => *code,
        }
    }

    pub fn from_code(code: u8) -> Self {
        match code {
            0x00 => Exception::None,
            0x01 => Exception::IllegalFunction,
            0x02 => Exception::IllegalDataAddress,
            0x03 => Exception::IllegalDataValue,
            0x04 => Exception::SlaveDeviceFailure,
            0x05 => Exception::Acknowledge,
            0x06 => Exception::SlaveBusy,
            0x08 => Exception::MemoryParityError,
            0x0A => Exception::GatewayPathFailed,
            0x0B => Exception::GatewayTargetFailed,
            other => Exception::Other(other),
        }
    }
}

/// Function handler: receives the PDU and its length, returns the status.
///
/// Two registrations refer to the same handler when their `Arc`s point to
/// the same allocation.
pub type FunctionHandler = Arc<dyn Fn(&mut [u8], &mut usize) -> Exception + Send + Sync>;

/// Wraps a closure into a [`FunctionHandler`]
pub fn handler<F>(f: F) -> FunctionHandler
where
    F: Fn(&mut [u8], &mut usize) -> Exception + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Handler used when no illegal-function handler has been registered
pub fn default_illegal_handler() -> FunctionHandler {
    handler(|_, _| Exception::IllegalFunction)
}
