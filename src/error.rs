use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModbusError {
    // Argument and lifecycle errors
    #[error("Invalid argument")]
    InvalidArgument,
    #[error("Operation not valid in the current state")]
    IllegalState,

    // Port layer errors
    #[error("Port error: {0}")]
    PortError(String),
    #[error("I/O error: {0}")]
    Io(String),

    // Dispatch table errors
    #[error("No free function handler slot")]
    ResourceExhausted,

    // Frame decode errors
    #[error("Checksum mismatch: expected {expected:#06x}, got {actual:#06x}")]
    Checksum { expected: u16, actual: u16 },
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    // Generic errors
    #[error("Operation timed out")]
    Timeout,
}

pub type Result<T> = std::result::Result<T, ModbusError>;
