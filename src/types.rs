use bitflags::bitflags;

/// Broadcast slave address
pub const ADDRESS_BROADCAST: u8 = 0;

/// Lowest valid slave address
pub const ADDRESS_MIN: u8 = 1;

/// Highest valid slave address
pub const ADDRESS_MAX: u8 = 247;

/// Unit id used as the address when running over TCP
pub const TCP_PSEUDO_ADDRESS: u8 = 0xFF;

/// Default Modbus TCP listen port
pub const TCP_DEFAULT_PORT: u16 = 502;

/// Maximum size of a protocol data unit (function code + data)
pub const PDU_SIZE_MAX: usize = 253;

/// Returns `true` for an address a serial station may own: neither the
/// broadcast address nor outside the assignable range
pub fn is_station_address(address: u8) -> bool {
    address != ADDRESS_BROADCAST && (ADDRESS_MIN..=ADDRESS_MAX).contains(&address)
}

/// Transport variant selected at init
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Rtu,
    Ascii,
    Tcp,
}

/// Serial line parity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Parity {
    None,
    Odd,
    #[default]
    Even,
}

bitflags! {
    /// Transport variants the engine is allowed to bind
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ModeSupport: u32 {
        const RTU = 1;
        const ASCII = 2;
        const TCP = 4;
    }
}

impl Default for ModeSupport {
    fn default() -> Self {
        ModeSupport::all()
    }
}

impl ModeSupport {
    pub fn supports(&self, mode: Mode) -> bool {
        match mode {
            Mode::Rtu => self.contains(ModeSupport::RTU),
            Mode::Ascii => self.contains(ModeSupport::ASCII),
            Mode::Tcp => self.contains(ModeSupport::TCP),
        }
    }
}

/// Line parameters handed to the port layer's low-level init
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineSettings {
    Serial {
        port: u8,
        baud_rate: u32,
        parity: Parity,
    },
    Tcp {
        port: u16,
    },
}

/// Configuration trait that must be implemented by all engine configurations
pub trait Config: Send + Sync {
    fn validate(&self) -> crate::error::Result<()>;
}
