// Protocol stack layers
pub mod engine; // Master poll loop and lifecycle
pub mod event; // Event queues between interrupt context and the poll loop
pub mod function; // Function codes and handler dispatch
pub mod port; // Serial port and timer contracts
pub mod transport; // RTU, ASCII and TCP framing

// Re-exports for convenience
pub use engine::{Engine, EngineConfig, PortHandle, State};
pub use event::{Event, EventQueue, FifoQueue};
pub use function::{Exception, FunctionHandler};
pub use types::Mode;

// Common types and traits
pub mod error;
pub mod types;

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
