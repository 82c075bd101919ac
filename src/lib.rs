//! Modbus RTU master for RS-485 impulse counters.
//!
//! Layers, bottom up: CRC and frame codec (`modbus::crc`, `modbus::protocol`),
//! a byte transport over a serial line (`modbus::transport`), the request/reply
//! client (`modbus::client`), brute-force line parameter search
//! (`modbus::discovery`) and the counter's register map (`devices`).

pub mod cli;
pub mod config;
pub mod devices;
pub mod modbus;
pub mod utils;

// Re-export commonly used types
pub use config::{Config, SerialParameters};
pub use devices::{CommunicationOptions, CounterOptions, CounterSearch, CounterSnapshot, DeviceData, ImpulseCounter};
pub use modbus::{Discovery, DiscoveryOutcome, ModbusClient, SearchSpace, SerialTransport, Transport};
pub use utils::error::{FrameError, ModbusError};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
