use std::time::Duration;

pub mod client;
pub mod crc;
pub mod discovery;
pub mod protocol;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use client::ModbusClient;
pub use crc::crc16_modbus;
pub use discovery::{Discovery, DiscoveryOutcome, SearchSpace};
pub use protocol::{FunctionCode, ModbusRequest, ModbusResponse};
pub use transport::{list_ports, Connector, Exchange, PortInfo, SerialConnector, SerialTransport, Transport};

/// Reply timeout for ordinary requests.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);
/// Reply timeout while probing during discovery.
pub const PROBE_TIMEOUT: Duration = Duration::from_millis(100);
/// Reply timeout for requests the device answers slowly (counter options block).
pub const SLOW_TIMEOUT: Duration = Duration::from_millis(10000);
