use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModbusError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Communication error: {0}")]
    CommunicationError(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl ModbusError {
    /// True when the caller passed something the protocol cannot express,
    /// as opposed to a fault on the line or in the device.
    pub fn is_caller_error(&self) -> bool {
        matches!(self, ModbusError::InvalidArgument(_))
    }
}

/// Reasons a response frame is rejected. These never reach the caller as
/// errors; the client logs them and reports "no answer".
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("no response within {0} ms")]
    Timeout(u128),

    #[error("frame too short: {actual} bytes, need at least {expected}")]
    TooShort { expected: usize, actual: usize },

    #[error("unexpected frame length: expected {expected} bytes, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("address mismatch: expected {expected}, got {actual}")]
    AddressMismatch { expected: u8, actual: u8 },

    #[error("function mismatch: expected 0x{expected:02x}, got 0x{actual:02x}")]
    FunctionMismatch { expected: u8, actual: u8 },

    #[error("byte count mismatch: expected {expected}, got {actual}")]
    ByteCountMismatch { expected: usize, actual: usize },

    #[error("CRC mismatch: calculated 0x{calculated:04x}, received 0x{received:04x}")]
    CrcMismatch { calculated: u16, received: u16 },

    #[error("echo does not match request")]
    EchoMismatch,

    #[error("device exception 0x{code:02x} for function 0x{function:02x}")]
    Exception { function: u8, code: u8 },
}

impl From<serialport::Error> for ModbusError {
    fn from(err: serialport::Error) -> Self {
        ModbusError::ConnectionError(format!("Serial port error: {}", err))
    }
}

impl From<toml::de::Error> for ModbusError {
    fn from(err: toml::de::Error) -> Self {
        ModbusError::ConfigError(format!("TOML parse error: {}", err))
    }
}

impl From<toml::ser::Error> for ModbusError {
    fn from(err: toml::ser::Error) -> Self {
        ModbusError::SerializationError(format!("TOML error: {}", err))
    }
}

impl From<std::io::Error> for ModbusError {
    fn from(err: std::io::Error) -> Self {
        ModbusError::CommunicationError(format!("IO error: {}", err))
    }
}
