use clap::ArgMatches;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;

use crate::utils::error::ModbusError;

/// Line speeds the counter supports. The discriminant is the code the device
/// stores in its baud rate register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum BaudRate {
    B2400 = 0,
    B4800 = 1,
    B9600 = 2,
    B14400 = 3,
    B19200 = 4,
    B28800 = 5,
    B38400 = 6,
    B57600 = 7,
    B115200 = 8,
}

impl BaudRate {
    pub const ALL: [BaudRate; 9] = [
        BaudRate::B2400,
        BaudRate::B4800,
        BaudRate::B9600,
        BaudRate::B14400,
        BaudRate::B19200,
        BaudRate::B28800,
        BaudRate::B38400,
        BaudRate::B57600,
        BaudRate::B115200,
    ];

    pub fn bps(self) -> u32 {
        match self {
            BaudRate::B2400 => 2400,
            BaudRate::B4800 => 4800,
            BaudRate::B9600 => 9600,
            BaudRate::B14400 => 14400,
            BaudRate::B19200 => 19200,
            BaudRate::B28800 => 28800,
            BaudRate::B38400 => 38400,
            BaudRate::B57600 => 57600,
            BaudRate::B115200 => 115200,
        }
    }

    pub fn code(self) -> u16 {
        self as u16
    }

    pub fn from_code(code: u16) -> Option<Self> {
        Self::ALL.get(code as usize).copied()
    }
}

impl TryFrom<u32> for BaudRate {
    type Error = String;

    fn try_from(bps: u32) -> Result<Self, Self::Error> {
        Self::ALL
            .iter()
            .copied()
            .find(|rate| rate.bps() == bps)
            .ok_or_else(|| format!("unsupported baud rate {}", bps))
    }
}

impl From<BaudRate> for u32 {
    fn from(rate: BaudRate) -> Self {
        rate.bps()
    }
}

impl fmt::Display for BaudRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.bps())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    None = 0,
    Even = 1,
    Odd = 2,
}

impl Parity {
    pub const ALL: [Parity; 3] = [Parity::None, Parity::Even, Parity::Odd];

    pub fn code(self) -> u16 {
        self as u16
    }

    pub fn from_code(code: u16) -> Option<Self> {
        Self::ALL.get(code as usize).copied()
    }

    fn letter(self) -> char {
        match self {
            Parity::None => 'N',
            Parity::Even => 'E',
            Parity::Odd => 'O',
        }
    }
}

impl std::str::FromStr for Parity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "n" => Ok(Parity::None),
            "even" | "e" => Ok(Parity::Even),
            "odd" | "o" => Ok(Parity::Odd),
            other => Err(format!("unknown parity '{}'", other)),
        }
    }
}

impl From<Parity> for serialport::Parity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => serialport::Parity::None,
            Parity::Even => serialport::Parity::Even,
            Parity::Odd => serialport::Parity::Odd,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum DataBits {
    Seven,
    Eight,
}

impl DataBits {
    pub const ALL: [DataBits; 2] = [DataBits::Seven, DataBits::Eight];

    pub fn bits(self) -> u8 {
        match self {
            DataBits::Seven => 7,
            DataBits::Eight => 8,
        }
    }
}

impl TryFrom<u8> for DataBits {
    type Error = String;

    fn try_from(bits: u8) -> Result<Self, Self::Error> {
        match bits {
            7 => Ok(DataBits::Seven),
            8 => Ok(DataBits::Eight),
            other => Err(format!("unsupported data bits {}", other)),
        }
    }
}

impl From<DataBits> for u8 {
    fn from(bits: DataBits) -> Self {
        bits.bits()
    }
}

impl From<DataBits> for serialport::DataBits {
    fn from(bits: DataBits) -> Self {
        match bits {
            DataBits::Seven => serialport::DataBits::Seven,
            DataBits::Eight => serialport::DataBits::Eight,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum StopBits {
    One,
    Two,
}

impl StopBits {
    pub const ALL: [StopBits; 2] = [StopBits::One, StopBits::Two];

    pub fn bits(self) -> u8 {
        match self {
            StopBits::One => 1,
            StopBits::Two => 2,
        }
    }
}

impl TryFrom<u8> for StopBits {
    type Error = String;

    fn try_from(bits: u8) -> Result<Self, Self::Error> {
        match bits {
            1 => Ok(StopBits::One),
            2 => Ok(StopBits::Two),
            other => Err(format!("unsupported stop bits {}", other)),
        }
    }
}

impl From<StopBits> for u8 {
    fn from(bits: StopBits) -> Self {
        bits.bits()
    }
}

impl From<StopBits> for serialport::StopBits {
    fn from(bits: StopBits) -> Self {
        match bits {
            StopBits::One => serialport::StopBits::One,
            StopBits::Two => serialport::StopBits::Two,
        }
    }
}

/// One candidate configuration of the physical link plus the slave address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SerialParameters {
    pub address: u8,
    pub baud_rate: BaudRate,
    pub parity: Parity,
    pub data_bits: DataBits,
    pub stop_bits: StopBits,
}

impl SerialParameters {
    pub fn new(
        address: u8,
        baud_rate: BaudRate,
        parity: Parity,
        data_bits: DataBits,
        stop_bits: StopBits,
    ) -> Result<Self, ModbusError> {
        if address == 0 {
            return Err(ModbusError::InvalidArgument(
                "device address must be in range 1-255".to_string(),
            ));
        }
        Ok(Self {
            address,
            baud_rate,
            parity,
            data_bits,
            stop_bits,
        })
    }

    /// Bits on the wire per character: start + data + parity + stop.
    pub fn bits_per_char(&self) -> u32 {
        let parity = if self.parity == Parity::None { 0 } else { 1 };
        1 + self.data_bits.bits() as u32 + parity + self.stop_bits.bits() as u32
    }

    /// Modbus t3.5 silence that terminates a frame. Fixed at 1750 us above
    /// 19200 bps.
    pub fn inter_frame_gap(&self) -> Duration {
        if self.baud_rate.bps() > 19200 {
            return Duration::from_micros(1750);
        }
        let micros = 3.5 * self.bits_per_char() as f64 * 1_000_000.0 / self.baud_rate.bps() as f64;
        Duration::from_micros(micros.ceil() as u64)
    }
}

impl Default for SerialParameters {
    fn default() -> Self {
        Self {
            address: 16,
            baud_rate: BaudRate::B9600,
            parity: Parity::None,
            data_bits: DataBits::Eight,
            stop_bits: StopBits::One,
        }
    }
}

impl fmt::Display for SerialParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "addr {} @ {} {}{}{}",
            self.address,
            self.baud_rate,
            self.data_bits.bits(),
            self.parity.letter(),
            self.stop_bits.bits()
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub first_address: u8,
    pub last_address: u8,
    pub baud_rates: Vec<BaudRate>,
    pub data_bits: Vec<DataBits>,
    pub parities: Vec<Parity>,
    pub stop_bits: Vec<StopBits>,
    pub probe_timeout_ms: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            first_address: 1,
            last_address: 254,
            baud_rates: BaudRate::ALL.to_vec(),
            data_bits: DataBits::ALL.to_vec(),
            parities: Parity::ALL.to_vec(),
            stop_bits: StopBits::ALL.to_vec(),
            probe_timeout_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    // Connection settings
    pub serial_port: String,
    pub device: SerialParameters,
    pub timeout_ms: u64,
    pub slow_timeout_ms: u64,
    pub inter_frame_gap_ms: Option<u64>,

    // Parameter search settings
    pub discovery: DiscoveryConfig,
}

impl Default for Config {
    fn default() -> Self {
        let serial_port = if cfg!(target_os = "windows") {
            "COM1"
        } else if cfg!(target_os = "macos") {
            "/dev/tty.usbserial-0001"
        } else {
            "/dev/ttyUSB0"
        };

        Self {
            serial_port: serial_port.to_string(),
            device: SerialParameters::default(),
            timeout_ms: 1000,
            slow_timeout_ms: 10000,
            inter_frame_gap_ms: None,
            discovery: DiscoveryConfig::default(),
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ModbusError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ModbusError::ConfigError(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;

        info!("📋 Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ModbusError> {
        // Create directory if it doesn't exist
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Overrides file/default values with whatever was given on the command line.
    pub fn apply_matches(&mut self, matches: &ArgMatches) -> Result<(), ModbusError> {
        if let Some(port) = matches.get_one::<String>("port") {
            self.serial_port = port.clone();
        }
        if let Some(&address) = matches.get_one::<u8>("address") {
            self.device.address = address;
        }
        if let Some(&baud) = matches.get_one::<u32>("baud") {
            self.device.baud_rate = BaudRate::try_from(baud).map_err(ModbusError::ConfigError)?;
        }
        if let Some(parity) = matches.get_one::<String>("parity") {
            self.device.parity = parity.parse().map_err(ModbusError::ConfigError)?;
        }
        if let Some(&bits) = matches.get_one::<u8>("data-bits") {
            self.device.data_bits = DataBits::try_from(bits).map_err(ModbusError::ConfigError)?;
        }
        if let Some(&bits) = matches.get_one::<u8>("stop-bits") {
            self.device.stop_bits = StopBits::try_from(bits).map_err(ModbusError::ConfigError)?;
        }
        if let Some(&timeout) = matches.get_one::<u64>("timeout-ms") {
            self.timeout_ms = timeout;
        }

        debug!("Effective configuration: {:?}", self);
        self.validate()
    }

    pub fn validate(&self) -> Result<(), ModbusError> {
        if self.serial_port.trim().is_empty() {
            return Err(ModbusError::ConfigError("serial_port is empty".to_string()));
        }
        if self.device.address == 0 {
            return Err(ModbusError::ConfigError(
                "device.address must be in range 1-255".to_string(),
            ));
        }
        if self.timeout_ms == 0 || self.slow_timeout_ms == 0 {
            return Err(ModbusError::ConfigError("timeouts must be non-zero".to_string()));
        }

        let discovery = &self.discovery;
        if discovery.first_address == 0 || discovery.first_address > discovery.last_address {
            return Err(ModbusError::ConfigError(format!(
                "invalid discovery address range {}-{}",
                discovery.first_address, discovery.last_address
            )));
        }
        if discovery.baud_rates.is_empty()
            || discovery.data_bits.is_empty()
            || discovery.parities.is_empty()
            || discovery.stop_bits.is_empty()
        {
            return Err(ModbusError::ConfigError(
                "discovery dimensions must not be empty".to_string(),
            ));
        }
        if discovery.probe_timeout_ms == 0 {
            return Err(ModbusError::ConfigError("probe_timeout_ms must be non-zero".to_string()));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn slow_timeout(&self) -> Duration {
        Duration::from_millis(self.slow_timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery.probe_timeout_ms)
    }

    pub fn inter_frame_gap(&self) -> Option<Duration> {
        self.inter_frame_gap_ms.map(Duration::from_millis)
    }
}
