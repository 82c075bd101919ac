use serde::{Deserialize, Serialize};

use crate::config::settings::{BaudRate, DataBits, Parity, StopBits};
use crate::utils::error::ModbusError;

/// First holding register of the communication block.
pub const COMMUNICATION_REG_START: u16 = 0x0000;
pub const COMMUNICATION_REG_COUNT: u16 = 7;
/// First holding register of the counter block.
pub const COUNTER_REG_START: u16 = 0x0007;
pub const COUNTER_REG_COUNT: u16 = 24;

/// One pending write produced by an options object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterWrite {
    /// Function 0x06.
    Single { address: u16, value: u16 },
    /// Function 0x10, high word first.
    Double { address: u16, value: u32 },
}

impl RegisterWrite {
    pub fn address(&self) -> u16 {
        match self {
            RegisterWrite::Single { address, .. } | RegisterWrite::Double { address, .. } => *address,
        }
    }

    pub fn registers(&self) -> Vec<u16> {
        match *self {
            RegisterWrite::Single { value, .. } => vec![value],
            RegisterWrite::Double { value, .. } => vec![(value >> 16) as u16, (value & 0xFFFF) as u16],
        }
    }
}

macro_rules! register_code {
    ($(#[$meta:meta])* $name:ident { $($variant:ident = $code:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant = $code),+
        }

        impl $name {
            pub fn code(self) -> u16 {
                self as u16
            }

            pub fn from_code(code: u16) -> Result<Self, ModbusError> {
                match code {
                    $($code => Ok($name::$variant),)+
                    _ => Err(ModbusError::InvalidData(format!(
                        "Unknown {} code: {}",
                        stringify!($name),
                        code
                    ))),
                }
            }
        }
    };
}

register_code!(
    /// Digits shown after the decimal point.
    DecimalPoint { D0 = 0, D1 = 1, D2 = 2, D3 = 3, D4 = 4 }
);

register_code!(
    InputMode {
        Forward = 0,
        Backward = 1,
        ByCommand = 2,
        Individual = 3,
        Reverse = 4,
        Quadrature = 5,
    }
);

register_code!(
    OutputMode {
        AboveThreshold = 0,
        BelowThreshold = 1,
        AboveThresholdWithTimeout = 2,
        ThresholdMultiple = 3,
    }
);

register_code!(
    /// What the counter does once a set point is reached.
    SetPointMode {
        ContinueWithoutReset = 0,
        StopUntilReset = 1,
        ResetAndContinue = 2,
    }
);

register_code!(
    ResetType {
        ResetOnly = 0,
        ResetAndClearOutputs = 1,
        ResetAndWaitForStart = 2,
        ResetAndWaitForStop = 3,
    }
);

register_code!(
    KeyboardLock {
        Unlocked = 0,
        ResetLocked = 1,
        OptionsLocked = 2,
        ResetAndOptionsLocked = 3,
    }
);

register_code!(
    ShownSetPoint { First = 0, Second = 1 }
);

register_code!(
    InputType { Npn = 0, Pnp = 1 }
);

register_code!(
    /// Operating mode reported in input register 0x0005.
    CurrentMode {
        CountingNoPassword = 0,
        SetFromPanel = 1,
        SetFromNetwork = 2,
        CountingPasswordRequired = 3,
    }
);

fn check_range<T: PartialOrd + std::fmt::Display>(name: &str, value: T, min: T, max: T) -> Result<T, ModbusError> {
    if value < min || value > max {
        return Err(ModbusError::InvalidArgument(format!(
            "{} should be in range {}..{}, got {}",
            name, min, max, value
        )));
    }
    Ok(value)
}

/// A range violation read back from the device is bad data, not caller misuse.
fn from_device<T>(result: Result<T, ModbusError>) -> Result<T, ModbusError> {
    result.map_err(|e| match e {
        ModbusError::InvalidArgument(msg) => ModbusError::InvalidData(msg),
        other => other,
    })
}

fn flag(value: u16) -> bool {
    value != 0
}

fn join(high: u16, low: u16) -> u32 {
    ((high as u32) << 16) | low as u32
}

/// Line settings stored on the device (holding registers 0x0000..=0x0006).
/// Unset fields are left untouched on write.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommunicationOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub baud_rate: Option<BaudRate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_bits: Option<DataBits>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parity: Option<Parity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_bits: Option<StopBits>,
    /// 11-bit addressing when true, 8-bit otherwise.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extended_address: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_address: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer_delay_ms: Option<u8>,
}

impl CommunicationOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn baud_rate(mut self, baud_rate: BaudRate) -> Self {
        self.baud_rate = Some(baud_rate);
        self
    }

    pub fn data_bits(mut self, data_bits: DataBits) -> Self {
        self.data_bits = Some(data_bits);
        self
    }

    pub fn parity(mut self, parity: Parity) -> Self {
        self.parity = Some(parity);
        self
    }

    pub fn stop_bits(mut self, stop_bits: StopBits) -> Self {
        self.stop_bits = Some(stop_bits);
        self
    }

    pub fn extended_address(mut self, extended: bool) -> Self {
        self.extended_address = Some(extended);
        self
    }

    pub fn base_address(mut self, address: u16) -> Result<Self, ModbusError> {
        self.base_address = Some(check_range("Base address", address, 1, 2047)?);
        Ok(self)
    }

    /// RS-485 answer delay.
    pub fn answer_delay_ms(mut self, delay: u8) -> Result<Self, ModbusError> {
        self.answer_delay_ms = Some(check_range("Answer delay", delay, 0, 45)?);
        Ok(self)
    }

    pub fn from_registers(registers: &[u16]) -> Result<Self, ModbusError> {
        if registers.len() < COMMUNICATION_REG_COUNT as usize {
            return Err(ModbusError::InvalidData(format!(
                "Communication block needs {} registers, got {}",
                COMMUNICATION_REG_COUNT,
                registers.len()
            )));
        }

        let baud_rate = BaudRate::from_code(registers[0])
            .ok_or_else(|| ModbusError::InvalidData(format!("Unknown baud rate code: {}", registers[0])))?;
        let parity = Parity::from_code(registers[2])
            .ok_or_else(|| ModbusError::InvalidData(format!("Unknown parity code: {}", registers[2])))?;
        let data_bits = if flag(registers[1]) { DataBits::Eight } else { DataBits::Seven };
        let stop_bits = if flag(registers[3]) { StopBits::Two } else { StopBits::One };
        let delay = u8::try_from(registers[6])
            .map_err(|_| ModbusError::InvalidData(format!("Answer delay out of range: {}", registers[6])))?;

        from_device(
            Self::new()
                .baud_rate(baud_rate)
                .data_bits(data_bits)
                .parity(parity)
                .stop_bits(stop_bits)
                .extended_address(flag(registers[4]))
                .base_address(registers[5])
                .and_then(|options| options.answer_delay_ms(delay)),
        )
    }

    pub fn writes(&self) -> Vec<RegisterWrite> {
        let fields = [
            self.baud_rate.map(BaudRate::code),
            self.data_bits.map(|bits| (bits == DataBits::Eight) as u16),
            self.parity.map(Parity::code),
            self.stop_bits.map(|bits| (bits == StopBits::Two) as u16),
            self.extended_address.map(u16::from),
            self.base_address,
            self.answer_delay_ms.map(u16::from),
        ];

        fields
            .iter()
            .zip(COMMUNICATION_REG_START..)
            .filter_map(|(value, address)| value.map(|value| RegisterWrite::Single { address, value }))
            .collect()
    }
}

/// Counting behaviour stored on the device (holding registers 0x0007..=0x001E).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decimal_point: Option<DecimalPoint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_mode: Option<InputMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_mode: Option<OutputMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub set_point_mode: Option<SetPointMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_type: Option<ResetType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub set_point_1: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub set_point_2: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_1: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_2: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decimal_multiplier: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub multiplier: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_frequency: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_control: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keyboard_lock: Option<KeyboardLock>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shown_set_point: Option<ShownSetPoint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub brightness: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_type: Option<InputType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<u16>,
}

impl CounterOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decimal_point(mut self, value: DecimalPoint) -> Self {
        self.decimal_point = Some(value);
        self
    }

    pub fn input_mode(mut self, value: InputMode) -> Self {
        self.input_mode = Some(value);
        self
    }

    pub fn output_mode(mut self, value: OutputMode) -> Self {
        self.output_mode = Some(value);
        self
    }

    pub fn set_point_mode(mut self, value: SetPointMode) -> Self {
        self.set_point_mode = Some(value);
        self
    }

    pub fn reset_type(mut self, value: ResetType) -> Self {
        self.reset_type = Some(value);
        self
    }

    pub fn set_point_1(mut self, value: i32) -> Result<Self, ModbusError> {
        self.set_point_1 = Some(check_range("Set point 1", value, -99_999, 999_999)?);
        Ok(self)
    }

    pub fn set_point_2(mut self, value: i32) -> Result<Self, ModbusError> {
        self.set_point_2 = Some(check_range("Set point 2", value, -99_999, 999_999)?);
        Ok(self)
    }

    pub fn timeout_1(mut self, value: u32) -> Result<Self, ModbusError> {
        self.timeout_1 = Some(check_range("Timeout 1", value, 0, 999_990)?);
        Ok(self)
    }

    pub fn timeout_2(mut self, value: u32) -> Result<Self, ModbusError> {
        self.timeout_2 = Some(check_range("Timeout 2", value, 0, 999_990)?);
        Ok(self)
    }

    pub fn decimal_multiplier(mut self, value: u8) -> Result<Self, ModbusError> {
        self.decimal_multiplier = Some(check_range("Decimal multiplier", value, 0, 5)?);
        Ok(self)
    }

    pub fn multiplier(mut self, value: u32) -> Result<Self, ModbusError> {
        self.multiplier = Some(check_range("Multiplier", value, 1, 999_999)?);
        Ok(self)
    }

    pub fn max_frequency(mut self, value: u16) -> Result<Self, ModbusError> {
        self.max_frequency = Some(check_range("Max frequency", value, 1, 50_000)?);
        Ok(self)
    }

    pub fn min_control(mut self, value: u32) -> Result<Self, ModbusError> {
        self.min_control = Some(check_range("Min control", value, 1, 999_999)?);
        Ok(self)
    }

    pub fn keyboard_lock(mut self, value: KeyboardLock) -> Self {
        self.keyboard_lock = Some(value);
        self
    }

    pub fn shown_set_point(mut self, value: ShownSetPoint) -> Self {
        self.shown_set_point = Some(value);
        self
    }

    pub fn brightness(mut self, value: u8) -> Result<Self, ModbusError> {
        self.brightness = Some(check_range("Brightness", value, 1, 3)?);
        Ok(self)
    }

    pub fn input_type(mut self, value: InputType) -> Self {
        self.input_type = Some(value);
        self
    }

    pub fn password(mut self, value: u16) -> Result<Self, ModbusError> {
        self.password = Some(check_range("Password", value, 0, 9999)?);
        Ok(self)
    }

    /// Decodes the 24-register block starting at 0x0007.
    pub fn from_registers(r: &[u16]) -> Result<Self, ModbusError> {
        if r.len() < COUNTER_REG_COUNT as usize {
            return Err(ModbusError::InvalidData(format!(
                "Counter block needs {} registers, got {}",
                COUNTER_REG_COUNT,
                r.len()
            )));
        }

        let options = Self::new()
            .decimal_point(DecimalPoint::from_code(r[0])?)
            .input_mode(InputMode::from_code(r[1])?)
            .output_mode(OutputMode::from_code(r[2])?)
            .set_point_mode(SetPointMode::from_code(r[3])?)
            .reset_type(ResetType::from_code(r[4])?)
            .keyboard_lock(KeyboardLock::from_code(r[19])?)
            .shown_set_point(ShownSetPoint::from_code(r[20])?)
            .input_type(InputType::from_code(r[22])?);

        from_device(options.with_ranged_fields(r))
    }

    fn with_ranged_fields(self, r: &[u16]) -> Result<Self, ModbusError> {
        let narrow = |index: usize| {
            u8::try_from(r[index]).map_err(|_| {
                ModbusError::InvalidArgument(format!(
                    "Register 0x{:04X} out of range: {}",
                    COUNTER_REG_START + index as u16,
                    r[index]
                ))
            })
        };

        self.set_point_1(join(r[5], r[6]) as i32)?
            .set_point_2(join(r[7], r[8]) as i32)?
            .timeout_1(join(r[9], r[10]))?
            .timeout_2(join(r[11], r[12]))?
            .decimal_multiplier(narrow(13)?)?
            .multiplier(join(r[14], r[15]))?
            .max_frequency(r[16])?
            .min_control(join(r[17], r[18]))?
            .brightness(narrow(21)?)?
            .password(r[23])
    }

    pub fn writes(&self) -> Vec<RegisterWrite> {
        let single = |address: u16, value: Option<u16>| value.map(|value| RegisterWrite::Single { address, value });
        let double = |address: u16, value: Option<u32>| value.map(|value| RegisterWrite::Double { address, value });

        [
            single(0x0007, self.decimal_point.map(DecimalPoint::code)),
            single(0x0008, self.input_mode.map(InputMode::code)),
            single(0x0009, self.output_mode.map(OutputMode::code)),
            single(0x000A, self.set_point_mode.map(SetPointMode::code)),
            single(0x000B, self.reset_type.map(ResetType::code)),
            double(0x000C, self.set_point_1.map(|v| v as u32)),
            double(0x000E, self.set_point_2.map(|v| v as u32)),
            double(0x0010, self.timeout_1),
            double(0x0012, self.timeout_2),
            single(0x0014, self.decimal_multiplier.map(u16::from)),
            double(0x0015, self.multiplier),
            single(0x0017, self.max_frequency),
            double(0x0018, self.min_control),
            single(0x001A, self.keyboard_lock.map(KeyboardLock::code)),
            single(0x001B, self.shown_set_point.map(ShownSetPoint::code)),
            single(0x001C, self.brightness.map(u16::from)),
            single(0x001D, self.input_type.map(InputType::code)),
            single(0x001E, self.password),
        ]
        .into_iter()
        .flatten()
        .collect()
    }
}
