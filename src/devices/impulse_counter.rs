use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;

use super::options::{
    CommunicationOptions, CounterOptions, CurrentMode, RegisterWrite, COMMUNICATION_REG_COUNT,
    COMMUNICATION_REG_START, COUNTER_REG_COUNT, COUNTER_REG_START,
};
use super::traits::DeviceData;
use crate::config::settings::{Config, SerialParameters};
use crate::modbus::client::ModbusClient;
use crate::modbus::discovery::{Discovery, DiscoveryOutcome, SearchSpace, PROBE_REGISTER};
use crate::modbus::transport::{Connector, SerialTransport, Transport};
use crate::modbus::{PROBE_TIMEOUT, SLOW_TIMEOUT};
use crate::utils::error::ModbusError;

const INPUT_COUNTER_VALUE: u16 = 0x0000;
const INPUT_COUNTER_EU: u16 = 0x0002;
const INPUT_START_STOP: u16 = 0x0004;
const INPUT_CURRENT_MODE: u16 = 0x0005;
const INPUT_NETWORK_ERROR: u16 = 0x0006;
const INPUT_DEVICE_NAME: u16 = 0x0007;
const INPUT_VERSION: u16 = 0x0009;

const DISCRETE_RESET: u16 = 0x0000;
const DISCRETE_LOCK: u16 = 0x0001;

const COIL_OUTPUT_1: u16 = 0x0000;
const COIL_OUTPUT_2: u16 = 0x0001;
const COIL_RESET_COUNT: u16 = 0x0002;
const COIL_PROGRAM_CONTROL: u16 = 0x0003;
const COIL_START_STOP: u16 = 0x0004;

/// The counter block is answered slowly; it is read in two halves.
const COUNTER_FIRST_HALF: u16 = 13;

/// How [`ImpulseCounter::discover`] ended.
pub enum CounterSearch<T: Transport> {
    Found {
        counter: ImpulseCounter<T>,
        parameters: SerialParameters,
    },
    /// Stopped by the progress callback. `client` is the trial line that was
    /// open at that point; nothing has answered on it.
    Cancelled {
        client: Option<ModbusClient<T>>,
        parameters: SerialParameters,
        attempts: u32,
    },
    NotFound { attempts: u32 },
}

impl<T: Transport> CounterSearch<T> {
    /// The found counter and its line settings, if any.
    pub fn found(self) -> Option<(ImpulseCounter<T>, SerialParameters)> {
        match self {
            CounterSearch::Found { counter, parameters } => Some((counter, parameters)),
            _ => None,
        }
    }
}

/// Impulse counter with an RS-485 Modbus RTU interface.
///
/// Reads return `Ok(None)` when the device gave no trustworthy answer.
pub struct ImpulseCounter<T: Transport> {
    client: ModbusClient<T>,
    slow_timeout: Duration,
}

impl ImpulseCounter<SerialTransport> {
    /// Opens the configured port and checks that the device answers.
    pub async fn open(config: &Config) -> Result<Self, ModbusError> {
        let transport =
            SerialTransport::open_with_gap(&config.serial_port, &config.device, config.inter_frame_gap())?;
        let client = ModbusClient::new(transport, config.device.address)?.with_timeout(config.timeout());

        let counter = Self::connect(client, config.probe_timeout()).await?;
        Ok(counter.with_slow_timeout(config.slow_timeout()))
    }
}

impl<T: Transport> ImpulseCounter<T> {
    /// Wraps `client` after probing holding register 0.
    pub async fn connect(mut client: ModbusClient<T>, probe_timeout: Duration) -> Result<Self, ModbusError> {
        let probe = client
            .read_holding_registers(PROBE_REGISTER, 1, Some(probe_timeout))
            .await?;
        if probe.is_empty() {
            return Err(ModbusError::DeviceNotFound(format!(
                "No answer from device {}",
                client.slave_id()
            )));
        }

        info!("✅ Impulse counter {} connected", client.slave_id());
        Ok(Self::from_client(client))
    }

    /// Wraps an already verified client, e.g. one handed over by discovery.
    pub fn from_client(client: ModbusClient<T>) -> Self {
        Self {
            client,
            slow_timeout: SLOW_TIMEOUT,
        }
    }

    /// Searches `space` for the device.
    pub async fn discover<C, F>(
        connector: C,
        space: SearchSpace,
        probe_timeout: Option<Duration>,
        progress: F,
    ) -> Result<CounterSearch<T>, ModbusError>
    where
        C: Connector<Transport = T>,
        F: FnMut(u32, u32, &SerialParameters) -> bool,
    {
        let mut discovery =
            Discovery::new(connector, space)?.with_probe_timeout(probe_timeout.unwrap_or(PROBE_TIMEOUT));

        Ok(match discovery.run(progress).await {
            DiscoveryOutcome::Found { client, parameters } => CounterSearch::Found {
                counter: Self::from_client(client),
                parameters,
            },
            DiscoveryOutcome::Cancelled {
                client,
                parameters,
                attempts,
            } => {
                warn!("Search cancelled at {}", parameters);
                CounterSearch::Cancelled {
                    client,
                    parameters,
                    attempts,
                }
            }
            DiscoveryOutcome::Exhausted { attempts } => {
                warn!("No impulse counter found after {} attempts", attempts);
                CounterSearch::NotFound { attempts }
            }
        })
    }

    pub fn with_slow_timeout(mut self, slow_timeout: Duration) -> Self {
        self.slow_timeout = slow_timeout;
        self
    }

    pub fn address(&self) -> u8 {
        self.client.slave_id()
    }

    pub fn client_mut(&mut self) -> &mut ModbusClient<T> {
        &mut self.client
    }

    pub fn into_client(self) -> ModbusClient<T> {
        self.client
    }

    pub async fn communication_options(&mut self) -> Result<Option<CommunicationOptions>, ModbusError> {
        let registers = self
            .client
            .read_holding_registers(COMMUNICATION_REG_START, COMMUNICATION_REG_COUNT, None)
            .await?;
        if registers.is_empty() {
            return Ok(None);
        }
        CommunicationOptions::from_registers(&registers).map(Some)
    }

    /// Writes every field set in `options`. True only if all writes were
    /// acknowledged; a failed write does not stop the remaining ones.
    pub async fn set_communication_options(&mut self, options: &CommunicationOptions) -> Result<bool, ModbusError> {
        self.apply(&options.writes()).await
    }

    pub async fn counter_options(&mut self) -> Result<Option<CounterOptions>, ModbusError> {
        let timeout = Some(self.slow_timeout);
        let mut registers = self
            .client
            .read_holding_registers(COUNTER_REG_START, COUNTER_FIRST_HALF, timeout)
            .await?;
        if registers.is_empty() {
            return Ok(None);
        }

        let rest = self
            .client
            .read_holding_registers(
                COUNTER_REG_START + COUNTER_FIRST_HALF,
                COUNTER_REG_COUNT - COUNTER_FIRST_HALF,
                timeout,
            )
            .await?;
        if rest.is_empty() {
            return Ok(None);
        }
        registers.extend(rest);

        CounterOptions::from_registers(&registers).map(Some)
    }

    pub async fn set_counter_options(&mut self, options: &CounterOptions) -> Result<bool, ModbusError> {
        self.apply(&options.writes()).await
    }

    /// Raw pulse count.
    pub async fn counter_value(&mut self) -> Result<Option<i32>, ModbusError> {
        self.read_i32(INPUT_COUNTER_VALUE).await
    }

    /// Count scaled to engineering units.
    pub async fn counter_eu(&mut self) -> Result<Option<i32>, ModbusError> {
        self.read_i32(INPUT_COUNTER_EU).await
    }

    pub async fn start_stop_mode(&mut self) -> Result<Option<bool>, ModbusError> {
        Ok(self.read_input(INPUT_START_STOP).await?.map(|value| value != 0))
    }

    pub async fn current_mode(&mut self) -> Result<Option<CurrentMode>, ModbusError> {
        self.read_input(INPUT_CURRENT_MODE)
            .await?
            .map(CurrentMode::from_code)
            .transpose()
    }

    pub async fn network_error_code(&mut self) -> Result<Option<u8>, ModbusError> {
        Ok(self.read_input(INPUT_NETWORK_ERROR).await?.map(|value| (value & 0xFF) as u8))
    }

    pub async fn device_name(&mut self) -> Result<Option<String>, ModbusError> {
        self.read_text(INPUT_DEVICE_NAME).await
    }

    pub async fn version(&mut self) -> Result<Option<String>, ModbusError> {
        self.read_text(INPUT_VERSION).await
    }

    pub async fn is_reset_input(&mut self) -> Result<Option<bool>, ModbusError> {
        first(self.client.read_discrete_inputs(DISCRETE_RESET, 1, None).await?)
    }

    pub async fn is_lock_input(&mut self) -> Result<Option<bool>, ModbusError> {
        first(self.client.read_discrete_inputs(DISCRETE_LOCK, 1, None).await?)
    }

    pub async fn output_state_1(&mut self) -> Result<Option<bool>, ModbusError> {
        first(self.client.read_coils(COIL_OUTPUT_1, 1, None).await?)
    }

    pub async fn output_state_2(&mut self) -> Result<Option<bool>, ModbusError> {
        first(self.client.read_coils(COIL_OUTPUT_2, 1, None).await?)
    }

    pub async fn is_reset_count(&mut self) -> Result<Option<bool>, ModbusError> {
        first(self.client.read_coils(COIL_RESET_COUNT, 1, None).await?)
    }

    pub async fn reset_count(&mut self) -> Result<bool, ModbusError> {
        info!("🔄 Resetting counter on device {}", self.address());
        self.client.write_single_coil(COIL_RESET_COUNT, true, None).await
    }

    pub async fn control_from_program(&mut self, enabled: bool) -> Result<bool, ModbusError> {
        self.client.write_single_coil(COIL_PROGRAM_CONTROL, enabled, None).await
    }

    pub async fn start_counter(&mut self, start: bool) -> Result<bool, ModbusError> {
        self.client.write_single_coil(COIL_START_STOP, start, None).await
    }

    pub async fn stop_counter(&mut self, stop: bool) -> Result<bool, ModbusError> {
        self.start_counter(!stop).await
    }

    /// Reads all runtime values in one pass.
    pub async fn snapshot(&mut self) -> Result<CounterSnapshot, ModbusError> {
        Ok(CounterSnapshot {
            device_address: self.address(),
            timestamp: Utc::now(),
            counter_value: self.counter_value().await?,
            counter_eu: self.counter_eu().await?,
            running: self.start_stop_mode().await?,
            current_mode: self.current_mode().await?,
            network_error_code: self.network_error_code().await?,
            reset_input: self.is_reset_input().await?,
            lock_input: self.is_lock_input().await?,
            output_1: self.output_state_1().await?,
            output_2: self.output_state_2().await?,
        })
    }

    async fn apply(&mut self, writes: &[RegisterWrite]) -> Result<bool, ModbusError> {
        let mut all_ok = true;
        for write in writes {
            let ok = match write {
                RegisterWrite::Single { address, value } => {
                    self.client.write_single_register(*address, *value, None).await?
                }
                RegisterWrite::Double { address, .. } => {
                    self.client
                        .write_multiple_registers(*address, &write.registers(), None)
                        .await?
                }
            };
            if !ok {
                warn!("⚠️  Device {} rejected write to 0x{:04X}", self.address(), write.address());
            }
            all_ok &= ok;
        }
        Ok(all_ok)
    }

    async fn read_input(&mut self, address: u16) -> Result<Option<u16>, ModbusError> {
        Ok(self
            .client
            .read_input_registers(address, 1, None)
            .await?
            .first()
            .copied())
    }

    async fn read_i32(&mut self, address: u16) -> Result<Option<i32>, ModbusError> {
        let registers = self.client.read_input_registers(address, 2, None).await?;
        Ok(match registers.as_slice() {
            [high, low] => Some((((*high as u32) << 16) | *low as u32) as i32),
            _ => None,
        })
    }

    async fn read_text(&mut self, address: u16) -> Result<Option<String>, ModbusError> {
        let registers = self.client.read_input_registers(address, 2, None).await?;
        if registers.len() != 2 {
            return Ok(None);
        }
        Ok(Some(decode_text(&registers)))
    }
}

fn first(bits: Vec<bool>) -> Result<Option<bool>, ModbusError> {
    Ok(bits.into_iter().next())
}

/// Two characters per register, high byte first. Padding NULs and spaces
/// are trimmed.
fn decode_text(registers: &[u16]) -> String {
    let bytes: Vec<u8> = registers.iter().flat_map(|r| r.to_be_bytes()).collect();
    String::from_utf8_lossy(&bytes)
        .trim_matches(|c: char| c == '\0' || c == ' ')
        .to_string()
}

#[derive(Debug, Clone, Serialize)]
pub struct CounterSnapshot {
    pub device_address: u8,
    pub timestamp: DateTime<Utc>,
    pub counter_value: Option<i32>,
    pub counter_eu: Option<i32>,
    pub running: Option<bool>,
    pub current_mode: Option<CurrentMode>,
    pub network_error_code: Option<u8>,
    pub reset_input: Option<bool>,
    pub lock_input: Option<bool>,
    pub output_1: Option<bool>,
    pub output_2: Option<bool>,
}

impl DeviceData for CounterSnapshot {
    fn device_address(&self) -> u8 {
        self.device_address
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    fn get_parameter(&self, name: &str) -> Option<String> {
        match name {
            "CounterValue" => self.counter_value.map(|v| v.to_string()),
            "CounterEU" => self.counter_eu.map(|v| v.to_string()),
            "Running" => self.running.map(|v| v.to_string()),
            "CurrentMode" => self.current_mode.map(|v| format!("{:?}", v)),
            "NetworkErrorCode" => self.network_error_code.map(|v| v.to_string()),
            "ResetInput" => self.reset_input.map(|v| v.to_string()),
            "LockInput" => self.lock_input.map(|v| v.to_string()),
            "Output1" => self.output_1.map(|v| v.to_string()),
            "Output2" => self.output_2.map(|v| v.to_string()),
            _ => None,
        }
    }

    fn get_all_parameters(&self) -> Vec<(String, String)> {
        [
            "CounterValue",
            "CounterEU",
            "Running",
            "CurrentMode",
            "NetworkErrorCode",
            "ResetInput",
            "LockInput",
            "Output1",
            "Output2",
        ]
        .iter()
        .filter_map(|name| self.get_parameter(name).map(|value| (name.to_string(), value)))
        .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modbus::testing::{registers_reply, reply, ScriptedTransport};

    async fn counter(replies: Vec<Result<crate::modbus::Exchange, ModbusError>>) -> ImpulseCounter<ScriptedTransport> {
        let mut script = vec![registers_reply(16, 0x03, &[2])];
        script.extend(replies);
        let client = ModbusClient::new(ScriptedTransport::new(script), 16).unwrap();
        ImpulseCounter::connect(client, PROBE_TIMEOUT).await.unwrap()
    }

    #[tokio::test]
    async fn test_connect_requires_answer() {
        let client = ModbusClient::new(ScriptedTransport::silent(), 16).unwrap();
        let result = ImpulseCounter::connect(client, PROBE_TIMEOUT).await;
        assert!(matches!(result, Err(ModbusError::DeviceNotFound(_))));
    }

    #[tokio::test]
    async fn test_counter_value_is_signed() {
        let mut device = counter(vec![
            registers_reply(16, 0x04, &[0xFFFF, 0xFFFE]),
            registers_reply(16, 0x04, &[0x0001, 0x0000]),
        ])
        .await;
        assert_eq!(device.counter_value().await.unwrap(), Some(-2));
        assert_eq!(device.counter_eu().await.unwrap(), Some(65536));
        assert_eq!(device.counter_value().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_device_name_and_version() {
        let mut device = counter(vec![
            registers_reply(16, 0x04, &[u16::from_be_bytes(*b"CI"), u16::from_be_bytes(*b"8\0")]),
            registers_reply(16, 0x04, &[u16::from_be_bytes(*b"V1"), u16::from_be_bytes(*b".2")]),
        ])
        .await;
        assert_eq!(device.device_name().await.unwrap(), Some("CI8".to_string()));
        assert_eq!(device.version().await.unwrap(), Some("V1.2".to_string()));
    }

    #[tokio::test]
    async fn test_mode_registers() {
        let mut device = counter(vec![
            registers_reply(16, 0x04, &[1]),
            registers_reply(16, 0x04, &[2]),
            registers_reply(16, 0x04, &[0x0107]),
            registers_reply(16, 0x04, &[9]),
        ])
        .await;
        assert_eq!(device.start_stop_mode().await.unwrap(), Some(true));
        assert_eq!(device.current_mode().await.unwrap(), Some(CurrentMode::SetFromNetwork));
        assert_eq!(device.network_error_code().await.unwrap(), Some(7));
        assert!(matches!(device.current_mode().await, Err(ModbusError::InvalidData(_))));
    }

    #[tokio::test]
    async fn test_bits() {
        let mut device = counter(vec![
            reply(vec![16, 0x02, 0x01, 0x01]),
            reply(vec![16, 0x01, 0x01, 0x00]),
        ])
        .await;
        assert_eq!(device.is_lock_input().await.unwrap(), Some(true));
        assert_eq!(device.output_state_2().await.unwrap(), Some(false));
        assert_eq!(device.is_reset_count().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_stop_counter_writes_inverted_coil() {
        let transport = ScriptedTransport::new(vec![registers_reply(16, 0x03, &[2])]);
        let sent = transport.sent();
        let client = ModbusClient::new(transport, 16).unwrap();
        let mut device = ImpulseCounter::connect(client, PROBE_TIMEOUT).await.unwrap();

        // No more scripted replies: echo is not enabled so the write fails
        assert!(!device.stop_counter(true).await.unwrap());
        let sent = sent.lock().unwrap();
        assert_eq!(&sent[1].0[..6], &[16, 0x05, 0x00, 0x04, 0x00, 0x00]);
    }

    #[tokio::test]
    async fn test_counter_options_read_in_two_blocks() {
        let mut first = vec![0u16; 13];
        first[0] = 1;
        let mut second = vec![0u16; 11];
        second[2] = 1; // multiplier low word
        second[3] = 1000; // max frequency
        second[5] = 1; // min control low word
        second[8] = 3; // brightness

        let transport = ScriptedTransport::new(vec![
            registers_reply(16, 0x03, &[2]),
            registers_reply(16, 0x03, &first),
            registers_reply(16, 0x03, &second),
        ]);
        let sent = transport.sent();
        let client = ModbusClient::new(transport, 16).unwrap();
        let mut device = ImpulseCounter::connect(client, PROBE_TIMEOUT).await.unwrap();

        let options = device.counter_options().await.unwrap().unwrap();
        assert_eq!(options.brightness, Some(3));
        assert_eq!(options.multiplier, Some(1));

        let sent = sent.lock().unwrap();
        assert_eq!(&sent[1].0[..6], &[16, 0x03, 0x00, 0x07, 0x00, 0x0D]);
        assert_eq!(&sent[2].0[..6], &[16, 0x03, 0x00, 0x14, 0x00, 0x0B]);
        assert_eq!(sent[1].1, SLOW_TIMEOUT);
    }

    #[tokio::test]
    async fn test_set_options_reports_conjunction() {
        let options = CounterOptions::new()
            .brightness(2)
            .unwrap()
            .set_point_1(10)
            .unwrap();

        let transport = ScriptedTransport::new(vec![
            registers_reply(16, 0x03, &[2]),
            reply(vec![16, 0x10, 0x00, 0x0C, 0x00, 0x02]),
        ]);
        let sent = transport.sent();
        let client = ModbusClient::new(transport, 16).unwrap();
        let mut device = ImpulseCounter::connect(client, PROBE_TIMEOUT).await.unwrap();

        // Second write (brightness) times out
        assert!(!device.set_counter_options(&options).await.unwrap());
        assert_eq!(sent.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_snapshot_keeps_partial_answers() {
        let mut device = counter(vec![registers_reply(16, 0x04, &[0, 42])]).await;
        let snapshot = device.snapshot().await.unwrap();
        assert_eq!(snapshot.counter_value, Some(42));
        assert_eq!(snapshot.counter_eu, None);
        assert_eq!(snapshot.get_parameter("CounterValue"), Some("42".to_string()));
        assert_eq!(snapshot.get_all_parameters().len(), 1);
        assert_eq!(snapshot.to_json()["device_address"], 16);
    }

    #[test]
    fn test_decode_text_trims_padding() {
        assert_eq!(decode_text(&[0x4142, 0x2000]), "AB");
        assert_eq!(decode_text(&[0x0000, 0x0000]), "");
    }
}
