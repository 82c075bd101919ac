use log::{debug, info};
use std::time::Duration;

use super::protocol::{ModbusRequest, ModbusResponse};
use super::transport::{SerialTransport, Transport};
use super::DEFAULT_TIMEOUT;
use crate::config::settings::SerialParameters;
use crate::utils::error::{FrameError, ModbusError};

/// Modbus RTU master bound to one slave address on one transport.
///
/// Every operation is a single exchange: no retries. "No trustworthy answer"
/// (timeout, malformed frame, CRC error, exception reply) is an empty vector
/// for reads and `false` for writes. `Err` means the caller asked for
/// something invalid or the request could not be written.
pub struct ModbusClient<T: Transport> {
    transport: T,
    slave_id: u8,
    timeout: Duration,
}

impl ModbusClient<SerialTransport> {
    pub fn connect(port_name: &str, params: &SerialParameters) -> Result<Self, ModbusError> {
        info!("🔌 Connecting to Modbus RTU port: {}", port_name);
        info!(
            "⚙️  Configuration: {} baud, {} data bits, {:?} parity, {} stop bit(s)",
            params.baud_rate,
            params.data_bits.bits(),
            params.parity,
            params.stop_bits.bits()
        );

        let transport = SerialTransport::open(port_name, params)?;
        let client = Self::new(transport, params.address)?;

        info!("✅ Modbus RTU connection established successfully");
        Ok(client)
    }
}

impl<T: Transport> ModbusClient<T> {
    pub fn new(transport: T, slave_id: u8) -> Result<Self, ModbusError> {
        if slave_id == 0 {
            return Err(ModbusError::InvalidArgument(
                "slave address 0 is broadcast and never answers".to_string(),
            ));
        }
        Ok(Self {
            transport,
            slave_id,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    /// Timeout used when an operation gets no override.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn slave_id(&self) -> u8 {
        self.slave_id
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    pub async fn read_coils(
        &mut self,
        start: u16,
        count: u16,
        timeout: Option<Duration>,
    ) -> Result<Vec<bool>, ModbusError> {
        let request = ModbusRequest::ReadCoils { start, count };
        Ok(bits(self.execute(&request, timeout).await?))
    }

    pub async fn read_discrete_inputs(
        &mut self,
        start: u16,
        count: u16,
        timeout: Option<Duration>,
    ) -> Result<Vec<bool>, ModbusError> {
        let request = ModbusRequest::ReadDiscreteInputs { start, count };
        Ok(bits(self.execute(&request, timeout).await?))
    }

    pub async fn read_holding_registers(
        &mut self,
        start: u16,
        count: u16,
        timeout: Option<Duration>,
    ) -> Result<Vec<u16>, ModbusError> {
        let request = ModbusRequest::ReadHoldingRegisters { start, count };
        Ok(registers(self.execute(&request, timeout).await?))
    }

    pub async fn read_input_registers(
        &mut self,
        start: u16,
        count: u16,
        timeout: Option<Duration>,
    ) -> Result<Vec<u16>, ModbusError> {
        let request = ModbusRequest::ReadInputRegisters { start, count };
        Ok(registers(self.execute(&request, timeout).await?))
    }

    pub async fn write_single_coil(
        &mut self,
        address: u16,
        value: bool,
        timeout: Option<Duration>,
    ) -> Result<bool, ModbusError> {
        let request = ModbusRequest::WriteSingleCoil { address, value };
        Ok(self.execute(&request, timeout).await?.is_some())
    }

    pub async fn write_single_register(
        &mut self,
        address: u16,
        value: u16,
        timeout: Option<Duration>,
    ) -> Result<bool, ModbusError> {
        let request = ModbusRequest::WriteSingleRegister { address, value };
        Ok(self.execute(&request, timeout).await?.is_some())
    }

    pub async fn write_multiple_registers(
        &mut self,
        start: u16,
        values: &[u16],
        timeout: Option<Duration>,
    ) -> Result<bool, ModbusError> {
        let request = ModbusRequest::WriteMultipleRegisters {
            start,
            values: values.to_vec(),
        };
        Ok(self.execute(&request, timeout).await?.is_some())
    }

    async fn execute(
        &mut self,
        request: &ModbusRequest,
        timeout: Option<Duration>,
    ) -> Result<Option<ModbusResponse>, ModbusError> {
        request.validate()?;

        let frame = request.encode(self.slave_id);
        let timeout = timeout.unwrap_or(self.timeout);
        let exchange = self.transport.exchange(&frame, timeout).await?;

        let result = if exchange.timed_out {
            Err(FrameError::Timeout(timeout.as_millis()))
        } else {
            request.decode(self.slave_id, &frame, &exchange.bytes)
        };

        match result {
            Ok(response) => Ok(Some(response)),
            Err(reason) => {
                debug!(
                    "📵 Device {} function 0x{:02x}: {}",
                    self.slave_id,
                    request.function_code().code(),
                    reason
                );
                Ok(None)
            }
        }
    }
}

fn bits(response: Option<ModbusResponse>) -> Vec<bool> {
    match response {
        Some(ModbusResponse::Bits(bits)) => bits,
        _ => Vec::new(),
    }
}

fn registers(response: Option<ModbusResponse>) -> Vec<u16> {
    match response {
        Some(ModbusResponse::Registers(registers)) => registers,
        _ => Vec::new(),
    }
}
