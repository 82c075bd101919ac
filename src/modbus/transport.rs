//! Byte transport for one serial line.
//!
//! A [`Transport`] knows nothing about Modbus framing. It writes a request,
//! then waits for the first reply bytes while a timeout clock runs; whichever
//! happens first ends the wait.

use async_trait::async_trait;
use log::{debug, info};
use serialport::{ClearBuffer, SerialPort, SerialPortType};
use std::io::{Read, Write};
use std::time::Duration;
use tokio::time::sleep;

use crate::config::settings::SerialParameters;
use crate::utils::error::ModbusError;
use crate::utils::hex_frame;

/// RTU frames never exceed 256 bytes.
pub const MAX_FRAME_LEN: usize = 256;

const POLL_INTERVAL: Duration = Duration::from_millis(2);
const MIN_FRAME_GAP: Duration = Duration::from_millis(5);

/// Result of one request/reply cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Exchange {
    pub bytes: Vec<u8>,
    pub timed_out: bool,
}

impl Exchange {
    pub fn received(bytes: Vec<u8>) -> Self {
        let timed_out = bytes.is_empty();
        Self { bytes, timed_out }
    }

    pub fn timeout() -> Self {
        Self {
            bytes: Vec::new(),
            timed_out: true,
        }
    }
}

#[async_trait]
pub trait Transport: Send {
    /// Sends `request` and waits up to `timeout` for a reply.
    ///
    /// `Err` only for transport faults (the request could not be written in
    /// full). Silence, read errors and empty reads come back as
    /// `Exchange { timed_out: true, .. }`.
    async fn exchange(&mut self, request: &[u8], timeout: Duration) -> Result<Exchange, ModbusError>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Box<T> {
    async fn exchange(&mut self, request: &[u8], timeout: Duration) -> Result<Exchange, ModbusError> {
        (**self).exchange(request, timeout).await
    }
}

/// Opens a transport for a given line configuration. Discovery uses this to
/// get a fresh transport per trial.
pub trait Connector {
    type Transport: Transport;

    fn open(&mut self, params: &SerialParameters) -> Result<Self::Transport, ModbusError>;
}

impl<F, T> Connector for F
where
    F: FnMut(&SerialParameters) -> Result<T, ModbusError>,
    T: Transport,
{
    type Transport = T;

    fn open(&mut self, params: &SerialParameters) -> Result<T, ModbusError> {
        self(params)
    }
}

/// Connector for a named OS serial port.
#[derive(Debug, Clone)]
pub struct SerialConnector {
    port_name: String,
    frame_gap: Option<Duration>,
}

impl SerialConnector {
    pub fn new(port_name: &str) -> Self {
        Self {
            port_name: port_name.to_string(),
            frame_gap: None,
        }
    }

    pub fn with_frame_gap(mut self, frame_gap: Option<Duration>) -> Self {
        self.frame_gap = frame_gap;
        self
    }
}

impl Connector for SerialConnector {
    type Transport = SerialTransport;

    fn open(&mut self, params: &SerialParameters) -> Result<SerialTransport, ModbusError> {
        SerialTransport::open_with_gap(&self.port_name, params, self.frame_gap)
    }
}

pub struct SerialTransport {
    port: Box<dyn SerialPort>,
    port_name: String,
    frame_gap: Duration,
}

impl SerialTransport {
    pub fn open(port_name: &str, params: &SerialParameters) -> Result<Self, ModbusError> {
        Self::open_with_gap(port_name, params, None)
    }

    /// `frame_gap` overrides the t3.5 silence derived from the line settings.
    pub fn open_with_gap(
        port_name: &str,
        params: &SerialParameters,
        frame_gap: Option<Duration>,
    ) -> Result<Self, ModbusError> {
        debug!("🔌 Opening {} ({})", port_name, params);

        let port = serialport::new(port_name, params.baud_rate.bps())
            .data_bits(params.data_bits.into())
            .parity(params.parity.into())
            .stop_bits(params.stop_bits.into())
            .flow_control(serialport::FlowControl::None)
            .timeout(POLL_INTERVAL)
            .open()
            .map_err(|e| {
                ModbusError::ConnectionError(format!("Failed to open port {}: {}", port_name, e))
            })?;

        let frame_gap = frame_gap.unwrap_or_else(|| params.inter_frame_gap().max(MIN_FRAME_GAP));

        Ok(Self {
            port,
            port_name: port_name.to_string(),
            frame_gap,
        })
    }

    fn pending(&mut self) -> std::io::Result<usize> {
        self.port
            .bytes_to_read()
            .map(|n| n as usize)
            .map_err(std::io::Error::from)
    }

    fn read_pending(&mut self, limit: usize) -> std::io::Result<Vec<u8>> {
        let mut buffer = vec![0u8; limit.min(MAX_FRAME_LEN)];
        let n = self.port.read(&mut buffer)?;
        buffer.truncate(n);
        Ok(buffer)
    }

    /// Resolves with the first chunk the line delivers. An empty chunk means
    /// the read completed without data.
    async fn wait_for_data(&mut self) -> std::io::Result<Vec<u8>> {
        loop {
            let pending = self.pending()?;
            if pending > 0 {
                return self.read_pending(pending);
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    /// Keeps reading after the first chunk until the line stays quiet for one
    /// inter-frame gap.
    async fn collect_frame(&mut self, mut frame: Vec<u8>) -> Vec<u8> {
        while frame.len() < MAX_FRAME_LEN {
            sleep(self.frame_gap).await;
            let chunk = match self.pending() {
                Ok(0) => break,
                Ok(pending) => self.read_pending(pending.min(MAX_FRAME_LEN - frame.len())),
                Err(e) => Err(e),
            };
            match chunk {
                Ok(chunk) if chunk.is_empty() => break,
                Ok(chunk) => frame.extend_from_slice(&chunk),
                Err(e) => {
                    debug!("Read error on {} while collecting frame: {}", self.port_name, e);
                    break;
                }
            }
        }
        frame
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn exchange(&mut self, request: &[u8], timeout: Duration) -> Result<Exchange, ModbusError> {
        if let Err(e) = self.port.clear(ClearBuffer::Input) {
            debug!("Could not discard stale input on {}: {}", self.port_name, e);
        }

        debug!("📤 {} <- [{}]", self.port_name, hex_frame(request));

        let written = self
            .port
            .write(request)
            .map_err(|e| ModbusError::CommunicationError(format!("Write failed: {}", e)))?;
        if written != request.len() {
            return Err(ModbusError::CommunicationError(format!(
                "Short write: {} of {} bytes",
                written,
                request.len()
            )));
        }
        self.port
            .flush()
            .map_err(|e| ModbusError::CommunicationError(format!("Flush failed: {}", e)))?;

        let first = match tokio::time::timeout(timeout, self.wait_for_data()).await {
            Ok(Ok(chunk)) => chunk,
            Ok(Err(e)) => {
                debug!("Read error on {}: {}", self.port_name, e);
                return Ok(Exchange::timeout());
            }
            Err(_) => {
                debug!("⏰ No response on {} within {:?}", self.port_name, timeout);
                return Ok(Exchange::timeout());
            }
        };
        if first.is_empty() {
            return Ok(Exchange::timeout());
        }

        let frame = self.collect_frame(first).await;
        debug!("📥 {} -> [{}]", self.port_name, hex_frame(&frame));
        Ok(Exchange::received(frame))
    }
}

/// Information about an available serial port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    pub name: String,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
}

pub fn list_ports() -> Result<Vec<PortInfo>, ModbusError> {
    let mut ports: Vec<PortInfo> = serialport::available_ports()?
        .into_iter()
        .map(|info| {
            let (manufacturer, product) = match info.port_type {
                SerialPortType::UsbPort(usb) => (usb.manufacturer, usb.product),
                _ => (None, None),
            };
            PortInfo {
                name: info.port_name,
                manufacturer,
                product,
            }
        })
        .collect();
    ports.sort_by(|a, b| a.name.cmp(&b.name));

    info!("📡 Found {} serial port(s)", ports.len());
    Ok(ports)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modbus::testing::ScriptedTransport;

    #[test]
    fn test_exchange_constructors() {
        assert!(Exchange::received(Vec::new()).timed_out);
        assert!(!Exchange::received(vec![0x01]).timed_out);
        assert_eq!(Exchange::timeout(), Exchange { bytes: vec![], timed_out: true });
    }

    #[test]
    fn test_open_missing_port_is_connection_error() {
        let result = SerialTransport::open("/dev/does-not-exist-rtu", &SerialParameters::default());
        assert!(matches!(result, Err(ModbusError::ConnectionError(_))));
    }

    #[test]
    fn test_closure_connector() {
        let mut opened = Vec::new();
        let mut connector = |params: &SerialParameters| {
            opened.push(*params);
            Ok::<_, ModbusError>(ScriptedTransport::silent())
        };
        assert!(Connector::open(&mut connector, &SerialParameters::default()).is_ok());
        assert_eq!(opened, vec![SerialParameters::default()]);
    }

    #[tokio::test]
    async fn test_boxed_transport_delegates() {
        let mut transport: Box<dyn Transport> = Box::new(ScriptedTransport::new(vec![Ok(
            Exchange::received(vec![0xAA]),
        )]));
        let exchange = transport
            .exchange(&[0x01], Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(exchange.bytes, vec![0xAA]);
    }

    #[cfg(unix)]
    mod pty {
        use super::*;
        use serialport::{SerialPort, TTYPort};
        use std::io::{Read, Write};
        use std::thread;
        use std::time::Instant;

        const READ_HOLDING: [u8; 8] = [0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x84, 0x0A];

        /// A transport on the master side of a pseudo terminal and the device
        /// end of the line.
        fn line() -> (SerialTransport, TTYPort) {
            let (master, mut device) = TTYPort::pair().unwrap();
            device.set_timeout(Duration::from_secs(1)).unwrap();
            let transport = SerialTransport {
                port: Box::new(master),
                port_name: "pty".to_string(),
                frame_gap: MIN_FRAME_GAP,
            };
            (transport, device)
        }

        #[tokio::test]
        async fn test_silent_device_times_out() {
            let (mut transport, _device) = line();

            let started = Instant::now();
            let exchange = transport
                .exchange(&READ_HOLDING, Duration::from_millis(100))
                .await
                .unwrap();
            let elapsed = started.elapsed();

            assert_eq!(exchange, Exchange::timeout());
            assert!(elapsed >= Duration::from_millis(100));
            assert!(elapsed < Duration::from_secs(1));
        }

        #[tokio::test]
        async fn test_request_reaches_device_unchanged() {
            let (mut transport, mut device) = line();
            let peer = thread::spawn(move || {
                let mut request = [0u8; 8];
                device.read_exact(&mut request).unwrap();
                request
            });

            transport
                .exchange(&READ_HOLDING, Duration::from_millis(100))
                .await
                .unwrap();
            assert_eq!(peer.join().unwrap(), READ_HOLDING);
        }

        #[tokio::test]
        async fn test_reply_split_across_reads_comes_back_whole() {
            let (mut transport, mut device) = line();
            let peer = thread::spawn(move || {
                let mut request = [0u8; 8];
                device.read_exact(&mut request).unwrap();
                device.write_all(&[0x01, 0x03, 0x02]).unwrap();
                device.flush().unwrap();
                thread::sleep(Duration::from_millis(2));
                device.write_all(&[0x00, 0x07, 0xF9, 0x86]).unwrap();
                device.flush().unwrap();
                // Keep the line open until the frame has been collected
                thread::sleep(Duration::from_millis(200));
            });

            let exchange = transport
                .exchange(&READ_HOLDING, Duration::from_millis(500))
                .await
                .unwrap();
            peer.join().unwrap();

            assert!(!exchange.timed_out);
            assert_eq!(exchange.bytes, vec![0x01, 0x03, 0x02, 0x00, 0x07, 0xF9, 0x86]);
        }

        #[tokio::test]
        async fn test_stale_input_is_discarded() {
            let (mut transport, mut device) = line();
            device.write_all(&[0x01, 0x03, 0x02, 0x00, 0x07, 0xF9, 0x86]).unwrap();
            device.flush().unwrap();
            thread::sleep(Duration::from_millis(20));

            let exchange = transport
                .exchange(&READ_HOLDING, Duration::from_millis(50))
                .await
                .unwrap();
            assert_eq!(exchange, Exchange::timeout());
        }
    }
}
