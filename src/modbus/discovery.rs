//! Brute-force search for the line settings of a device whose configuration
//! is unknown.
//!
//! Every combination of (address, baud rate, data bits, parity, stop bits)
//! is tried in that nesting order, outermost first. Each trial opens a fresh
//! transport and probes holding register 0 with a short timeout.

use log::{debug, info, warn};
use std::ops::RangeInclusive;
use std::time::Duration;

use super::client::ModbusClient;
use super::transport::Connector;
use super::PROBE_TIMEOUT;
use crate::config::settings::{BaudRate, DataBits, DiscoveryConfig, Parity, SerialParameters, StopBits};
use crate::utils::error::ModbusError;

/// Register read to decide whether anything answers.
pub const PROBE_REGISTER: u16 = 0x0000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchSpace {
    pub addresses: RangeInclusive<u8>,
    pub baud_rates: Vec<BaudRate>,
    pub data_bits: Vec<DataBits>,
    pub parities: Vec<Parity>,
    pub stop_bits: Vec<StopBits>,
}

impl Default for SearchSpace {
    fn default() -> Self {
        Self {
            addresses: 1..=254,
            baud_rates: BaudRate::ALL.to_vec(),
            data_bits: DataBits::ALL.to_vec(),
            parities: Parity::ALL.to_vec(),
            stop_bits: StopBits::ALL.to_vec(),
        }
    }
}

impl From<&DiscoveryConfig> for SearchSpace {
    fn from(config: &DiscoveryConfig) -> Self {
        Self {
            addresses: config.first_address..=config.last_address,
            baud_rates: config.baud_rates.clone(),
            data_bits: config.data_bits.clone(),
            parities: config.parities.clone(),
            stop_bits: config.stop_bits.clone(),
        }
    }
}

impl SearchSpace {
    /// Number of combinations: the product of every dimension's size.
    pub fn total(&self) -> u32 {
        self.addresses.clone().count() as u32
            * self.baud_rates.len() as u32
            * self.data_bits.len() as u32
            * self.parities.len() as u32
            * self.stop_bits.len() as u32
    }

    /// Every combination as a fresh value, address outermost and stop bits
    /// innermost.
    pub fn iter(&self) -> impl Iterator<Item = SerialParameters> + '_ {
        self.addresses.clone().flat_map(move |address| {
            self.baud_rates.iter().flat_map(move |&baud_rate| {
                self.data_bits.iter().flat_map(move |&data_bits| {
                    self.parities.iter().flat_map(move |&parity| {
                        self.stop_bits.iter().map(move |&stop_bits| SerialParameters {
                            address,
                            baud_rate,
                            parity,
                            data_bits,
                            stop_bits,
                        })
                    })
                })
            })
        })
    }

    fn validate(&self) -> Result<(), ModbusError> {
        if *self.addresses.start() == 0 {
            return Err(ModbusError::InvalidArgument(
                "address 0 is broadcast and cannot be probed".to_string(),
            ));
        }
        if self.total() == 0 {
            return Err(ModbusError::InvalidArgument("search space is empty".to_string()));
        }
        Ok(())
    }
}

/// How a search ended. Exactly one of these per run.
pub enum DiscoveryOutcome<T: super::transport::Transport> {
    /// The probe got a valid answer; the probe's client is handed over.
    Found {
        client: ModbusClient<T>,
        parameters: SerialParameters,
    },
    /// The progress callback asked to stop. `client` is the trial that was
    /// open at that point (not validated), `None` if its line failed to open.
    Cancelled {
        client: Option<ModbusClient<T>>,
        parameters: SerialParameters,
        attempts: u32,
    },
    /// Every combination was tried without an answer.
    Exhausted { attempts: u32 },
}

impl<T: super::transport::Transport> DiscoveryOutcome<T> {
    pub fn is_found(&self) -> bool {
        matches!(self, DiscoveryOutcome::Found { .. })
    }

    pub fn parameters(&self) -> Option<SerialParameters> {
        match self {
            DiscoveryOutcome::Found { parameters, .. }
            | DiscoveryOutcome::Cancelled { parameters, .. } => Some(*parameters),
            DiscoveryOutcome::Exhausted { .. } => None,
        }
    }
}

pub struct Discovery<C: Connector> {
    connector: C,
    space: SearchSpace,
    probe_timeout: Duration,
}

impl<C: Connector> Discovery<C> {
    pub fn new(connector: C, space: SearchSpace) -> Result<Self, ModbusError> {
        space.validate()?;
        Ok(Self {
            connector,
            space,
            probe_timeout: PROBE_TIMEOUT,
        })
    }

    pub fn with_probe_timeout(mut self, probe_timeout: Duration) -> Self {
        self.probe_timeout = probe_timeout;
        self
    }

    pub fn total(&self) -> u32 {
        self.space.total()
    }

    /// Runs the search. `progress(completed, total, params)` is called after
    /// each unsuccessful trial; returning `false` stops the search. On success
    /// it is called once with `(total, total, params)` and its answer ignored.
    pub async fn run<F>(&mut self, mut progress: F) -> DiscoveryOutcome<C::Transport>
    where
        F: FnMut(u32, u32, &SerialParameters) -> bool,
    {
        let Self {
            connector,
            space,
            probe_timeout,
        } = self;
        let probe_timeout = *probe_timeout;
        let total = space.total();
        info!("🔍 Searching {} parameter combinations", total);

        let mut completed = 0u32;
        for params in space.iter() {
            completed += 1;
            debug!("Trying {} ({}/{})", params, completed, total);

            let mut trial = match connector.open(&params) {
                Ok(transport) => ModbusClient::new(transport, params.address).ok(),
                Err(e) => {
                    warn!("⚠️  Cannot open line for {}: {}", params, e);
                    None
                }
            };

            let answered = match trial.as_mut() {
                Some(client) => probe(client, probe_timeout).await,
                None => false,
            };

            match trial {
                Some(client) if answered => {
                    info!("✅ Device answered with {} after {} attempt(s)", params, completed);
                    progress(total, total, &params);
                    return DiscoveryOutcome::Found {
                        client,
                        parameters: params,
                    };
                }
                trial => {
                    if !progress(completed, total, &params) {
                        info!("🛑 Search cancelled after {} of {} combinations", completed, total);
                        return DiscoveryOutcome::Cancelled {
                            client: trial,
                            parameters: params,
                            attempts: completed,
                        };
                    }
                }
            }
        }

        info!("📵 No device answered in {} combinations", completed);
        DiscoveryOutcome::Exhausted {
            attempts: completed,
        }
    }
}

async fn probe<T: super::transport::Transport>(client: &mut ModbusClient<T>, timeout: Duration) -> bool {
    match client.read_holding_registers(PROBE_REGISTER, 1, Some(timeout)).await {
        Ok(values) => !values.is_empty(),
        Err(e) => {
            debug!("Probe of device {} failed: {}", client.slave_id(), e);
            false
        }
    }
}
