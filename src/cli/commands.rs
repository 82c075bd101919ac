use anyhow::Result;
use clap::ArgMatches;
use log::{info, warn};
use serde_json::json;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::DEFAULT_CONFIG_FILE;
use crate::config::Config;
use crate::devices::{DeviceData, ImpulseCounter};
use crate::modbus::discovery::{Discovery, DiscoveryOutcome, SearchSpace};
use crate::modbus::transport::{list_ports, SerialConnector, SerialTransport};
use crate::modbus::ModbusClient;

/// Progress is printed every this many trials.
const PROGRESS_EVERY: u32 = 50;

/// Runs the selected subcommand. Returns `false` when there was none.
pub async fn handle_subcommands(matches: &ArgMatches, config: &mut Config) -> Result<bool> {
    let Some((name, sub)) = matches.subcommand() else {
        return Ok(false);
    };

    match name {
        "ports" => print_ports()?,
        "find" => find_device(sub, config).await?,
        "read-coils" | "read-discrete" | "read-holding" | "read-input" => {
            read(name, sub, config).await?
        }
        "write-coil" | "write-register" | "write-registers" => write(name, sub, config).await?,
        "status" => {
            let mut counter = ImpulseCounter::open(config).await?;
            let snapshot = counter.snapshot().await?;
            let device_name = counter.device_name().await?;
            let version = counter.version().await?;

            println!("📊 Device {} ({})", snapshot.device_address(), snapshot.timestamp().to_rfc3339());
            if let Some(device_name) = &device_name {
                println!("   Name: {}", device_name);
            }
            if let Some(version) = &version {
                println!("   Version: {}", version);
            }
            for (parameter, value) in snapshot.get_all_parameters() {
                println!("   {}: {}", parameter, value);
            }
            println!("{}", serde_json::to_string_pretty(&snapshot.to_json())?);
        }
        "options" => {
            let mut counter = ImpulseCounter::open(config).await?;
            let communication = counter.communication_options().await?;
            let counting = counter.counter_options().await?;
            let output = json!({
                "communication": communication,
                "counter": counting,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        "reset" => {
            let mut counter = ImpulseCounter::open(config).await?;
            if counter.reset_count().await? {
                println!("✅ Counter reset on device {}", counter.address());
            } else {
                println!("❌ Device {} did not confirm the reset", counter.address());
            }
        }
        "save-config" => {
            let path = sub
                .get_one::<String>("path")
                .or_else(|| matches.get_one::<String>("config"))
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
            config.save_to_file(&path)?;
            println!("💾 Configuration written to {}", path.display());
        }
        _ => return Ok(false),
    }

    Ok(true)
}

fn print_ports() -> Result<()> {
    let ports = list_ports()?;
    println!("📡 Available Serial Ports:");
    if ports.is_empty() {
        println!("   ⚠️  No serial ports found");
        return Ok(());
    }

    for (index, port) in ports.iter().enumerate() {
        println!("   {}. {}", index + 1, port.name);
        if let Some(manufacturer) = &port.manufacturer {
            println!("      📱 Manufacturer: {}", manufacturer);
        }
        if let Some(product) = &port.product {
            println!("      🏷️  Product: {}", product);
        }
    }
    Ok(())
}

async fn find_device(matches: &ArgMatches, config: &mut Config) -> Result<()> {
    if let Some(&first) = matches.get_one::<u8>("first") {
        config.discovery.first_address = first;
    }
    if let Some(&last) = matches.get_one::<u8>("last") {
        config.discovery.last_address = last;
    }
    if let Some(&timeout) = matches.get_one::<u64>("probe-timeout-ms") {
        config.discovery.probe_timeout_ms = timeout;
    }
    config.validate()?;

    let cancelled = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cancelled);
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            flag.store(true, Ordering::SeqCst);
        }
    });

    let connector = SerialConnector::new(&config.serial_port).with_frame_gap(config.inter_frame_gap());
    let mut discovery =
        Discovery::new(connector, SearchSpace::from(&config.discovery))?.with_probe_timeout(config.probe_timeout());
    println!(
        "🔍 Searching {} on {} combinations (Ctrl+C to stop)",
        config.serial_port,
        discovery.total()
    );

    let outcome = discovery
        .run(|done, total, params| {
            if done % PROGRESS_EVERY == 0 || done == total {
                println!("   [{:>5}/{}] {}", done, total, params);
            }
            !cancelled.load(Ordering::SeqCst)
        })
        .await;
    watcher.abort();

    match outcome {
        DiscoveryOutcome::Found { parameters, .. } => {
            println!("✅ Device found: {}", parameters);
            config.device = parameters;
            if matches.get_flag("save") {
                let path = matches
                    .get_one::<String>("config")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
                config.save_to_file(&path)?;
                info!("💾 Saved found settings to {}", path.display());
            }
        }
        DiscoveryOutcome::Cancelled { parameters, attempts, .. } => {
            println!("🛑 Search stopped after {} attempts (last tried {})", attempts, parameters);
        }
        DiscoveryOutcome::Exhausted { attempts } => {
            println!("❌ No device answered in {} attempts", attempts);
            println!("💡 Check wiring, termination and that the port is not in use.");
        }
    }
    Ok(())
}

fn open_client(config: &Config) -> Result<ModbusClient<SerialTransport>> {
    let transport = SerialTransport::open_with_gap(&config.serial_port, &config.device, config.inter_frame_gap())?;
    Ok(ModbusClient::new(transport, config.device.address)?.with_timeout(config.timeout()))
}

async fn read(name: &str, matches: &ArgMatches, config: &Config) -> Result<()> {
    let start = matches.get_one::<u16>("start").copied().unwrap_or_default();
    let count = matches.get_one::<u16>("count").copied().unwrap_or(1);
    let mut client = open_client(config)?;

    let values = match name {
        "read-coils" => json!(client.read_coils(start, count, None).await?),
        "read-discrete" => json!(client.read_discrete_inputs(start, count, None).await?),
        "read-holding" => json!(client.read_holding_registers(start, count, None).await?),
        _ => json!(client.read_input_registers(start, count, None).await?),
    };

    if values.as_array().map_or(true, |values| values.is_empty()) {
        warn!("No valid answer from device {}", config.device.address);
        println!("❌ Device {}: No response", config.device.address);
    } else {
        println!(
            "{}",
            json!({ "address": config.device.address, "start": start, "values": values })
        );
    }
    Ok(())
}

async fn write(name: &str, matches: &ArgMatches, config: &Config) -> Result<()> {
    let mut client = open_client(config)?;

    let acknowledged = match name {
        "write-coil" => {
            let address = matches.get_one::<u16>("register").copied().unwrap_or_default();
            let on = matches.get_one::<String>("state").map(|s| s == "on").unwrap_or(false);
            client.write_single_coil(address, on, None).await?
        }
        "write-register" => {
            let address = matches.get_one::<u16>("register").copied().unwrap_or_default();
            let value = matches.get_one::<u16>("value").copied().unwrap_or_default();
            client.write_single_register(address, value, None).await?
        }
        _ => {
            let start = matches.get_one::<u16>("start").copied().unwrap_or_default();
            let values: Vec<u16> = matches
                .get_many::<u16>("values")
                .map(|values| values.copied().collect())
                .unwrap_or_default();
            client.write_multiple_registers(start, &values, None).await?
        }
    };

    if acknowledged {
        println!("✅ Write successful");
    } else {
        println!("❌ Write failed");
    }
    Ok(())
}
