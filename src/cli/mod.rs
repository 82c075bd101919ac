use clap::{value_parser, Arg, ArgAction, Command};
use log::info;
use std::path::Path;

use crate::config::Config;
use crate::utils::error::ModbusError;

pub mod commands;

pub use commands::handle_subcommands;

pub const DEFAULT_CONFIG_FILE: &str = "rtu-counter.toml";

fn register_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("start")
                .help("First register/bit address")
                .required(true)
                .value_parser(value_parser!(u16)),
        )
        .arg(
            Arg::new("count")
                .help("Number of registers/bits")
                .default_value("1")
                .value_parser(value_parser!(u16)),
        )
}

pub fn build_cli() -> Command {
    Command::new("rtu-counter")
        .version(crate::VERSION)
        .about("Modbus RTU master for RS-485 impulse counters")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Path to configuration file")
                .default_value(DEFAULT_CONFIG_FILE)
                .global(true),
        )
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .value_name("PORT")
                .help("Serial port (e.g. /dev/ttyUSB0, COM3)")
                .global(true),
        )
        .arg(
            Arg::new("address")
                .short('a')
                .long("address")
                .value_name("ADDR")
                .help("Device address")
                .value_parser(value_parser!(u8).range(1..))
                .global(true),
        )
        .arg(
            Arg::new("baud")
                .short('b')
                .long("baud")
                .value_name("BPS")
                .help("Baud rate")
                .value_parser(value_parser!(u32))
                .global(true),
        )
        .arg(
            Arg::new("parity")
                .long("parity")
                .value_parser(["none", "even", "odd"])
                .help("Parity")
                .global(true),
        )
        .arg(
            Arg::new("data-bits")
                .long("data-bits")
                .value_parser(value_parser!(u8).range(7..=8))
                .help("Data bits")
                .global(true),
        )
        .arg(
            Arg::new("stop-bits")
                .long("stop-bits")
                .value_parser(value_parser!(u8).range(1..=2))
                .help("Stop bits")
                .global(true),
        )
        .arg(
            Arg::new("timeout-ms")
                .short('t')
                .long("timeout-ms")
                .value_name("MS")
                .help("Reply timeout in milliseconds")
                .value_parser(value_parser!(u64).range(1..))
                .global(true),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Log every frame sent and received")
                .action(ArgAction::SetTrue)
                .global(true),
        )
        .subcommand(Command::new("ports").about("List available serial ports"))
        .subcommand(
            Command::new("find")
                .about("Search for the device by trying every line setting")
                .arg(
                    Arg::new("first")
                        .long("first")
                        .value_name("ADDR")
                        .help("First address to probe")
                        .value_parser(value_parser!(u8).range(1..)),
                )
                .arg(
                    Arg::new("last")
                        .long("last")
                        .value_name("ADDR")
                        .help("Last address to probe")
                        .value_parser(value_parser!(u8).range(1..)),
                )
                .arg(
                    Arg::new("probe-timeout-ms")
                        .long("probe-timeout-ms")
                        .value_name("MS")
                        .help("Reply timeout per trial")
                        .value_parser(value_parser!(u64).range(1..)),
                )
                .arg(
                    Arg::new("save")
                        .long("save")
                        .help("Store the found settings in the configuration file")
                        .action(ArgAction::SetTrue),
                ),
        )
        .subcommand(register_args(Command::new("read-coils").about("Read coils (0x01)")))
        .subcommand(register_args(
            Command::new("read-discrete").about("Read discrete inputs (0x02)"),
        ))
        .subcommand(register_args(
            Command::new("read-holding").about("Read holding registers (0x03)"),
        ))
        .subcommand(register_args(
            Command::new("read-input").about("Read input registers (0x04)"),
        ))
        .subcommand(
            Command::new("write-coil")
                .about("Write a single coil (0x05)")
                .arg(
                    Arg::new("register")
                        .value_name("ADDRESS")
                        .required(true)
                        .value_parser(value_parser!(u16)),
                )
                .arg(Arg::new("state").required(true).value_parser(["on", "off"])),
        )
        .subcommand(
            Command::new("write-register")
                .about("Write a single holding register (0x06)")
                .arg(
                    Arg::new("register")
                        .value_name("ADDRESS")
                        .required(true)
                        .value_parser(value_parser!(u16)),
                )
                .arg(Arg::new("value").required(true).value_parser(value_parser!(u16))),
        )
        .subcommand(
            Command::new("write-registers")
                .about("Write consecutive holding registers (0x10)")
                .arg(
                    Arg::new("start")
                        .required(true)
                        .value_parser(value_parser!(u16)),
                )
                .arg(
                    Arg::new("values")
                        .required(true)
                        .num_args(1..)
                        .value_parser(value_parser!(u16)),
                ),
        )
        .subcommand(Command::new("status").about("Show counter value, mode and I/O state"))
        .subcommand(Command::new("options").about("Show communication and counter options"))
        .subcommand(Command::new("reset").about("Reset the counter"))
        .subcommand(
            Command::new("save-config")
                .about("Write the effective configuration to a file")
                .arg(Arg::new("path").value_name("FILE")),
        )
}

/// Loads `path` if it exists, otherwise starts from defaults.
pub fn load_config(path: &Path) -> Result<Config, ModbusError> {
    if path.exists() {
        Config::from_file(path)
    } else {
        info!("📋 {} not found, using default configuration", path.display());
        Ok(Config::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::settings::{BaudRate, Parity};

    #[test]
    fn test_cli_is_well_formed() {
        build_cli().debug_assert();
    }

    #[test]
    fn test_global_overrides_reach_config() {
        let matches = build_cli()
            .try_get_matches_from([
                "rtu-counter",
                "status",
                "--port",
                "/dev/ttyS3",
                "--address",
                "7",
                "--baud",
                "19200",
                "--parity",
                "even",
            ])
            .unwrap();

        let mut config = Config::default();
        config.apply_matches(&matches).unwrap();
        assert_eq!(config.serial_port, "/dev/ttyS3");
        assert_eq!(config.device.address, 7);
        assert_eq!(config.device.baud_rate, BaudRate::B19200);
        assert_eq!(config.device.parity, Parity::Even);
    }

    #[test]
    fn test_rejects_broadcast_address() {
        assert!(build_cli()
            .try_get_matches_from(["rtu-counter", "status", "--address", "0"])
            .is_err());
    }

    #[test]
    fn test_write_registers_takes_many_values() {
        let matches = build_cli()
            .try_get_matches_from(["rtu-counter", "write-registers", "12", "1", "34464"])
            .unwrap();
        let (_, sub) = matches.subcommand().unwrap();
        let values: Vec<u16> = sub.get_many::<u16>("values").unwrap().copied().collect();
        assert_eq!(values, vec![1, 34464]);
    }

    #[test]
    fn test_missing_config_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, Config::default());
    }
}
