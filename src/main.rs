use anyhow::Result;
use log::{debug, error};
use std::path::Path;

use rtu_counter::cli::{build_cli, handle_subcommands, load_config, DEFAULT_CONFIG_FILE};

#[tokio::main]
async fn main() -> Result<()> {
    let matches = build_cli().get_matches();

    let level = if matches.get_flag("verbose") { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
    debug!("rtu-counter v{}", rtu_counter::VERSION);

    let config_path = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or(DEFAULT_CONFIG_FILE);
    let mut config = load_config(Path::new(config_path))?;
    config.apply_matches(&matches)?;

    match handle_subcommands(&matches, &mut config).await {
        Ok(true) => Ok(()),
        Ok(false) => {
            build_cli().print_help()?;
            println!();
            Ok(())
        }
        Err(e) => {
            error!("💥 {}", e);
            Err(e)
        }
    }
}
