use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use kaibridge::Config;

mod cli;

use cli::{run_command, Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from("kaibridge.toml"));
    let config = Config::load_or_default(&config_path)?;

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()))
    };

    // The log file only applies to the bridge itself
    let file_layer = if matches!(cli.command, Commands::Run { .. }) && !config.log_file.is_empty() {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.log_file)?;
        Some(fmt::layer().with_ansi(false).with_writer(Arc::new(file)))
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(file_layer)
        .with(filter)
        .init();

    // Run the command
    if let Err(e) = run_command(cli, config, config_path).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}
