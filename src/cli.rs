use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use parking_lot::Mutex;
use tracing::info;

use kaibridge::engine::{Command, ControlModel, Engine, EngineStatus};
use kaibridge::wireless::WifiInterface;
use kaibridge::Config;

#[derive(Parser)]
#[command(name = "kaibridge")]
#[command(author, version, about = "PSP/Vita ad-hoc to XLink Kai bridge")]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the bridge
    Run {
        /// Wireless adapter to capture on (overrides config)
        #[arg(short, long)]
        adapter: Option<String>,

        /// XLink Kai address as ip[:port]; disables auto-discovery
        #[arg(short, long)]
        xlink: Option<String>,

        /// Use the host-side PSP plugin device
        #[arg(long)]
        psp_plugin: bool,
    },

    /// List wireless interfaces
    Interfaces,

    /// Write the default configuration file
    GenConfig {
        /// Output path
        #[arg(short, long, default_value = "kaibridge.toml")]
        output: PathBuf,
    },
}

pub async fn run_command(cli: Cli, config: Config, config_path: PathBuf) -> Result<()> {
    match cli.command {
        Commands::Run {
            adapter,
            xlink,
            psp_plugin,
        } => cmd_run(config, config_path, adapter, xlink, psp_plugin).await,
        Commands::Interfaces => cmd_interfaces(),
        Commands::GenConfig { output } => cmd_gen_config(output),
    }
}

async fn cmd_run(
    config: Config,
    config_path: PathBuf,
    adapter: Option<String>,
    xlink: Option<String>,
    psp_plugin: bool,
) -> Result<()> {
    let mut model = ControlModel::from_config(&config);

    if let Some(adapter) = adapter {
        model.adapter = adapter;
    }
    if let Some(endpoint) = xlink {
        if let Some((ip, port)) = endpoint.rsplit_once(':') {
            model.xlink_ip = ip.to_string();
            model.xlink_port = port.parse().context("invalid XLink Kai port")?;
        } else {
            model.xlink_ip = endpoint;
        }
        model.auto_discover_xlink = false;
    }
    if psp_plugin {
        model.use_psp_plugin = true;
    }

    if model.adapter.is_empty() {
        anyhow::bail!("no wireless adapter configured (use --adapter or the config file)");
    }

    let model = Arc::new(Mutex::new(model));
    let mut engine = Engine::new(Arc::clone(&model));
    engine.set_config_path(config_path);

    // Signal task: its only effect is flipping the running flag; the
    // control loop below is the sole consumer
    let running = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&running);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            flag.store(false, Ordering::SeqCst);
        }
    });

    model.lock().command = Command::StartEngine;

    while running.load(Ordering::SeqCst) {
        engine.tick();
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    info!("shutting down");
    model.lock().command = Command::StopEngine;
    engine.tick();
    debug_assert_eq!(model.lock().status, EngineStatus::Idle);

    Ok(())
}

fn cmd_interfaces() -> Result<()> {
    let interfaces =
        WifiInterface::list().map_err(|e| anyhow::anyhow!("listing interfaces failed: {}", e))?;

    if interfaces.is_empty() {
        println!("No wireless interfaces found");
        return Ok(());
    }

    for iface in interfaces {
        let mac = iface
            .mac_addr
            .map(|m| m.to_string())
            .unwrap_or_else(|| "-".to_string());
        let freq = iface
            .frequency
            .map(|f| format!("{} MHz", f))
            .unwrap_or_else(|| "-".to_string());
        println!("{:<12} {:<18} {}", iface.name, mac, freq);
    }
    Ok(())
}

fn cmd_gen_config(output: PathBuf) -> Result<()> {
    Config::default().save(&output)?;
    println!("Wrote default configuration to {}", output.display());
    Ok(())
}
