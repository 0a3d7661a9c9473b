//! adcd CLI: acquisition gateway for ADC64/TQDC digitizer modules.

use std::sync::Arc;

use clap::Parser;
use colored::Colorize;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::info;

use adcd::cli::{Cli, Commands, ConfigAction};
use adcd::config::{init_logging, Config, LoggingConfig};
use adcd::control::ControlServer;
use adcd::error::Result;
use adcd::store::RegStore;
use adcd::stream::MStreamServer;
use adcd::VERSION;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_config = LoggingConfig {
        level: cli.log_level.clone(),
        color: !cli.no_color,
        ..Default::default()
    };
    init_logging(&log_config)?;

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(Config::default_path);
    let config = if config_path.exists() {
        Config::load(&config_path)?
    } else {
        Config::default()
    };

    match cli.command {
        Commands::Control => run_control(config).await,
        Commands::Mstream => run_mstream(config).await,
        Commands::Config(args) => run_config(args.action, &config, &config_path),
    }
}

/// Broadcast a shutdown signal on ctrl-c.
fn shutdown_channel() -> broadcast::Receiver<()> {
    let (tx, rx) = broadcast::channel(1);
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            let _ = tx.send(());
        }
    });
    rx
}

async fn run_control(config: Config) -> Result<()> {
    banner("CONTROL");
    require_devices(&config)?;

    if let Some(parent) = config.storage.db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let store = Arc::new(RegStore::open(&config.storage.db_path)?);

    let server = ControlServer::bind(&config, store).await?;
    for device in config.devices.iter() {
        println!(
            "  {} {} ({}, {})",
            "•".green(),
            device.name,
            device.ip,
            device.family
        );
    }

    server.run(shutdown_channel()).await
}

async fn run_mstream(config: Config) -> Result<()> {
    banner("MSTREAM");
    require_devices(&config)?;

    let server = MStreamServer::start(&config).await?;
    for device in config.devices.iter() {
        println!(
            "  {} {} ({}, {})",
            "•".green(),
            device.name,
            device.ip,
            device.family
        );
    }

    server.run(shutdown_channel()).await
}

fn run_config(
    action: ConfigAction,
    config: &Config,
    path: &std::path::Path,
) -> Result<()> {
    match action {
        ConfigAction::Init { force } => {
            if path.exists() && !force {
                return Err(adcd::Error::Config(format!(
                    "{} exists; use --force to overwrite",
                    path.display()
                )));
            }
            Config::example().save(path)?;
            println!("{} wrote {}", "✓".green(), path.display());
            Ok(())
        }
        ConfigAction::Show => {
            let text = toml::to_string_pretty(config)
                .map_err(|e| adcd::Error::Config(e.to_string()))?;
            print!("{text}");
            Ok(())
        }
    }
}

fn require_devices(config: &Config) -> Result<()> {
    if config.devices.is_empty() {
        return Err(adcd::Error::InvalidConfig(
            "no devices configured; run `adcd config init` first".into(),
        ));
    }
    Ok(())
}

fn banner(role: &str) {
    println!("{}", format!("adcd {VERSION} [{role}]").bright_cyan().bold());
}
