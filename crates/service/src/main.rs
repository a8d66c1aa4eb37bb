//! Device link daemon (wheeld)

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use racing_wheel_service::{LinkDaemon, ServiceConfig};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "wheeld", version, about = "Keeps Moza devices and HID peripherals connected")]
struct Cli {
    /// YAML configuration file. Defaults to the per-user config path.
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Tracing filter, e.g. `debug`; overrides RUST_LOG and the config file.
    #[arg(long)]
    log_level: Option<String>,

    /// Run one discovery pass, print the devices found as JSON and exit.
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = match cli.config.clone() {
        Some(path) => Some(path),
        None => ServiceConfig::default_path().ok(),
    };
    let loaded = load_config(config_path.as_deref(), cli.config.is_some());
    let (config, load_error) = match loaded {
        Ok(config) => (config, None),
        Err(e) => (ServiceConfig::default(), Some(e)),
    };

    // A file that failed to load is never overwritten.
    let writable = load_error.is_none();
    init_tracing(cli.log_level.as_deref(), &config)?;
    if let Some(e) = load_error {
        warn!(error = %format!("{e:#}"), "failed to load config, using defaults");
    }
    info!("wheeld v{}", env!("CARGO_PKG_VERSION"));

    let daemon = LinkDaemon::new(&config)?;
    if cli.once {
        let handles = daemon.scan();
        println!("{}", serde_json::to_string_pretty(&handles)?);
        daemon.shutdown();
        return Ok(());
    }

    let manager = Arc::clone(daemon.manager());
    daemon.run().await?;

    let tokens = manager.known_wheel_tokens();
    if writable
        && tokens != config.link.known_wheel_tokens
        && let Some(path) = config_path
    {
        let mut updated = config;
        updated.link.known_wheel_tokens = tokens;
        updated
            .save_to_path(&path)
            .context("Failed to remember wheel slots")?;
        info!(path = %path.display(), "saved wheel slots");
    }
    Ok(())
}

/// An explicit path must load; the default path may simply not exist yet.
fn load_config(path: Option<&Path>, explicit: bool) -> Result<ServiceConfig> {
    match path {
        Some(path) if explicit || path.exists() => ServiceConfig::load_from_path(path),
        _ => Ok(ServiceConfig::default()),
    }
}

fn init_tracing(cli_level: Option<&str>, config: &ServiceConfig) -> Result<()> {
    let filter = match cli_level {
        Some(level) => EnvFilter::try_new(level)?,
        None => EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(config.log_filter()))?,
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| anyhow!(e))
}
