//! Device Registry Service
//!
//! Main entry point: loads the device registry of a config directory and
//! keeps its storage up to date until shutdown.
//!
//! Usage: `device-registry [CONFIG_DIR]`

use anyhow::{Context, Result};
use ha_config::{load_config, Config};
use ha_registries::{get_registry, DeviceRegistry, Registries};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Environment variable naming the config directory
const CONFIG_DIR_ENV: &str = "HA_CONFIG_DIR";
const DEFAULT_CONFIG_DIR: &str = "config";

fn config_dir() -> PathBuf {
    std::env::args_os()
        .nth(1)
        .or_else(|| std::env::var_os(CONFIG_DIR_ENV))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_DIR))
}

/// Install the tracing subscriber; `RUST_LOG` overrides `logger.default`
fn init_logging(config: &Config) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logger.default))
        .with_context(|| format!("Invalid logger filter '{}'", config.logger.default))?;

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

fn log_summary(registry: &DeviceRegistry) {
    let devices = registry.devices();
    let disabled = devices.iter().filter(|d| d.is_disabled()).count();
    let via_hub = devices.iter().filter(|d| d.via_device_id.is_some()).count();

    info!(
        "Device registry: {} devices ({} disabled, {} behind a hub), {} deleted",
        devices.len(),
        disabled,
        via_hub,
        registry.deleted_devices().len()
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let config_dir = config_dir();
    let config = load_config(&config_dir)
        .with_context(|| format!("Failed to load configuration from {}", config_dir.display()))?;
    init_logging(&config)?;

    info!("Starting device registry for {}", config_dir.display());

    let registries = Registries::from_config(&config);
    let registry = get_registry(&registries)
        .await
        .context("Failed to load device registry")?;
    log_summary(&registry);
    registry.purge_expired_orphaned_devices();

    info!("Device registry is running");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    registries
        .shutdown()
        .await
        .context("Failed to write device registry")?;

    Ok(())
}
