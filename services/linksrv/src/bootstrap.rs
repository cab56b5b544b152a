//! Service bootstrap and initialization
//!
//! Argument parsing, logging setup, configuration validation and wiring of
//! registry, connector, sink and polling driver.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use common::logging::LogConfig;
use common::service_bootstrap::ServiceInfo;
use errors::{PlcLinkError, PlcLinkResult};

use crate::config::{AppConfig, DEFAULT_CONFIG_PATH};
use crate::connector::Connector;
use crate::error::Result;
use crate::polling::{PollEvent, PollingDriver};
use crate::protocols::SimulatedClientFactory;
use crate::registry::open_registry;
use crate::storage::open_sink;

/// Command-line arguments for linksrv
#[derive(Parser, Debug, Clone)]
#[command(
    name = "linksrv",
    version = env!("CARGO_PKG_VERSION"),
    about = "PLC Device Link Service",
    long_about = None
)]
pub struct Args {
    /// Configuration file (YAML, JSON or TOML)
    #[arg(short = 'c', long, env = "LINKSRV_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); overrides logging.level
    #[arg(short = 'l', long)]
    pub log_level: Option<String>,

    /// Principal whose devices are polled; overrides service.principal
    #[arg(short = 'p', long)]
    pub principal: Option<String>,

    /// Validation mode - only validate configuration without starting service
    #[arg(long)]
    pub validate: bool,

    /// Disable colored output
    #[arg(long)]
    pub no_color: bool,
}

impl Args {
    /// Explicit `--config`, else the default path when it exists
    pub fn config_path(&self) -> Option<PathBuf> {
        self.config.clone().or_else(|| {
            let default = PathBuf::from(DEFAULT_CONFIG_PATH);
            default.exists().then_some(default)
        })
    }
}

/// Load configuration and apply command-line overrides
pub fn load_config(args: &Args) -> Result<AppConfig> {
    let mut config = AppConfig::load(args.config_path().as_deref())?;
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    if let Some(principal) = &args.principal {
        config.service.principal = principal.clone();
    }
    config.validate()?;
    Ok(config)
}

/// Logger settings for the configured service
pub fn log_config(config: &AppConfig, args: &Args) -> LogConfig {
    LogConfig {
        service_name: config.service.name.clone(),
        level: config.logging.level.clone(),
        log_dir: config.logging.dir.clone(),
        enable_json: config.logging.json,
        ansi: !args.no_color,
    }
}

/// Build the polling driver described by `config`
pub async fn build_driver(config: &AppConfig) -> Result<PollingDriver> {
    let registry = open_registry(&config.registry).await?;
    let devices = registry
        .list_active_devices(&config.service.principal)
        .await?;
    info!(
        "{} active devices for principal '{}'",
        devices.len(),
        config.service.principal
    );
    if devices.is_empty() {
        warn!("No devices to poll");
    }
    if config.blocks.is_empty() {
        warn!("No read blocks configured");
    }

    let factory = Arc::new(SimulatedClientFactory::new(config.simulation.clone()));
    let connector = Connector::new(devices, factory, config.connector.clone());
    let sink = open_sink(&config.storage);

    Ok(PollingDriver::new(
        connector,
        sink,
        config.blocks.clone(),
        config.polling.clone(),
    ))
}

/// Validate configuration and the device list without polling
pub async fn validate_configuration(config: &AppConfig) -> Result<()> {
    let registry = open_registry(&config.registry).await?;
    let devices = registry
        .list_active_devices(&config.service.principal)
        .await?;
    info!("Found {} device(s)", devices.len());

    for device in &devices {
        match device.endpoint() {
            Ok(endpoint) => info!("  {} ({}) -> {}", device.id, device.protocol, endpoint),
            Err(e) => warn!("  {} ({}): {}", device.id, device.protocol, e),
        }
    }

    for block in &config.blocks {
        if !devices.iter().any(|d| d.id == block.device_id) {
            warn!("Block {} references an unknown device", block.key());
        }
    }
    Ok(())
}

/// Run the service until a shutdown signal arrives
pub async fn run(args: Args) -> PlcLinkResult<()> {
    let config = load_config(&args)?;

    common::logging::init_with_config(log_config(&config, &args))
        .map_err(|e| PlcLinkError::StartupFailed(format!("Failed to init logging: {}", e)))?;

    let service_info = ServiceInfo::new(
        config.service.name.clone(),
        env!("CARGO_PKG_VERSION"),
        "PLC Device Link Service - Modbus / S7 / OPC UA",
    );
    if !args.no_color {
        common::service_bootstrap::print_startup_banner(&service_info);
    }

    if args.validate {
        validate_configuration(&config).await?;
        info!("Validation completed successfully");
        return Ok(());
    }

    let driver = build_driver(&config).await?;
    let mut events = driver.subscribe();
    let handle = driver.spawn();

    // Surface driver events in the service log
    let event_log = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(PollEvent::ConnectionWarning { failed_devices }) => {
                    warn!("Devices offline: {}", failed_devices.join(", "));
                },
                Ok(PollEvent::StorageFailed { error, .. }) => {
                    warn!("Storage: {} ({})", error.message, error.code);
                },
                Ok(other) => debug!("{:?}", other),
                Err(RecvError::Lagged(n)) => debug!("Event log lagged by {}", n),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let signal = common::shutdown::wait_for_shutdown().await;
    debug!("Stopping polling on {}", signal);

    let stats = handle.stop().await;
    event_log.abort();
    info!(
        "Shutdown complete: {} cycles, {} points stored, {} storage failures",
        stats.cycles, stats.points_stored, stats.storage_failures
    );
    Ok(())
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_cli_overrides() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "service:\n  principal: plant-a\nlogging:\n  level: warn\npolling:\n  interval_ms: 1500\n"
        )
        .unwrap();
        let path = file.path().to_str().unwrap();

        let args = Args::parse_from([
            "linksrv",
            "--config",
            path,
            "--log-level",
            "debug",
            "--principal",
            "plant-b",
            "--no-color",
        ]);
        let config = load_config(&args).unwrap();
        assert_eq!(config.service.principal, "plant-b");
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.polling.interval_ms, 1500);

        let log = log_config(&config, &args);
        assert_eq!(log.level, "debug");
        assert!(!log.ansi);

        // Without flags the file values stand
        let args = Args::parse_from(["linksrv", "--config", path]);
        let config = load_config(&args).unwrap();
        assert_eq!(config.service.principal, "plant-a");
        assert_eq!(config.logging.level, "warn");
    }

    #[test]
    fn test_blank_principal_override_is_rejected() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "service:\n  name: linksrv\n").unwrap();
        let path = file.path().to_str().unwrap();
        let args = Args::parse_from(["linksrv", "--config", path, "--principal", " "]);
        assert!(load_config(&args).is_err());
    }

    #[tokio::test]
    async fn test_build_driver_from_inline_registry() {
        let config: AppConfig = serde_yaml::from_str(
            "registry:\n  kind: inline\n  devices:\n    - id: a\n      protocol: modbus\n      address: 127.0.0.1\nblocks:\n  - deviceId: a\n    address: 0\n    type: holding\n",
        )
        .unwrap();
        let driver = build_driver(&config).await.unwrap();
        let connector = driver.connector();
        assert_eq!(connector.lock().await.devices().len(), 1);
        assert!(validate_configuration(&config).await.is_ok());
    }
}
