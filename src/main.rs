mod args;

use anyhow::{bail, Context};
use args::{Cli, LogFormat};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use widget_device_plugin::plugin::{DevicePathProbe, FaultSource, NoopFaultSource, Supervisor};
use widget_device_plugin::{DeviceConfig, PluginConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);

    debug!("Config file: {}", cli.resource_config.display());
    debug!("Resource name: {}", cli.resource_name);

    info!("Fetching devices");
    let devices = DeviceConfig::load(&cli.resource_config, cli.strict_perms)
        .with_context(|| format!("Failed to load devices from {}", cli.resource_config.display()))?
        .devices;

    if devices.is_empty() {
        bail!("No devices found in {}", cli.resource_config.display());
    }
    debug!("Widget device list: {:?}", devices);

    let health_interval = Duration::from_secs(cli.health_interval.max(1));
    let config = PluginConfig::new(cli.resource_name, devices)
        .with_plugin_dir(cli.plugin_dir)
        .with_env_prefix(cli.env_prefix)
        .with_health_interval(health_interval);

    let fault_source: Arc<dyn FaultSource> = if cli.probe_device_paths {
        info!("Probing device paths every {:?}", config.health_interval);
        Arc::new(DevicePathProbe::new().with_interval(config.health_interval))
    } else {
        Arc::new(NoopFaultSource)
    };

    Supervisor::new(config, fault_source)
        .run()
        .await
        .context("Device plugin supervisor failed")?;

    Ok(())
}

fn init_tracing(cli: &Cli) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| cli.log_level.clone().into());

    let registry = tracing_subscriber::registry().with(env_filter);

    match cli.log_format {
        LogFormat::Json => {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        LogFormat::Pretty => {
            registry.with(tracing_subscriber::fmt::layer()).init();
        }
    }
}
