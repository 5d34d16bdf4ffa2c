use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use widget_device_plugin::config::{DEFAULT_RESOURCE_CONFIG_FILE, DEFAULT_RESOURCE_NAME};
use widget_device_plugin::proto::DEVICE_PLUGIN_PATH;

#[derive(Parser)]
#[command(name = "widget-device-plugin")]
#[command(version)]
#[command(about = "Kubernetes device plugin for widget devices", long_about = None)]
pub(crate) struct Cli {
    /// Logging level: error, warn, info, debug, trace. RUST_LOG takes precedence.
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,

    /// Resource name advertised to the kubelet
    #[arg(long, env = "WIDGET_RESOURCE_NAME", default_value = DEFAULT_RESOURCE_NAME)]
    pub resource_name: String,

    /// Device config file (YAML, or TOML with a .toml extension)
    #[arg(long = "resource-configfile", env = "WIDGET_RESOURCE_CONFIG", default_value = DEFAULT_RESOURCE_CONFIG_FILE)]
    pub resource_config: PathBuf,

    /// Directory holding kubelet.sock and the plugin socket
    #[arg(long, env = "DEVICE_PLUGIN_DIR", default_value = DEVICE_PLUGIN_PATH)]
    pub plugin_dir: PathBuf,

    /// Require the config file to be owned by root or the current user and not group/other writable
    #[arg(long, env = "STRICT_PERMS", default_value_t = true, action = clap::ArgAction::Set)]
    pub strict_perms: bool,

    /// Prefix for the VISIBLE_DEVICE_IDS / VISIBLE_DEVICES allocation env vars
    #[arg(long, env = "WIDGET_ENV_PREFIX", default_value = "")]
    pub env_prefix: String,

    /// Mark a device unhealthy once its path disappears from this node.
    /// Off by default: paths are usually opaque ids, not real device nodes.
    #[arg(long, env = "PROBE_DEVICE_PATHS", default_value_t = false, action = clap::ArgAction::Set)]
    pub probe_device_paths: bool,

    /// Seconds between device path health probes
    #[arg(long, default_value_t = 5)]
    pub health_interval: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub(crate) enum LogFormat {
    Pretty,
    Json,
}
