use crate::error::{PluginError, Result};
use crate::proto;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_RESOURCE_NAME: &str = "ska-sdp.org/widget";
pub const DEFAULT_RESOURCE_CONFIG_FILE: &str = "/etc/kubernetes/widget.yml";

const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(5);

/// One entry of the `devices` list in the resource config file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    #[serde(rename = "type")]
    pub device_type: String,
    pub model: String,
    /// Physical path handed through to allocated containers
    pub device: String,
}

impl DeviceDescriptor {
    /// Create a device descriptor
    pub fn new(
        device_type: impl Into<String>,
        model: impl Into<String>,
        device: impl Into<String>,
    ) -> Self {
        Self {
            device_type: device_type.into(),
            model: model.into(),
            device: device.into(),
        }
    }
}

/// Resource config file contents
///
/// ```yaml
/// devices:
///   - type: snaffler
///     model: v1
///     device: /dev/wibble1
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(default)]
    pub devices: Vec<DeviceDescriptor>,
}

impl DeviceConfig {
    /// Load the config file, enforcing ownership and mode checks when `strict_perms` is set.
    ///
    /// Files ending in `.toml` are parsed as TOML, anything else as YAML.
    pub fn load(path: &Path, strict_perms: bool) -> Result<Self> {
        tracing::debug!(path = %path.display(), strict_perms, "Loading resource config");

        if strict_perms {
            owner_has_exclusive_write_perms(path)?;
        }

        let content = fs::read_to_string(path).map_err(|e| {
            PluginError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;

        let config: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => toml::from_str(&content)?,
            _ => serde_yaml::from_str(&content)?,
        };

        tracing::debug!(path = %path.display(), devices = ?config.devices, "Resource config loaded");
        Ok(config)
    }
}

/// Require the config file to be owned by root or the effective user, and not
/// writable by group or other.
#[cfg(unix)]
pub fn owner_has_exclusive_write_perms(path: &Path) -> Result<()> {
    use std::os::unix::fs::MetadataExt;

    let meta = fs::metadata(path)?;
    // SAFETY: geteuid has no preconditions and cannot fail
    let euid = unsafe { libc::geteuid() };
    let file_uid = meta.uid();

    if file_uid != 0 && file_uid != euid {
        return Err(PluginError::InsecureConfig(format!(
            "config file (\"{}\") must be owned by the plugin user (uid={}) or root",
            path.display(),
            euid
        )));
    }

    let perm = meta.mode() & 0o777;
    if perm & 0o022 != 0 {
        let abs = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        return Err(PluginError::InsecureConfig(format!(
            "config file (\"{}\") can only be writable by the owner but the permissions are \"{:o}\" \
             (to fix the permissions use: 'chmod go-w {}')",
            path.display(),
            perm,
            abs.display()
        )));
    }

    Ok(())
}

#[cfg(not(unix))]
pub fn owner_has_exclusive_write_perms(_path: &Path) -> Result<()> {
    Ok(())
}

/// Retry delay between failed start/registration attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Backoff {
    /// Delay before retry number `attempt` (1-based), doubling up to `max`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.initial
            .checked_mul(1u32 << shift)
            .unwrap_or(self.max)
            .min(self.max)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
        }
    }
}

/// Everything the supervisor needs, built once at startup.
#[derive(Debug, Clone)]
pub struct PluginConfig {
    pub resource_name: String,
    /// Directory holding the host agent socket and this plugin's socket
    pub plugin_dir: PathBuf,
    /// Host agent control socket used for registration
    pub kubelet_socket: PathBuf,
    pub devices: Vec<DeviceDescriptor>,
    /// Prepended to the allocation env var names
    pub env_prefix: String,
    pub start_timeout: Duration,
    pub register_timeout: Duration,
    pub health_interval: Duration,
    pub backoff: Backoff,
}

impl PluginConfig {
    /// Create a config with default sockets, timeouts and backoff
    pub fn new(resource_name: impl Into<String>, devices: Vec<DeviceDescriptor>) -> Self {
        let plugin_dir = PathBuf::from(proto::DEVICE_PLUGIN_PATH);
        Self {
            resource_name: resource_name.into(),
            kubelet_socket: plugin_dir.join(proto::KUBELET_SOCKET),
            plugin_dir,
            devices,
            env_prefix: String::new(),
            start_timeout: DEFAULT_DIAL_TIMEOUT,
            register_timeout: DEFAULT_DIAL_TIMEOUT,
            health_interval: DEFAULT_HEALTH_INTERVAL,
            backoff: Backoff::default(),
        }
    }

    /// Move both sockets under `dir`
    pub fn with_plugin_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.plugin_dir = dir.into();
        self.kubelet_socket = self.plugin_dir.join(proto::KUBELET_SOCKET);
        self
    }

    /// Set the prefix for allocation env vars
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Set the device path probe interval
    pub fn with_health_interval(mut self, interval: Duration) -> Self {
        self.health_interval = interval;
        self
    }

    /// Set the restart backoff
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }
}
