pub mod config;
pub mod error;
pub mod inventory;
pub mod plugin;
pub mod proto;

pub use config::{DeviceConfig, DeviceDescriptor, PluginConfig};
pub use error::{PluginError, Result};
pub use inventory::{Device, Health, Inventory};
pub use plugin::{PluginServer, Supervisor};
