//! Device inventory snapshot advertised by one plugin instance

use crate::config::DeviceDescriptor;
use crate::proto;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Health {
    Healthy,
    Unhealthy,
}

impl Health {
    /// Wire value used in `Device.health`
    pub fn as_str(&self) -> &'static str {
        match self {
            Health::Healthy => proto::HEALTHY,
            Health::Unhealthy => proto::UNHEALTHY,
        }
    }
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub id: String,
    pub device_type: String,
    pub model: String,
    /// Opaque path exposed to containers the device is allocated to
    pub path: String,
    pub health: Health,
}

impl Device {
    /// Health only ever degrades; returns whether this call changed it.
    pub fn mark_unhealthy(&mut self) -> bool {
        let changed = self.health == Health::Healthy;
        self.health = Health::Unhealthy;
        changed
    }

    /// Convert to the wire device record
    pub fn to_proto(&self) -> proto::Device {
        proto::Device {
            id: self.id.clone(),
            health: self.health.as_str().to_string(),
            topology: None,
        }
    }
}

/// Ordered device list, ids unique by construction (`<type>_<model>_<position>`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Inventory {
    devices: Vec<Device>,
}

impl Inventory {
    /// Build an all-Healthy inventory, numbering devices by position
    pub fn from_descriptors(descriptors: &[DeviceDescriptor]) -> Self {
        let devices = descriptors
            .iter()
            .enumerate()
            .map(|(i, d)| Device {
                id: format!("{}_{}_{}", d.device_type, d.model, i),
                device_type: d.device_type.clone(),
                model: d.model.clone(),
                path: d.device.clone(),
                health: Health::Healthy,
            })
            .collect();

        Self { devices }
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Look up a device by id
    pub fn get(&self, id: &str) -> Option<&Device> {
        self.devices.iter().find(|d| d.id == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Device> {
        self.devices.iter_mut().find(|d| d.id == id)
    }

    /// Check if a device id is known
    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// Whole-snapshot message for ListAndWatch
    pub fn to_response(&self) -> proto::ListAndWatchResponse {
        proto::ListAndWatchResponse {
            devices: self.devices.iter().map(Device::to_proto).collect(),
        }
    }
}
