use crate::error::{PluginError, Result};
use crate::inventory::Device;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default probe interval
const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// A fault observed on one device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceFault {
    pub device_id: String,
    pub reason: String,
}

pub type FaultStream = BoxStream<'static, Result<DeviceFault>>;

/// Anything able to report device faults (kernel exception watcher, probes, ...)
#[async_trait]
pub trait FaultSource: Send + Sync {
    /// Start watching `devices`; the stream yields faults until it is dropped.
    async fn subscribe(&self, devices: &[Device]) -> Result<FaultStream>;
}

/// Never reports a fault
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopFaultSource;

#[async_trait]
impl FaultSource for NoopFaultSource {
    async fn subscribe(&self, _devices: &[Device]) -> Result<FaultStream> {
        Ok(stream::pending().boxed())
    }
}

/// Reports a device once its physical path disappears
#[derive(Debug, Clone)]
pub struct DevicePathProbe {
    check_interval: Duration,
}

impl DevicePathProbe {
    /// Create a probe with the default interval
    pub fn new() -> Self {
        Self {
            check_interval: DEFAULT_CHECK_INTERVAL,
        }
    }

    /// Set the probe interval
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }
}

impl Default for DevicePathProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FaultSource for DevicePathProbe {
    async fn subscribe(&self, devices: &[Device]) -> Result<FaultStream> {
        if self.check_interval.is_zero() {
            return Err(PluginError::FaultSource(
                "probe interval must be non-zero".to_string(),
            ));
        }

        let watched: Vec<(String, String)> = devices
            .iter()
            .map(|d| (d.id.clone(), d.path.clone()))
            .collect();
        let interval = tokio::time::interval(self.check_interval);

        let faults = stream::unfold(
            (interval, watched, HashSet::<String>::new()),
            |(mut interval, watched, mut reported)| async move {
                loop {
                    interval.tick().await;

                    let missing = watched
                        .iter()
                        .find(|(id, path)| !reported.contains(id) && !Path::new(path).exists());

                    if let Some((id, path)) = missing {
                        let fault = DeviceFault {
                            device_id: id.clone(),
                            reason: format!("device path {path} no longer exists"),
                        };
                        reported.insert(id.clone());
                        return Some((Ok::<_, PluginError>(fault), (interval, watched, reported)));
                    }
                    debug!("All {} device paths present", watched.len());
                }
            },
        );

        Ok(faults.boxed())
    }
}

/// Forwards faults from a [`FaultSource`] into the server's health channel.
pub struct HealthMonitor {
    source: Arc<dyn FaultSource>,
    devices: Vec<Device>,
    health_tx: mpsc::Sender<String>,
}

impl HealthMonitor {
    /// Create a new health monitor
    pub fn new(
        source: Arc<dyn FaultSource>,
        devices: Vec<Device>,
        health_tx: mpsc::Sender<String>,
    ) -> Self {
        Self {
            source,
            devices,
            health_tx,
        }
    }

    /// Run until `cancel` fires.
    ///
    /// Source errors are logged and do not stop the monitor. Each device is
    /// forwarded at most once since health never recovers.
    pub async fn run(self, cancel: CancellationToken) {
        info!("Health monitor started ({} devices)", self.devices.len());

        let mut faults = tokio::select! {
            _ = cancel.cancelled() => return,
            sub = self.source.subscribe(&self.devices) => match sub {
                Ok(faults) => faults,
                Err(e) => {
                    warn!("Failed to subscribe to device faults: {}", e);
                    cancel.cancelled().await;
                    return;
                }
            },
        };

        let known: HashSet<&str> = self.devices.iter().map(|d| d.id.as_str()).collect();
        let mut forwarded = HashSet::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                next = faults.next() => match next {
                    Some(Ok(fault)) => {
                        if !known.contains(fault.device_id.as_str()) {
                            warn!("Fault reported for unknown device '{}'", fault.device_id);
                            continue;
                        }
                        if !forwarded.insert(fault.device_id.clone()) {
                            continue;
                        }
                        warn!("Device '{}' faulted: {}", fault.device_id, fault.reason);

                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            sent = self.health_tx.send(fault.device_id) => {
                                if sent.is_err() {
                                    debug!("Health channel closed");
                                    break;
                                }
                            }
                        }
                    }
                    Some(Err(e)) => warn!("Fault source error: {}", e),
                    None => {
                        debug!("Fault source exhausted");
                        cancel.cancelled().await;
                        break;
                    }
                },
            }
        }

        info!("Health monitor stopped");
    }
}
