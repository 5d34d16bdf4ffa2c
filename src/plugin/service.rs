//! DevicePlugin gRPC service: options, ListAndWatch streaming and allocation.

use crate::error::{PluginError, Result};
use crate::inventory::Inventory;
use crate::proto::device_plugin_server::DevicePlugin;
use crate::proto::{
    AllocateRequest, AllocateResponse, ContainerAllocateRequest, ContainerAllocateResponse,
    ContainerPreferredAllocationRequest, ContainerPreferredAllocationResponse, DevicePluginOptions,
    Empty, ListAndWatchResponse, PreStartContainerRequest, PreStartContainerResponse,
    PreferredAllocationRequest, PreferredAllocationResponse,
};
use std::collections::HashMap;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};

/// Env var listing the logical ids allocated to a container
pub const VISIBLE_DEVICE_IDS_ENV: &str = "VISIBLE_DEVICE_IDS";
/// Env var listing the physical device paths allocated to a container
pub const VISIBLE_DEVICES_ENV: &str = "VISIBLE_DEVICES";

const WATCH_BUFFER: usize = 4;

/// Static capabilities advertised at registration and via GetDevicePluginOptions
pub fn plugin_options() -> DevicePluginOptions {
    DevicePluginOptions {
        pre_start_required: false,
        get_preferred_allocation_available: false,
    }
}

/// Apply health events to the inventory and publish every changed snapshot.
///
/// This is the only writer of device health for an instance. Runs until
/// `stop` fires; a closed health channel just leaves the last snapshot in place.
pub async fn track_health(
    snapshots: watch::Sender<Inventory>,
    mut health_rx: mpsc::Receiver<String>,
    stop: CancellationToken,
) {
    loop {
        let id = tokio::select! {
            _ = stop.cancelled() => break,
            next = health_rx.recv() => match next {
                Some(id) => id,
                None => {
                    stop.cancelled().await;
                    break;
                }
            },
        };

        let mut known = true;
        // No way back to Healthy within this instance; a restart clears it.
        let changed = snapshots.send_if_modified(|inventory| match inventory.get_mut(&id) {
            Some(device) => device.mark_unhealthy(),
            None => {
                known = false;
                false
            }
        });

        if !known {
            warn!("Health event for unknown device '{}' ignored", id);
        } else if changed {
            warn!("Device '{}' marked unhealthy", id);
        }
    }
    debug!("Health tracker stopped");
}

pub struct DevicePluginService {
    snapshots: watch::Receiver<Inventory>,
    stop: CancellationToken,
    env_prefix: String,
}

impl DevicePluginService {
    /// Create a service reading inventory snapshots published by [`track_health`]
    pub fn new(
        snapshots: watch::Receiver<Inventory>,
        stop: CancellationToken,
        env_prefix: impl Into<String>,
    ) -> Self {
        Self {
            snapshots,
            stop,
            env_prefix: env_prefix.into(),
        }
    }

    /// Build the allocation response; any unknown id fails the whole request.
    pub fn allocate_devices(&self, request: &AllocateRequest) -> Result<AllocateResponse> {
        let inventory = self.snapshots.borrow();
        let container_responses = request
            .container_requests
            .iter()
            .map(|req| self.allocate_container(&inventory, req))
            .collect::<Result<Vec<_>>>()?;

        Ok(AllocateResponse {
            container_responses,
        })
    }

    fn allocate_container(
        &self,
        inventory: &Inventory,
        req: &ContainerAllocateRequest,
    ) -> Result<ContainerAllocateResponse> {
        debug!("Allocation request for {:?}", req.devices_ids);

        let paths = req
            .devices_ids
            .iter()
            .map(|id| {
                inventory
                    .get(id)
                    .map(|d| d.path.clone())
                    .ok_or_else(|| PluginError::UnknownDevice(id.clone()))
            })
            .collect::<Result<Vec<_>>>()?;

        debug!("Devices to be offered: {:?} -> {:?}", req.devices_ids, paths);

        // Paths are opaque: env vars only, no device specs or mounts.
        let mut envs = HashMap::new();
        envs.insert(
            format!("{}{}", self.env_prefix, VISIBLE_DEVICE_IDS_ENV),
            req.devices_ids.join(","),
        );
        envs.insert(
            format!("{}{}", self.env_prefix, VISIBLE_DEVICES_ENV),
            paths.join(","),
        );

        Ok(ContainerAllocateResponse {
            envs,
            ..Default::default()
        })
    }

    /// Must-include ids first, then other available ids in inventory order.
    fn preferred_for(
        &self,
        req: &ContainerPreferredAllocationRequest,
    ) -> ContainerPreferredAllocationResponse {
        let size = usize::try_from(req.allocation_size).unwrap_or(0);
        let mut device_ids = req.must_include_device_ids.clone();

        for device in self.snapshots.borrow().devices() {
            if device_ids.len() >= size {
                break;
            }
            if req.available_device_ids.contains(&device.id) && !device_ids.contains(&device.id)
            {
                device_ids.push(device.id.clone());
            }
        }

        ContainerPreferredAllocationResponse { device_ids }
    }
}

/// Stream loop: full snapshot first, then the full snapshot again after every
/// health change, until the instance stops or the watcher goes away.
async fn stream_devices(
    mut snapshots: watch::Receiver<Inventory>,
    stop: CancellationToken,
    tx: mpsc::Sender<std::result::Result<ListAndWatchResponse, Status>>,
) {
    let first = snapshots.borrow_and_update().to_response();
    if tx.send(Ok(first)).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            _ = stop.cancelled() => {
                debug!("ListAndWatch terminated by stop signal");
                return;
            }
            _ = tx.closed() => {
                debug!("ListAndWatch client went away");
                return;
            }
            changed = snapshots.changed() => {
                if changed.is_err() {
                    debug!("Health tracker gone, ending ListAndWatch");
                    return;
                }
                let snapshot = snapshots.borrow_and_update().to_response();
                if tx.send(Ok(snapshot)).await.is_err() {
                    return;
                }
            }
        }
    }
}

#[tonic::async_trait]
impl DevicePlugin for DevicePluginService {
    type ListAndWatchStream = ReceiverStream<std::result::Result<ListAndWatchResponse, Status>>;

    async fn get_device_plugin_options(
        &self,
        _request: Request<Empty>,
    ) -> std::result::Result<Response<DevicePluginOptions>, Status> {
        Ok(Response::new(plugin_options()))
    }

    async fn list_and_watch(
        &self,
        _request: Request<Empty>,
    ) -> std::result::Result<Response<Self::ListAndWatchStream>, Status> {
        info!(
            "ListAndWatch stream opened ({} devices)",
            self.snapshots.borrow().len()
        );

        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        tokio::spawn(stream_devices(self.snapshots.clone(), self.stop.clone(), tx));

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn get_preferred_allocation(
        &self,
        request: Request<PreferredAllocationRequest>,
    ) -> std::result::Result<Response<PreferredAllocationResponse>, Status> {
        let container_responses = request
            .into_inner()
            .container_requests
            .iter()
            .map(|req| self.preferred_for(req))
            .collect();

        Ok(Response::new(PreferredAllocationResponse {
            container_responses,
        }))
    }

    async fn allocate(
        &self,
        request: Request<AllocateRequest>,
    ) -> std::result::Result<Response<AllocateResponse>, Status> {
        match self.allocate_devices(request.get_ref()) {
            Ok(response) => Ok(Response::new(response)),
            Err(e) => {
                warn!("Allocation rejected: {}", e);
                Err(e.into())
            }
        }
    }

    async fn pre_start_container(
        &self,
        _request: Request<PreStartContainerRequest>,
    ) -> std::result::Result<Response<PreStartContainerResponse>, Status> {
        Ok(Response::new(PreStartContainerResponse {}))
    }
}
