use super::health::{FaultSource, HealthMonitor};
use super::registration;
use super::service::{self, DevicePluginService};
use super::socket;
use crate::config::PluginConfig;
use crate::error::{PluginError, Result};
use crate::inventory::Inventory;
use crate::proto::device_plugin_server::DevicePluginServer;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UnixListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnixListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tracing::{debug, error, info, warn};

const HEALTH_CHANNEL_CAPACITY: usize = 16;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// One plugin instance: socket, inventory, stop signal and the serving task.
///
/// A stopped instance is never restarted; the supervisor builds a new one.
pub struct PluginServer {
    resource_name: String,
    socket: PathBuf,
    kubelet_socket: PathBuf,
    env_prefix: String,
    start_timeout: Duration,
    register_timeout: Duration,
    inventory: Inventory,
    fault_source: Arc<dyn FaultSource>,
    stop: CancellationToken,
    server: Option<JoinHandle<std::result::Result<(), tonic::transport::Error>>>,
    tracker: Option<JoinHandle<()>>,
    monitor: Option<JoinHandle<()>>,
}

impl PluginServer {
    /// Create an instance for `config`; nothing is bound until [`start`](Self::start).
    pub fn new(config: &PluginConfig, fault_source: Arc<dyn FaultSource>) -> Self {
        let inventory = Inventory::from_descriptors(&config.devices);
        let socket = socket::socket_path(&config.plugin_dir, &config.resource_name);
        debug!(
            "Plugin instance created for {} ({} devices)",
            socket.display(),
            inventory.len()
        );

        Self {
            resource_name: config.resource_name.clone(),
            socket,
            kubelet_socket: config.kubelet_socket.clone(),
            env_prefix: config.env_prefix.clone(),
            start_timeout: config.start_timeout,
            register_timeout: config.register_timeout,
            inventory,
            fault_source,
            stop: CancellationToken::new(),
            server: None,
            tracker: None,
            monitor: None,
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket
    }

    pub fn inventory(&self) -> &Inventory {
        &self.inventory
    }

    /// Check if the serving task is running
    pub fn is_serving(&self) -> bool {
        self.server.is_some()
    }

    /// Bind the socket, serve in the background and confirm with a self-dial.
    pub async fn start(&mut self) -> Result<()> {
        if self.server.is_some() {
            return Ok(());
        }
        if self.stop.is_cancelled() {
            return Err(self.start_error("instance already stopped"));
        }

        socket::remove_socket(&self.socket)
            .map_err(|e| self.start_error(format!("stale socket cleanup: {e}")))?;

        if let Some(parent) = self.socket.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| self.start_error(format!("create {}: {e}", parent.display())))?;
        }

        let listener = UnixListener::bind(&self.socket)
            .map_err(|e| self.start_error(format!("bind: {e}")))?;

        let (health_tx, health_rx) = mpsc::channel(HEALTH_CHANNEL_CAPACITY);
        let (snapshot_tx, snapshot_rx) = watch::channel(self.inventory.clone());
        self.tracker = Some(tokio::spawn(service::track_health(
            snapshot_tx,
            health_rx,
            self.stop.clone(),
        )));
        let service =
            DevicePluginService::new(snapshot_rx, self.stop.clone(), self.env_prefix.clone());

        let shutdown = self.stop.clone().cancelled_owned();
        self.server = Some(tokio::spawn(
            Server::builder()
                .add_service(DevicePluginServer::new(service))
                .serve_with_incoming_shutdown(UnixListenerStream::new(listener), shutdown),
        ));

        // Wait for the server to accept a connection before declaring success
        match socket::dial(&self.socket, self.start_timeout).await {
            Ok(channel) => drop(channel),
            Err(e) => {
                let err = self.start_error(format!("self-dial: {e}"));
                if let Err(stop_err) = self.stop().await {
                    warn!("Cleanup after failed start: {}", stop_err);
                }
                return Err(err);
            }
        }

        let monitor = HealthMonitor::new(
            Arc::clone(&self.fault_source),
            self.inventory.devices().to_vec(),
            health_tx,
        );
        self.monitor = Some(tokio::spawn(monitor.run(self.stop.child_token())));

        info!("Device plugin server started on {}", self.socket.display());
        Ok(())
    }

    /// Register this instance's endpoint with the host agent.
    pub async fn register(&self) -> Result<()> {
        registration::register(
            &self.kubelet_socket,
            &self.endpoint(),
            &self.resource_name,
            self.register_timeout,
        )
        .await
    }

    /// Start then register; a failed registration stops the fresh server.
    pub async fn serve(&mut self) -> Result<()> {
        self.start().await?;

        if let Err(e) = self.register().await {
            if let Err(stop_err) = self.stop().await {
                warn!("Cleanup after failed registration: {}", stop_err);
            }
            return Err(e);
        }

        info!("Device plugin serving '{}'", self.resource_name);
        Ok(())
    }

    /// Halt serving, end all streams and remove the socket. No-op when not serving.
    pub async fn stop(&mut self) -> Result<()> {
        let Some(mut server) = self.server.take() else {
            return Ok(());
        };

        self.stop.cancel();

        match tokio::time::timeout(SHUTDOWN_GRACE, &mut server).await {
            Ok(Ok(Ok(()))) => debug!("gRPC server shut down"),
            Ok(Ok(Err(e))) => warn!("gRPC server exited with error: {}", e),
            Ok(Err(e)) => error!("gRPC server task failed: {}", e),
            Err(_) => {
                warn!("gRPC server did not shut down in time, aborting");
                server.abort();
            }
        }

        let tasks = [
            ("Health monitor", self.monitor.take()),
            ("Health tracker", self.tracker.take()),
        ];
        for (name, task) in tasks {
            if let Some(task) = task {
                if tokio::time::timeout(SHUTDOWN_GRACE, task).await.is_err() {
                    warn!("{} did not stop in time", name);
                }
            }
        }

        socket::remove_socket(&self.socket)?;
        info!("Device plugin server stopped, removed {}", self.socket.display());
        Ok(())
    }

    /// Socket basename, as the host agent expects it
    fn endpoint(&self) -> String {
        self.socket
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    fn start_error(&self, reason: impl Into<String>) -> PluginError {
        PluginError::Start {
            socket: self.socket.clone(),
            reason: reason.into(),
        }
    }
}

impl Drop for PluginServer {
    fn drop(&mut self) {
        if let Some(server) = self.server.take() {
            self.stop.cancel();
            server.abort();
            for task in [self.monitor.take(), self.tracker.take()].into_iter().flatten() {
                task.abort();
            }
            if let Err(e) = socket::remove_socket(&self.socket) {
                warn!("Failed to remove {} on drop: {}", self.socket.display(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceDescriptor;
    use crate::plugin::health::NoopFaultSource;
    use crate::proto::device_plugin_client::DevicePluginClient;
    use crate::proto::{AllocateRequest, ContainerAllocateRequest, Empty};
    use tokio_stream::StreamExt;

    fn config(dir: &Path, resource: &str) -> PluginConfig {
        PluginConfig::new(
            resource,
            vec![DeviceDescriptor::new("snaffler", "v1", "/dev/wibble1")],
        )
        .with_plugin_dir(dir)
    }

    fn instance(dir: &Path, resource: &str) -> PluginServer {
        PluginServer::new(&config(dir, resource), Arc::new(NoopFaultSource))
    }

    #[tokio::test]
    async fn test_start_and_stop_removes_socket() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = instance(dir.path(), "ska-sdp.org/widget");

        server.start().await.unwrap();
        assert!(server.is_serving());
        assert!(server.socket_path().exists());

        server.stop().await.unwrap();
        assert!(!server.is_serving());
        assert!(!server.socket_path().exists());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = instance(dir.path(), "r");

        server.stop().await.unwrap();
        server.start().await.unwrap();
        server.stop().await.unwrap();
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stopped_instance_cannot_restart() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = instance(dir.path(), "r");
        server.start().await.unwrap();
        server.stop().await.unwrap();

        assert!(matches!(server.start().await, Err(PluginError::Start { .. })));
        assert!(!server.socket_path().exists());
    }

    #[tokio::test]
    async fn test_stop_then_start_on_same_path() {
        let dir = tempfile::tempdir().unwrap();
        let mut first = instance(dir.path(), "r");
        first.start().await.unwrap();
        first.stop().await.unwrap();

        let mut second = instance(dir.path(), "r");
        assert_eq!(first.socket_path(), second.socket_path());
        second.start().await.unwrap();
        second.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_replaces_stale_socket_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = instance(dir.path(), "r");
        std::fs::write(server.socket_path(), b"stale").unwrap();

        server.start().await.unwrap();
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_two_resource_names_serve_side_by_side() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = instance(dir.path(), "a");
        let mut b = instance(dir.path(), "b");
        assert_ne!(a.socket_path(), b.socket_path());

        a.start().await.unwrap();
        b.start().await.unwrap();
        assert!(a.socket_path().exists() && b.socket_path().exists());

        a.stop().await.unwrap();
        assert!(b.socket_path().exists());
        b.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_serves_rpcs_over_socket() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = instance(dir.path(), "r");
        server.start().await.unwrap();

        let channel = socket::dial(server.socket_path(), Duration::from_secs(5))
            .await
            .unwrap();
        let mut client = DevicePluginClient::new(channel);

        let response = client
            .allocate(AllocateRequest {
                container_requests: vec![ContainerAllocateRequest {
                    devices_ids: vec!["snaffler_v1_0".to_string()],
                }],
            })
            .await
            .unwrap()
            .into_inner();
        assert_eq!(
            response.container_responses[0].envs["VISIBLE_DEVICES"],
            "/dev/wibble1"
        );

        let mut stream = client.list_and_watch(Empty {}).await.unwrap().into_inner();
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first, server.inventory().to_response());

        server.stop().await.unwrap();
        let end = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .unwrap();
        assert!(!matches!(end, Some(Ok(_))));
    }

    #[tokio::test]
    async fn test_ghost_device_path_stays_healthy() {
        let dir = tempfile::tempdir().unwrap();
        let ghost = dir.path().join("wibble1");
        let config = PluginConfig::new(
            "r",
            vec![DeviceDescriptor::new("snaffler", "v1", ghost.to_str().unwrap())],
        )
        .with_plugin_dir(dir.path())
        .with_health_interval(Duration::from_millis(10));
        let mut server = PluginServer::new(&config, Arc::new(NoopFaultSource));
        server.start().await.unwrap();

        let channel = socket::dial(server.socket_path(), Duration::from_secs(5))
            .await
            .unwrap();
        let mut stream = DevicePluginClient::new(channel)
            .list_and_watch(Empty {})
            .await
            .unwrap()
            .into_inner();
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.devices[0].health, "Healthy");

        // The path does not exist on this node; nothing may be reported for it
        let update = tokio::time::timeout(Duration::from_millis(300), stream.next()).await;
        assert!(update.is_err());

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_serve_without_host_agent_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = instance(dir.path(), "r");

        let err = server.serve().await.unwrap_err();
        assert!(matches!(err, PluginError::Register { .. }));
        assert!(!server.is_serving());
        assert!(!server.socket_path().exists());
    }

    #[tokio::test]
    async fn test_drop_removes_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = {
            let mut server = instance(dir.path(), "r");
            server.start().await.unwrap();
            server.socket_path().to_path_buf()
        };
        assert!(!path.exists());
    }
}
