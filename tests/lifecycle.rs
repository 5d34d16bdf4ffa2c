//! Supervisor lifecycle against a fake host agent
//!
//! A Registration server bound to `<tmp>/kubelet.sock` stands in for the
//! kubelet. The supervisor is driven through restarts with explicit events and
//! a real filesystem watcher on the temp directory.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UnixListener;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::UnixListenerStream;
use tokio_stream::StreamExt;
use tonic::transport::Server;
use tonic::{Request, Response, Status};
use widget_device_plugin::config::{Backoff, DeviceDescriptor, PluginConfig};
use widget_device_plugin::plugin::socket;
use widget_device_plugin::plugin::supervisor::watch_host_agent;
use widget_device_plugin::plugin::{
    NoopFaultSource, Supervisor, SupervisorEvent, SupervisorState,
};
use widget_device_plugin::proto::device_plugin_client::DevicePluginClient;
use widget_device_plugin::proto::registration_server::{Registration, RegistrationServer};
use widget_device_plugin::proto::{
    AllocateRequest, ContainerAllocateRequest, Empty, RegisterRequest,
};

// ============================================================================
// Fake host agent
// ============================================================================

#[derive(Clone, Default)]
struct FakeKubelet {
    registrations: Arc<Mutex<Vec<RegisterRequest>>>,
}

impl FakeKubelet {
    fn count(&self) -> usize {
        self.registrations.lock().unwrap().len()
    }

    fn last(&self) -> RegisterRequest {
        self.registrations.lock().unwrap().last().cloned().unwrap()
    }
}

#[tonic::async_trait]
impl Registration for FakeKubelet {
    async fn register(&self, request: Request<RegisterRequest>) -> Result<Response<Empty>, Status> {
        self.registrations.lock().unwrap().push(request.into_inner());
        Ok(Response::new(Empty {}))
    }
}

/// Serve the fake agent on `path`; the returned sender stops it.
fn serve_kubelet(kubelet: FakeKubelet, path: &Path) -> oneshot::Sender<()> {
    let listener = UnixListener::bind(path).unwrap();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        Server::builder()
            .add_service(RegistrationServer::new(kubelet))
            .serve_with_incoming_shutdown(UnixListenerStream::new(listener), async {
                stop_rx.await.ok();
            })
            .await
            .ok();
    });
    stop_tx
}

// ============================================================================
// Test Helpers
// ============================================================================

fn plugin_config(dir: &Path) -> PluginConfig {
    PluginConfig::new(
        "ska-sdp.org/widget",
        vec![DeviceDescriptor::new("snaffler", "v1", "/dev/wibble1")],
    )
    .with_plugin_dir(dir)
    .with_backoff(Backoff {
        initial: Duration::from_millis(50),
        max: Duration::from_millis(200),
    })
}

async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn plugin_socket(dir: &Path) -> PathBuf {
    socket::socket_path(dir, "ska-sdp.org/widget")
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_register_restart_and_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let kubelet_path = dir.path().join("kubelet.sock");
    let kubelet = FakeKubelet::default();
    let stop_first_kubelet = serve_kubelet(kubelet.clone(), &kubelet_path);

    let (tx, rx) = mpsc::unbounded_channel();
    let _watcher = watch_host_agent(dir.path(), &kubelet_path, tx.clone()).unwrap();

    let supervisor = Supervisor::new(plugin_config(dir.path()), Arc::new(NoopFaultSource));
    let mut states = supervisor.subscribe();
    let handle = tokio::spawn(supervisor.run_with_events(rx));

    // Initial registration
    wait_until("first registration", || kubelet.count() == 1).await;
    let record = kubelet.last();
    assert_eq!(record.version, "v1beta1");
    assert_eq!(record.resource_name, "ska-sdp.org/widget");
    let socket_path = plugin_socket(dir.path());
    assert_eq!(
        record.endpoint,
        socket_path.file_name().unwrap().to_str().unwrap()
    );
    states
        .wait_for(|s| *s == SupervisorState::Serving)
        .await
        .unwrap();

    // The registered endpoint serves the inventory
    let channel = socket::dial(&socket_path, Duration::from_secs(5)).await.unwrap();
    let mut client = DevicePluginClient::new(channel);
    let mut watch = client.list_and_watch(Empty {}).await.unwrap().into_inner();
    let snapshot = watch.next().await.unwrap().unwrap();
    assert_eq!(snapshot.devices.len(), 1);
    assert_eq!(snapshot.devices[0].id, "snaffler_v1_0");
    assert_eq!(snapshot.devices[0].health, "Healthy");

    let allocation = client
        .allocate(AllocateRequest {
            container_requests: vec![ContainerAllocateRequest {
                devices_ids: vec!["snaffler_v1_0".to_string()],
            }],
        })
        .await
        .unwrap()
        .into_inner();
    let envs = &allocation.container_responses[0].envs;
    assert_eq!(envs["VISIBLE_DEVICE_IDS"], "snaffler_v1_0");
    assert_eq!(envs["VISIBLE_DEVICES"], "/dev/wibble1");

    let unknown = client
        .allocate(AllocateRequest {
            container_requests: vec![ContainerAllocateRequest {
                devices_ids: vec!["unknown_id".to_string()],
            }],
        })
        .await;
    assert!(unknown.is_err());

    // SIGHUP: old instance stopped (its stream ends), new one registered
    tx.send(SupervisorEvent::Hangup).unwrap();
    let ended = tokio::time::timeout(Duration::from_secs(10), watch.next())
        .await
        .expect("old ListAndWatch stream should end on restart");
    assert!(!matches!(ended, Some(Ok(_))));
    wait_until("re-registration after hangup", || kubelet.count() == 2).await;
    assert_eq!(kubelet.last().endpoint, record.endpoint);

    let channel = socket::dial(&socket_path, Duration::from_secs(5)).await.unwrap();
    let mut client = DevicePluginClient::new(channel);
    let mut watch = client.list_and_watch(Empty {}).await.unwrap().into_inner();
    assert_eq!(watch.next().await.unwrap().unwrap(), snapshot);

    // Host agent restarts: its socket is recreated, the serving instance is
    // stopped, and only then does a new one re-announce itself
    stop_first_kubelet.send(()).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    std::fs::remove_file(&kubelet_path).unwrap();
    let restarted = FakeKubelet::default();
    let _stop_second_kubelet = serve_kubelet(restarted.clone(), &kubelet_path);

    let ended = tokio::time::timeout(Duration::from_secs(10), watch.next())
        .await
        .expect("old ListAndWatch stream should end when the host agent restarts");
    assert!(!matches!(ended, Some(Ok(_))));
    assert_eq!(
        restarted.count(),
        0,
        "old instance must be stopped before the new one registers"
    );
    wait_until("registration with restarted host agent", || restarted.count() >= 1).await;
    assert_eq!(restarted.last().endpoint, record.endpoint);
    assert_eq!(kubelet.count(), 2);

    // Termination: supervisor exits and the socket is gone
    tx.send(SupervisorEvent::Terminate("SIGTERM")).unwrap();
    let result = tokio::time::timeout(Duration::from_secs(10), handle)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());
    assert!(!socket_path.exists());
}

#[tokio::test]
async fn test_retries_until_host_agent_appears() {
    let dir = tempfile::tempdir().unwrap();
    let kubelet_path = dir.path().join("kubelet.sock");

    let (tx, rx) = mpsc::unbounded_channel();
    let _watcher = watch_host_agent(dir.path(), &kubelet_path, tx.clone()).unwrap();

    let supervisor = Supervisor::new(plugin_config(dir.path()), Arc::new(NoopFaultSource));
    let mut states = supervisor.subscribe();
    let handle = tokio::spawn(supervisor.run_with_events(rx));

    states
        .wait_for(|s| *s == SupervisorState::Restarting)
        .await
        .unwrap();

    let kubelet = FakeKubelet::default();
    let _stop_kubelet = serve_kubelet(kubelet.clone(), &kubelet_path);
    wait_until("registration once the host agent is up", || kubelet.count() >= 1).await;
    states
        .wait_for(|s| *s == SupervisorState::Serving)
        .await
        .unwrap();
    assert!(plugin_socket(dir.path()).exists());

    tx.send(SupervisorEvent::Terminate("SIGINT")).unwrap();
    tokio::time::timeout(Duration::from_secs(10), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(!plugin_socket(dir.path()).exists());
}
