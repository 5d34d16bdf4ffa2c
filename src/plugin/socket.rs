use crate::error::DialError;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use hyper_util::rt::TokioIo;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::UnixStream;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;
use tracing::trace;

const SOCKET_SUFFIX: &str = "_widget.sock";

/// Plugin socket for `resource_name` under `plugin_dir`.
///
/// The resource name is base64url-encoded so that several instances with
/// different resource names never share a socket, and the result never
/// contains a path separator.
pub fn socket_path(plugin_dir: &Path, resource_name: &str) -> PathBuf {
    let encoded = URL_SAFE_NO_PAD.encode(resource_name.as_bytes());
    trace!(resource_name, encoded = %encoded, "Encoded resource name");
    plugin_dir.join(format!("{encoded}{SOCKET_SUFFIX}"))
}

/// Remove a socket file; a missing file is not an error.
pub fn remove_socket(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Open a gRPC channel to a unix socket, failing after `timeout`.
pub async fn dial(path: &Path, timeout: Duration) -> Result<Channel, DialError> {
    let path = path.to_path_buf();

    // The URI is ignored by the connector; tonic only needs a valid authority.
    let endpoint = Endpoint::from_static("http://[::]:50051").connect_timeout(timeout);

    let connect = endpoint.connect_with_connector(service_fn(move |_: Uri| {
        let path = path.clone();
        async move { Ok::<_, std::io::Error>(TokioIo::new(UnixStream::connect(path).await?)) }
    }));

    match tokio::time::timeout(timeout, connect).await {
        Ok(channel) => Ok(channel?),
        Err(_) => Err(DialError::Timeout(timeout)),
    }
}
