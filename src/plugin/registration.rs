use super::service::plugin_options;
use super::socket;
use crate::error::{PluginError, Result};
use crate::proto::registration_client::RegistrationClient;
use crate::proto::{self, RegisterRequest};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Announce a plugin endpoint to the host agent's control socket.
///
/// Single attempt: dial failures and rejections both come back as
/// [`PluginError::Register`] and retrying is up to the caller.
pub async fn register(
    kubelet_socket: &Path,
    endpoint: &str,
    resource_name: &str,
    timeout: Duration,
) -> Result<()> {
    let register_error = |reason: String| PluginError::Register {
        endpoint: kubelet_socket.to_path_buf(),
        resource: resource_name.to_string(),
        reason,
    };

    debug!("Dialing host agent at {}", kubelet_socket.display());
    let channel = socket::dial(kubelet_socket, timeout)
        .await
        .map_err(|e| register_error(format!("dial: {e}")))?;

    let request = RegisterRequest {
        version: proto::VERSION.to_string(),
        endpoint: endpoint.to_string(),
        resource_name: resource_name.to_string(),
        options: Some(plugin_options()),
    };

    RegistrationClient::new(channel)
        .register(request)
        .await
        .map_err(|status| register_error(format!("rejected: {}", status.message())))?;

    info!(
        "Registered '{}' with host agent (endpoint {})",
        resource_name, endpoint
    );
    Ok(())
}
