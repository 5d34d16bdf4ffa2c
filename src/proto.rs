//! Device plugin API types generated from `proto/deviceplugin/v1beta1/api.proto`.

#![allow(clippy::all, missing_docs)]

tonic::include_proto!("v1beta1");

/// API version announced in every registration record
pub const VERSION: &str = "v1beta1";

/// Well-known directory holding the host agent socket and plugin sockets
pub const DEVICE_PLUGIN_PATH: &str = "/var/lib/kubelet/device-plugins";

/// File name of the host agent's control socket inside [`DEVICE_PLUGIN_PATH`]
pub const KUBELET_SOCKET: &str = "kubelet.sock";

/// Health value of a device that can be allocated
pub const HEALTHY: &str = "Healthy";

/// Health value of a device the host agent must stop handing out
pub const UNHEALTHY: &str = "Unhealthy";
