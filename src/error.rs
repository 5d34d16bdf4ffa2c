use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PluginError {
    #[error("failed to start device plugin server on {}: {reason}", .socket.display())]
    Start { socket: PathBuf, reason: String },

    #[error("failed to register {resource} with host agent at {}: {reason}", .endpoint.display())]
    Register {
        endpoint: PathBuf,
        resource: String,
        reason: String,
    },

    #[error("invalid allocation request: unknown device: {0}")]
    UnknownDevice(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("insecure config file: {0}")]
    InsecureConfig(String),

    #[error("fault source error: {0}")]
    FaultSource(String),

    #[error("filesystem watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Failure to open a gRPC channel over a unix socket
#[derive(Error, Debug)]
pub enum DialError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport: {0}")]
    Transport(#[from] tonic::transport::Error),
}

impl From<PluginError> for tonic::Status {
    fn from(e: PluginError) -> Self {
        match e {
            PluginError::UnknownDevice(_) => tonic::Status::invalid_argument(e.to_string()),
            other => tonic::Status::internal(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, PluginError>;
