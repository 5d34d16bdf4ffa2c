//! Widget device plugin core
//!
//! Keeps one plugin instance registered with a volatile host agent:
//! - gRPC DevicePlugin service on a dedicated unix socket
//! - one-shot registration against the host agent's control socket
//! - health monitoring fed into the ListAndWatch stream
//! - restart supervision on host agent restarts and OS signals
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │                  Supervisor                    │
//! │   (fs watcher + signals → restart / shutdown)  │
//! ├───────────────────────────────────────────────┤
//! │                 PluginServer                   │
//! │  DevicePluginService │ HealthMonitor │ socket  │
//! ├───────────────────────────────────────────────┤
//! │      registration → <plugin-dir>/kubelet.sock   │
//! └───────────────────────────────────────────────┘
//! ```

pub mod health;
pub mod registration;
pub mod server;
pub mod service;
pub mod socket;
pub mod supervisor;

pub use health::{DeviceFault, DevicePathProbe, FaultSource, HealthMonitor, NoopFaultSource};
pub use server::PluginServer;
pub use service::DevicePluginService;
pub use supervisor::{Supervisor, SupervisorEvent, SupervisorState};
