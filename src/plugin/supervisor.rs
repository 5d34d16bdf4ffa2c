use super::health::FaultSource;
use super::server::PluginServer;
use crate::config::PluginConfig;
use crate::error::Result;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Initializing,
    Serving,
    Restarting,
    ShuttingDown,
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SupervisorState::Initializing => "initializing",
            SupervisorState::Serving => "serving",
            SupervisorState::Restarting => "restarting",
            SupervisorState::ShuttingDown => "shutting-down",
        };
        f.write_str(name)
    }
}

/// Inputs that can move the supervisor between states
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    /// The host agent's control socket was (re)created
    HostAgentRestarted,
    /// SIGHUP
    Hangup,
    /// SIGINT, SIGTERM or SIGQUIT
    Terminate(&'static str),
    /// Filesystem watcher failure; logged only
    WatchError(String),
}

/// Keeps exactly one plugin instance serving and replaces it on restart triggers.
pub struct Supervisor {
    config: PluginConfig,
    fault_source: Arc<dyn FaultSource>,
    current: Option<PluginServer>,
    attempts: u32,
    state: watch::Sender<SupervisorState>,
}

impl Supervisor {
    /// Create a new supervisor in the `Initializing` state
    pub fn new(config: PluginConfig, fault_source: Arc<dyn FaultSource>) -> Self {
        let (state, _) = watch::channel(SupervisorState::Initializing);
        Self {
            config,
            fault_source,
            current: None,
            attempts: 0,
            state,
        }
    }

    /// Current state
    pub fn state(&self) -> SupervisorState {
        *self.state.borrow()
    }

    /// Observe state transitions
    pub fn subscribe(&self) -> watch::Receiver<SupervisorState> {
        self.state.subscribe()
    }

    /// Watch the plugin directory and OS signals, serve until a termination signal.
    pub async fn run(self) -> Result<()> {
        let (tx, rx) = mpsc::unbounded_channel();

        info!("Starting FS watcher on {}", self.config.plugin_dir.display());
        let _watcher = watch_host_agent(&self.config.plugin_dir, &self.config.kubelet_socket, tx.clone())?;

        info!("Starting OS signal watcher");
        let signals = spawn_signal_listener(tx)?;

        let result = self.run_with_events(rx).await;
        signals.abort();
        result
    }

    /// Drive the state machine from an explicit event channel.
    pub async fn run_with_events(
        mut self,
        mut events: mpsc::UnboundedReceiver<SupervisorEvent>,
    ) -> Result<()> {
        loop {
            match self.state() {
                SupervisorState::Initializing | SupervisorState::Restarting => {
                    self.restart(&mut events).await;
                }
                SupervisorState::Serving => {
                    let next = match events.recv().await {
                        Some(event) => self.on_event(event),
                        None => SupervisorState::ShuttingDown,
                    };
                    self.transition(next);
                }
                SupervisorState::ShuttingDown => {
                    self.stop_current().await;
                    info!("Device plugin supervisor exited");
                    return Ok(());
                }
            }
        }
    }

    /// Replace the current instance; on failure wait out the backoff.
    async fn restart(&mut self, events: &mut mpsc::UnboundedReceiver<SupervisorEvent>) {
        self.stop_current().await;

        let mut instance = PluginServer::new(&self.config, Arc::clone(&self.fault_source));
        match instance.serve().await {
            Ok(()) => {
                self.current = Some(instance);
                self.attempts = 0;
                self.transition(SupervisorState::Serving);
                return;
            }
            Err(e) => {
                self.attempts += 1;
                warn!(
                    "Could not contact host agent (attempt {}): {}. Retrying. Is the device plugin feature enabled?",
                    self.attempts, e
                );
            }
        }
        self.transition(SupervisorState::Restarting);

        let delay = self.config.backoff.delay(self.attempts);
        debug!("Waiting {:?} before next attempt", delay);
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return,
                event = events.recv() => {
                    let next = match event {
                        Some(event) => self.on_event(event),
                        None => SupervisorState::ShuttingDown,
                    };
                    match next {
                        SupervisorState::ShuttingDown => {
                            self.transition(next);
                            return;
                        }
                        SupervisorState::Restarting => return,
                        _ => {}
                    }
                }
            }
        }
    }

    /// State an event leads to; `Serving` means "no change".
    fn on_event(&self, event: SupervisorEvent) -> SupervisorState {
        match event {
            SupervisorEvent::HostAgentRestarted => {
                info!(
                    "{} created, restarting",
                    self.config.kubelet_socket.display()
                );
                SupervisorState::Restarting
            }
            SupervisorEvent::Hangup => {
                info!("Received SIGHUP, restarting");
                SupervisorState::Restarting
            }
            SupervisorEvent::Terminate(signal) => {
                info!("Received {}, shutting down", signal);
                SupervisorState::ShuttingDown
            }
            SupervisorEvent::WatchError(e) => {
                warn!("Filesystem watch error: {}", e);
                SupervisorState::Serving
            }
        }
    }

    async fn stop_current(&mut self) {
        if let Some(mut instance) = self.current.take() {
            if let Err(e) = instance.stop().await {
                error!("Failed to stop device plugin cleanly: {}", e);
            }
        }
    }

    fn transition(&self, next: SupervisorState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!("Supervisor state: {} -> {}", previous, next);
        }
    }
}

/// Report creation of the host agent's control socket inside `dir`.
pub fn watch_host_agent(
    dir: &Path,
    kubelet_socket: &Path,
    tx: mpsc::UnboundedSender<SupervisorEvent>,
) -> Result<RecommendedWatcher> {
    let socket_name = kubelet_socket.file_name().map(|n| n.to_os_string());

    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        let event = match res {
            Ok(event) => {
                let created = event.kind.is_create()
                    && event
                        .paths
                        .iter()
                        .any(|p| p.file_name().map(|n| n.to_os_string()) == socket_name);
                if !created {
                    return;
                }
                SupervisorEvent::HostAgentRestarted
            }
            Err(e) => SupervisorEvent::WatchError(e.to_string()),
        };
        let _ = tx.send(event);
    })?;

    watcher.watch(dir, RecursiveMode::NonRecursive)?;
    Ok(watcher)
}

#[cfg(unix)]
fn spawn_signal_listener(tx: mpsc::UnboundedSender<SupervisorEvent>) -> Result<JoinHandle<()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    Ok(tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = sighup.recv() => SupervisorEvent::Hangup,
                _ = sigint.recv() => SupervisorEvent::Terminate("SIGINT"),
                _ = sigterm.recv() => SupervisorEvent::Terminate("SIGTERM"),
                _ = sigquit.recv() => SupervisorEvent::Terminate("SIGQUIT"),
            };
            if tx.send(event).is_err() {
                break;
            }
        }
    }))
}

#[cfg(not(unix))]
fn spawn_signal_listener(tx: mpsc::UnboundedSender<SupervisorEvent>) -> Result<JoinHandle<()>> {
    Ok(tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = tx.send(SupervisorEvent::Terminate("Ctrl+C"));
        }
    }))
}
