use std::fmt;
use std::io;
use std::path::Path;
use std::path::PathBuf;

use error_stack::Report;
use notify::Event;
use notify::EventKind;
use tokio::signal::unix::signal;
use tokio::signal::unix::Signal;
use tokio::signal::unix::SignalKind;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::warn;

use crate::config::ConfigChangeEvent;
use crate::platform::k8s::PluginServerError;

/// Why the plugin is shutting down. Every trigger is handled the same way:
/// stop all servers and exit, leaving the restart to the supervisor.
#[derive(Debug)]
pub enum ShutdownTrigger {
    /// The kubelet recreated its socket and forgot every registration.
    KubeletRestarted,
    Signal(&'static str),
    ServerFatal(Report<PluginServerError>),
    ConfigChanged(ConfigChangeEvent),
    /// An event source went away and can no longer be watched.
    SourceClosed(&'static str),
}

impl ShutdownTrigger {
    /// Whether the process should exit with an error.
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::ServerFatal(_) | Self::SourceClosed(_))
    }
}

impl fmt::Display for ShutdownTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::KubeletRestarted => f.write_str("kubelet socket was recreated"),
            Self::Signal(name) => write!(f, "received {name}"),
            Self::ServerFatal(report) => write!(f, "plugin server failed: {report:?}"),
            Self::ConfigChanged(event) if event.is_error => write!(
                f,
                "failed to watch {}: {}",
                event.filename.display(),
                event.detail
            ),
            Self::ConfigChanged(event) => write!(
                f,
                "configuration file {} changed: {}",
                event.filename.display(),
                event.detail
            ),
            Self::SourceClosed(source) => write!(f, "{source} stopped"),
        }
    }
}

/// Waits on every source that can end the process.
pub struct EventLoop {
    kubelet_socket: PathBuf,
    fs_events: mpsc::Receiver<notify::Result<Event>>,
    fatal_errors: mpsc::Receiver<Report<PluginServerError>>,
    config_changes: mpsc::Receiver<ConfigChangeEvent>,
    sigterm: Signal,
    sigint: Signal,
    sigquit: Signal,
}

impl EventLoop {
    /// `fs_events` must come from a watch on the kubelet socket's directory.
    pub fn new(
        kubelet_socket: PathBuf,
        fs_events: mpsc::Receiver<notify::Result<Event>>,
        fatal_errors: mpsc::Receiver<Report<PluginServerError>>,
        config_changes: mpsc::Receiver<ConfigChangeEvent>,
    ) -> io::Result<Self> {
        Ok(Self {
            kubelet_socket,
            fs_events,
            fatal_errors,
            config_changes,
            sigterm: signal(SignalKind::terminate())?,
            sigint: signal(SignalKind::interrupt())?,
            sigquit: signal(SignalKind::quit())?,
        })
    }

    pub async fn wait(&mut self) -> ShutdownTrigger {
        loop {
            tokio::select! {
                event = self.fs_events.recv() => match event {
                    Some(Ok(event)) if is_kubelet_restart(&event, &self.kubelet_socket) => {
                        return ShutdownTrigger::KubeletRestarted;
                    }
                    Some(Ok(event)) => debug!("ignoring {:?} on {:?}", event.kind, event.paths),
                    Some(Err(e)) => warn!("kubelet socket directory watch error: {e}"),
                    None => return ShutdownTrigger::SourceClosed("kubelet socket watcher"),
                },
                _ = self.sigterm.recv() => return ShutdownTrigger::Signal("SIGTERM"),
                _ = self.sigint.recv() => return ShutdownTrigger::Signal("SIGINT"),
                _ = self.sigquit.recv() => return ShutdownTrigger::Signal("SIGQUIT"),
                error = self.fatal_errors.recv() => {
                    return error.map_or(
                        ShutdownTrigger::SourceClosed("plugin servers"),
                        ShutdownTrigger::ServerFatal,
                    );
                }
                change = self.config_changes.recv() => {
                    return change.map_or(
                        ShutdownTrigger::SourceClosed("config watcher"),
                        ShutdownTrigger::ConfigChanged,
                    );
                }
            }
        }
    }
}

/// The kubelet creates its socket anew every time it starts.
pub fn is_kubelet_restart(event: &Event, kubelet_socket: &Path) -> bool {
    matches!(event.kind, EventKind::Create(_))
        && event.paths.iter().any(|path| path == kubelet_socket)
}
