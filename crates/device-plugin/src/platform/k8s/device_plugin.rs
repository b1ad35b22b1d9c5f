use std::fmt;
use std::fs;
use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use derive_more::Display;
use error_stack::Report;
use error_stack::ResultExt;
use futures::Stream;
use thiserror::Error;
use tokio::net::UnixListener;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::wrappers::UnixListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::Request;
use tonic::Response;
use tonic::Result as TonicResult;
use tonic::Status;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;
use tracing::Instrument;
use tracing::Span;

use super::api;
use super::api::device_plugin_server::DevicePlugin;
use super::api::device_plugin_server::DevicePluginServer;
use super::api::registration_client::RegistrationClient;
use super::registration;
use super::registration::registration_server::Registration;
use super::registration::registration_server::RegistrationServer;
use super::uds;
use super::API_VERSION;
use crate::domain::device_manager::endpoint_name;
use crate::domain::device_manager::DeviceManager;
use crate::domain::device_manager::DeviceManagerError;

const PLUGIN_TYPE: &str = "DevicePlugin";

const OPTIONS: api::DevicePluginOptions = api::DevicePluginOptions {
    pre_start_required: false,
    get_preferred_allocation_available: true,
};

#[derive(Debug, Clone)]
pub struct PluginServerConfig {
    /// Directory holding plugin sockets and the kubelet's own socket.
    pub device_plugin_path: PathBuf,
    /// Directory the kubelet plugin watcher scans for new sockets.
    pub plugins_registry_path: PathBuf,
    pub kubelet_socket: PathBuf,
    pub health_check_interval: Duration,
    pub dial_timeout: Duration,
}

/// Lifecycle of a [`PluginServer`]. Only moves forward.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Created,
    Listening,
    Registered,
    Serving,
    Stopped,
}

#[derive(Debug, Error)]
pub enum PluginServerError {
    #[error("failed to prepare socket {path}")]
    Socket { path: String },
    #[error("failed to link {link} into the plugin registry")]
    RegistryLink { link: String },
    #[error("failed to dial {path}")]
    Dial { path: String },
    #[error("timed out dialing {path}")]
    DialTimeout { path: String },
    #[error("failed to register {resource_name} with the kubelet")]
    Registration { resource_name: String },
    #[error("gRPC server for {resource_name} stopped unexpectedly")]
    Serve { resource_name: String },
    #[error("cannot {action} a server that is {state}")]
    InvalidState {
        action: &'static str,
        state: ServerState,
    },
}

/// Serves one extended resource to the kubelet.
pub struct PluginServer {
    manager: Arc<DeviceManager>,
    config: PluginServerConfig,
    socket_path: PathBuf,
    registry_link: PathBuf,
    state: ServerState,
    token: CancellationToken,
    serve_handle: Option<JoinHandle<()>>,
    health_handle: Option<JoinHandle<()>>,
}

impl fmt::Debug for PluginServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginServer")
            .field("resource_name", &self.manager.resource_name())
            .field("socket_path", &self.socket_path)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl PluginServer {
    pub fn new(manager: Arc<DeviceManager>, config: PluginServerConfig) -> Self {
        let socket_name = format!("{}.sock", endpoint_name(manager.resource_name()));
        Self {
            socket_path: config.device_plugin_path.join(&socket_name),
            registry_link: config.plugins_registry_path.join(&socket_name),
            manager,
            config,
            state: ServerState::Created,
            token: CancellationToken::new(),
            serve_handle: None,
            health_handle: None,
        }
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn resource_name(&self) -> &str {
        self.manager.resource_name()
    }

    /// Binds the socket, registers with the kubelet and starts health checks.
    ///
    /// Errors from the background gRPC server after startup are sent to
    /// `fatal_tx`.
    #[tracing::instrument(skip_all, fields(resource = %self.manager.resource_name()))]
    pub async fn start(
        &mut self,
        fatal_tx: mpsc::Sender<Report<PluginServerError>>,
    ) -> Result<(), Report<PluginServerError>> {
        if self.state != ServerState::Created {
            return Err(Report::new(PluginServerError::InvalidState {
                action: "start",
                state: self.state,
            }));
        }

        let (health_tx, health_rx) = watch::channel(0u64);
        self.listen(health_rx, fatal_tx)?;
        self.register().await?;
        self.spawn_health_check(health_tx);
        Ok(())
    }

    fn listen(
        &mut self,
        health_rx: watch::Receiver<u64>,
        fatal_tx: mpsc::Sender<Report<PluginServerError>>,
    ) -> Result<(), Report<PluginServerError>> {
        remove_if_exists(&self.socket_path).change_context_lazy(|| {
            PluginServerError::Socket {
                path: self.socket_path.display().to_string(),
            }
        })?;
        remove_if_exists(&self.registry_link).change_context_lazy(|| {
            PluginServerError::RegistryLink {
                link: self.registry_link.display().to_string(),
            }
        })?;

        let listener = UnixListener::bind(&self.socket_path).change_context_lazy(|| {
            PluginServerError::Socket {
                path: self.socket_path.display().to_string(),
            }
        })?;
        info!(
            "gRPC server for {} bound to {}",
            self.resource_name(),
            self.socket_path.display()
        );

        let service = DevicePluginService {
            manager: self.manager.clone(),
            socket_path: self.socket_path.clone(),
            token: self.token.clone(),
            health_rx,
        };
        let token = self.token.clone();
        let resource_name = self.resource_name().to_string();

        self.serve_handle = Some(tokio::spawn(async move {
            let result = tonic::transport::Server::builder()
                .add_service(DevicePluginServer::new(service.clone()))
                .add_service(RegistrationServer::new(service))
                .serve_with_incoming_shutdown(
                    UnixListenerStream::new(listener),
                    token.clone().cancelled_owned(),
                )
                .await;

            match result {
                Err(e) if !token.is_cancelled() => {
                    let report = Report::new(e).change_context(PluginServerError::Serve {
                        resource_name: resource_name.clone(),
                    });
                    error!("{report:?}");
                    // the event loop may already be gone during shutdown
                    let _ = fatal_tx.send(report).await;
                }
                Err(e) => debug!("gRPC server for {resource_name} ended during shutdown: {e}"),
                Ok(()) => info!("gRPC server for {resource_name} shut down"),
            }
        }
        .instrument(Span::current())));
        self.state = ServerState::Listening;
        Ok(())
    }

    async fn register(&mut self) -> Result<(), Report<PluginServerError>> {
        std::os::unix::fs::symlink(&self.socket_path, &self.registry_link).change_context_lazy(
            || PluginServerError::RegistryLink {
                link: self.registry_link.display().to_string(),
            },
        )?;

        // make sure our own server answers before telling the kubelet about it
        drop(uds::connect(&self.socket_path, self.config.dial_timeout).await?);

        let channel = uds::connect(&self.config.kubelet_socket, self.config.dial_timeout).await?;
        let endpoint = self
            .socket_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let request = api::RegisterRequest {
            version: API_VERSION.to_string(),
            endpoint,
            resource_name: self.resource_name().to_string(),
            options: Some(OPTIONS),
        };

        RegistrationClient::new(channel)
            .register(Request::new(request))
            .await
            .change_context_lazy(|| PluginServerError::Registration {
                resource_name: self.resource_name().to_string(),
            })?;

        info!("resource {} is registered to kubelet", self.resource_name());
        self.state = ServerState::Registered;
        Ok(())
    }

    fn spawn_health_check(&mut self, health_tx: watch::Sender<u64>) {
        let manager = self.manager.clone();
        let token = self.token.clone();
        let interval = self.config.health_check_interval;

        info!(
            "start health check loop for the resource {}",
            manager.resource_name()
        );
        self.health_handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut healthy = true;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                match manager.health_check() {
                    Ok(()) => {
                        if !healthy {
                            info!("all {} devices are healthy again", manager.resource_name());
                            health_tx.send_modify(|generation| *generation += 1);
                        }
                        healthy = true;
                    }
                    Err(e) => {
                        warn!("health check of {} failed: {e:?}", manager.resource_name());
                        health_tx.send_modify(|generation| *generation += 1);
                        healthy = false;
                    }
                }
            }
            debug!("health check loop for {} stopped", manager.resource_name());
        }
        .instrument(Span::current())));
        self.state = ServerState::Serving;
    }

    /// Stops serving and cleans up the socket. Safe to call in any state.
    #[tracing::instrument(skip_all, fields(resource = %self.manager.resource_name()))]
    pub async fn stop(&mut self) {
        if self.state == ServerState::Stopped {
            return;
        }
        info!("stopping plugin server for {}", self.resource_name());

        if let Some(handle) = self.serve_handle.take() {
            handle.abort();
        }
        for path in [&self.socket_path, &self.registry_link] {
            if let Err(e) = remove_if_exists(path) {
                warn!("failed to remove {}: {e}", path.display());
            }
        }
        self.token.cancel();

        if let Some(handle) = self.health_handle.take() {
            if let Err(e) = handle.await {
                warn!(
                    "health check loop for {} ended abnormally: {e}",
                    self.resource_name()
                );
            }
        }
        self.state = ServerState::Stopped;
    }
}

/// Removes a file or symlink; a missing path is not an error.
fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

fn to_status(report: &Report<DeviceManagerError>) -> Status {
    match report.current_context() {
        DeviceManagerError::UnknownDevices(_) => {
            Status::not_found(report.current_context().to_string())
        }
        _ => Status::internal(format!("{report:?}")),
    }
}

#[derive(Clone)]
struct DevicePluginService {
    manager: Arc<DeviceManager>,
    socket_path: PathBuf,
    token: CancellationToken,
    health_rx: watch::Receiver<u64>,
}

impl DevicePluginService {
    fn log_rpc<T: fmt::Debug>(&self, rpc: &str, message: &T) {
        log_rpc(self.manager.debug_mode(), rpc, message);
    }
}

/// Debug mode promotes request and response dumps to info.
fn log_rpc<T: fmt::Debug>(debug_mode: bool, rpc: &str, message: &T) {
    if debug_mode {
        info!("{rpc}: {message:?}");
    } else {
        debug!("{rpc}: {message:?}");
    }
}

#[tonic::async_trait]
impl DevicePlugin for DevicePluginService {
    async fn get_device_plugin_options(
        &self,
        _request: Request<api::Empty>,
    ) -> TonicResult<Response<api::DevicePluginOptions>> {
        Ok(Response::new(OPTIONS))
    }

    type ListAndWatchStream =
        Pin<Box<dyn Stream<Item = Result<api::ListAndWatchResponse, Status>> + Send>>;

    async fn list_and_watch(
        &self,
        _request: Request<api::Empty>,
    ) -> TonicResult<Response<Self::ListAndWatchStream>> {
        info!("kubelet is watching {}", self.manager.resource_name());

        let (tx, rx) = mpsc::channel(1);
        let manager = self.manager.clone();
        let token = self.token.clone();
        let mut health_rx = self.health_rx.clone();
        let span = tracing::info_span!("list_and_watch", resource = %manager.resource_name());

        tokio::spawn(async move {
            health_rx.borrow_and_update();
            let initial = manager.list_and_watch_response();
            log_rpc(manager.debug_mode(), "ListAndWatch", &initial);
            if tx.send(Ok(initial)).await.is_err() {
                warn!(
                    "kubelet left before the initial device list of {}",
                    manager.resource_name()
                );
                return;
            }

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tx.closed() => {
                        debug!("kubelet stopped watching {}", manager.resource_name());
                        break;
                    }
                    changed = health_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        health_rx.borrow_and_update();
                    }
                }

                let response = manager.list_and_watch_response();
                log_rpc(manager.debug_mode(), "ListAndWatch", &response);
                if tx.send(Ok(response)).await.is_err() {
                    warn!(
                        "failed to send device list of {}, kubelet disconnected",
                        manager.resource_name()
                    );
                    break;
                }
            }
            info!("stopped watching {}", manager.resource_name());
        }
        .instrument(span));

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }

    async fn get_preferred_allocation(
        &self,
        request: Request<api::PreferredAllocationRequest>,
    ) -> TonicResult<Response<api::PreferredAllocationResponse>> {
        let request = request.into_inner();
        self.log_rpc("GetPreferredAllocation", &request);

        let mut container_responses = Vec::with_capacity(request.container_requests.len());
        for container in &request.container_requests {
            let size = usize::try_from(container.allocation_size).map_err(|_| {
                Status::invalid_argument(format!(
                    "allocation size must not be negative, got {}",
                    container.allocation_size
                ))
            })?;
            let response = self
                .manager
                .container_preferred_allocation_response(
                    &container.available_device_i_ds,
                    &container.must_include_device_i_ds,
                    size,
                )
                .map_err(|e| to_status(&e))?;
            container_responses.push(response);
        }

        let response = api::PreferredAllocationResponse {
            container_responses,
        };
        self.log_rpc("GetPreferredAllocation", &response);
        Ok(Response::new(response))
    }

    async fn allocate(
        &self,
        request: Request<api::AllocateRequest>,
    ) -> TonicResult<Response<api::AllocateResponse>> {
        let request = request.into_inner();
        self.log_rpc("Allocate", &request);

        // nothing is granted unless every container's request is valid
        let mut missing = Vec::new();
        for container in &request.container_requests {
            if container.devices_ids.is_empty() {
                return Err(Status::invalid_argument("container request has no device ids"));
            }
            let (_, unknown) = self.manager.contains(&container.devices_ids);
            missing.extend(unknown);
        }
        if !missing.is_empty() {
            return Err(Status::not_found(format!(
                "unknown device id(s) for {}: {}",
                self.manager.resource_name(),
                missing.join(", ")
            )));
        }

        let container_responses = request
            .container_requests
            .iter()
            .map(|container| {
                self.manager
                    .container_allocate_response(&container.devices_ids)
                    .map_err(|e| to_status(&e))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let response = api::AllocateResponse {
            container_responses,
        };
        self.log_rpc("Allocate", &response);
        Ok(Response::new(response))
    }

    async fn pre_start_container(
        &self,
        request: Request<api::PreStartContainerRequest>,
    ) -> TonicResult<Response<api::PreStartContainerResponse>> {
        self.log_rpc("PreStartContainer", request.get_ref());
        Ok(Response::new(api::PreStartContainerResponse {}))
    }
}

#[tonic::async_trait]
impl Registration for DevicePluginService {
    async fn get_info(
        &self,
        _request: Request<registration::InfoRequest>,
    ) -> TonicResult<Response<registration::PluginInfo>> {
        Ok(Response::new(registration::PluginInfo {
            r#type: PLUGIN_TYPE.to_string(),
            name: self.manager.resource_name().to_string(),
            endpoint: self.socket_path.display().to_string(),
            supported_versions: vec![API_VERSION.to_string()],
        }))
    }

    async fn notify_registration_status(
        &self,
        request: Request<registration::RegistrationStatus>,
    ) -> TonicResult<Response<registration::RegistrationStatusResponse>> {
        let status = request.into_inner();
        if status.plugin_registered {
            info!("kubelet accepted {}", self.manager.resource_name());
        } else {
            // a real problem surfaces as a kubelet restart or socket change
            warn!(
                "kubelet failed to register {}: {}",
                self.manager.resource_name(),
                status.error
            );
        }
        Ok(Response::new(registration::RegistrationStatusResponse {}))
    }
}
