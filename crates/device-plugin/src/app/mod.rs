//! Process wiring: one plugin server per NPU family, supervised by a single
//! event loop that ends the process on any terminal event.

use std::sync::Arc;

use anyhow::Result;
use npu_allocator::ScoreBasedOptimalNpuAllocator;
use tokio::sync::mpsc;
use tracing::error;
use tracing::info;

use crate::config;
use crate::config::Cli;
use crate::config::ConfigWatcher;
use crate::domain::device_manager::DeviceManager;
use crate::platform::fswatch::DirWatcher;
use crate::platform::k8s::PluginServer;
use crate::platform::k8s::PluginServerConfig;
use crate::platform::npu::SysfsInventory;

pub mod event_loop;

pub use event_loop::EventLoop;
pub use event_loop::ShutdownTrigger;

const FS_EVENT_CAPACITY: usize = 16;

pub struct Application {
    servers: Vec<PluginServer>,
    event_loop: EventLoop,
    _config_watcher: ConfigWatcher,
    _socket_watcher: DirWatcher,
}

impl Application {
    /// Discovers boards and starts a registered plugin server for each family.
    ///
    /// Servers that already started are stopped again if a later one fails.
    pub async fn build(cli: &Cli) -> Result<Self> {
        let config = config::load(&cli.global_config, &cli.local_config)
            .map_err(|e| anyhow::anyhow!("couldn't parse configuration: {e:?}"))?
            .resolve(cli.node_name.as_deref());
        info!(
            "resource strategy {}, {} disabled device(s), debug mode {}",
            config.strategy,
            config.disabled_devices.len(),
            config.debug_mode
        );

        let (config_tx, config_rx) = mpsc::channel(1);
        let config_watcher = ConfigWatcher::spawn(
            &[cli.global_config.clone(), cli.local_config.clone()],
            config_tx,
        )
        .map_err(|e| anyhow::anyhow!("couldn't watch configuration: {e:?}"))?;

        // watch before registering so a kubelet restart during startup is seen
        let (socket_watcher, fs_events) =
            DirWatcher::new(&[cli.device_plugin_path.clone()], FS_EVENT_CAPACITY)
                .map_err(|e| anyhow::anyhow!("couldn't watch kubelet socket: {e:?}"))?;

        let inventory = SysfsInventory::new(&cli.sysfs_root, &cli.devfs_root);
        let boards = inventory
            .discover()
            .map_err(|e| anyhow::anyhow!("couldn't list NPU boards: {e:?}"))?;
        if boards.is_empty() {
            anyhow::bail!("couldn't recognize any furiosa devices");
        }

        let plugin_config = PluginServerConfig {
            device_plugin_path: cli.device_plugin_path.clone(),
            plugins_registry_path: cli.plugins_registry_path.clone(),
            kubelet_socket: cli.kubelet_socket(),
            health_check_interval: cli.health_check_interval(),
            dial_timeout: cli.dial_timeout(),
        };
        let (fatal_tx, fatal_rx) = mpsc::channel(boards.len());
        let event_loop = EventLoop::new(cli.kubelet_socket(), fs_events, fatal_rx, config_rx)
            .map_err(|e| anyhow::anyhow!("couldn't install signal handlers: {e}"))?;

        let mut servers: Vec<PluginServer> = Vec::with_capacity(boards.len());

        for (arch, boards) in &boards {
            let hints = inventory.topology_hints(boards.iter().map(|board| board.info()));
            let manager = DeviceManager::new(
                *arch,
                boards,
                config.strategy,
                &config.disabled_devices,
                config.debug_mode,
                Box::new(ScoreBasedOptimalNpuAllocator::new(hints)),
            );
            let manager = match manager {
                Ok(manager) => manager,
                Err(e) => {
                    stop_all(&mut servers).await;
                    anyhow::bail!("couldn't initialize device manager for {arch}: {e:?}");
                }
            };

            info!("starting new plugin server for {}", manager.resource_name());
            let mut server = PluginServer::new(Arc::new(manager), plugin_config.clone());
            if let Err(e) = server.start(fatal_tx.clone()).await {
                server.stop().await;
                stop_all(&mut servers).await;
                anyhow::bail!("couldn't start plugin server for {arch}: {e:?}");
            }
            servers.push(server);
        }

        Ok(Self {
            servers,
            event_loop,
            _config_watcher: config_watcher,
            _socket_watcher: socket_watcher,
        })
    }

    /// Blocks until something ends the process.
    pub async fn run(&mut self) -> Result<()> {
        info!("start event loop");
        let trigger = self.event_loop.wait().await;

        if trigger.is_failure() {
            error!("{trigger}, restarting device-plugin");
            Err(anyhow::anyhow!("{trigger}"))
        } else {
            info!("{trigger}, restarting device-plugin");
            Ok(())
        }
    }

    pub async fn shutdown(&mut self) {
        info!("stopping plugin servers");
        stop_all(&mut self.servers).await;
    }
}

async fn stop_all(servers: &mut [PluginServer]) {
    for server in servers {
        server.stop().await;
    }
}
