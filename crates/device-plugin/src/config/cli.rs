use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use utils::version;

const KUBELET_SOCKET_NAME: &str = "kubelet.sock";

/// Advertises Furiosa NPUs to the kubelet.
#[derive(Parser, Debug, Clone)]
#[command(about, long_about, version = &**version::VERSION)]
pub struct Cli {
    #[arg(
        long,
        env = "GLOBAL_CONFIG_PATH",
        value_hint = clap::ValueHint::FilePath,
        default_value = "/etc/config/global_config.yaml",
        help = "Cluster-wide configuration file, usually mounted from a ConfigMap"
    )]
    pub global_config: PathBuf,

    #[arg(
        long,
        env = "LOCAL_CONFIG_PATH",
        value_hint = clap::ValueHint::FilePath,
        default_value = "/etc/config/local/local_config.yaml",
        help = "Optional node-local overrides applied on top of the global configuration"
    )]
    pub local_config: PathBuf,

    #[arg(
        long,
        env = "NODE_NAME",
        help = "Name of this node, used to pick the node's disabled devices"
    )]
    pub node_name: Option<String>,

    #[arg(
        long,
        value_hint = clap::ValueHint::DirPath,
        default_value = "/var/lib/kubelet/device-plugins/",
        help = "Directory holding the kubelet socket and device plugin sockets"
    )]
    pub device_plugin_path: PathBuf,

    #[arg(
        long,
        value_hint = clap::ValueHint::DirPath,
        default_value = "/var/lib/kubelet/plugins_registry/",
        help = "Directory scanned by the kubelet plugin watcher"
    )]
    pub plugins_registry_path: PathBuf,

    #[arg(long, value_hint = clap::ValueHint::DirPath, default_value = "/sys")]
    pub sysfs_root: PathBuf,

    #[arg(long, value_hint = clap::ValueHint::DirPath, default_value = "/dev")]
    pub devfs_root: PathBuf,

    #[arg(
        long,
        default_value_t = 5,
        help = "Seconds between device health checks"
    )]
    pub health_check_interval_secs: u64,

    #[arg(
        long,
        default_value_t = 5,
        help = "Seconds to wait when dialing the plugin or kubelet socket"
    )]
    pub dial_timeout_secs: u64,

    #[arg(long, env = "VERBOSE", help = "Log at debug level unless RUST_LOG is set")]
    pub verbose: bool,
}

impl Cli {
    pub fn kubelet_socket(&self) -> PathBuf {
        self.device_plugin_path.join(KUBELET_SOCKET_NAME)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }
}
