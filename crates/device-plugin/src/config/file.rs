use std::collections::HashMap;
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::Path;

use derive_more::Display;
use error_stack::Report;
use error_stack::ResultExt;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use tracing::info;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}")]
    Read { path: String },
    #[error("failed to parse config file {path}")]
    Parse { path: String },
    #[error("failed to watch {path}")]
    Watch { path: String },
}

/// How a board is split into allocatable units.
#[derive(
    Debug, Display, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceUnitStrategy {
    /// One unit per board.
    #[default]
    #[serde(alias = "legacy")]
    #[display("generic")]
    Generic,
    #[display("single-core")]
    SingleCore,
    #[display("dual-core")]
    DualCore,
    #[display("quad-core")]
    QuadCore,
}

impl ResourceUnitStrategy {
    /// Cores per unit, `None` when the board is not partitioned.
    pub fn core_size(self) -> Option<u32> {
        match self {
            ResourceUnitStrategy::Generic => None,
            ResourceUnitStrategy::SingleCore => Some(1),
            ResourceUnitStrategy::DualCore => Some(2),
            ResourceUnitStrategy::QuadCore => Some(4),
        }
    }
}

/// Contents of one configuration file. Every field is optional so that a
/// node-local file can override only what it names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub resource_strategy: Option<ResourceUnitStrategy>,
    /// Node name to UUIDs of boards the kubelet must not schedule onto.
    #[serde(default)]
    pub disabled_devices: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub debug_mode: Option<bool>,
}

/// Settings in effect for this node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedConfig {
    pub strategy: ResourceUnitStrategy,
    pub disabled_devices: HashSet<String>,
    pub debug_mode: bool,
}

impl Config {
    pub fn from_path(path: &Path) -> Result<Self, Report<ConfigError>> {
        let contents = fs::read_to_string(path).change_context_lazy(|| ConfigError::Read {
            path: path.display().to_string(),
        })?;
        Self::from_yaml(&contents).change_context_lazy(|| ConfigError::Parse {
            path: path.display().to_string(),
        })
    }

    fn from_yaml(contents: &str) -> Result<Self, serde_yaml::Error> {
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(contents)
    }

    /// Fields set in `local` replace those in `self`.
    pub fn merge(self, local: Config) -> Config {
        Config {
            resource_strategy: local.resource_strategy.or(self.resource_strategy),
            disabled_devices: if local.disabled_devices.is_empty() {
                self.disabled_devices
            } else {
                local.disabled_devices
            },
            debug_mode: local.debug_mode.or(self.debug_mode),
        }
    }

    pub fn resolve(&self, node_name: Option<&str>) -> ResolvedConfig {
        let disabled_devices = match node_name {
            Some(node_name) => self
                .disabled_devices
                .get(node_name)
                .map(|uuids| uuids.iter().cloned().collect())
                .unwrap_or_default(),
            None => {
                if !self.disabled_devices.is_empty() {
                    warn!("node name is not set, ignoring disabledDevices");
                }
                HashSet::new()
            }
        };

        ResolvedConfig {
            strategy: self.resource_strategy.unwrap_or_default(),
            disabled_devices,
            debug_mode: self.debug_mode.unwrap_or(false),
        }
    }
}

/// Loads the required global file and applies the node-local file on top of
/// it when one exists.
pub fn load(global: &Path, local: &Path) -> Result<Config, Report<ConfigError>> {
    let config = Config::from_path(global)?;

    match fs::metadata(local) {
        Ok(_) => {
            info!("applying local config {}", local.display());
            Ok(config.merge(Config::from_path(local)?))
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(config),
        Err(e) => Err(Report::new(e).change_context(ConfigError::Read {
            path: local.display().to_string(),
        })),
    }
}
