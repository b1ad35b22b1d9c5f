use thiserror::Error;

use crate::config::ResourceUnitStrategy;
use crate::platform::npu::Arch;

#[derive(Debug, Error)]
pub enum DeviceManagerError {
    #[error("{arch} does not support the {strategy} strategy")]
    UnsupportedStrategy {
        arch: Arch,
        strategy: ResourceUnitStrategy,
    },
    #[error("resource name {name} is invalid: {reason}")]
    InvalidResourceName { name: String, reason: String },
    #[error("malformed PCI address {0}")]
    InvalidBusname(String),
    #[error("malformed partition {0:?}")]
    InvalidPartition(String),
    #[error("{path} does not follow the per-core device layout")]
    ManifestMismatch { path: String },
    #[error("device {uuid} belongs to {actual}, expected {expected}")]
    ArchMismatch {
        uuid: String,
        expected: Arch,
        actual: Arch,
    },
    #[error("no devices to manage")]
    NoDevices,
    #[error("unknown device id(s): {}", .0.join(", "))]
    UnknownDevices(Vec<String>),
    #[error("unhealthy device(s): {}", .0.join(", "))]
    Unhealthy(Vec<String>),
}
