//! Hardware inventory for Furiosa NPU boards.
//!
//! Everything above this module treats a board as an [`NpuDevice`]: static
//! identity read once at discovery, a liveness probe, and the device files
//! and sysfs entries a container needs to drive the whole board.

use core::fmt;

use derive_more::Display;
use error_stack::Report;
use thiserror::Error;

pub mod inventory;
pub mod manifest;
#[cfg(test)]
pub mod mock;

pub use inventory::SysfsInventory;
pub use manifest::DeviceNode;
pub use manifest::Manifest;
pub use manifest::MountPath;

/// NPU product family.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Arch {
    #[display("warboy")]
    Warboy,
    #[display("rngd")]
    Rngd,
}

impl Arch {
    /// Processing elements on one board.
    pub fn total_cores(self) -> u32 {
        match self {
            Arch::Warboy => 2,
            Arch::Rngd => 8,
        }
    }

    /// Device memory on one board, in gigabytes.
    pub fn memory_gb(self) -> u32 {
        match self {
            Arch::Warboy => 16,
            Arch::Rngd => 48,
        }
    }
}

#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("failed to read {path}")]
    ReadAttribute { path: String },
    #[error("malformed value {value:?} in {path}")]
    MalformedAttribute { path: String, value: String },
    #[error("failed to list NPU boards under {path}")]
    Discovery { path: String },
    #[error("failed to query liveness of {arch} board {index}")]
    Liveness { arch: Arch, index: u32 },
}

/// Identity of a physical board, fixed for the lifetime of the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub arch: Arch,
    /// Board number as used in device file names, e.g. `3` for `/dev/npu3`.
    pub index: u32,
    pub uuid: String,
    /// PCI address in `domain:bus:device.function` form.
    pub busname: String,
    /// `None` when the platform does not report NUMA affinity.
    pub numa_node: Option<u32>,
}

/// A physical NPU board.
pub trait NpuDevice: Send + Sync + fmt::Debug {
    fn info(&self) -> &DeviceInfo;

    fn liveness(&self) -> Result<bool, Report<InventoryError>>;

    /// Resources exposing the whole, unpartitioned board.
    fn manifest(&self) -> Manifest {
        Manifest::whole_device(self.info().arch, self.info().index)
    }
}
