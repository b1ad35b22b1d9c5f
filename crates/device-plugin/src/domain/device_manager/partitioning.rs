//! Splitting boards into core ranges and naming the resulting units.

use core::fmt;
use std::str::FromStr;

use error_stack::Report;

use super::DeviceManagerError;
use crate::config::ResourceUnitStrategy;
use crate::platform::npu::Arch;

/// Separates the board UUID from the core range in a unit ID, e.g.
/// `a3e78042-9cc7-4344-9541-d2d3ffd28106_cores_0-1`.
pub const DEVICE_ID_DELIMITER: &str = "_cores_";

/// A contiguous, inclusive range of cores on one board.
///
/// Rendered as `N` for a single core and `N-M` otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Partition {
    start: u32,
    end: u32,
}

impl Partition {
    pub fn new(start: u32, end: u32) -> Option<Self> {
        (start <= end).then_some(Self { start, end })
    }

    pub fn start(&self) -> u32 {
        self.start
    }

    pub fn end(&self) -> u32 {
        self.end
    }

    pub fn core_count(&self) -> u32 {
        self.end - self.start + 1
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

impl FromStr for Partition {
    type Err = Report<DeviceManagerError>;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Report::new(DeviceManagerError::InvalidPartition(s.to_string()));
        let core = |part: &str| -> Result<u32, Self::Err> {
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(invalid());
            }
            part.parse().map_err(|_| invalid())
        };

        let (start, end) = match s.split_once('-') {
            Some((start, end)) => (core(start)?, core(end)?),
            None => {
                let single = core(s)?;
                (single, single)
            }
        };
        Partition::new(start, end).ok_or_else(invalid)
    }
}

/// Whether boards of `arch` can be handed out under `strategy`.
pub fn supports(arch: Arch, strategy: ResourceUnitStrategy) -> bool {
    match (arch, strategy) {
        (Arch::Warboy, ResourceUnitStrategy::QuadCore) => false,
        (_, strategy) => strategy
            .core_size()
            .is_none_or(|core_size| arch.total_cores() % core_size == 0),
    }
}

/// Consecutive `core_size`-wide ranges covering `0..total_cores`.
pub fn generate_partitions(total_cores: u32, core_size: u32) -> Vec<Partition> {
    if core_size == 0 {
        return Vec::new();
    }
    (0..total_cores / core_size)
        .map(|i| Partition {
            start: i * core_size,
            end: (i + 1) * core_size - 1,
        })
        .collect()
}

/// Ranges for one board of `arch`, or `None` when `strategy` does not partition.
pub fn partitions_for(
    arch: Arch,
    strategy: ResourceUnitStrategy,
) -> Result<Option<Vec<Partition>>, Report<DeviceManagerError>> {
    if !supports(arch, strategy) {
        return Err(Report::new(DeviceManagerError::UnsupportedStrategy {
            arch,
            strategy,
        }));
    }
    Ok(strategy
        .core_size()
        .map(|core_size| generate_partitions(arch.total_cores(), core_size)))
}

/// Dense position of a unit across every board of one family.
pub fn generate_index(
    device_ordinal: usize,
    partition_ordinal: usize,
    partitions_per_device: usize,
) -> usize {
    device_ordinal * partitions_per_device + partition_ordinal
}

/// Identifier of an allocatable unit as advertised to the kubelet.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceId {
    uuid: String,
    partition: Option<Partition>,
}

impl DeviceId {
    pub fn exclusive(uuid: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            partition: None,
        }
    }

    pub fn partitioned(uuid: impl Into<String>, partition: Partition) -> Self {
        Self {
            uuid: uuid.into(),
            partition: Some(partition),
        }
    }

    pub fn parse(id: &str) -> Result<Self, Report<DeviceManagerError>> {
        match id.split_once(DEVICE_ID_DELIMITER) {
            Some((uuid, partition)) => Ok(Self::partitioned(uuid, partition.parse()?)),
            None => Ok(Self::exclusive(id)),
        }
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn partition(&self) -> Option<Partition> {
        self.partition
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.partition {
            Some(partition) => write!(f, "{}{DEVICE_ID_DELIMITER}{partition}", self.uuid),
            None => f.write_str(&self.uuid),
        }
    }
}
