use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::LazyLock;

use error_stack::Report;
use regex::Regex;

use super::manifest_filter::filter_manifest;
use super::partitioning::generate_index;
use super::partitioning::DeviceId;
use super::partitioning::Partition;
use super::DeviceManagerError;
use crate::platform::k8s::api;
use crate::platform::npu::InventoryError;
use crate::platform::npu::Manifest;
use crate::platform::npu::NpuDevice;

static BDF_PATTERN: LazyLock<Result<Regex, regex::Error>> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<domain>[0-9a-fA-F]{1,4}):(?P<bus>[0-9a-fA-F]+):(?P<function>[0-9a-fA-F]+\.[0-9])$",
    )
});

/// Extracts the bus number from a `domain:bus:device.function` address,
/// e.g. `0000:51:00.0` gives `51`.
pub fn parse_bus_id(bdf: &str) -> Result<String, Report<DeviceManagerError>> {
    let invalid = || DeviceManagerError::InvalidBusname(bdf.to_string());
    let pattern = BDF_PATTERN
        .as_ref()
        .map_err(|e| Report::new(e.clone()).change_context(invalid()))?;
    pattern
        .captures(bdf)
        .and_then(|captures| captures.name("bus"))
        .map(|bus| bus.as_str().to_string())
        .ok_or_else(|| Report::new(invalid()))
}

/// Shape of an allocatable unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceKind {
    /// The whole board.
    Exclusive,
    /// One fixed range of the board's cores.
    Partitioned(Partition),
}

/// An allocatable unit backed by a physical board.
#[derive(Debug, Clone)]
pub struct FuriosaDevice {
    origin: Arc<dyn NpuDevice>,
    kind: DeviceKind,
    id: String,
    pci_bus_id: String,
    numa_node: Option<u32>,
    index: usize,
    disabled: bool,
    manifest: Manifest,
}

impl FuriosaDevice {
    /// Wraps the board at position `ordinal` as a single unit.
    pub fn exclusive(
        origin: Arc<dyn NpuDevice>,
        ordinal: usize,
        disabled: bool,
    ) -> Result<Self, Report<DeviceManagerError>> {
        let info = origin.info();
        let pci_bus_id = parse_bus_id(&info.busname)?;

        Ok(Self {
            kind: DeviceKind::Exclusive,
            id: DeviceId::exclusive(&info.uuid).to_string(),
            pci_bus_id,
            numa_node: info.numa_node,
            index: generate_index(ordinal, 0, 1),
            disabled,
            manifest: origin.manifest(),
            origin,
        })
    }

    /// Splits the board at position `ordinal` into one unit per partition.
    pub fn partitioned(
        origin: Arc<dyn NpuDevice>,
        ordinal: usize,
        partitions: &[Partition],
        disabled: bool,
    ) -> Result<Vec<Self>, Report<DeviceManagerError>> {
        let info = origin.info();
        let pci_bus_id = parse_bus_id(&info.busname)?;
        let whole = origin.manifest();

        partitions
            .iter()
            .enumerate()
            .map(|(position, partition)| {
                Ok(Self {
                    origin: origin.clone(),
                    kind: DeviceKind::Partitioned(*partition),
                    id: DeviceId::partitioned(&info.uuid, *partition).to_string(),
                    pci_bus_id: pci_bus_id.clone(),
                    numa_node: info.numa_node,
                    index: generate_index(ordinal, position, partitions.len()),
                    disabled,
                    manifest: filter_manifest(info.arch, &whole, partition)?,
                })
            })
            .collect()
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn uuid(&self) -> &str {
        &self.origin.info().uuid
    }

    pub fn kind(&self) -> &DeviceKind {
        &self.kind
    }

    pub fn pci_bus_id(&self) -> &str {
        &self.pci_bus_id
    }

    pub fn numa_node(&self) -> Option<u32> {
        self.numa_node
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Disabled units are never healthy; otherwise the board's liveness decides.
    pub fn is_healthy(&self) -> Result<bool, Report<InventoryError>> {
        if self.disabled {
            return Ok(false);
        }
        self.origin.liveness()
    }

    pub fn topology_hint_key(&self) -> &str {
        &self.pci_bus_id
    }

    pub fn env_vars(&self) -> &HashMap<String, String> {
        &self.manifest.env_vars
    }

    pub fn annotations(&self) -> &HashMap<String, String> {
        &self.manifest.annotations
    }

    pub fn device_specs(&self) -> Vec<api::DeviceSpec> {
        self.manifest
            .device_nodes
            .iter()
            .map(|node| api::DeviceSpec {
                container_path: node.container_path.clone(),
                host_path: node.host_path.clone(),
                permissions: node.permissions.clone(),
            })
            .collect()
    }

    pub fn mounts(&self) -> Vec<api::Mount> {
        self.manifest
            .mount_paths
            .iter()
            .map(|mount| api::Mount {
                container_path: mount.container_path.clone(),
                host_path: mount.host_path.clone(),
                read_only: mount.read_only(),
            })
            .collect()
    }

    pub fn cdi_devices(&self) -> Vec<api::CdiDevice> {
        self.manifest
            .cdi_devices
            .iter()
            .map(|name| api::CdiDevice { name: name.clone() })
            .collect()
    }
}

impl PartialEq for FuriosaDevice {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for FuriosaDevice {}

impl npu_allocator::Device for FuriosaDevice {
    fn id(&self) -> &str {
        &self.id
    }

    fn topology_hint_key(&self) -> &str {
        &self.pci_bus_id
    }
}

/// Builds every unit for `boards`, in board order then partition order.
pub(super) fn build_devices(
    boards: &[Arc<dyn NpuDevice>],
    partitions: Option<&[Partition]>,
    disabled_uuids: &HashSet<String>,
) -> Result<Vec<FuriosaDevice>, Report<DeviceManagerError>> {
    let mut devices = Vec::new();
    for (ordinal, board) in boards.iter().enumerate() {
        let disabled = disabled_uuids.contains(&board.info().uuid);
        match partitions {
            Some(partitions) => devices.extend(FuriosaDevice::partitioned(
                board.clone(),
                ordinal,
                partitions,
                disabled,
            )?),
            None => devices.push(FuriosaDevice::exclusive(board.clone(), ordinal, disabled)?),
        }
    }
    Ok(devices)
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::domain::device_manager::partitioning::generate_partitions;
    use crate::platform::npu::mock;
    use crate::platform::npu::Arch;

    #[test]
    fn bus_ids() {
        assert_eq!(parse_bus_id("0000:51:00.0").unwrap().as_str(), "51");
        assert_eq!(parse_bus_id("0000:2a:00.0").unwrap().as_str(), "2a");
        assert_eq!(parse_bus_id("1:9e:1f.7").unwrap().as_str(), "9e");

        for bad in ["", "51", "0000:51", "0000:51:00", "00000:51:00.0", "0000:51:00.a"] {
            assert!(parse_bus_id(bad).is_err(), "{bad:?}");
        }
    }

    #[test]
    fn bus_id_pattern_is_compiled_once() {
        assert!(BDF_PATTERN.is_ok());
        let first = BDF_PATTERN.as_ref().unwrap() as *const Regex;

        for _ in 0..3 {
            assert_eq!(parse_bus_id("0000:27:00.0").unwrap().as_str(), "27");
        }
        assert_eq!(BDF_PATTERN.as_ref().unwrap() as *const Regex, first);
    }

    #[test]
    fn exclusive_device() {
        let board = mock::rngd_boards().remove(1);

        let device = FuriosaDevice::exclusive(board.clone(), 1, false).unwrap();

        assert_eq!(device.id(), mock::RNGD_UUIDS[1]);
        assert_eq!(device.kind(), &DeviceKind::Exclusive);
        assert_eq!(device.pci_bus_id(), "2a");
        assert_eq!(device.topology_hint_key(), "2a");
        assert_eq!(device.numa_node(), Some(0));
        assert_eq!(device.index(), 1);
        assert_eq!(device.device_specs().len(), 32);
        assert_eq!(device.mounts().len(), 2);
        assert!(device.mounts().iter().all(|mount| mount.read_only));
        assert!(device.is_healthy().unwrap());

        board.set_alive(false);
        assert!(!device.is_healthy().unwrap());
    }

    #[test]
    fn dual_core_partitions_share_board_identity() {
        let board = mock::rngd_boards().remove(0);
        let partitions = generate_partitions(Arch::Rngd.total_cores(), 2);

        let devices = FuriosaDevice::partitioned(board, 0, &partitions, false).unwrap();

        assert_eq!(devices.len(), 4);
        assert_eq!(
            devices.iter().map(|d| d.id().to_string()).collect::<Vec<_>>(),
            ["0-1", "2-3", "4-5", "6-7"]
                .iter()
                .map(|p| format!("{}_cores_{p}", mock::RNGD_UUIDS[0]))
                .collect::<Vec<_>>()
        );
        for (position, device) in devices.iter().enumerate() {
            assert_eq!(device.pci_bus_id(), "27");
            assert_eq!(device.numa_node(), Some(0));
            assert_eq!(device.index(), position);
            assert_eq!(device.uuid(), mock::RNGD_UUIDS[0]);
        }
        assert_ne!(devices[0], devices[1]);
    }

    #[test]
    fn disabled_board_is_unhealthy_in_every_partition() {
        let board = mock::warboy_boards().remove(0);
        let partitions = generate_partitions(Arch::Warboy.total_cores(), 1);

        let devices = FuriosaDevice::partitioned(board, 3, &partitions, true).unwrap();

        assert_eq!(
            devices.iter().map(FuriosaDevice::index).collect::<Vec<_>>(),
            vec![6, 7]
        );
        for device in &devices {
            assert!(!device.is_healthy().unwrap());
        }
    }

    #[test]
    fn build_orders_by_board_then_partition() {
        let boards = mock::as_npu_devices(&mock::rngd_boards());
        let partitions = generate_partitions(8, 4);
        let disabled = HashSet::from([mock::RNGD_UUIDS[1].to_string()]);

        let devices = build_devices(&boards, Some(&partitions), &disabled).unwrap();

        assert_eq!(
            devices.iter().map(FuriosaDevice::index).collect::<Vec<_>>(),
            vec![0, 1, 2, 3]
        );
        assert_eq!(
            devices
                .iter()
                .map(|device| device.is_healthy().unwrap())
                .collect::<Vec<_>>(),
            vec![true, true, false, false]
        );
    }
}
