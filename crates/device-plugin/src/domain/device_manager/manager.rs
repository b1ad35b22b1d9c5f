use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;

use error_stack::Report;
use npu_allocator::NpuAllocator;
use tracing::debug;
use tracing::warn;

use super::device::build_devices;
use super::device::FuriosaDevice;
use super::partitioning::partitions_for;
use super::resource_name::resource_name;
use super::DeviceManagerError;
use crate::config::ResourceUnitStrategy;
use crate::platform::k8s::api;
use crate::platform::npu::Arch;
use crate::platform::npu::NpuDevice;

pub const HEALTHY: &str = "Healthy";
pub const UNHEALTHY: &str = "Unhealthy";

/// Owns every allocatable unit of one product family on this node.
///
/// Built once from the inventory and read-only afterwards, so RPC handlers
/// share it without locking.
pub struct DeviceManager {
    arch: Arch,
    devices: Vec<FuriosaDevice>,
    by_id: HashMap<String, usize>,
    resource_name: String,
    debug_mode: bool,
    allocator: Box<dyn NpuAllocator>,
}

impl DeviceManager {
    pub fn new(
        arch: Arch,
        boards: &[Arc<dyn NpuDevice>],
        strategy: ResourceUnitStrategy,
        disabled_uuids: &HashSet<String>,
        debug_mode: bool,
        allocator: Box<dyn NpuAllocator>,
    ) -> Result<Self, Report<DeviceManagerError>> {
        if boards.is_empty() {
            return Err(Report::new(DeviceManagerError::NoDevices));
        }
        if let Some(stray) = boards.iter().find(|board| board.info().arch != arch) {
            return Err(Report::new(DeviceManagerError::ArchMismatch {
                uuid: stray.info().uuid.clone(),
                expected: arch,
                actual: stray.info().arch,
            }));
        }

        let resource_name = resource_name(arch, strategy)?;
        let partitions = partitions_for(arch, strategy)?;
        let devices = build_devices(boards, partitions.as_deref(), disabled_uuids)?;
        let by_id = devices
            .iter()
            .enumerate()
            .map(|(position, device)| (device.id().to_string(), position))
            .collect();

        debug!(
            "{resource_name}: {} unit(s) from {} board(s)",
            devices.len(),
            boards.len()
        );

        Ok(Self {
            arch,
            devices,
            by_id,
            resource_name,
            debug_mode,
            allocator,
        })
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }

    pub fn resource_name(&self) -> &str {
        &self.resource_name
    }

    pub fn debug_mode(&self) -> bool {
        self.debug_mode
    }

    /// Units ordered by index.
    pub fn devices(&self) -> &[FuriosaDevice] {
        &self.devices
    }

    pub fn device_ids(&self) -> Vec<String> {
        self.devices
            .iter()
            .map(|device| device.id().to_string())
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<&FuriosaDevice> {
        self.by_id.get(id).map(|&position| &self.devices[position])
    }

    /// Whether every ID is known, along with all of the unknown ones.
    /// An empty request is never contained.
    pub fn contains<S: AsRef<str>>(&self, ids: &[S]) -> (bool, Vec<String>) {
        let missing: Vec<String> = ids
            .iter()
            .map(AsRef::as_ref)
            .filter(|id| !self.by_id.contains_key(*id))
            .map(str::to_string)
            .collect();
        (!ids.is_empty() && missing.is_empty(), missing)
    }

    fn resolve<S: AsRef<str>>(
        &self,
        ids: &[S],
    ) -> Result<Vec<&FuriosaDevice>, Report<DeviceManagerError>> {
        let (_, missing) = self.contains(ids);
        if !missing.is_empty() {
            return Err(Report::new(DeviceManagerError::UnknownDevices(missing)));
        }
        Ok(ids.iter().filter_map(|id| self.get(id.as_ref())).collect())
    }

    /// Everything a container needs to use `ids`. Fails without a partial
    /// answer when any ID is unknown.
    pub fn container_allocate_response<S: AsRef<str>>(
        &self,
        ids: &[S],
    ) -> Result<api::ContainerAllocateResponse, Report<DeviceManagerError>> {
        let devices = self.resolve(ids)?;

        let mut response = api::ContainerAllocateResponse::default();
        for device in devices {
            response.envs.extend(
                device
                    .env_vars()
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone())),
            );
            response.annotations.extend(
                device
                    .annotations()
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone())),
            );
            response.devices.extend(device.device_specs());
            response.mounts.extend(device.mounts());
            response.cdi_devices.extend(device.cdi_devices());
        }
        Ok(response)
    }

    /// Delegates the choice of `size` units to the topology-aware allocator.
    pub fn container_preferred_allocation_response<S: AsRef<str>>(
        &self,
        available: &[S],
        must_include: &[S],
        size: usize,
    ) -> Result<api::ContainerPreferredAllocationResponse, Report<DeviceManagerError>> {
        let available: Vec<&dyn npu_allocator::Device> = self
            .resolve(available)?
            .into_iter()
            .map(|device| device as &dyn npu_allocator::Device)
            .collect();
        let required: Vec<&dyn npu_allocator::Device> = self
            .resolve(must_include)?
            .into_iter()
            .map(|device| device as &dyn npu_allocator::Device)
            .collect();

        let device_i_ds = self
            .allocator
            .allocate(&available, &required, size)
            .into_iter()
            .map(|device| device.id().to_string())
            .collect();
        Ok(api::ContainerPreferredAllocationResponse { device_i_ds })
    }

    /// Re-queries liveness of every board. Units that are down, disabled or
    /// whose liveness cannot be read are reported together.
    pub fn health_check(&self) -> Result<(), Report<DeviceManagerError>> {
        let unhealthy: Vec<String> = self
            .devices
            .iter()
            .filter(|device| !self.is_healthy(device))
            .map(|device| device.id().to_string())
            .collect();

        if unhealthy.is_empty() {
            Ok(())
        } else {
            Err(Report::new(DeviceManagerError::Unhealthy(unhealthy)))
        }
    }

    /// Current state of every unit as advertised to the kubelet.
    pub fn list_and_watch_response(&self) -> api::ListAndWatchResponse {
        let devices = self
            .devices
            .iter()
            .map(|device| api::Device {
                id: device.id().to_string(),
                health: if self.is_healthy(device) {
                    HEALTHY
                } else {
                    UNHEALTHY
                }
                .to_string(),
                topology: device.numa_node().map(|node| api::TopologyInfo {
                    nodes: vec![api::NumaNode { id: i64::from(node) }],
                }),
            })
            .collect();
        api::ListAndWatchResponse { devices }
    }

    fn is_healthy(&self, device: &FuriosaDevice) -> bool {
        device.is_healthy().unwrap_or_else(|e| {
            warn!("liveness of {} unavailable: {e:?}", device.id());
            false
        })
    }
}

#[cfg(test)]
mod tests {
    use npu_allocator::ScoreBasedOptimalNpuAllocator;
    use npu_allocator::TopologyHint;
    use similar_asserts::assert_eq;

    use super::*;
    use crate::platform::npu::mock;
    use crate::platform::npu::mock::MockNpu;

    fn allocator() -> Box<dyn NpuAllocator> {
        Box::new(ScoreBasedOptimalNpuAllocator::new(
            |a: &str, b: &str| -> TopologyHint {
                if a == b {
                    npu_allocator::SAME_DEVICE
                } else {
                    npu_allocator::CROSS_ROOT_COMPLEX
                }
            },
        ))
    }

    fn manager(
        boards: &[Arc<MockNpu>],
        strategy: ResourceUnitStrategy,
        disabled: &[&str],
    ) -> DeviceManager {
        let disabled = disabled.iter().map(|uuid| uuid.to_string()).collect();
        DeviceManager::new(
            boards[0].info().arch,
            &mock::as_npu_devices(boards),
            strategy,
            &disabled,
            false,
            allocator(),
        )
        .unwrap()
    }

    fn ids(uuid: &str, partitions: &[&str]) -> Vec<String> {
        partitions
            .iter()
            .map(|partition| format!("{uuid}_cores_{partition}"))
            .collect()
    }

    #[test]
    fn generic_strategy_exposes_whole_boards() {
        let manager = manager(&mock::rngd_boards(), ResourceUnitStrategy::Generic, &[]);

        assert_eq!(manager.resource_name(), "furiosa.ai/rngd");
        assert_eq!(
            manager.device_ids(),
            mock::RNGD_UUIDS.map(str::to_string).to_vec()
        );
    }

    #[test]
    fn dual_core_strategy_on_one_board() {
        let boards = vec![mock::rngd_boards().remove(0)];
        let manager = manager(&boards, ResourceUnitStrategy::DualCore, &[]);

        assert_eq!(manager.resource_name(), "furiosa.ai/rngd-2core.12gb");
        assert_eq!(
            manager.device_ids(),
            ids(mock::RNGD_UUIDS[0], &["0-1", "2-3", "4-5", "6-7"])
        );
        for device in manager.devices() {
            assert_eq!(device.pci_bus_id(), "27");
            assert_eq!(device.numa_node(), Some(0));
        }
    }

    #[test]
    fn construction_failures() {
        let disabled = HashSet::new();

        let err = DeviceManager::new(
            Arch::Rngd,
            &[],
            ResourceUnitStrategy::Generic,
            &disabled,
            false,
            allocator(),
        )
        .err()
        .unwrap();
        assert!(matches!(err.current_context(), DeviceManagerError::NoDevices));

        let err = DeviceManager::new(
            Arch::Warboy,
            &mock::as_npu_devices(&mock::warboy_boards()),
            ResourceUnitStrategy::QuadCore,
            &disabled,
            false,
            allocator(),
        )
        .err()
        .unwrap();
        assert!(matches!(
            err.current_context(),
            DeviceManagerError::UnsupportedStrategy { .. }
        ));

        let err = DeviceManager::new(
            Arch::Warboy,
            &mock::as_npu_devices(&mock::rngd_boards()),
            ResourceUnitStrategy::Generic,
            &disabled,
            false,
            allocator(),
        )
        .err()
        .unwrap();
        assert!(matches!(
            err.current_context(),
            DeviceManagerError::ArchMismatch { .. }
        ));
    }

    #[test]
    fn contains_reports_every_missing_id() {
        let manager = manager(&mock::rngd_boards(), ResourceUnitStrategy::Generic, &[]);

        assert_eq!(manager.contains(&[mock::RNGD_UUIDS[0]]), (true, vec![]));
        assert_eq!(
            manager.contains(&[mock::RNGD_UUIDS[0], "ghost-a", "ghost-b"]),
            (false, vec!["ghost-a".to_string(), "ghost-b".to_string()])
        );
        assert_eq!(manager.contains::<&str>(&[]), (false, vec![]));
    }

    #[test]
    fn allocate_aggregates_manifests() {
        let boards = vec![mock::warboy_boards().remove(0)];
        let manager = manager(&boards, ResourceUnitStrategy::SingleCore, &[]);
        let requested = ids(mock::WARBOY_UUIDS[0], &["0", "1"]);

        let response = manager.container_allocate_response(&requested).unwrap();

        let host_paths: Vec<&str> = response
            .devices
            .iter()
            .map(|spec| spec.host_path.as_str())
            .collect();
        assert!(host_paths.contains(&"/dev/npu0pe0"));
        assert!(host_paths.contains(&"/dev/npu0pe1"));
        assert!(!host_paths.contains(&"/dev/npu0pe0-1"));
        assert!(!host_paths.contains(&"/dev/npu0"));
        // shared nodes are listed once per unit
        assert_eq!(host_paths.len(), 2 * 6);
        assert!(response.mounts.iter().all(|mount| mount.read_only));
        assert!(response.envs.is_empty());
        assert!(response.cdi_devices.is_empty());
    }

    #[test]
    fn allocate_with_unknown_id_fails_atomically() {
        let manager = manager(&mock::rngd_boards(), ResourceUnitStrategy::Generic, &[]);

        let err = manager
            .container_allocate_response(&[mock::RNGD_UUIDS[0], "nonexistent"])
            .unwrap_err();

        match err.current_context() {
            DeviceManagerError::UnknownDevices(missing) => {
                assert_eq!(missing, &vec!["nonexistent".to_string()]);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn preferred_allocation_stays_on_one_board() {
        let manager = manager(&mock::rngd_boards(), ResourceUnitStrategy::QuadCore, &[]);
        let upper = ids(mock::RNGD_UUIDS[0], &["0-3", "4-7"]);
        let lower = ids(mock::RNGD_UUIDS[1], &["0-3", "4-7"]);
        let available = vec![
            upper[0].clone(),
            lower[0].clone(),
            upper[1].clone(),
            lower[1].clone(),
        ];

        let response = manager
            .container_preferred_allocation_response(&available, &[lower[1].clone()], 2)
            .unwrap();

        assert_eq!(response.device_i_ds, lower);
    }

    #[test]
    fn preferred_allocation_rejects_unknown_ids() {
        let manager = manager(&mock::rngd_boards(), ResourceUnitStrategy::Generic, &[]);

        let err = manager
            .container_preferred_allocation_response(&["ghost"], &[], 1)
            .unwrap_err();

        assert!(matches!(
            err.current_context(),
            DeviceManagerError::UnknownDevices(_)
        ));
    }

    #[test]
    fn health_reflects_liveness_and_deny_list() {
        let boards = mock::rngd_boards();
        let manager = manager(&boards, ResourceUnitStrategy::QuadCore, &[mock::RNGD_UUIDS[1]]);

        let err = manager.health_check().unwrap_err();
        match err.current_context() {
            DeviceManagerError::Unhealthy(unhealthy) => {
                assert_eq!(unhealthy, &ids(mock::RNGD_UUIDS[1], &["0-3", "4-7"]));
            }
            other => panic!("unexpected error {other:?}"),
        }

        boards[0].set_broken(true);
        let health: Vec<String> = manager
            .list_and_watch_response()
            .devices
            .into_iter()
            .map(|device| device.health)
            .collect();
        assert_eq!(health, vec![UNHEALTHY.to_string(); 4]);
    }

    #[test]
    fn healthy_manager_passes_health_check() {
        let manager = manager(&mock::warboy_boards(), ResourceUnitStrategy::Generic, &[]);

        assert!(manager.health_check().is_ok());
    }

    #[test]
    fn list_and_watch_carries_numa_topology() {
        let manager = manager(&mock::warboy_boards(), ResourceUnitStrategy::Generic, &[]);

        let response = manager.list_and_watch_response();

        assert_eq!(response.devices.len(), 2);
        assert_eq!(response.devices[0].id.as_str(), mock::WARBOY_UUIDS[0]);
        assert_eq!(response.devices[0].health.as_str(), HEALTHY);
        assert_eq!(
            response.devices[0].topology,
            Some(api::TopologyInfo {
                nodes: vec![api::NumaNode { id: 0 }],
            })
        );
        assert_eq!(response.devices[1].topology, None);
    }
}
