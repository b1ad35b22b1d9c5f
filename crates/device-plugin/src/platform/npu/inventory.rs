use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use error_stack::Report;
use error_stack::ResultExt;
use npu_allocator::PciTopologyHintProvider;
use tracing::debug;
use tracing::error;
use tracing::info;

use super::Arch;
use super::DeviceInfo;
use super::InventoryError;
use super::NpuDevice;

const UUID_ATTRIBUTE: &str = "device_uuid";
const BUSNAME_ATTRIBUTE: &str = "busname";
/// `1` while the board firmware is up. Older drivers do not expose it.
const STATE_ATTRIBUTE: &str = "device_state";

/// Discovers NPU boards from the kernel driver's sysfs and devfs entries.
#[derive(Debug, Clone)]
pub struct SysfsInventory {
    sysfs_root: PathBuf,
    devfs_root: PathBuf,
}

impl SysfsInventory {
    pub fn new<P1: Into<PathBuf>, P2: Into<PathBuf>>(sysfs_root: P1, devfs_root: P2) -> Self {
        Self {
            sysfs_root: sysfs_root.into(),
            devfs_root: devfs_root.into(),
        }
    }

    /// Lists boards per family, ordered by board number.
    ///
    /// A board whose identity cannot be read is logged and left out.
    #[tracing::instrument(skip(self))]
    pub fn discover(
        &self,
    ) -> Result<BTreeMap<Arch, Vec<Arc<dyn NpuDevice>>>, Report<InventoryError>> {
        let mut discovered: BTreeMap<Arch, Vec<Arc<dyn NpuDevice>>> = BTreeMap::new();

        for arch in [Arch::Warboy, Arch::Rngd] {
            let class_dir = self.sysfs_root.join("class").join(mgmt_class(arch));
            let entries = match fs::read_dir(&class_dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    debug!("no {} driver class at {}", arch, class_dir.display());
                    continue;
                }
                Err(e) => {
                    return Err(Report::new(e).change_context(InventoryError::Discovery {
                        path: class_dir.display().to_string(),
                    }))
                }
            };

            let mut boards: Vec<(u32, PathBuf)> = entries
                .filter_map(Result::ok)
                .filter_map(|entry| {
                    let name = entry.file_name();
                    board_index(arch, name.to_str()?).map(|index| (index, entry.path()))
                })
                .collect();
            boards.sort_by_key(|(index, _)| *index);

            for (index, mgmt_dir) in boards {
                match self.probe(arch, index, mgmt_dir) {
                    Ok(device) => {
                        info!(
                            "found {} board {}: uuid={} busname={}",
                            arch, index, device.info.uuid, device.info.busname
                        );
                        discovered
                            .entry(arch)
                            .or_default()
                            .push(Arc::new(device) as Arc<dyn NpuDevice>);
                    }
                    Err(e) => error!("skipping {} board {}: {e:?}", arch, index),
                }
            }
        }

        Ok(discovered)
    }

    /// Builds PCI fabric paths for the given boards, keyed by PCI bus number.
    pub fn topology_hints<'a>(
        &self,
        devices: impl IntoIterator<Item = &'a DeviceInfo>,
    ) -> PciTopologyHintProvider {
        let mut provider = PciTopologyHintProvider::default();
        for info in devices {
            let Some(bus) = info.busname.split(':').nth(1) else {
                continue;
            };
            match self.pci_path(&info.busname) {
                Some(path) => provider.insert(bus, path),
                None => debug!("no PCI path for {}", info.busname),
            }
        }
        provider
    }

    fn probe(
        &self,
        arch: Arch,
        index: u32,
        mgmt_dir: PathBuf,
    ) -> Result<SysfsDevice, Report<InventoryError>> {
        let uuid = read_attribute(&mgmt_dir.join(UUID_ATTRIBUTE))?;
        let busname = read_attribute(&mgmt_dir.join(BUSNAME_ATTRIBUTE))?;
        let numa_node = self.numa_node(&busname);

        let dev_node = match arch {
            Arch::Warboy => self.devfs_root.join(format!("npu{index}")),
            Arch::Rngd => self.devfs_root.join("rngd").join(format!("npu{index}mgmt")),
        };

        Ok(SysfsDevice {
            info: DeviceInfo {
                arch,
                index,
                uuid,
                busname,
                numa_node,
            },
            mgmt_dir,
            dev_node,
        })
    }

    fn pci_device_dir(&self, busname: &str) -> PathBuf {
        self.sysfs_root
            .join("bus")
            .join("pci")
            .join("devices")
            .join(busname)
    }

    /// `None` when unreported, or reported as `-1`.
    fn numa_node(&self, busname: &str) -> Option<u32> {
        let raw = fs::read_to_string(self.pci_device_dir(busname).join("numa_node")).ok()?;
        raw.trim().parse::<u32>().ok()
    }

    fn pci_path(&self, busname: &str) -> Option<Vec<String>> {
        let target = fs::read_link(self.pci_device_dir(busname)).ok()?;
        let components: Vec<String> = target
            .components()
            .map(|component| component.as_os_str().to_string_lossy().into_owned())
            .skip_while(|component| component != "devices")
            .skip(1)
            .collect();
        (!components.is_empty()).then_some(components)
    }
}

fn mgmt_class(arch: Arch) -> &'static str {
    match arch {
        Arch::Warboy => "npu_mgmt",
        Arch::Rngd => "rngd_mgmt",
    }
}

/// Parses `npu3_mgmt` (warboy) or `rngd!npu3mgmt` (rngd) into `3`.
fn board_index(arch: Arch, name: &str) -> Option<u32> {
    let digits = match arch {
        Arch::Warboy => name.strip_prefix("npu")?.strip_suffix("_mgmt")?,
        Arch::Rngd => name.strip_prefix("rngd!npu")?.strip_suffix("mgmt")?,
    };
    digits.parse().ok()
}

fn read_attribute(path: &Path) -> Result<String, Report<InventoryError>> {
    let raw = fs::read_to_string(path).change_context_lazy(|| InventoryError::ReadAttribute {
        path: path.display().to_string(),
    })?;
    let value = raw.trim();
    if value.is_empty() {
        return Err(Report::new(InventoryError::MalformedAttribute {
            path: path.display().to_string(),
            value: raw.clone(),
        }));
    }
    Ok(value.to_string())
}

#[derive(Debug)]
struct SysfsDevice {
    info: DeviceInfo,
    mgmt_dir: PathBuf,
    dev_node: PathBuf,
}

impl NpuDevice for SysfsDevice {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn liveness(&self) -> Result<bool, Report<InventoryError>> {
        if !self.dev_node.exists() {
            return Ok(false);
        }

        match fs::read_to_string(self.mgmt_dir.join(STATE_ATTRIBUTE)) {
            Ok(state) => Ok(state.trim() == "1"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(true),
            Err(e) => Err(Report::new(e).change_context(InventoryError::Liveness {
                arch: self.info.arch,
                index: self.info.index,
            })),
        }
    }
}
