//! Narrowing a whole-board manifest to what one partition may touch.

use error_stack::Report;
use error_stack::ResultExt;
use regex::Regex;

use super::partitioning::Partition;
use super::DeviceManagerError;
use crate::platform::npu::Arch;
use crate::platform::npu::Manifest;

const CORES_GROUP: &str = "cores";

/// Path classification rules for one product family.
struct Rules {
    /// Whole-board entries, meaningless once the board is split.
    whole_device: Option<Regex>,
    /// Per-core entries; the `cores` group holds the core range suffix.
    per_core: Regex,
}

impl Rules {
    fn new(whole_device: Option<&str>, per_core: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            whole_device: whole_device.map(Regex::new).transpose()?,
            per_core: Regex::new(per_core)?,
        })
    }

    /// `Ok(true)` when `path` stays visible from `partition`.
    fn keeps(
        &self,
        path: &str,
        partition: &Partition,
    ) -> Result<bool, Report<DeviceManagerError>> {
        if self
            .whole_device
            .as_ref()
            .is_some_and(|whole| whole.is_match(path))
        {
            return Ok(false);
        }

        let Some(captures) = self.per_core.captures(path) else {
            return Ok(true);
        };
        let cores = captures
            .name(CORES_GROUP)
            .map(|cores| cores.as_str())
            .unwrap_or_default();
        let owner = cores.parse::<Partition>().change_context_lazy(|| {
            DeviceManagerError::ManifestMismatch {
                path: path.to_string(),
            }
        })?;
        Ok(&owner == partition)
    }
}

struct FamilyRules {
    device_nodes: Rules,
    mount_paths: Option<Rules>,
}

fn family_rules(arch: Arch) -> Result<FamilyRules, regex::Error> {
    match arch {
        Arch::Warboy => Ok(FamilyRules {
            device_nodes: Rules::new(
                Some(r"^/dev/npu[0-9]+$"),
                r"^/dev/npu[0-9]+pe(?P<cores>\S+)$",
            )?,
            mount_paths: Some(Rules::new(
                Some(r"^(/sys/class|/sys/devices/virtual)/npu_mgmt/npu[0-9]+$"),
                r"^(/sys/class|/sys/devices/virtual)/npu_mgmt/npu[0-9]+pe(?P<cores>\S+)$",
            )?),
        }),
        // the management node stays shared and sysfs entries are per board
        Arch::Rngd => Ok(FamilyRules {
            device_nodes: Rules::new(None, r"^/dev/rngd/npu[0-9]+pe(?P<cores>\S+)$")?,
            mount_paths: None,
        }),
    }
}

/// Keeps shared entries, the per-core entries whose core range equals
/// `partition`, and drops whole-board entries where the family has them.
///
/// A per-core entry whose suffix is not a core range is an error.
pub fn filter_manifest(
    arch: Arch,
    manifest: &Manifest,
    partition: &Partition,
) -> Result<Manifest, Report<DeviceManagerError>> {
    let rules = family_rules(arch).change_context(DeviceManagerError::ManifestMismatch {
        path: format!("{arch} filter rules"),
    })?;

    let mut device_nodes = Vec::with_capacity(manifest.device_nodes.len());
    for node in &manifest.device_nodes {
        if rules.device_nodes.keeps(&node.host_path, partition)? {
            device_nodes.push(node.clone());
        }
    }

    let mut mount_paths = Vec::with_capacity(manifest.mount_paths.len());
    for mount in &manifest.mount_paths {
        let keep = match &rules.mount_paths {
            Some(mount_rules) => mount_rules.keeps(&mount.host_path, partition)?,
            None => true,
        };
        if keep {
            mount_paths.push(mount.clone());
        }
    }

    Ok(Manifest {
        env_vars: manifest.env_vars.clone(),
        annotations: manifest.annotations.clone(),
        device_nodes,
        mount_paths,
        cdi_devices: manifest.cdi_devices.clone(),
    })
}
