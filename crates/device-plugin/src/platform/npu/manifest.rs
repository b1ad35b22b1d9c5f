use std::collections::HashMap;

use super::Arch;

/// Mount option marking a bind mount read-only.
pub const READ_ONLY_OPT: &str = "ro";

const DEVICE_NODE_PERMISSIONS: &str = "rw";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceNode {
    pub container_path: String,
    pub host_path: String,
    /// Any combination of `r`, `w` and `m`.
    pub permissions: String,
}

impl DeviceNode {
    fn same_path(path: String) -> Self {
        Self {
            container_path: path.clone(),
            host_path: path,
            permissions: DEVICE_NODE_PERMISSIONS.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPath {
    pub container_path: String,
    pub host_path: String,
    pub options: Vec<String>,
}

impl MountPath {
    fn read_only_bind(path: String) -> Self {
        Self {
            container_path: path.clone(),
            host_path: path,
            options: vec![
                "bind".to_string(),
                "nodev".to_string(),
                READ_ONLY_OPT.to_string(),
            ],
        }
    }

    pub fn read_only(&self) -> bool {
        self.options.iter().any(|opt| opt == READ_ONLY_OPT)
    }
}

/// Container edits required to hand a board, or part of it, to a container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    pub env_vars: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
    pub device_nodes: Vec<DeviceNode>,
    pub mount_paths: Vec<MountPath>,
    /// Fully qualified CDI device names.
    pub cdi_devices: Vec<String>,
}

impl Manifest {
    pub fn whole_device(arch: Arch, index: u32) -> Self {
        match arch {
            Arch::Warboy => warboy(index),
            Arch::Rngd => rngd(index),
        }
    }
}

fn warboy(index: u32) -> Manifest {
    let mut device_nodes = vec![
        format!("/dev/npu{index}_mgmt"),
        format!("/dev/npu{index}"),
        format!("/dev/npu{index}pe0"),
        format!("/dev/npu{index}pe1"),
        format!("/dev/npu{index}pe0-1"),
    ];
    device_nodes.extend((0..4).map(|ch| format!("/dev/npu{index}ch{ch}")));

    let sysfs_entries = [
        format!("npu{index}_mgmt"),
        format!("npu{index}"),
        format!("npu{index}pe0"),
        format!("npu{index}pe1"),
        format!("npu{index}pe0-1"),
    ];
    let mount_paths = ["/sys/class/npu_mgmt", "/sys/devices/virtual/npu_mgmt"]
        .iter()
        .flat_map(|base| sysfs_entries.iter().map(move |entry| format!("{base}/{entry}")))
        .map(MountPath::read_only_bind)
        .collect();

    Manifest {
        device_nodes: device_nodes.into_iter().map(DeviceNode::same_path).collect(),
        mount_paths,
        ..Default::default()
    }
}

fn rngd(index: u32) -> Manifest {
    let mut device_nodes = vec![format!("/dev/rngd/npu{index}mgmt")];
    device_nodes.extend((0..8).map(|pe| format!("/dev/rngd/npu{index}pe{pe}")));
    device_nodes.extend(
        ["0-1", "2-3", "4-5", "6-7", "0-3", "4-7"]
            .iter()
            .map(|fused| format!("/dev/rngd/npu{index}pe{fused}")),
    );
    device_nodes.extend((0..8).map(|ch| format!("/dev/rngd/npu{index}ch{ch}")));
    device_nodes.extend((0..8).map(|ch| format!("/dev/rngd/npu{index}ch{ch}r")));
    device_nodes.push(format!("/dev/rngd/npu{index}dmar"));

    let mount_paths = [
        format!("/sys/class/rngd_mgmt/rngd!npu{index}mgmt"),
        format!("/sys/devices/virtual/rngd_mgmt/rngd!npu{index}mgmt"),
    ]
    .into_iter()
    .map(MountPath::read_only_bind)
    .collect();

    Manifest {
        device_nodes: device_nodes.into_iter().map(DeviceNode::same_path).collect(),
        mount_paths,
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    fn host_paths(manifest: &Manifest) -> Vec<&str> {
        manifest
            .device_nodes
            .iter()
            .map(|node| node.host_path.as_str())
            .collect()
    }

    #[test]
    fn warboy_whole_device() {
        let manifest = Manifest::whole_device(Arch::Warboy, 1);

        assert_eq!(
            host_paths(&manifest),
            vec![
                "/dev/npu1_mgmt",
                "/dev/npu1",
                "/dev/npu1pe0",
                "/dev/npu1pe1",
                "/dev/npu1pe0-1",
                "/dev/npu1ch0",
                "/dev/npu1ch1",
                "/dev/npu1ch2",
                "/dev/npu1ch3",
            ]
        );
        assert!(manifest.device_nodes.iter().all(|node| node.permissions == "rw"));
        assert_eq!(manifest.mount_paths.len(), 10);
        assert_eq!(
            manifest.mount_paths[0].host_path,
            "/sys/class/npu_mgmt/npu1_mgmt"
        );
        assert_eq!(
            manifest.mount_paths[9].host_path,
            "/sys/devices/virtual/npu_mgmt/npu1pe0-1"
        );
        assert!(manifest.mount_paths.iter().all(MountPath::read_only));
    }

    #[test]
    fn rngd_whole_device() {
        let manifest = Manifest::whole_device(Arch::Rngd, 0);
        let paths = host_paths(&manifest);

        assert_eq!(paths.len(), 1 + 8 + 6 + 8 + 8 + 1);
        assert_eq!(paths[0], "/dev/rngd/npu0mgmt");
        assert_eq!(paths[9], "/dev/rngd/npu0pe0-1");
        assert_eq!(paths[14], "/dev/rngd/npu0pe4-7");
        assert_eq!(paths[23], "/dev/rngd/npu0ch0r");
        assert_eq!(paths[31], "/dev/rngd/npu0dmar");
        assert_eq!(
            manifest
                .mount_paths
                .iter()
                .map(|mount| mount.host_path.as_str())
                .collect::<Vec<_>>(),
            vec![
                "/sys/class/rngd_mgmt/rngd!npu0mgmt",
                "/sys/devices/virtual/rngd_mgmt/rngd!npu0mgmt",
            ]
        );
    }
}
