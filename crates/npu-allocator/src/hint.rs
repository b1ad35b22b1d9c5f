use std::collections::HashMap;

/// Affinity score between two topology hint keys. Larger is closer.
pub type TopologyHint = u32;

/// Units sharing one board.
pub const SAME_DEVICE: TopologyHint = 70;
/// Boards behind a common PCIe switch.
pub const SAME_SWITCH: TopologyHint = 30;
/// Boards under the same root complex.
pub const SAME_ROOT_COMPLEX: TopologyHint = 20;
/// Anything else, including unknown keys.
pub const CROSS_ROOT_COMPLEX: TopologyHint = 10;

pub trait TopologyHintProvider: Send + Sync {
    fn hint(&self, a: &str, b: &str) -> TopologyHint;
}

impl<F> TopologyHintProvider for F
where
    F: Fn(&str, &str) -> TopologyHint + Send + Sync,
{
    fn hint(&self, a: &str, b: &str) -> TopologyHint {
        self(a, b)
    }
}

/// Scores hint keys by how much of their PCI device path they share.
///
/// Each key maps to the chain of PCI nodes from the root bus down to the board,
/// e.g. `["pci0000:00", "0000:00:01.1", "0000:01:00.0", "0000:02:00.0"]`.
#[derive(Debug, Default, Clone)]
pub struct PciTopologyHintProvider {
    paths: HashMap<String, Vec<String>>,
}

impl PciTopologyHintProvider {
    pub fn new(paths: HashMap<String, Vec<String>>) -> Self {
        Self { paths }
    }

    pub fn insert(&mut self, key: impl Into<String>, path: Vec<String>) {
        self.paths.insert(key.into(), path);
    }
}

impl TopologyHintProvider for PciTopologyHintProvider {
    fn hint(&self, a: &str, b: &str) -> TopologyHint {
        if a == b {
            return SAME_DEVICE;
        }

        let (Some(path_a), Some(path_b)) = (self.paths.get(a), self.paths.get(b)) else {
            return CROSS_ROOT_COMPLEX;
        };

        let common = path_a
            .iter()
            .zip(path_b.iter())
            .take_while(|(x, y)| x == y)
            .count();

        // the last element is the board itself, so a shared bridge below the
        // root bus means the two boards hang off the same switch
        match common {
            0 => CROSS_ROOT_COMPLEX,
            1 => SAME_ROOT_COMPLEX,
            _ => SAME_SWITCH,
        }
    }
}
