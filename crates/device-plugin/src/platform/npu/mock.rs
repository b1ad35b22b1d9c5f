//! In-memory boards for tests.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use error_stack::Report;

use super::Arch;
use super::DeviceInfo;
use super::InventoryError;
use super::NpuDevice;

#[derive(Debug)]
pub struct MockNpu {
    info: DeviceInfo,
    alive: AtomicBool,
    broken: AtomicBool,
}

impl MockNpu {
    pub fn new(
        arch: Arch,
        index: u32,
        uuid: &str,
        busname: &str,
        numa_node: Option<u32>,
    ) -> Arc<Self> {
        Arc::new(Self {
            info: DeviceInfo {
                arch,
                index,
                uuid: uuid.to_string(),
                busname: busname.to_string(),
                numa_node,
            },
            alive: AtomicBool::new(true),
            broken: AtomicBool::new(false),
        })
    }

    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::SeqCst);
    }

    /// Makes liveness queries fail instead of answering.
    pub fn set_broken(&self, broken: bool) {
        self.broken.store(broken, Ordering::SeqCst);
    }
}

impl NpuDevice for MockNpu {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn liveness(&self) -> Result<bool, Report<InventoryError>> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(Report::new(InventoryError::Liveness {
                arch: self.info.arch,
                index: self.info.index,
            }));
        }
        Ok(self.alive.load(Ordering::SeqCst))
    }
}

pub const RNGD_UUIDS: [&str; 2] = [
    "A76AAD68-6855-40B1-9E86-D080852D1C80",
    "A76AAD68-6855-40B1-9E86-D080852D1C81",
];

pub const WARBOY_UUIDS: [&str; 2] = [
    "DF80A4B4-2C2F-4D3C-9E3A-1F2B3C4D5E60",
    "DF80A4B4-2C2F-4D3C-9E3A-1F2B3C4D5E61",
];

pub fn rngd_boards() -> Vec<Arc<MockNpu>> {
    vec![
        MockNpu::new(Arch::Rngd, 0, RNGD_UUIDS[0], "0000:27:00.0", Some(0)),
        MockNpu::new(Arch::Rngd, 1, RNGD_UUIDS[1], "0000:2a:00.0", Some(0)),
    ]
}

pub fn warboy_boards() -> Vec<Arc<MockNpu>> {
    vec![
        MockNpu::new(Arch::Warboy, 0, WARBOY_UUIDS[0], "0000:51:00.0", Some(0)),
        MockNpu::new(Arch::Warboy, 1, WARBOY_UUIDS[1], "0000:9e:00.0", None),
    ]
}

pub fn as_npu_devices(boards: &[Arc<MockNpu>]) -> Vec<Arc<dyn NpuDevice>> {
    boards
        .iter()
        .map(|board| board.clone() as Arc<dyn NpuDevice>)
        .collect()
}
