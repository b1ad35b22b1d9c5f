//! Allocatable units built from physical boards, and the bookkeeping the
//! kubelet protocol needs on top of them.

pub mod device;
mod error;
pub mod manifest_filter;
pub mod manager;
pub mod partitioning;
pub mod resource_name;

pub use device::DeviceKind;
pub use device::FuriosaDevice;
pub use error::DeviceManagerError;
pub use manager::DeviceManager;
pub use manager::HEALTHY;
pub use manager::UNHEALTHY;
pub use partitioning::DeviceId;
pub use partitioning::Partition;
pub use resource_name::endpoint_name;
