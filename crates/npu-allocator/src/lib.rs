//! Topology-aware selection of NPU units for a container request.
//!
//! The kubelet asks a device plugin which `size` units it would prefer out of an
//! `available` set, given units that `must` be part of the answer. Allocators in
//! this crate pick the subset whose members sit closest to each other on the PCI
//! fabric, as scored by a [`TopologyHintProvider`].

mod allocator;
mod hint;

pub use allocator::NpuAllocator;
pub use allocator::ScoreBasedOptimalNpuAllocator;
pub use hint::PciTopologyHintProvider;
pub use hint::TopologyHint;
pub use hint::TopologyHintProvider;
pub use hint::CROSS_ROOT_COMPLEX;
pub use hint::SAME_DEVICE;
pub use hint::SAME_ROOT_COMPLEX;
pub use hint::SAME_SWITCH;

/// An allocatable unit as seen by an allocator.
pub trait Device: Send + Sync {
    /// Identifier advertised to the kubelet.
    fn id(&self) -> &str;

    /// Key used to look up affinity between two units. Units on the same
    /// physical board share a key.
    fn topology_hint_key(&self) -> &str;
}
