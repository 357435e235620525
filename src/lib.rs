//! Parallel Sort
//!
//! GPU LSD radix sort for 32-bit keys with an optional 32-bit payload.
//! Eight 4-bit digit passes, each made of five compute stages
//! (Count, Reduce, Scan, ScanAdd, Scatter), recorded through the
//! [`Device`]/[`CommandList`] abstraction. Dispatch sizes come from the host
//! (direct mode) or from a key count living in a GPU buffer (indirect mode).
//!
//! [`CpuDevice`] runs the kernels on the host with rayon and validates the
//! recorded work the way a GPU validation layer would.

pub mod config;
pub mod cpu_device;
pub mod cpu_radix_sort;
pub mod device;
mod dispatcher;
pub mod engine;
pub mod error;
mod kernels;
pub mod params;

pub use config::SortConfig;
pub use cpu_device::{CpuCommandList, CpuDevice, DeviceStats};
pub use device::{
    BufferDesc, BufferHandle, BufferUsage, CommandList, Device, KernelVariant, ResourceState,
    Stage,
};
pub use engine::ParallelSort;
pub use error::{DeviceError, SortError};
pub use params::{calculate_scratch_resource_size, DispatchSizes, ParallelSortConstants};
