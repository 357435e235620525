//! Device Abstraction
//!
//! The sort engine never talks to a graphics API directly. It allocates
//! buffers and pipelines through [`Device`] and records work into a
//! [`CommandList`]. Any backend that can create word-addressed buffers, run
//! the six sort kernels, dispatch directly or indirectly and track resource
//! states can host the engine; [`CpuDevice`](crate::cpu_device::CpuDevice)
//! is the reference implementation.

use crate::error::DeviceError;

/// Opaque reference to a device buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub(crate) u32);

/// Opaque reference to a compiled kernel pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipelineHandle(pub(crate) u32);

/// Access state a buffer must be in for a given use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceState {
    /// Read/write from kernels
    UnorderedAccess,
    /// Source of dispatch dimensions for an indirect dispatch
    IndirectArgument,
    /// Read-only constants
    ConstantBufferRead,
    /// Source of a copy or host readback
    CopySource,
    /// Target of a recorded buffer update
    CopyDest,
}

bitflags::bitflags! {
    /// What a buffer may be used for over its lifetime.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[repr(transparent)]
    pub struct BufferUsage: u32 {
        /// Kernel read/write access
        const STORAGE = 1 << 0;
        /// Constant buffer reads
        const CONSTANT = 1 << 1;
        /// Indirect dispatch arguments
        const INDIRECT = 1 << 2;
    }
}

impl BufferUsage {
    /// Whether a buffer with this usage may enter `state`.
    pub fn allows(&self, state: ResourceState) -> bool {
        match state {
            ResourceState::UnorderedAccess => self.contains(Self::STORAGE),
            ResourceState::IndirectArgument => self.contains(Self::INDIRECT),
            ResourceState::ConstantBufferRead => self.contains(Self::CONSTANT),
            ResourceState::CopySource | ResourceState::CopyDest => true,
        }
    }
}

/// Description of a buffer to allocate.
#[derive(Debug, Clone)]
pub struct BufferDesc {
    pub label: String,
    /// Size in bytes, a multiple of 4
    pub size: u64,
    /// Element stride in bytes
    pub stride: u32,
    pub usage: BufferUsage,
    pub initial_state: ResourceState,
}

impl BufferDesc {
    /// Structured `u32` storage buffer, initially in `UnorderedAccess`.
    pub fn storage(label: impl Into<String>, size: u64) -> Self {
        Self {
            label: label.into(),
            size,
            stride: std::mem::size_of::<u32>() as u32,
            usage: BufferUsage::STORAGE,
            initial_state: ResourceState::UnorderedAccess,
        }
    }

    pub fn with_usage(mut self, usage: BufferUsage) -> Self {
        self.usage = usage;
        self
    }

    pub fn with_stride(mut self, stride: u32) -> Self {
        self.stride = stride;
        self
    }

    pub fn with_initial_state(mut self, state: ResourceState) -> Self {
        self.initial_state = state;
        self
    }
}

/// Sort kernel entry points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    SetupIndirectArgs,
    Count,
    Reduce,
    Scan,
    ScanAdd,
    Scatter,
}

impl Stage {
    pub const COUNT: usize = 6;

    /// The five stages run on every digit pass, in order.
    pub const SORT_STAGES: [Stage; 5] = [
        Stage::Count,
        Stage::Reduce,
        Stage::Scan,
        Stage::ScanAdd,
        Stage::Scatter,
    ];

    pub fn index(self) -> usize {
        match self {
            Stage::SetupIndirectArgs => 0,
            Stage::Count => 1,
            Stage::Reduce => 2,
            Stage::Scan => 3,
            Stage::ScanAdd => 4,
            Stage::Scatter => 5,
        }
    }

    /// Kernel entry point name.
    pub fn kernel_name(self) -> &'static str {
        match self {
            Stage::SetupIndirectArgs => "parallel_sort_setup_indirect_args",
            Stage::Count => "parallel_sort_count",
            Stage::Reduce => "parallel_sort_reduce",
            Stage::Scan => "parallel_sort_scan",
            Stage::ScanAdd => "parallel_sort_scan_add",
            Stage::Scatter => "parallel_sort_scatter",
        }
    }
}

/// Kernel define toggling payload support.
pub const HAS_PAYLOAD_DEFINE: &str = "HAS_PAYLOAD";

/// Which flavor of the kernels an engine instance is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KernelVariant {
    pub payload: bool,
    pub indirect: bool,
}

impl KernelVariant {
    /// Compile-time defines for this variant's pipelines.
    pub fn defines(&self) -> [(&'static str, bool); 1] {
        [(HAS_PAYLOAD_DEFINE, self.payload)]
    }

    /// Stages that need a pipeline for this variant.
    pub fn stages(&self) -> impl Iterator<Item = Stage> {
        let setup = self.indirect.then_some(Stage::SetupIndirectArgs);
        setup.into_iter().chain(Stage::SORT_STAGES)
    }
}

/// A buffer bound at a byte offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferSlice {
    pub buffer: BufferHandle,
    pub offset: u64,
}

/// Root constants consumed by `SetupIndirectArgs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RootConstants {
    pub max_thread_groups: u32,
    pub max_entries: u32,
    pub shift: u32,
}

/// Resources attached to one kernel invocation.
///
/// Unused slots stay `None`; each kernel documents which slots it reads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Bindings {
    pub constants: Option<BufferSlice>,
    pub src_keys: Option<BufferHandle>,
    pub dst_keys: Option<BufferHandle>,
    pub src_payload: Option<BufferHandle>,
    pub dst_payload: Option<BufferHandle>,
    pub sum_table: Option<BufferHandle>,
    pub reduce_table: Option<BufferHandle>,
    pub num_keys: Option<BufferHandle>,
    pub indirect_constants: Option<BufferSlice>,
    pub count_scatter_args: Option<BufferHandle>,
    pub reduce_scan_args: Option<BufferHandle>,
    pub root_constants: RootConstants,
}

/// Resource and pipeline factory plus host access to buffer contents.
pub trait Device {
    type CommandList: CommandList;

    fn create_buffer(&mut self, desc: &BufferDesc) -> Result<BufferHandle, DeviceError>;

    fn destroy_buffer(&mut self, buffer: BufferHandle);

    /// Compile `stage` with the given boolean defines.
    fn create_pipeline(
        &mut self,
        stage: Stage,
        defines: &[(&str, bool)],
    ) -> Result<PipelineHandle, DeviceError>;

    fn create_command_list(&self) -> Self::CommandList;

    /// Execute recorded work to completion.
    fn submit(&mut self, list: Self::CommandList) -> Result<(), DeviceError>;

    /// Host upload of `data` at `offset` bytes.
    fn write_buffer(
        &mut self,
        buffer: BufferHandle,
        offset: u64,
        data: &[u32],
    ) -> Result<(), DeviceError>;

    /// Host readback of `len` words starting at `offset` bytes.
    fn read_buffer(
        &self,
        buffer: BufferHandle,
        offset: u64,
        len: usize,
    ) -> Result<Vec<u32>, DeviceError>;
}

/// Recording interface. Recording never fails; problems surface on submit.
pub trait CommandList {
    /// Recorded upload of `data` at `offset` bytes. Target must be in `CopyDest`.
    fn update_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u32]);

    /// Dispatch with host-known thread-group counts.
    fn dispatch(&mut self, pipeline: PipelineHandle, bindings: &Bindings, x: u32, y: u32, z: u32);

    /// Dispatch whose thread-group counts are three words read from `args`
    /// at `args_offset` bytes when the GPU reaches this command.
    fn dispatch_indirect(
        &mut self,
        pipeline: PipelineHandle,
        bindings: &Bindings,
        args: BufferHandle,
        args_offset: u64,
    );

    /// Make all prior unordered-access writes visible to later dispatches.
    fn uav_barrier(&mut self);

    fn transition(&mut self, buffer: BufferHandle, from: ResourceState, to: ResourceState);
}
