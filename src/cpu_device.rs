//! Host-Side Simulated GPU
//!
//! `CpuDevice` implements [`Device`] by recording commands and replaying them
//! on `submit`. Thread groups of a dispatch run concurrently on the rayon
//! pool over atomic word storage, so kernels see the same "no ordering
//! between groups" model they would on real hardware.
//!
//! ## Validation
//!
//! Replay checks what a GPU validation layer would flag:
//! - buffer accesses outside the allocation
//! - buffers used in the wrong resource state, or transitions from the wrong state
//! - storage buffers read or written after another dispatch wrote them,
//!   without a UAV barrier in between
//! - payload bindings that disagree with the pipeline's `HAS_PAYLOAD` define
//!
//! Every replayed command is also counted in [`DeviceStats`].

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};

use rayon::prelude::*;

use crate::device::{
    Bindings, BufferDesc, BufferHandle, BufferUsage, CommandList, Device, PipelineHandle,
    ResourceState, Stage, HAS_PAYLOAD_DEFINE,
};
use crate::error::DeviceError;
use crate::kernels::{self, BufferAccess, GpuBuffer, KernelResources};
use crate::params::{ParallelSortConstants, CONSTANTS_WORDS};

const WORD: u64 = std::mem::size_of::<u32>() as u64;

struct CpuBuffer {
    label: String,
    words: Vec<AtomicU32>,
    usage: BufferUsage,
    state: ResourceState,
}

impl CpuBuffer {
    fn size(&self) -> u64 {
        self.words.len() as u64 * WORD
    }

    fn range(&self, offset: u64, len: usize) -> Result<std::ops::Range<usize>, DeviceError> {
        let start = (offset / WORD) as usize;
        let end = start + len;
        if offset % WORD != 0 || end > self.words.len() {
            return Err(DeviceError::OutOfBounds {
                label: self.label.clone(),
                index: end.saturating_sub(1) as u64,
                len: self.words.len(),
            });
        }
        Ok(start..end)
    }
}

#[derive(Debug, Clone, Copy)]
struct CpuPipeline {
    stage: Stage,
    has_payload: bool,
}

#[derive(Debug, Clone, Copy)]
enum DispatchSize {
    Direct([u32; 3]),
    Indirect { args: BufferHandle, offset: u64 },
}

#[derive(Debug)]
enum Command {
    Update {
        buffer: BufferHandle,
        offset: u64,
        data: Vec<u32>,
    },
    Dispatch {
        pipeline: PipelineHandle,
        bindings: Bindings,
        size: DispatchSize,
    },
    Barrier,
    Transition {
        buffer: BufferHandle,
        from: ResourceState,
        to: ResourceState,
    },
}

/// Commands recorded for a [`CpuDevice`].
#[derive(Debug, Default)]
pub struct CpuCommandList {
    commands: Vec<Command>,
}

impl CpuCommandList {
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

impl CommandList for CpuCommandList {
    fn update_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u32]) {
        self.commands.push(Command::Update {
            buffer,
            offset,
            data: data.to_vec(),
        });
    }

    fn dispatch(&mut self, pipeline: PipelineHandle, bindings: &Bindings, x: u32, y: u32, z: u32) {
        self.commands.push(Command::Dispatch {
            pipeline,
            bindings: *bindings,
            size: DispatchSize::Direct([x, y, z]),
        });
    }

    fn dispatch_indirect(
        &mut self,
        pipeline: PipelineHandle,
        bindings: &Bindings,
        args: BufferHandle,
        args_offset: u64,
    ) {
        self.commands.push(Command::Dispatch {
            pipeline,
            bindings: *bindings,
            size: DispatchSize::Indirect {
                args,
                offset: args_offset,
            },
        });
    }

    fn uav_barrier(&mut self) {
        self.commands.push(Command::Barrier);
    }

    fn transition(&mut self, buffer: BufferHandle, from: ResourceState, to: ResourceState) {
        self.commands.push(Command::Transition { buffer, from, to });
    }
}

/// Counters accumulated over every submitted command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceStats {
    dispatches: [u64; Stage::COUNT],
    pub indirect_dispatches: u64,
    /// Dispatches that resolved to zero thread groups
    pub empty_dispatches: u64,
    pub thread_groups: u64,
    pub barriers: u64,
    pub transitions: u64,
    pub buffer_updates: u64,
}

impl DeviceStats {
    /// Dispatches recorded for `stage`, direct and indirect.
    pub fn dispatches(&self, stage: Stage) -> u64 {
        self.dispatches[stage.index()]
    }

    pub fn total_dispatches(&self) -> u64 {
        self.dispatches.iter().sum()
    }
}

/// Storage buffers touched since the last UAV barrier.
#[derive(Default)]
struct HazardTracker {
    written: HashSet<BufferHandle>,
    read: HashSet<BufferHandle>,
}

impl HazardTracker {
    fn conflict(&self, access: &BufferAccess) -> bool {
        if access.state != ResourceState::UnorderedAccess {
            return false;
        }
        (access.access.reads() && self.written.contains(&access.buffer))
            || (access.access.writes()
                && (self.written.contains(&access.buffer) || self.read.contains(&access.buffer)))
    }

    fn record(&mut self, accesses: &[BufferAccess]) {
        for access in accesses
            .iter()
            .filter(|a| a.state == ResourceState::UnorderedAccess)
        {
            if access.access.reads() {
                self.read.insert(access.buffer);
            }
            if access.access.writes() {
                self.written.insert(access.buffer);
            }
        }
    }

    fn forget(&mut self, buffer: BufferHandle) {
        self.written.remove(&buffer);
        self.read.remove(&buffer);
    }

    fn clear(&mut self) {
        self.written.clear();
        self.read.clear();
    }
}

/// Simulated compute device running the sort kernels on the host.
#[derive(Default)]
pub struct CpuDevice {
    buffers: Vec<Option<CpuBuffer>>,
    pipelines: Vec<CpuPipeline>,
    memory_budget: Option<u64>,
    allocated: u64,
    stats: DeviceStats,
}

impl CpuDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Device that fails allocations once `bytes` are in use.
    pub fn with_memory_budget(bytes: u64) -> Self {
        Self {
            memory_budget: Some(bytes),
            ..Self::default()
        }
    }

    pub fn stats(&self) -> &DeviceStats {
        &self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = DeviceStats::default();
    }

    /// Bytes held by live buffers.
    pub fn allocated_bytes(&self) -> u64 {
        self.allocated
    }

    pub fn live_buffers(&self) -> usize {
        self.buffers.iter().filter(|b| b.is_some()).count()
    }

    pub fn buffer_state(&self, buffer: BufferHandle) -> Option<ResourceState> {
        self.buffer(buffer).ok().map(|b| b.state)
    }

    /// Upload `data` into a fresh storage buffer.
    pub fn create_buffer_init(
        &mut self,
        label: &str,
        data: &[u32],
    ) -> Result<BufferHandle, DeviceError> {
        let handle = self.create_buffer(&BufferDesc::storage(label, data.len() as u64 * WORD))?;
        self.write_buffer(handle, 0, data)?;
        Ok(handle)
    }

    fn buffer(&self, handle: BufferHandle) -> Result<&CpuBuffer, DeviceError> {
        self.buffers
            .get(handle.0 as usize)
            .and_then(Option::as_ref)
            .ok_or(DeviceError::UnknownBuffer(handle))
    }

    fn buffer_mut(&mut self, handle: BufferHandle) -> Result<&mut CpuBuffer, DeviceError> {
        self.buffers
            .get_mut(handle.0 as usize)
            .and_then(Option::as_mut)
            .ok_or(DeviceError::UnknownBuffer(handle))
    }

    fn view(&self, handle: Option<BufferHandle>) -> Result<Option<GpuBuffer<'_>>, DeviceError> {
        self.view_at(handle, 0)
    }

    fn view_at(
        &self,
        handle: Option<BufferHandle>,
        offset: u64,
    ) -> Result<Option<GpuBuffer<'_>>, DeviceError> {
        handle
            .map(|h| {
                let buffer = self.buffer(h)?;
                Ok(GpuBuffer::new(&buffer.label, &buffer.words, (offset / WORD) as usize))
            })
            .transpose()
    }

    fn replay(&mut self, command: Command, hazards: &mut HazardTracker) -> Result<(), DeviceError> {
        match command {
            Command::Update {
                buffer,
                offset,
                data,
            } => {
                let target = self.buffer(buffer)?;
                if target.state != ResourceState::CopyDest {
                    return Err(DeviceError::StateMismatch {
                        label: target.label.clone(),
                        expected: ResourceState::CopyDest,
                        actual: target.state,
                    });
                }
                let range = target.range(offset, data.len())?;
                for (slot, word) in target.words[range].iter().zip(data) {
                    slot.store(word, Ordering::Relaxed);
                }
                self.stats.buffer_updates += 1;
            }
            Command::Dispatch {
                pipeline,
                bindings,
                size,
            } => self.replay_dispatch(pipeline, &bindings, size, hazards)?,
            Command::Barrier => {
                hazards.clear();
                self.stats.barriers += 1;
            }
            Command::Transition { buffer, from, to } => {
                let target = self.buffer_mut(buffer)?;
                if target.state != from {
                    return Err(DeviceError::StateMismatch {
                        label: target.label.clone(),
                        expected: from,
                        actual: target.state,
                    });
                }
                if !target.usage.allows(to) {
                    return Err(DeviceError::UnsupportedState {
                        label: target.label.clone(),
                        state: to,
                    });
                }
                target.state = to;
                hazards.forget(buffer);
                self.stats.transitions += 1;
            }
        }
        Ok(())
    }

    fn replay_dispatch(
        &mut self,
        pipeline: PipelineHandle,
        bindings: &Bindings,
        size: DispatchSize,
        hazards: &mut HazardTracker,
    ) -> Result<(), DeviceError> {
        let CpuPipeline { stage, has_payload } = *self
            .pipelines
            .get(pipeline.0 as usize)
            .ok_or(DeviceError::UnknownPipeline(pipeline))?;

        let accesses = kernels::accesses(stage, has_payload, bindings)?;
        for access in &accesses {
            let buffer = self.buffer(access.buffer)?;
            if buffer.state != access.state {
                return Err(DeviceError::StateMismatch {
                    label: buffer.label.clone(),
                    expected: access.state,
                    actual: buffer.state,
                });
            }
            if hazards.conflict(access) {
                return Err(DeviceError::MissingBarrier {
                    stage,
                    label: format!("{} (bound as {})", buffer.label, access.binding),
                });
            }
        }

        let groups = match size {
            DispatchSize::Direct([x, y, z]) => x as u64 * y as u64 * z as u64,
            DispatchSize::Indirect { args, offset } => {
                let buffer = self.buffer(args)?;
                if buffer.state != ResourceState::IndirectArgument {
                    return Err(DeviceError::StateMismatch {
                        label: buffer.label.clone(),
                        expected: ResourceState::IndirectArgument,
                        actual: buffer.state,
                    });
                }
                buffer.words[buffer.range(offset, 3)?]
                    .iter()
                    .map(|w| w.load(Ordering::Relaxed) as u64)
                    .product()
            }
        };

        let group_count = u32::try_from(groups)
            .map_err(|_| DeviceError::TooManyThreadGroups { stage, groups })?;

        if let DispatchSize::Indirect { .. } = size {
            self.stats.indirect_dispatches += 1;
        }

        self.stats.dispatches[stage.index()] += 1;
        self.stats.thread_groups += groups;
        log::trace!("{}: {} thread groups", stage.kernel_name(), groups);

        if groups == 0 {
            self.stats.empty_dispatches += 1;
        } else {
            self.run_groups(stage, has_payload, bindings, group_count)?;
        }

        hazards.record(&accesses);
        Ok(())
    }

    fn run_groups(
        &self,
        stage: Stage,
        has_payload: bool,
        bindings: &Bindings,
        groups: u32,
    ) -> Result<(), DeviceError> {
        let constants = match bindings.constants {
            Some(slice) => {
                let buffer = self.buffer(slice.buffer)?;
                let mut words = [0u32; CONSTANTS_WORDS];
                for (word, slot) in words
                    .iter_mut()
                    .zip(&buffer.words[buffer.range(slice.offset, CONSTANTS_WORDS)?])
                {
                    *word = slot.load(Ordering::Relaxed);
                }
                ParallelSortConstants::from_words(words)
            }
            None => ParallelSortConstants::default(),
        };

        let indirect_constants = match bindings.indirect_constants {
            Some(slice) => self.view_at(Some(slice.buffer), slice.offset)?,
            None => None,
        };

        let resources = KernelResources {
            stage,
            has_payload,
            constants,
            root: bindings.root_constants,
            src_keys: self.view(bindings.src_keys)?,
            dst_keys: self.view(bindings.dst_keys)?,
            src_payload: self.view(bindings.src_payload)?,
            dst_payload: self.view(bindings.dst_payload)?,
            sum_table: self.view(bindings.sum_table)?,
            reduce_table: self.view(bindings.reduce_table)?,
            num_keys: self.view(bindings.num_keys)?,
            indirect_constants,
            count_scatter_args: self.view(bindings.count_scatter_args)?,
            reduce_scan_args: self.view(bindings.reduce_scan_args)?,
        };

        (0..groups)
            .into_par_iter()
            .try_for_each(|group_id| kernels::run_group(&resources, group_id))
    }
}

impl Device for CpuDevice {
    type CommandList = CpuCommandList;

    fn create_buffer(&mut self, desc: &BufferDesc) -> Result<BufferHandle, DeviceError> {
        if desc.size % WORD != 0 {
            return Err(DeviceError::InvalidSize {
                label: desc.label.clone(),
                size: desc.size,
            });
        }
        if !desc.usage.allows(desc.initial_state) {
            return Err(DeviceError::UnsupportedState {
                label: desc.label.clone(),
                state: desc.initial_state,
            });
        }
        if let Some(budget) = self.memory_budget {
            let available = budget.saturating_sub(self.allocated);
            if desc.size > available {
                return Err(DeviceError::OutOfMemory {
                    requested: desc.size,
                    available,
                });
            }
        }

        let words = (0..desc.size / WORD).map(|_| AtomicU32::new(0)).collect();
        let handle = BufferHandle(self.buffers.len() as u32);
        self.buffers.push(Some(CpuBuffer {
            label: desc.label.clone(),
            words,
            usage: desc.usage,
            state: desc.initial_state,
        }));
        self.allocated += desc.size;

        log::debug!(
            "created buffer `{}` ({} bytes, stride {})",
            desc.label,
            desc.size,
            desc.stride
        );
        Ok(handle)
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        match self.buffers.get_mut(buffer.0 as usize).and_then(Option::take) {
            Some(released) => {
                self.allocated -= released.size();
                log::debug!("destroyed buffer `{}`", released.label);
            }
            None => log::warn!("destroy of unknown buffer {:?}", buffer),
        }
    }

    fn create_pipeline(
        &mut self,
        stage: Stage,
        defines: &[(&str, bool)],
    ) -> Result<PipelineHandle, DeviceError> {
        let mut has_payload = false;
        for &(name, value) in defines {
            if name != HAS_PAYLOAD_DEFINE {
                return Err(DeviceError::UnknownDefine(name.to_string()));
            }
            has_payload = value;
        }

        let handle = PipelineHandle(self.pipelines.len() as u32);
        self.pipelines.push(CpuPipeline { stage, has_payload });
        log::debug!(
            "created pipeline {} (HAS_PAYLOAD={})",
            stage.kernel_name(),
            has_payload
        );
        Ok(handle)
    }

    fn create_command_list(&self) -> CpuCommandList {
        CpuCommandList::default()
    }

    fn submit(&mut self, list: CpuCommandList) -> Result<(), DeviceError> {
        let mut hazards = HazardTracker::default();
        for command in list.commands {
            self.replay(command, &mut hazards)?;
        }
        Ok(())
    }

    fn write_buffer(
        &mut self,
        buffer: BufferHandle,
        offset: u64,
        data: &[u32],
    ) -> Result<(), DeviceError> {
        let target = self.buffer(buffer)?;
        let range = target.range(offset, data.len())?;
        for (slot, &word) in target.words[range].iter().zip(data) {
            slot.store(word, Ordering::Relaxed);
        }
        Ok(())
    }

    fn read_buffer(
        &self,
        buffer: BufferHandle,
        offset: u64,
        len: usize,
    ) -> Result<Vec<u32>, DeviceError> {
        let source = self.buffer(buffer)?;
        let range = source.range(offset, len)?;
        Ok(source.words[range]
            .iter()
            .map(|w| w.load(Ordering::Relaxed))
            .collect())
    }
}
