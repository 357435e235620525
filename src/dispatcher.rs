//! Direct and Indirect Dispatch
//!
//! The engine records the same five stages per digit pass in both modes.
//! What differs is where the thread-group counts and per-pass constants
//! come from:
//!
//! - [`DirectDispatcher`]: the host knows the key count, derives the sizes
//!   once and uploads all eight constants slots before the first pass.
//! - [`IndirectDispatcher`]: the key count lives in a GPU buffer.
//!   `SetupIndirectArgs` runs at the top of every pass and writes the pass's
//!   constants slot and two indirect argument triples, which the sort stages
//!   then consume through `dispatch_indirect`.

use crate::device::{
    Bindings, BufferHandle, CommandList, PipelineHandle, ResourceState, Stage,
};
use crate::params::{DispatchSizes, NUM_PASSES};

/// Which dispatch width a stage uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Workload {
    /// One group per Count/Scatter thread group
    CountScatter,
    /// One group per (bin, reduce slice)
    ReduceScanAdd,
    /// A single group
    Single,
}

impl Workload {
    pub(crate) fn of(stage: Stage) -> Self {
        match stage {
            Stage::Count | Stage::Scatter => Workload::CountScatter,
            Stage::Reduce | Stage::ScanAdd => Workload::ReduceScanAdd,
            Stage::Scan | Stage::SetupIndirectArgs => Workload::Single,
        }
    }
}

/// Engine-owned buffers backing indirect dispatch.
#[derive(Debug, Clone, Copy)]
pub(crate) struct IndirectResources {
    /// One constants slot per pass, written by `SetupIndirectArgs`
    pub constant_buffer: BufferHandle,
    pub count_scatter_args: BufferHandle,
    pub reduce_scan_args: BufferHandle,
}

impl IndirectResources {
    fn transition_for_read<C: CommandList>(&self, cmd: &mut C) {
        use ResourceState::*;
        cmd.transition(self.count_scatter_args, UnorderedAccess, IndirectArgument);
        cmd.transition(self.reduce_scan_args, UnorderedAccess, IndirectArgument);
        cmd.transition(self.constant_buffer, UnorderedAccess, ConstantBufferRead);
    }

    fn transition_for_write<C: CommandList>(&self, cmd: &mut C) {
        use ResourceState::*;
        cmd.transition(self.count_scatter_args, IndirectArgument, UnorderedAccess);
        cmd.transition(self.reduce_scan_args, IndirectArgument, UnorderedAccess);
        cmd.transition(self.constant_buffer, ConstantBufferRead, UnorderedAccess);
    }
}

/// Source of dispatch widths for a sort.
pub(crate) trait Dispatcher {
    /// Recorded once before the first pass.
    fn begin_sort<C: CommandList>(&self, _cmd: &mut C) {}

    /// Recorded at the top of `pass`, before Count.
    fn begin_pass<C: CommandList>(&self, _cmd: &mut C, _pass: u32) {}

    fn dispatch<C: CommandList>(
        &self,
        cmd: &mut C,
        pipeline: PipelineHandle,
        bindings: &Bindings,
        workload: Workload,
    );

    /// Recorded after Scatter's barrier, before the buffers swap roles.
    fn end_pass<C: CommandList>(&self, _cmd: &mut C, _pass: u32) {}
}

/// Host-computed dispatch widths.
pub(crate) struct DirectDispatcher {
    sizes: DispatchSizes,
    constant_buffer: BufferHandle,
}

impl DirectDispatcher {
    pub(crate) fn new(sizes: DispatchSizes, constant_buffer: BufferHandle) -> Self {
        Self {
            sizes,
            constant_buffer,
        }
    }
}

impl Dispatcher for DirectDispatcher {
    fn begin_sort<C: CommandList>(&self, cmd: &mut C) {
        let words: Vec<u32> = (0..NUM_PASSES)
            .flat_map(|pass| self.sizes.constants_for_pass(pass).to_words())
            .collect();

        cmd.transition(
            self.constant_buffer,
            ResourceState::ConstantBufferRead,
            ResourceState::CopyDest,
        );
        cmd.update_buffer(self.constant_buffer, 0, &words);
        cmd.transition(
            self.constant_buffer,
            ResourceState::CopyDest,
            ResourceState::ConstantBufferRead,
        );
    }

    fn dispatch<C: CommandList>(
        &self,
        cmd: &mut C,
        pipeline: PipelineHandle,
        bindings: &Bindings,
        workload: Workload,
    ) {
        let groups = match workload {
            Workload::CountScatter => self.sizes.num_thread_groups_to_run,
            Workload::ReduceScanAdd => self.sizes.num_reduced_thread_groups_to_run,
            Workload::Single => 1,
        };
        cmd.dispatch(pipeline, bindings, groups, 1, 1);
    }
}

/// GPU-computed dispatch widths.
pub(crate) struct IndirectDispatcher<'a> {
    resources: IndirectResources,
    setup_pipeline: PipelineHandle,
    /// Per-pass `SetupIndirectArgs` bindings, key count already attached
    setup_bindings: &'a [Bindings],
}

impl<'a> IndirectDispatcher<'a> {
    pub(crate) fn new(
        resources: IndirectResources,
        setup_pipeline: PipelineHandle,
        setup_bindings: &'a [Bindings],
    ) -> Self {
        Self {
            resources,
            setup_pipeline,
            setup_bindings,
        }
    }
}

impl Dispatcher for IndirectDispatcher<'_> {
    fn begin_pass<C: CommandList>(&self, cmd: &mut C, pass: u32) {
        cmd.dispatch(
            self.setup_pipeline,
            &self.setup_bindings[pass as usize],
            1,
            1,
            1,
        );
        cmd.uav_barrier();
        self.resources.transition_for_read(cmd);
    }

    fn dispatch<C: CommandList>(
        &self,
        cmd: &mut C,
        pipeline: PipelineHandle,
        bindings: &Bindings,
        workload: Workload,
    ) {
        match workload {
            Workload::CountScatter => {
                cmd.dispatch_indirect(pipeline, bindings, self.resources.count_scatter_args, 0)
            }
            Workload::ReduceScanAdd => {
                cmd.dispatch_indirect(pipeline, bindings, self.resources.reduce_scan_args, 0)
            }
            Workload::Single => cmd.dispatch(pipeline, bindings, 1, 1, 1),
        }
    }

    fn end_pass<C: CommandList>(&self, cmd: &mut C, _pass: u32) {
        self.resources.transition_for_write(cmd);
    }
}
