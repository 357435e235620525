//! Sort Kernels
//!
//! The six data-parallel kernels of a digit pass, written against
//! word-addressed device memory. Every kernel is a function of one thread
//! group; a backend launches as many groups as the dispatch asks for, in any
//! order and concurrently.
//!
//! ## Per-Pass Data Flow
//!
//! 1. **SetupIndirectArgs**: derive constants and dispatch widths from a GPU-resident key count
//! 2. **Count**: 16-bin digit histogram per group into the sum table
//! 3. **Reduce**: fold each bin's row of the sum table into partial sums
//! 4. **Scan**: exclusive prefix sum over the partial sums (single group)
//! 5. **ScanAdd**: turn the sum table into global per-(bin, group) offsets
//! 6. **Scatter**: rank keys inside each group and write them to their offsets
//!
//! Count and Scatter walk a group's keys in the same order, so the offsets
//! produced from Count's histograms match the ranks Scatter recomputes.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::device::{Bindings, BufferHandle, ResourceState, RootConstants, Stage};
use crate::error::DeviceError;
use crate::params::{
    digit, DispatchSizes, ParallelSortConstants, SORT_BIN_COUNT, THREADGROUP_SIZE,
};

const BINS: usize = SORT_BIN_COUNT as usize;
const GROUP_THREADS: usize = THREADGROUP_SIZE as usize;

/// Bounds-checked view of a device buffer starting at a word offset.
#[derive(Clone, Copy)]
pub(crate) struct GpuBuffer<'a> {
    label: &'a str,
    words: &'a [AtomicU32],
    base: usize,
}

impl<'a> GpuBuffer<'a> {
    pub(crate) fn new(label: &'a str, words: &'a [AtomicU32], base: usize) -> Self {
        Self { label, words, base }
    }

    fn slot(&self, index: u32) -> Result<&AtomicU32, DeviceError> {
        let at = self.base + index as usize;
        self.words.get(at).ok_or_else(|| DeviceError::OutOfBounds {
            label: self.label.to_string(),
            index: at as u64,
            len: self.words.len(),
        })
    }

    #[inline]
    pub(crate) fn load(&self, index: u32) -> Result<u32, DeviceError> {
        Ok(self.slot(index)?.load(Ordering::Relaxed))
    }

    #[inline]
    pub(crate) fn store(&self, index: u32, value: u32) -> Result<(), DeviceError> {
        self.slot(index)?.store(value, Ordering::Relaxed);
        Ok(())
    }
}

/// How a kernel touches a bound buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Access {
    Read,
    Write,
    ReadWrite,
}

impl Access {
    pub(crate) fn reads(self) -> bool {
        matches!(self, Access::Read | Access::ReadWrite)
    }

    pub(crate) fn writes(self) -> bool {
        matches!(self, Access::Write | Access::ReadWrite)
    }
}

/// One buffer a dispatch will touch and the state it must be in.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BufferAccess {
    pub buffer: BufferHandle,
    pub binding: &'static str,
    pub access: Access,
    pub state: ResourceState,
}

/// Every buffer `stage` touches given `bindings`, or the first missing slot.
pub(crate) fn accesses(
    stage: Stage,
    has_payload: bool,
    bindings: &Bindings,
) -> Result<Vec<BufferAccess>, DeviceError> {
    use Access::*;
    use ResourceState::*;

    let need = |slot: Option<BufferHandle>, binding: &'static str, access, state| {
        slot.map(|buffer| BufferAccess {
            buffer,
            binding,
            access,
            state,
        })
        .ok_or(DeviceError::MissingBinding { stage, binding })
    };
    let constants = || {
        need(
            bindings.constants.map(|s| s.buffer),
            "constants",
            Read,
            ConstantBufferRead,
        )
    };

    let list = match stage {
        Stage::SetupIndirectArgs => vec![
            need(bindings.num_keys, "num_keys", Read, UnorderedAccess)?,
            need(
                bindings.indirect_constants.map(|s| s.buffer),
                "indirect_constants",
                Write,
                UnorderedAccess,
            )?,
            need(bindings.count_scatter_args, "count_scatter_args", Write, UnorderedAccess)?,
            need(bindings.reduce_scan_args, "reduce_scan_args", Write, UnorderedAccess)?,
        ],
        Stage::Count => vec![
            constants()?,
            need(bindings.src_keys, "src_keys", Read, UnorderedAccess)?,
            need(bindings.sum_table, "sum_table", Write, UnorderedAccess)?,
        ],
        Stage::Reduce => vec![
            constants()?,
            need(bindings.sum_table, "sum_table", Read, UnorderedAccess)?,
            need(bindings.reduce_table, "reduce_table", Write, UnorderedAccess)?,
        ],
        Stage::Scan => vec![
            constants()?,
            need(bindings.reduce_table, "reduce_table", ReadWrite, UnorderedAccess)?,
        ],
        Stage::ScanAdd => vec![
            constants()?,
            need(bindings.reduce_table, "reduce_table", Read, UnorderedAccess)?,
            need(bindings.sum_table, "sum_table", ReadWrite, UnorderedAccess)?,
        ],
        Stage::Scatter => {
            let payload_bound = bindings.src_payload.is_some() || bindings.dst_payload.is_some();
            if payload_bound && !has_payload {
                return Err(DeviceError::VariantMismatch {
                    stage,
                    compiled: has_payload,
                });
            }

            let mut list = vec![
                constants()?,
                need(bindings.src_keys, "src_keys", Read, UnorderedAccess)?,
                need(bindings.dst_keys, "dst_keys", Write, UnorderedAccess)?,
                need(bindings.sum_table, "sum_table", Read, UnorderedAccess)?,
            ];
            if has_payload {
                list.push(need(bindings.src_payload, "src_payload", Read, UnorderedAccess)?);
                list.push(need(bindings.dst_payload, "dst_payload", Write, UnorderedAccess)?);
            }
            list
        }
    };

    Ok(list)
}

/// Buffers and constants resolved for one dispatch.
pub(crate) struct KernelResources<'a> {
    pub stage: Stage,
    pub has_payload: bool,
    pub constants: ParallelSortConstants,
    pub root: RootConstants,
    pub src_keys: Option<GpuBuffer<'a>>,
    pub dst_keys: Option<GpuBuffer<'a>>,
    pub src_payload: Option<GpuBuffer<'a>>,
    pub dst_payload: Option<GpuBuffer<'a>>,
    pub sum_table: Option<GpuBuffer<'a>>,
    pub reduce_table: Option<GpuBuffer<'a>>,
    pub num_keys: Option<GpuBuffer<'a>>,
    pub indirect_constants: Option<GpuBuffer<'a>>,
    pub count_scatter_args: Option<GpuBuffer<'a>>,
    pub reduce_scan_args: Option<GpuBuffer<'a>>,
}

impl<'a> KernelResources<'a> {
    fn bound(
        &self,
        slot: Option<GpuBuffer<'a>>,
        binding: &'static str,
    ) -> Result<GpuBuffer<'a>, DeviceError> {
        slot.ok_or(DeviceError::MissingBinding {
            stage: self.stage,
            binding,
        })
    }
}

/// Run thread group `group_id` of the kernel selected by `res.stage`.
pub(crate) fn run_group(res: &KernelResources<'_>, group_id: u32) -> Result<(), DeviceError> {
    match res.stage {
        Stage::SetupIndirectArgs => setup_indirect_args(res, group_id),
        Stage::Count => count(res, group_id),
        Stage::Reduce => reduce(res, group_id),
        Stage::Scan => scan(res, group_id),
        Stage::ScanAdd => scan_add(res, group_id),
        Stage::Scatter => scatter(res, group_id),
    }
}

fn setup_indirect_args(res: &KernelResources<'_>, group_id: u32) -> Result<(), DeviceError> {
    if group_id != 0 {
        return Ok(());
    }
    let num_keys_buffer = res.bound(res.num_keys, "num_keys")?;
    let constants_out = res.bound(res.indirect_constants, "indirect_constants")?;
    let count_scatter_args = res.bound(res.count_scatter_args, "count_scatter_args")?;
    let reduce_scan_args = res.bound(res.reduce_scan_args, "reduce_scan_args")?;

    let num_keys = num_keys_buffer.load(0)?.min(res.root.max_entries);
    let sizes = DispatchSizes::derive(num_keys, res.root.max_thread_groups);

    let words = sizes.constants.with_shift(res.root.shift).to_words();
    for (i, &word) in words.iter().enumerate() {
        constants_out.store(i as u32, word)?;
    }

    for (args, groups) in [
        (count_scatter_args, sizes.num_thread_groups_to_run),
        (reduce_scan_args, sizes.num_reduced_thread_groups_to_run),
    ] {
        args.store(0, groups)?;
        args.store(1, 1)?;
        args.store(2, 1)?;
    }

    Ok(())
}

fn count(res: &KernelResources<'_>, group_id: u32) -> Result<(), DeviceError> {
    let c = &res.constants;
    let src = res.bound(res.src_keys, "src_keys")?;
    let sum_table = res.bound(res.sum_table, "sum_table")?;

    let mut histogram = [0u32; BINS];
    for index in c.block_range(group_id).keys(c.num_keys) {
        histogram[digit(src.load(index)?, c.shift)] += 1;
    }

    for (bin, &total) in histogram.iter().enumerate() {
        sum_table.store(c.sum_table_index(bin as u32, group_id), total)?;
    }
    Ok(())
}

fn reduce(res: &KernelResources<'_>, group_id: u32) -> Result<(), DeviceError> {
    let c = &res.constants;
    let sum_table = res.bound(res.sum_table, "sum_table")?;
    let reduce_table = res.bound(res.reduce_table, "reduce_table")?;

    let span = c.reduce_span(group_id);
    let mut total = 0u32;
    for column in span.begin..span.end {
        total += sum_table.load(span.bin_offset + column)?;
    }

    reduce_table.store(group_id, total)
}

fn scan(res: &KernelResources<'_>, group_id: u32) -> Result<(), DeviceError> {
    if group_id != 0 {
        return Ok(());
    }
    let c = &res.constants;
    let reduce_table = res.bound(res.reduce_table, "reduce_table")?;

    let mut carry = 0u32;
    for index in 0..c.num_scan_values {
        let value = reduce_table.load(index)?;
        reduce_table.store(index, carry)?;
        carry += value;
    }
    Ok(())
}

fn scan_add(res: &KernelResources<'_>, group_id: u32) -> Result<(), DeviceError> {
    let c = &res.constants;
    let reduce_table = res.bound(res.reduce_table, "reduce_table")?;
    let sum_table = res.bound(res.sum_table, "sum_table")?;

    let span = c.reduce_span(group_id);
    let mut running = reduce_table.load(group_id)?;
    for column in span.begin..span.end {
        let index = span.bin_offset + column;
        let local = sum_table.load(index)?;
        sum_table.store(index, running)?;
        running += local;
    }
    Ok(())
}

fn scatter(res: &KernelResources<'_>, group_id: u32) -> Result<(), DeviceError> {
    let c = &res.constants;
    let src = res.bound(res.src_keys, "src_keys")?;
    let dst = res.bound(res.dst_keys, "dst_keys")?;
    let sum_table = res.bound(res.sum_table, "sum_table")?;
    let payload = if res.has_payload {
        Some((
            res.bound(res.src_payload, "src_payload")?,
            res.bound(res.dst_payload, "dst_payload")?,
        ))
    } else {
        None
    };

    let mut bin_offsets = [0u32; BINS];
    for (bin, offset) in bin_offsets.iter_mut().enumerate() {
        *offset = sum_table.load(c.sum_table_index(bin as u32, group_id))?;
    }

    // Thread-group local storage
    let mut keys = [0u32; GROUP_THREADS];
    let mut values = [0u32; GROUP_THREADS];
    let mut sorted = [(0u32, 0u32); GROUP_THREADS];

    let range = c.block_range(group_id).keys(c.num_keys);
    let mut chunk_start = range.start;
    while chunk_start < range.end {
        let len = (range.end - chunk_start).min(THREADGROUP_SIZE) as usize;

        let mut local_histogram = [0u32; BINS];
        for j in 0..len {
            let index = chunk_start + j as u32;
            keys[j] = src.load(index)?;
            if let Some((src_payload, _)) = payload {
                values[j] = src_payload.load(index)?;
            }
            local_histogram[digit(keys[j], c.shift)] += 1;
        }

        // Stable local sort of the chunk by digit
        let mut local_offsets = [0u32; BINS];
        let mut sum = 0;
        for (offset, &count) in local_offsets.iter_mut().zip(&local_histogram) {
            *offset = sum;
            sum += count;
        }
        let mut cursor = local_offsets;
        for j in 0..len {
            let bin = digit(keys[j], c.shift);
            sorted[cursor[bin] as usize] = (keys[j], values[j]);
            cursor[bin] += 1;
        }

        for (slot, &(key, value)) in sorted[..len].iter().enumerate() {
            let bin = digit(key, c.shift);
            let target = bin_offsets[bin] + (slot as u32 - local_offsets[bin]);
            dst.store(target, key)?;
            if let Some((_, dst_payload)) = payload {
                dst_payload.store(target, value)?;
            }
        }

        for (offset, &count) in bin_offsets.iter_mut().zip(&local_histogram) {
            *offset += count;
        }
        chunk_start += len as u32;
    }
    Ok(())
}
