//! Sort Parameters and Dispatch Sizing
//!
//! Engine-wide constants and the pure indexing math shared by the host
//! (direct mode) and the `SetupIndirectArgs` kernel (indirect mode).
//!
//! ## Work Decomposition
//!
//! Keys are split into *blocks* of `ELEMENTS_PER_THREAD * THREADGROUP_SIZE`
//! keys. At most `max_thread_groups` thread groups are launched; when there
//! are more blocks than groups, every group processes
//! `num_blocks / max_thread_groups` blocks and the last
//! `num_blocks % max_thread_groups` groups take one extra block each.
//!
//! The per-block histograms live in a bin-major *sum table*
//! (`sum_table[bin * num_thread_groups + group]`). The reduce stage folds
//! each bin's row into `num_reduce_threadgroup_per_bin` partial sums so the
//! single-group scan only ever touches a handful of values.

use bytemuck::{Pod, Zeroable};

/// Number of bits sorted per digit pass
pub const SORT_BITS_PER_PASS: u32 = 4;
/// Number of bins per digit (2^SORT_BITS_PER_PASS)
pub const SORT_BIN_COUNT: u32 = 1 << SORT_BITS_PER_PASS;
/// Keys loaded per thread per block
pub const ELEMENTS_PER_THREAD: u32 = 4;
/// Threads per thread group
pub const THREADGROUP_SIZE: u32 = 128;
/// Keys covered by one block
pub const BLOCK_SIZE: u32 = ELEMENTS_PER_THREAD * THREADGROUP_SIZE;
/// Width of a sort key in bits
pub const KEY_BITS: u32 = 32;
/// Digit passes needed to cover a full key
pub const NUM_PASSES: u32 = KEY_BITS / SORT_BITS_PER_PASS;
/// Default upper bound on thread groups per Count/Scatter dispatch
pub const DEFAULT_MAX_THREADGROUPS: u32 = 800;

const DIGIT_MASK: u32 = SORT_BIN_COUNT - 1;

/// Extract the digit of `key` processed by the pass with the given `shift`.
#[inline]
pub fn digit(key: u32, shift: u32) -> usize {
    ((key >> shift) & DIGIT_MASK) as usize
}

/// Bit offset of the digit handled by `pass`.
#[inline]
pub fn pass_shift(pass: u32) -> u32 {
    pass * SORT_BITS_PER_PASS
}

/// Per-pass constants consumed by every sort kernel.
///
/// Laid out as eight 32-bit words so it can be written into a constant
/// buffer slot directly, either by the host or by `SetupIndirectArgs`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct ParallelSortConstants {
    pub num_keys: u32,
    pub num_blocks_per_thread_group: u32,
    pub num_thread_groups: u32,
    pub num_thread_groups_with_additional_blocks: u32,
    pub num_reduce_threadgroup_per_bin: u32,
    pub num_scan_values: u32,
    pub shift: u32,
    _pad: u32,
}

/// Size of one constants record in 32-bit words.
pub const CONSTANTS_WORDS: usize = std::mem::size_of::<ParallelSortConstants>() / 4;
/// Size of one constants record in bytes.
pub const CONSTANTS_SIZE: u64 = std::mem::size_of::<ParallelSortConstants>() as u64;

impl ParallelSortConstants {
    /// Copy of these constants for the pass with the given `shift`.
    pub fn with_shift(mut self, shift: u32) -> Self {
        self.shift = shift;
        self
    }

    pub fn to_words(&self) -> [u32; CONSTANTS_WORDS] {
        bytemuck::cast(*self)
    }

    pub fn from_words(words: [u32; CONSTANTS_WORDS]) -> Self {
        bytemuck::cast(words)
    }

    /// Blocks assigned to thread group `group_id`.
    ///
    /// The trailing `num_thread_groups_with_additional_blocks` groups own
    /// one block more than the others, so each of them is shifted right by
    /// the number of extra blocks handed out before it.
    pub fn block_range(&self, group_id: u32) -> BlockRange {
        let mut first_block = group_id * self.num_blocks_per_thread_group;
        let mut num_blocks = self.num_blocks_per_thread_group;

        let first_extended =
            self.num_thread_groups - self.num_thread_groups_with_additional_blocks;
        if group_id >= first_extended {
            first_block += group_id - first_extended;
            num_blocks += 1;
        }

        BlockRange {
            first_block,
            num_blocks,
        }
    }

    /// Bin and sum-table span owned by reduce/scan-add group `group_id`.
    pub fn reduce_span(&self, group_id: u32) -> ReduceSpan {
        let per_bin = self.num_reduce_threadgroup_per_bin.max(1);
        let bin = group_id / per_bin;
        let begin = (group_id % per_bin) * BLOCK_SIZE;
        let end = (begin + BLOCK_SIZE).min(self.num_thread_groups);
        ReduceSpan {
            bin_offset: bin * self.num_thread_groups,
            begin,
            end: end.max(begin),
        }
    }

    /// Index of `(bin, group)` in the bin-major sum table.
    #[inline]
    pub fn sum_table_index(&self, bin: u32, group_id: u32) -> u32 {
        bin * self.num_thread_groups + group_id
    }
}

/// Contiguous run of blocks processed by one Count/Scatter thread group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRange {
    pub first_block: u32,
    pub num_blocks: u32,
}

impl BlockRange {
    /// Key index range `[start, end)` covered by this group, clipped to `num_keys`.
    pub fn keys(&self, num_keys: u32) -> std::ops::Range<u32> {
        let start = (self.first_block as u64 * BLOCK_SIZE as u64).min(num_keys as u64) as u32;
        let end = ((self.first_block + self.num_blocks) as u64 * BLOCK_SIZE as u64)
            .min(num_keys as u64) as u32;
        start..end
    }
}

/// Row segment of the sum table reduced (or scan-added) by one thread group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReduceSpan {
    /// Start of the bin's row in the sum table
    pub bin_offset: u32,
    /// First thread-group column in the row
    pub begin: u32,
    /// One past the last thread-group column in the row
    pub end: u32,
}

/// Everything needed to record one sort: per-pass constants (minus the
/// shift) and the two dispatch widths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchSizes {
    pub constants: ParallelSortConstants,
    pub num_thread_groups_to_run: u32,
    pub num_reduced_thread_groups_to_run: u32,
}

impl DispatchSizes {
    /// Derive the work decomposition for `num_keys` keys with at most
    /// `max_thread_groups` Count/Scatter groups.
    ///
    /// Zero keys yields zero thread groups for every stage.
    pub fn derive(num_keys: u32, max_thread_groups: u32) -> Self {
        let max_thread_groups = max_thread_groups.max(1);
        let num_blocks = num_keys.div_ceil(BLOCK_SIZE);

        let (num_thread_groups, blocks_per_group, with_additional) =
            if num_blocks < max_thread_groups {
                (num_blocks, 1, 0)
            } else {
                (
                    max_thread_groups,
                    num_blocks / max_thread_groups,
                    num_blocks % max_thread_groups,
                )
            };

        let num_reduced = if num_thread_groups == 0 {
            0
        } else if num_thread_groups >= BLOCK_SIZE {
            SORT_BIN_COUNT * num_thread_groups.div_ceil(BLOCK_SIZE)
        } else {
            SORT_BIN_COUNT
        };

        let constants = ParallelSortConstants {
            num_keys,
            num_blocks_per_thread_group: blocks_per_group,
            num_thread_groups,
            num_thread_groups_with_additional_blocks: with_additional,
            num_reduce_threadgroup_per_bin: num_reduced / SORT_BIN_COUNT,
            num_scan_values: num_reduced,
            shift: 0,
            _pad: 0,
        };

        Self {
            constants,
            num_thread_groups_to_run: num_thread_groups,
            num_reduced_thread_groups_to_run: num_reduced,
        }
    }

    /// Constants for the given digit pass.
    pub fn constants_for_pass(&self, pass: u32) -> ParallelSortConstants {
        self.constants.with_shift(pass_shift(pass))
    }
}

/// Byte sizes of the sum table and the reduced sum table for an engine
/// that sorts at most `max_entries` keys.
///
/// Covers every index the sort kernels can touch for any
/// `num_keys <= max_entries` and any thread-group budget.
pub fn calculate_scratch_resource_size(max_entries: u32) -> (u32, u32) {
    let num_blocks = max_entries.div_ceil(BLOCK_SIZE);
    let num_reduced_blocks = num_blocks.div_ceil(BLOCK_SIZE);

    let word = std::mem::size_of::<u32>() as u32;
    let scratch_size = SORT_BIN_COUNT * num_blocks * word;
    let reduced_scratch_size = SORT_BIN_COUNT * num_reduced_blocks * word;

    (scratch_size, reduced_scratch_size)
}
