//! ParallelSort Engine
//!
//! Owns the scratch buffers, pipelines and per-pass bindings for sorting up
//! to `max_entries` 32-bit keys (optionally with a 32-bit payload), and
//! records the full 8-pass radix sort into a command list.
//!
//! ## Pass Layout
//!
//! Each pass processes 4 bits and ping-pongs between the caller's buffer and
//! an engine-owned scratch buffer of the same size:
//!
//! ```text
//! pass 0: keys    -> scratch   (bits 0..4)
//! pass 1: scratch -> keys      (bits 4..8)
//! ...
//! pass 7: scratch -> keys      (bits 28..32)
//! ```
//!
//! Eight is even, so the sorted data always lands back in the caller's buffer.

use crate::config::SortConfig;
use crate::device::{
    Bindings, BufferDesc, BufferHandle, BufferSlice, BufferUsage, CommandList, Device,
    KernelVariant, PipelineHandle, ResourceState, RootConstants, Stage,
};
use crate::dispatcher::{
    DirectDispatcher, Dispatcher, IndirectDispatcher, IndirectResources, Workload,
};
use crate::error::{DeviceError, SortError};
use crate::params::{
    calculate_scratch_resource_size, pass_shift, DispatchSizes, CONSTANTS_SIZE, NUM_PASSES,
};

const WORD: u64 = std::mem::size_of::<u32>() as u64;

/// A caller buffer and its scratch twin; `pass & 1` selects the source.
#[derive(Debug, Clone, Copy)]
struct PingPong {
    buffers: [BufferHandle; 2],
}

impl PingPong {
    fn new(caller: BufferHandle, scratch: BufferHandle) -> Self {
        Self {
            buffers: [caller, scratch],
        }
    }

    fn src(&self, pass: u32) -> BufferHandle {
        self.buffers[(pass & 1) as usize]
    }

    fn dst(&self, pass: u32) -> BufferHandle {
        self.buffers[((pass & 1) ^ 1) as usize]
    }
}

#[derive(Debug, Clone, Copy)]
struct Pipelines {
    setup: Option<PipelineHandle>,
    sort: [PipelineHandle; 5],
}

/// Bindings for one pass, built at init. Key and payload slots are filled
/// in per `execute` call.
#[derive(Debug, Clone)]
struct PassBindings {
    setup: Option<Bindings>,
    stages: [Bindings; 5],
}

/// Buffers created during init, released again if init fails part way.
struct Allocations<'d, D: Device> {
    device: &'d mut D,
    created: Vec<BufferHandle>,
}

impl<D: Device> Allocations<'_, D> {
    fn buffer(&mut self, desc: BufferDesc) -> Result<BufferHandle, DeviceError> {
        let handle = self.device.create_buffer(&desc)?;
        self.created.push(handle);
        Ok(handle)
    }

    fn release(self) {
        for handle in self.created.into_iter().rev() {
            self.device.destroy_buffer(handle);
        }
    }
}

/// GPU radix sort engine for 32-bit keys with an optional 32-bit payload.
///
/// Only one sort may be in flight per engine: every `execute` reuses the
/// same scratch buffers.
#[derive(Debug)]
pub struct ParallelSort {
    max_entries: u32,
    variant: KernelVariant,
    config: SortConfig,
    sort_scratch: BufferHandle,
    payload_scratch: Option<BufferHandle>,
    scratch_buffer: BufferHandle,
    reduced_scratch_buffer: BufferHandle,
    /// Direct mode: one host-written constants slot per pass
    constant_buffer: Option<BufferHandle>,
    indirect: Option<IndirectResources>,
    pipelines: Pipelines,
    passes: Vec<PassBindings>,
    live: bool,
}

impl ParallelSort {
    /// Allocate scratch buffers and pipelines for sorting up to
    /// `max_entries` keys.
    ///
    /// On failure every buffer created so far is released again.
    pub fn init<D: Device>(
        device: &mut D,
        max_entries: u32,
        has_payload: bool,
        indirect: bool,
        config: &SortConfig,
    ) -> Result<Self, SortError> {
        if config.max_thread_groups == 0 {
            return Err(SortError::InvalidThreadGroupBudget);
        }

        let variant = KernelVariant {
            payload: has_payload,
            indirect,
        };
        let mut allocations = Allocations {
            device,
            created: Vec::new(),
        };

        match Self::allocate(&mut allocations, max_entries, variant, *config) {
            Ok(engine) => Ok(engine),
            Err(err) => {
                log::warn!("parallel sort init failed: {err}");
                allocations.release();
                Err(err.into())
            }
        }
    }

    fn allocate<D: Device>(
        allocations: &mut Allocations<'_, D>,
        max_entries: u32,
        variant: KernelVariant,
        config: SortConfig,
    ) -> Result<Self, DeviceError> {
        let (scratch_size, reduced_scratch_size) = calculate_scratch_resource_size(max_entries);
        let keys_size = max_entries as u64 * WORD;
        let constants_size = NUM_PASSES as u64 * CONSTANTS_SIZE;

        log::debug!(
            "parallel sort init: max_entries={max_entries}, payload={}, indirect={}, \
             scratch={scratch_size}B, reduced scratch={reduced_scratch_size}B",
            variant.payload,
            variant.indirect
        );

        let sort_scratch = allocations.buffer(BufferDesc::storage("sort scratch", keys_size))?;
        let payload_scratch = if variant.payload {
            Some(allocations.buffer(BufferDesc::storage("payload scratch", keys_size))?)
        } else {
            None
        };
        let scratch_buffer =
            allocations.buffer(BufferDesc::storage("sum table", scratch_size as u64))?;
        let reduced_scratch_buffer = allocations.buffer(BufferDesc::storage(
            "reduced sum table",
            reduced_scratch_size as u64,
        ))?;

        let args = |label: &str| {
            BufferDesc::storage(label, 3 * WORD)
                .with_usage(BufferUsage::STORAGE | BufferUsage::INDIRECT)
        };
        let (constant_buffer, indirect, constants_buffer) = if variant.indirect {
            let resources = IndirectResources {
                constant_buffer: allocations.buffer(
                    BufferDesc::storage("indirect constants", constants_size)
                        .with_usage(BufferUsage::STORAGE | BufferUsage::CONSTANT)
                        .with_stride(CONSTANTS_SIZE as u32),
                )?,
                count_scatter_args: allocations.buffer(args("count/scatter indirect args"))?,
                reduce_scan_args: allocations.buffer(args("reduce/scan indirect args"))?,
            };
            (None, Some(resources), resources.constant_buffer)
        } else {
            let buffer = allocations.buffer(
                BufferDesc::storage("sort constants", constants_size)
                    .with_usage(BufferUsage::CONSTANT)
                    .with_stride(CONSTANTS_SIZE as u32)
                    .with_initial_state(ResourceState::ConstantBufferRead),
            )?;
            (Some(buffer), None, buffer)
        };

        let defines = variant.defines();
        let mut setup = None;
        let mut sort = [PipelineHandle(0); 5];
        for stage in variant.stages() {
            let pipeline = allocations.device.create_pipeline(stage, &defines)?;
            match stage {
                Stage::SetupIndirectArgs => setup = Some(pipeline),
                // Sort stages follow setup in stage order
                _ => sort[stage.index() - 1] = pipeline,
            }
        }

        let passes = (0..NUM_PASSES)
            .map(|pass| {
                let constants = BufferSlice {
                    buffer: constants_buffer,
                    offset: pass as u64 * CONSTANTS_SIZE,
                };
                let setup = indirect.map(|r| Bindings {
                    indirect_constants: Some(constants),
                    count_scatter_args: Some(r.count_scatter_args),
                    reduce_scan_args: Some(r.reduce_scan_args),
                    root_constants: RootConstants {
                        max_thread_groups: config.max_thread_groups,
                        max_entries,
                        shift: pass_shift(pass),
                    },
                    ..Default::default()
                });
                PassBindings {
                    setup,
                    stages: Stage::SORT_STAGES.map(|stage| {
                        stage_bindings(stage, constants, scratch_buffer, reduced_scratch_buffer)
                    }),
                }
            })
            .collect();

        Ok(Self {
            max_entries,
            variant,
            config,
            sort_scratch,
            payload_scratch,
            scratch_buffer,
            reduced_scratch_buffer,
            constant_buffer,
            indirect,
            pipelines: Pipelines { setup, sort },
            passes,
            live: true,
        })
    }

    pub fn max_entries(&self) -> u32 {
        self.max_entries
    }

    pub fn has_payload(&self) -> bool {
        self.variant.payload
    }

    pub fn is_indirect(&self) -> bool {
        self.variant.indirect
    }

    /// Record a sort of the first `num_keys` entries of `keys` (and
    /// `payload`). The sorted result ends up in the same buffers.
    ///
    /// Zero keys records nothing.
    pub fn execute<C: CommandList>(
        &self,
        cmd: &mut C,
        num_keys: u32,
        keys: BufferHandle,
        payload: Option<BufferHandle>,
    ) -> Result<(), SortError> {
        if self.variant.indirect {
            return Err(SortError::IndirectEngine);
        }
        self.check_payload(payload)?;
        if num_keys > self.max_entries {
            log::warn!(
                "refusing to sort {num_keys} keys with an engine sized for {}",
                self.max_entries
            );
            return Err(SortError::TooManyKeys {
                requested: num_keys,
                max: self.max_entries,
            });
        }
        if num_keys == 0 {
            log::trace!("parallel sort: nothing to sort");
            return Ok(());
        }

        let constant_buffer = self.constant_buffer.ok_or(SortError::IndirectEngine)?;
        let sizes = DispatchSizes::derive(num_keys, self.config.max_thread_groups);
        log::trace!(
            "parallel sort: {num_keys} keys, {} thread groups, {} reduce groups",
            sizes.num_thread_groups_to_run,
            sizes.num_reduced_thread_groups_to_run
        );

        let dispatcher = DirectDispatcher::new(sizes, constant_buffer);
        self.record_passes(cmd, &dispatcher, keys, payload);
        Ok(())
    }

    /// Record a sort whose key count is read from word 0 of
    /// `num_keys_buffer` when the GPU executes the work.
    ///
    /// Counts above `max_entries` are clamped on the device.
    pub fn execute_indirect<C: CommandList>(
        &self,
        cmd: &mut C,
        num_keys_buffer: BufferHandle,
        keys: BufferHandle,
        payload: Option<BufferHandle>,
    ) -> Result<(), SortError> {
        let (Some(resources), Some(setup_pipeline)) = (self.indirect, self.pipelines.setup) else {
            return Err(SortError::DirectEngine);
        };
        self.check_payload(payload)?;

        let setup_bindings: Vec<Bindings> = self
            .passes
            .iter()
            .filter_map(|pass| pass.setup)
            .map(|setup| Bindings {
                num_keys: Some(num_keys_buffer),
                ..setup
            })
            .collect();

        let dispatcher = IndirectDispatcher::new(resources, setup_pipeline, &setup_bindings);
        self.record_passes(cmd, &dispatcher, keys, payload);
        Ok(())
    }

    fn check_payload(&self, payload: Option<BufferHandle>) -> Result<(), SortError> {
        if payload.is_some() != self.variant.payload {
            log::warn!(
                "payload mismatch: engine has_payload={}, payload provided={}",
                self.variant.payload,
                payload.is_some()
            );
            return Err(SortError::PayloadMismatch {
                expected: self.variant.payload,
                provided: payload.is_some(),
            });
        }
        Ok(())
    }

    fn record_passes<C: CommandList, D: Dispatcher>(
        &self,
        cmd: &mut C,
        dispatcher: &D,
        keys: BufferHandle,
        payload: Option<BufferHandle>,
    ) {
        let keys = PingPong::new(keys, self.sort_scratch);
        let payload = payload
            .zip(self.payload_scratch)
            .map(|(caller, scratch)| PingPong::new(caller, scratch));

        dispatcher.begin_sort(cmd);
        for (pass, pass_bindings) in (0..NUM_PASSES).zip(&self.passes) {
            log::trace!("parallel sort: pass {pass} (shift {})", pass_shift(pass));
            dispatcher.begin_pass(cmd, pass);

            let stages = Stage::SORT_STAGES.iter().zip(&pass_bindings.stages);
            for ((&stage, template), &pipeline) in stages.zip(&self.pipelines.sort) {
                let bindings = bind_buffers(template, stage, pass, &keys, payload.as_ref());
                dispatcher.dispatch(cmd, pipeline, &bindings, Workload::of(stage));
                cmd.uav_barrier();
            }

            dispatcher.end_pass(cmd, pass);
        }
    }

    /// Every device buffer this engine owns.
    pub fn owned_buffers(&self) -> Vec<BufferHandle> {
        let mut buffers = vec![
            self.sort_scratch,
            self.scratch_buffer,
            self.reduced_scratch_buffer,
        ];
        buffers.extend(self.payload_scratch);
        buffers.extend(self.constant_buffer);
        if let Some(indirect) = self.indirect {
            buffers.extend([
                indirect.constant_buffer,
                indirect.count_scatter_args,
                indirect.reduce_scan_args,
            ]);
        }
        buffers
    }

    /// Release every engine-owned buffer.
    pub fn destroy<D: Device>(mut self, device: &mut D) {
        for buffer in self.owned_buffers() {
            device.destroy_buffer(buffer);
        }
        self.live = false;
    }
}

impl Drop for ParallelSort {
    fn drop(&mut self) {
        if self.live {
            log::warn!(
                "ParallelSort dropped without destroy(); {} device buffers still allocated",
                self.owned_buffers().len()
            );
        }
    }
}

fn stage_bindings(
    stage: Stage,
    constants: BufferSlice,
    sum_table: BufferHandle,
    reduce_table: BufferHandle,
) -> Bindings {
    let base = Bindings {
        constants: Some(constants),
        ..Default::default()
    };
    match stage {
        Stage::Count | Stage::Scatter => Bindings {
            sum_table: Some(sum_table),
            ..base
        },
        Stage::Reduce | Stage::ScanAdd => Bindings {
            sum_table: Some(sum_table),
            reduce_table: Some(reduce_table),
            ..base
        },
        Stage::Scan => Bindings {
            reduce_table: Some(reduce_table),
            ..base
        },
        Stage::SetupIndirectArgs => base,
    }
}

fn bind_buffers(
    template: &Bindings,
    stage: Stage,
    pass: u32,
    keys: &PingPong,
    payload: Option<&PingPong>,
) -> Bindings {
    match stage {
        Stage::Count => Bindings {
            src_keys: Some(keys.src(pass)),
            ..*template
        },
        Stage::Scatter => Bindings {
            src_keys: Some(keys.src(pass)),
            dst_keys: Some(keys.dst(pass)),
            src_payload: payload.map(|p| p.src(pass)),
            dst_payload: payload.map(|p| p.dst(pass)),
            ..*template
        },
        _ => *template,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu_device::CpuDevice;
    use crate::cpu_radix_sort;
    use crate::params::{BLOCK_SIZE, DEFAULT_MAX_THREADGROUPS};
    use proptest::prelude::*;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    fn seeded_rng(seed: u64) -> ChaCha8Rng {
        ChaCha8Rng::seed_from_u64(seed)
    }

    fn random_keys(seed: u64, n: usize) -> Vec<u32> {
        let mut rng = seeded_rng(seed);
        (0..n).map(|_| rng.gen()).collect()
    }

    /// Sort `keys` (and `payload`) through a fresh engine and read the result back.
    fn gpu_sort(
        keys: &[u32],
        payload: Option<&[u32]>,
        indirect: bool,
        config: SortConfig,
    ) -> (Vec<u32>, Option<Vec<u32>>, CpuDevice) {
        let mut device = CpuDevice::new();
        let n = keys.len() as u32;
        let engine =
            ParallelSort::init(&mut device, n.max(1), payload.is_some(), indirect, &config)
                .unwrap();

        let key_buffer = device.create_buffer_init("keys", keys).unwrap();
        let payload_buffer = payload.map(|p| device.create_buffer_init("payload", p).unwrap());

        let mut cmd = device.create_command_list();
        if indirect {
            let count = device.create_buffer_init("count", &[n]).unwrap();
            engine
                .execute_indirect(&mut cmd, count, key_buffer, payload_buffer)
                .unwrap();
        } else {
            engine
                .execute(&mut cmd, n, key_buffer, payload_buffer)
                .unwrap();
        }
        device.submit(cmd).unwrap();

        let sorted = device.read_buffer(key_buffer, 0, keys.len()).unwrap();
        let sorted_payload = payload_buffer.map(|b| device.read_buffer(b, 0, keys.len()).unwrap());
        engine.destroy(&mut device);
        (sorted, sorted_payload, device)
    }

    fn sort_keys(keys: &[u32], indirect: bool) -> Vec<u32> {
        gpu_sort(keys, None, indirect, SortConfig::default()).0
    }

    fn expected(keys: &[u32]) -> Vec<u32> {
        let mut sorted = keys.to_vec();
        sorted.sort_unstable();
        sorted
    }

    #[test]
    fn test_sort_small() {
        let keys = vec![4, 2, 1, 3, 8, 6, 5, 7];
        assert_eq!(sort_keys(&keys, false), vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_sort_single() {
        assert_eq!(sort_keys(&[42], false), vec![42]);
        assert_eq!(sort_keys(&[42], true), vec![42]);
    }

    #[test]
    fn test_sort_random_64k() {
        let keys = random_keys(1, 65_536);
        let sorted = sort_keys(&keys, false);
        assert!(cpu_radix_sort::is_sorted(&sorted));
        assert_eq!(sorted, expected(&keys));
    }

    #[test]
    fn test_sort_non_block_multiple() {
        let keys = random_keys(2, 5 * BLOCK_SIZE as usize + 77);
        assert_eq!(sort_keys(&keys, false), expected(&keys));
    }

    #[test]
    fn test_sort_distributions() {
        let n = 4096u32;
        let cases: Vec<(&str, Vec<u32>)> = vec![
            ("already sorted", (0..n).collect()),
            ("reverse sorted", (0..n).rev().collect()),
            ("all same", vec![42; n as usize]),
            ("few distinct", (0..n).map(|i| i % 3).collect()),
            (
                "extremes",
                (0..n)
                    .map(|i| match i % 4 {
                        0 => u32::MAX,
                        1 => 0,
                        2 => u32::MAX / 2,
                        _ => 1,
                    })
                    .collect(),
            ),
            ("high bits only", (0..n).map(|i| (i % 16) << 28).collect()),
        ];

        for (name, keys) in cases {
            assert_eq!(sort_keys(&keys, false), expected(&keys), "{name}");
        }
    }

    #[test]
    fn test_sort_with_budget_exceeded() {
        // 40 blocks over 7 groups: the first 5 groups take an extra block
        let keys = random_keys(3, 40 * BLOCK_SIZE as usize - 13);
        let config = SortConfig::default().with_max_thread_groups(7);
        let (sorted, _, _) = gpu_sort(&keys, None, false, config);
        assert_eq!(sorted, expected(&keys));

        let (sorted, _, _) = gpu_sort(&keys, None, true, config);
        assert_eq!(sorted, expected(&keys));
    }

    #[test]
    fn test_sort_with_multiple_reduce_groups_per_bin() {
        // More than BLOCK_SIZE thread groups splits each bin row across reduce groups
        let keys = random_keys(4, BLOCK_SIZE as usize * (BLOCK_SIZE as usize + 1));
        let config = SortConfig::default().with_max_thread_groups(BLOCK_SIZE * 4);
        let sizes = DispatchSizes::derive(keys.len() as u32, config.max_thread_groups);
        assert_eq!(sizes.num_thread_groups_to_run, BLOCK_SIZE + 1);
        assert_eq!(sizes.constants.num_reduce_threadgroup_per_bin, 2);

        let (sorted, _, _) = gpu_sort(&keys, None, false, config);
        assert_eq!(sorted, expected(&keys));
        let (sorted, _, _) = gpu_sort(&keys, None, true, config);
        assert_eq!(sorted, expected(&keys));
    }

    #[test]
    fn test_payload_follows_keys() {
        let keys = random_keys(6, 10_000)
            .into_iter()
            .map(|k| k % 1000)
            .collect::<Vec<_>>();
        let payload: Vec<u32> = (0..keys.len() as u32).collect();

        for indirect in [false, true] {
            let (sorted, sorted_payload, _) =
                gpu_sort(&keys, Some(&payload), indirect, SortConfig::default());
            let sorted_payload = sorted_payload.unwrap();
            assert!(cpu_radix_sort::is_sorted(&sorted));
            for (key, original_index) in sorted.iter().zip(&sorted_payload) {
                assert_eq!(*key, keys[*original_index as usize]);
            }
            // Ties keep their original order
            let (ref_keys, ref_payload) = cpu_radix_sort::sort_pairs(&keys, &payload);
            assert_eq!(sorted, ref_keys);
            assert_eq!(sorted_payload, ref_payload);
        }
    }

    #[test]
    fn test_payload_with_multi_block_groups() {
        // Budgets below, near and above BLOCK_SIZE thread groups
        let n = BLOCK_SIZE as usize * 515 + 17;
        let keys: Vec<u32> = random_keys(12, n).into_iter().map(|k| k >> 12).collect();
        let payload: Vec<u32> = (0..n as u32).collect();
        let (ref_keys, ref_payload) = cpu_radix_sort::sort_pairs(&keys, &payload);

        for budget in [1, 5, 600] {
            let config = SortConfig::default().with_max_thread_groups(budget);
            for indirect in [false, true] {
                let (sorted, sorted_payload, _) = gpu_sort(&keys, Some(&payload), indirect, config);
                assert_eq!(sorted, ref_keys, "budget {budget}, indirect {indirect}");
                assert_eq!(
                    sorted_payload.as_ref(),
                    Some(&ref_payload),
                    "budget {budget}, indirect {indirect}"
                );
            }
        }
    }

    #[test]
    fn test_resort_is_idempotent() {
        let keys = random_keys(7, 3000);
        let once = sort_keys(&keys, false);
        let twice = sort_keys(&once, false);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_direct_and_indirect_agree() {
        let keys = random_keys(8, 123_457);
        assert_eq!(sort_keys(&keys, false), sort_keys(&keys, true));
    }

    #[test]
    fn test_eight_passes_per_execute() {
        for indirect in [false, true] {
            let keys = random_keys(9, 2048);
            let (_, _, device) = gpu_sort(&keys, None, indirect, SortConfig::default());
            let stats = device.stats();
            for stage in Stage::SORT_STAGES {
                assert_eq!(stats.dispatches(stage), NUM_PASSES as u64, "{stage:?}");
            }
            let setup = if indirect { NUM_PASSES as u64 } else { 0 };
            assert_eq!(stats.dispatches(Stage::SetupIndirectArgs), setup);
            assert_eq!(stats.barriers, NUM_PASSES as u64 * (5 + setup.min(1)));
        }
    }

    #[test]
    fn test_pipelines_follow_variant() {
        let mut device = CpuDevice::new();
        let direct =
            ParallelSort::init(&mut device, 64, false, false, &SortConfig::default()).unwrap();
        let indirect =
            ParallelSort::init(&mut device, 64, true, true, &SortConfig::default()).unwrap();

        assert!(direct.pipelines.setup.is_none());
        assert!(indirect.pipelines.setup.is_some());
        for engine in [&direct, &indirect] {
            let mut handles = engine.pipelines.sort.to_vec();
            handles.extend(engine.pipelines.setup);
            handles.sort_by_key(|h| h.0);
            handles.dedup();
            assert_eq!(handles.len(), engine.variant.stages().count());
        }

        direct.destroy(&mut device);
        indirect.destroy(&mut device);
    }

    #[test]
    fn test_recorded_command_counts() {
        let mut device = CpuDevice::new();
        let keys = device.create_buffer_init("keys", &[5, 4, 3, 2]).unwrap();
        let count = device.create_buffer_init("count", &[4]).unwrap();
        let direct =
            ParallelSort::init(&mut device, 4, false, false, &SortConfig::default()).unwrap();
        let indirect =
            ParallelSort::init(&mut device, 4, false, true, &SortConfig::default()).unwrap();

        // Constants upload bracket, then five dispatches and five barriers per pass
        let mut cmd = device.create_command_list();
        direct.execute(&mut cmd, 4, keys, None).unwrap();
        assert_eq!(cmd.len(), 3 + NUM_PASSES as usize * 10);
        device.submit(cmd).unwrap();

        // Setup dispatch and barrier, three transitions in and out around the sort stages
        let mut cmd = device.create_command_list();
        indirect.execute_indirect(&mut cmd, count, keys, None).unwrap();
        assert_eq!(cmd.len(), NUM_PASSES as usize * (2 + 3 + 10 + 3));
        device.submit(cmd).unwrap();

        assert_eq!(device.read_buffer(keys, 0, 4).unwrap(), vec![2, 3, 4, 5]);
        direct.destroy(&mut device);
        indirect.destroy(&mut device);
    }

    #[test]
    fn test_zero_keys_records_nothing() {
        let mut device = CpuDevice::new();
        let engine =
            ParallelSort::init(&mut device, 1024, false, false, &SortConfig::default()).unwrap();
        let keys = device.create_buffer_init("keys", &[9, 8, 7]).unwrap();

        let mut cmd = device.create_command_list();
        engine.execute(&mut cmd, 0, keys, None).unwrap();
        assert!(cmd.is_empty());
        device.submit(cmd).unwrap();

        assert_eq!(device.stats().total_dispatches(), 0);
        assert_eq!(device.read_buffer(keys, 0, 3).unwrap(), vec![9, 8, 7]);
        engine.destroy(&mut device);
    }

    #[test]
    fn test_zero_keys_indirect_runs_no_groups() {
        let mut device = CpuDevice::new();
        let engine =
            ParallelSort::init(&mut device, 1024, true, true, &SortConfig::default()).unwrap();
        let keys = device.create_buffer_init("keys", &[9, 8, 7]).unwrap();
        let payload = device.create_buffer_init("payload", &[0, 1, 2]).unwrap();
        let count = device.create_buffer_init("count", &[0]).unwrap();

        let mut cmd = device.create_command_list();
        engine
            .execute_indirect(&mut cmd, count, keys, Some(payload))
            .unwrap();
        device.submit(cmd).unwrap();

        let stats = device.stats();
        // Only SetupIndirectArgs and the single-group scan launch anything
        assert_eq!(stats.thread_groups, 2 * NUM_PASSES as u64);
        assert_eq!(stats.empty_dispatches, 4 * NUM_PASSES as u64);
        assert_eq!(device.read_buffer(keys, 0, 3).unwrap(), vec![9, 8, 7]);
        assert_eq!(device.read_buffer(payload, 0, 3).unwrap(), vec![0, 1, 2]);
        engine.destroy(&mut device);
    }

    #[test]
    fn test_indirect_count_below_buffer_length() {
        let mut device = CpuDevice::new();
        let engine =
            ParallelSort::init(&mut device, 4096, false, true, &SortConfig::default()).unwrap();
        let mut data = random_keys(10, 4096);
        let keys = device.create_buffer_init("keys", &data).unwrap();
        let count = device.create_buffer_init("count", &[1000]).unwrap();

        let mut cmd = device.create_command_list();
        engine.execute_indirect(&mut cmd, count, keys, None).unwrap();
        device.submit(cmd).unwrap();

        data[..1000].sort_unstable();
        assert_eq!(device.read_buffer(keys, 0, 4096).unwrap(), data);
        engine.destroy(&mut device);
    }

    #[test]
    fn test_indirect_count_clamped_to_max_entries() {
        let mut device = CpuDevice::new();
        let engine =
            ParallelSort::init(&mut device, 600, false, true, &SortConfig::default()).unwrap();
        let data = random_keys(11, 600);
        let keys = device.create_buffer_init("keys", &data).unwrap();
        let count = device.create_buffer_init("count", &[1_000_000]).unwrap();

        let mut cmd = device.create_command_list();
        engine.execute_indirect(&mut cmd, count, keys, None).unwrap();
        device.submit(cmd).unwrap();

        assert_eq!(device.read_buffer(keys, 0, 600).unwrap(), expected(&data));
        engine.destroy(&mut device);
    }

    #[test]
    fn test_sort_at_max_entries_stays_in_bounds() {
        // Any out-of-bounds scratch access fails submit
        for max_entries in [1u32, 511, 512, 513, 20_000] {
            for budget in [1, 3, DEFAULT_MAX_THREADGROUPS] {
                let keys = random_keys(max_entries as u64, max_entries as usize);
                let config = SortConfig::default().with_max_thread_groups(budget);
                let (sorted, _, _) = gpu_sort(&keys, None, false, config);
                assert_eq!(sorted, expected(&keys));
            }
        }
    }

    #[test]
    fn test_too_many_keys() {
        let mut device = CpuDevice::new();
        let engine =
            ParallelSort::init(&mut device, 100, false, false, &SortConfig::default()).unwrap();
        let keys = device.create_buffer_init("keys", &[0; 200]).unwrap();

        let mut cmd = device.create_command_list();
        assert!(matches!(
            engine.execute(&mut cmd, 101, keys, None),
            Err(SortError::TooManyKeys {
                requested: 101,
                max: 100
            })
        ));
        assert!(cmd.is_empty());
        engine.destroy(&mut device);
    }

    #[test]
    fn test_payload_mismatch() {
        let mut device = CpuDevice::new();
        let keys = device.create_buffer_init("keys", &[0; 16]).unwrap();
        let payload = device.create_buffer_init("payload", &[0; 16]).unwrap();

        let with_payload =
            ParallelSort::init(&mut device, 16, true, false, &SortConfig::default()).unwrap();
        let mut cmd = device.create_command_list();
        assert!(matches!(
            with_payload.execute(&mut cmd, 16, keys, None),
            Err(SortError::PayloadMismatch {
                expected: true,
                provided: false
            })
        ));

        let without_payload =
            ParallelSort::init(&mut device, 16, false, true, &SortConfig::default()).unwrap();
        let count = device.create_buffer_init("count", &[16]).unwrap();
        assert!(matches!(
            without_payload.execute_indirect(&mut cmd, count, keys, Some(payload)),
            Err(SortError::PayloadMismatch {
                expected: false,
                provided: true
            })
        ));

        with_payload.destroy(&mut device);
        without_payload.destroy(&mut device);
    }

    #[test]
    fn test_mode_mismatch() {
        let mut device = CpuDevice::new();
        let keys = device.create_buffer_init("keys", &[0; 16]).unwrap();
        let count = device.create_buffer_init("count", &[16]).unwrap();
        let direct =
            ParallelSort::init(&mut device, 16, false, false, &SortConfig::default()).unwrap();
        let indirect =
            ParallelSort::init(&mut device, 16, false, true, &SortConfig::default()).unwrap();

        let mut cmd = device.create_command_list();
        assert!(matches!(
            direct.execute_indirect(&mut cmd, count, keys, None),
            Err(SortError::DirectEngine)
        ));
        assert!(matches!(
            indirect.execute(&mut cmd, 16, keys, None),
            Err(SortError::IndirectEngine)
        ));

        direct.destroy(&mut device);
        indirect.destroy(&mut device);
    }

    #[test]
    fn test_zero_thread_group_budget_rejected() {
        let mut device = CpuDevice::new();
        let config = SortConfig::default().with_max_thread_groups(0);
        assert!(matches!(
            ParallelSort::init(&mut device, 16, false, false, &config),
            Err(SortError::InvalidThreadGroupBudget)
        ));
        assert_eq!(device.live_buffers(), 0);
    }

    #[test]
    fn test_init_allocates_expected_buffers() {
        let mut device = CpuDevice::new();
        let direct =
            ParallelSort::init(&mut device, 10_000, false, false, &SortConfig::default()).unwrap();
        assert_eq!(direct.owned_buffers().len(), 4);

        let full =
            ParallelSort::init(&mut device, 10_000, true, true, &SortConfig::default()).unwrap();
        assert_eq!(full.owned_buffers().len(), 7);
        assert_eq!(device.live_buffers(), 11);

        direct.destroy(&mut device);
        full.destroy(&mut device);
        assert_eq!(device.live_buffers(), 0);
        assert_eq!(device.allocated_bytes(), 0);
    }

    #[test]
    fn test_init_failure_releases_partial_allocations() {
        // Room for the key scratch, not for the payload scratch
        let mut device = CpuDevice::with_memory_budget(40_000 + 8);
        let result = ParallelSort::init(&mut device, 10_000, true, false, &SortConfig::default());
        assert!(matches!(
            result,
            Err(SortError::Device(DeviceError::OutOfMemory { .. }))
        ));
        assert_eq!(device.live_buffers(), 0);
        assert_eq!(device.allocated_bytes(), 0);
    }

    #[test]
    fn test_engine_is_reusable() {
        let mut device = CpuDevice::new();
        let engine =
            ParallelSort::init(&mut device, 5000, true, false, &SortConfig::default()).unwrap();

        for seed in 0..3 {
            let n = 1000 + seed as usize * 1500;
            let data = random_keys(100 + seed, n);
            let keys = device.create_buffer_init("keys", &data).unwrap();
            let payload: Vec<u32> = (0..n as u32).collect();
            let values = device.create_buffer_init("values", &payload).unwrap();

            device.reset_stats();
            let mut cmd = device.create_command_list();
            engine.execute(&mut cmd, n as u32, keys, Some(values)).unwrap();
            device.submit(cmd).unwrap();

            assert_eq!(device.read_buffer(keys, 0, n).unwrap(), expected(&data));
            for stage in Stage::SORT_STAGES {
                assert_eq!(device.stats().dispatches(stage), NUM_PASSES as u64);
            }
            device.destroy_buffer(keys);
            device.destroy_buffer(values);
        }
        engine.destroy(&mut device);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn prop_sorts_any_input(keys in proptest::collection::vec(any::<u32>(), 0..3000)) {
            let (sorted, _, _) = gpu_sort(&keys, None, false, SortConfig::default());
            prop_assert_eq!(sorted, expected(&keys));
        }

        #[test]
        fn prop_payload_coherent(
            keys in proptest::collection::vec(0u32..64, 1..2000),
            budget in 1u32..8,
            indirect in any::<bool>(),
        ) {
            let payload: Vec<u32> = (0..keys.len() as u32).collect();
            let config = SortConfig::default().with_max_thread_groups(budget);
            let (sorted, sorted_payload, _) = gpu_sort(&keys, Some(&payload), indirect, config);
            let (ref_keys, ref_payload) = cpu_radix_sort::sort_pairs(&keys, &payload);
            prop_assert_eq!(sorted, ref_keys);
            prop_assert_eq!(sorted_payload, Some(ref_payload));
        }

        #[test]
        fn prop_direct_matches_indirect(
            keys in proptest::collection::vec(any::<u32>(), 1..2500),
            budget in 1u32..16,
        ) {
            let config = SortConfig::default().with_max_thread_groups(budget);
            let (direct, _, _) = gpu_sort(&keys, None, false, config);
            let (indirect, _, _) = gpu_sort(&keys, None, true, config);
            prop_assert_eq!(direct, indirect);
        }
    }
}
