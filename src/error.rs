//! Error types for the sort engine and its device backends.

use crate::device::{BufferHandle, PipelineHandle, ResourceState, Stage};

/// Failures reported by a [`Device`](crate::device::Device) while creating
/// resources or executing recorded work.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("out of device memory: requested {requested} bytes, {available} available")]
    OutOfMemory { requested: u64, available: u64 },
    #[error("buffer `{label}` has size {size}, which is not a multiple of 4 bytes")]
    InvalidSize { label: String, size: u64 },
    #[error("unknown or destroyed buffer {0:?}")]
    UnknownBuffer(BufferHandle),
    #[error("unknown pipeline {0:?}")]
    UnknownPipeline(PipelineHandle),
    #[error("unknown kernel define `{0}`")]
    UnknownDefine(String),
    #[error("access to word {index} of `{label}`, which holds {len} words")]
    OutOfBounds {
        label: String,
        index: u64,
        len: usize,
    },
    #[error("buffer `{label}` is in state {actual:?}, expected {expected:?}")]
    StateMismatch {
        label: String,
        expected: ResourceState,
        actual: ResourceState,
    },
    #[error("buffer `{label}` was not created with a usage that allows {state:?}")]
    UnsupportedState { label: String, state: ResourceState },
    #[error("{stage:?} accesses `{label}` after an unsynchronized write; a UAV barrier is missing")]
    MissingBarrier { stage: Stage, label: String },
    #[error("{stage:?} requires binding `{binding}`")]
    MissingBinding { stage: Stage, binding: &'static str },
    #[error("{stage:?} dispatch of {groups} thread groups exceeds the u32 group count")]
    TooManyThreadGroups { stage: Stage, groups: u64 },
    #[error("{stage:?} pipeline compiled with HAS_PAYLOAD={compiled}, bindings disagree")]
    VariantMismatch { stage: Stage, compiled: bool },
}

/// Errors returned by [`ParallelSort`](crate::ParallelSort).
#[derive(Debug, thiserror::Error)]
pub enum SortError {
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error("cannot sort {requested} keys with an engine sized for {max}")]
    TooManyKeys { requested: u32, max: u32 },
    #[error("payload mismatch: engine has_payload={expected}, payload buffer provided={provided}")]
    PayloadMismatch { expected: bool, provided: bool },
    #[error("engine was initialized for indirect dispatch; use execute_indirect")]
    IndirectEngine,
    #[error("engine was initialized for direct dispatch; use execute")]
    DirectEngine,
    #[error("thread-group budget must be at least 1")]
    InvalidThreadGroupBudget,
}
