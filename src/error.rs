//! Crate-level construction/config errors. Per-operation status codes
//! (`CompletionCode`, `WqeStatus`, `AethSyndrome`, ...) are plain `Copy`
//! enums returned from hot-path calls and live next to their owning module.

use thiserror::Error;

/// Failures that can occur while building a [`crate::device::Device`] or one
/// of its sub-components from a configuration struct.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("ring capacity must be nonzero")]
    ZeroRingCapacity,
    #[error("ring slot size must be nonzero")]
    ZeroSlotSize,
    #[error("host memory size must be nonzero")]
    ZeroHostMemorySize,
    #[error("queue pair weight must be at least 1")]
    ZeroWeight,
    #[error("duplicate queue id {0}")]
    DuplicateQueueId(u32),
    #[error("msix vector {0} out of range")]
    VectorOutOfRange(u16),
    #[error("max_mtu must be nonzero")]
    ZeroMtu,
    #[error("rdma resource limit must be nonzero")]
    ZeroResourceLimit,
}
