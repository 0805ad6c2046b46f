//! Kernel-construction policy.
//!
//! The configuration flags select how device work is batched; the choice is
//! resolved once at entry initialization into a strategy value so the stage
//! builders never branch on raw flags. Granularity only: every policy
//! produces the same numeric result.

use crate::coll::DataType;
use crate::config::CollConfig;

/// Alignment boundary separating the aligned kernel from the leftover kernel
/// in monolithic mode.
pub const KERNEL_ALIGN_BYTES: usize = 64;

/// Number of kernels a monolithic split issues (aligned + leftover).
pub const ALIGN_KERNEL_COUNT: usize = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KernelPolicy {
    /// One kernel (or copy) per peer.
    PerPeer,
    /// All per-peer reductions merged into a single kernel.
    Merged,
    /// Aligned + leftover kernel pair reading peer memory directly.
    Monolithic,
}

impl KernelPolicy {
    /// Monolithic mode dominates the single-kernel merge when both are set.
    pub fn for_reduce_scatter(config: &CollConfig) -> Self {
        if config.reduce_scatter_monolithic_kernel {
            KernelPolicy::Monolithic
        } else if config.enable_single_reduce_kernel {
            KernelPolicy::Merged
        } else {
            KernelPolicy::PerPeer
        }
    }

    /// The monolithic all-gather kernel miscomputes for int8; it stays off
    /// for that datatype no matter what the flags say.
    pub fn for_all_gather(config: &CollConfig, dtype: DataType) -> Self {
        if config.all_gather_monolithic_kernel && dtype != DataType::Int8 {
            KernelPolicy::Monolithic
        } else {
            KernelPolicy::PerPeer
        }
    }

    /// Staging copies issued before the reduction kernels; monolithic mode
    /// reads peer memory directly and needs none.
    pub fn pre_copy_event_count(&self, peer_count: usize) -> usize {
        match self {
            KernelPolicy::Monolithic => 0,
            KernelPolicy::PerPeer | KernelPolicy::Merged => peer_count,
        }
    }

    pub fn reduce_event_count(&self, peer_count: usize) -> usize {
        match self {
            KernelPolicy::PerPeer => peer_count,
            KernelPolicy::Merged => 1,
            KernelPolicy::Monolithic => ALIGN_KERNEL_COUNT,
        }
    }

    /// Completion events produced by the all-gather stage: one per rank in
    /// per-peer mode, or aligned + leftover + the local self-copy.
    pub fn all_gather_event_count(&self, comm_size: usize) -> usize {
        match self {
            KernelPolicy::Monolithic => ALIGN_KERNEL_COUNT + 1,
            KernelPolicy::PerPeer | KernelPolicy::Merged => comm_size,
        }
    }
}

/// Split a block into its aligned prefix and leftover tail, in elements.
pub fn align_split(block_count: usize, elem_bytes: usize) -> (usize, usize) {
    let elems_per_align = (KERNEL_ALIGN_BYTES / elem_bytes).max(1);
    let aligned = block_count - block_count % elems_per_align;
    (aligned, block_count - aligned)
}
