//! Block partitioning for the all-to-all allreduce.
//!
//! Splits `cnt` elements across `comm_size` ranks: every rank owns a
//! contiguous block of `cnt / comm_size` elements and the last rank absorbs
//! the remainder. When `cnt < comm_size` the first `cnt` ranks own one
//! element each and the rest own nothing (and skip the operation entirely).

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockPartition {
    /// Uniform per-rank block size used for offset arithmetic; sized as 1 in
    /// the sparse case so owned single elements land at distinct offsets.
    pub main_block_count: usize,
    /// Elements this rank owns after reduce-scatter.
    pub block_count: usize,
    /// Element offset of this rank's block within the operation.
    pub offset: usize,
}

/// Whether `rank` contributes any owned elements to the operation.
pub fn count_check(cnt: usize, comm_size: usize, rank: usize) -> bool {
    cnt / comm_size > 0 || rank < cnt
}

pub fn block_partition(cnt: usize, comm_size: usize, rank: usize) -> BlockPartition {
    debug_assert!(comm_size >= 1);
    debug_assert!(rank < comm_size);

    let mut main_block_count = cnt / comm_size;
    let remainder = cnt - main_block_count * comm_size;

    let block_count = if main_block_count == 0 {
        usize::from(rank < cnt)
    } else if rank == comm_size - 1 {
        main_block_count + remainder
    } else {
        main_block_count
    };

    if main_block_count == 0 && rank < cnt {
        main_block_count = 1;
    }

    BlockPartition {
        main_block_count,
        block_count,
        offset: rank * main_block_count,
    }
}
