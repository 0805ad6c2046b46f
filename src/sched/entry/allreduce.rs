//! All-to-all allreduce entry: reduce-scatter into an entry-owned temporary
//! buffer, then all-gather the reduced block into every rank's receive
//! buffer by direct peer-memory write.

use std::sync::Arc;

use crate::coll::{DataType, ReduceOp};
use crate::comm::Communicator;
use crate::config::CollConfig;
use crate::device::alloc::TempBuffer;
use crate::device::{Buffer, DeviceApi, EventHandle};
use crate::registry::PeerBufferRegistry;
use crate::sched::partition::{block_partition, count_check};
use crate::sched::policy::KernelPolicy;

use super::all_gather::{self, AllGatherArgs};
use super::reduce_scatter::{self, ReduceScatterArgs};
use super::{BaseEntry, EntryError, EntryStatus, EventSet};

#[derive(Clone, Copy, Debug)]
pub struct AllReduceParams {
    pub send_buf: Buffer,
    pub recv_buf: Buffer,
    pub cnt: usize,
    pub dtype: DataType,
    pub op: ReduceOp,
    /// Registry index under which every rank registered its send buffer.
    pub send_buf_idx: usize,
    /// Registry index under which every rank registered its receive buffer.
    pub recv_buf_idx: usize,
    /// Extra element offset applied when addressing peer memory.
    pub peer_buf_offset: usize,
}

pub struct A2aAllReduceEntry {
    base: BaseEntry,
    registry: Arc<PeerBufferRegistry>,
    params: AllReduceParams,
    peer_count: usize,
    skip: bool,
    topo_read: bool,
    rs_policy: KernelPolicy,
    ag_policy: KernelPolicy,
    tmp_buf: Option<TempBuffer>,
    pre_copy_events: EventSet,
    kernel_events: EventSet,
    post_copy_events: EventSet,
}

impl A2aAllReduceEntry {
    pub fn new(
        api: Arc<dyn DeviceApi>,
        comm: Arc<Communicator>,
        params: AllReduceParams,
        config: &CollConfig,
        registry: Arc<PeerBufferRegistry>,
        wait_events: Vec<EventHandle>,
    ) -> Self {
        let comm_size = comm.num_ranks();
        let rank = comm.rank();
        let feasible = count_check(params.cnt, comm_size, rank);
        let skip = !feasible || (comm_size == 1 && params.send_buf == params.recv_buf);
        let rs_policy = KernelPolicy::for_reduce_scatter(config);
        let ag_policy = KernelPolicy::for_all_gather(config, params.dtype);
        let peer_count = comm.peer_count();
        A2aAllReduceEntry {
            base: BaseEntry::new(api, comm, wait_events),
            registry,
            params,
            peer_count,
            skip,
            topo_read: config.all_gather_topo_read,
            rs_policy,
            ag_policy,
            tmp_buf: None,
            pre_copy_events: EventSet::default(),
            kernel_events: EventSet::default(),
            post_copy_events: EventSet::default(),
        }
    }

    /// True when the operation contributes nothing on this rank (no owned
    /// elements, or a single-rank in-place no-op). Skip entries build no
    /// device work and fast-complete at start.
    #[inline]
    pub fn skip(&self) -> bool {
        self.skip
    }

    #[inline]
    pub fn status(&self) -> EntryStatus {
        self.base.status()
    }

    /// The completion event the outer scheduler watches.
    #[inline]
    pub fn entry_event(&self) -> EventHandle {
        self.base.entry_event()
    }

    /// Resolve peer buffers, allocate the temporary buffer and event sets,
    /// and build the reduce-scatter + all-gather command list.
    pub fn initialize(&mut self) -> Result<(), EntryError> {
        if self.skip {
            log::debug!("{}: skip entry, no device work built", self.name());
            return Ok(());
        }
        if self.base.status() != EntryStatus::Created {
            return Err(EntryError::InvalidState(
                self.base.status(),
                EntryStatus::Created,
            ));
        }
        if self.topo_read {
            return Err(EntryError::UnsupportedConfig(
                "read-based all-gather is not implemented for all-to-all allreduce",
            ));
        }

        let comm_size = self.base.comm().num_ranks();
        let rank = self.base.comm().rank();

        // Peer buffers are resolved fresh for every entry; registrations can
        // rotate between operations.
        let mut peer_send_bufs = Vec::with_capacity(self.peer_count);
        let mut peer_recv_bufs: Vec<Option<Buffer>> = vec![None; comm_size];
        for i in 0..self.peer_count {
            let peer_rank = (rank + i + 1) % comm_size;
            let send =
                self.registry
                    .resolve(peer_rank, self.params.send_buf_idx)
                    .map_err(|_| EntryError::NullPeerBuffer {
                        rank: peer_rank,
                        index: self.params.send_buf_idx,
                    })?;
            peer_send_bufs.push(send);
            // the all-gather wants peer receive buffers indexed by rank
            let recv =
                self.registry
                    .resolve(peer_rank, self.params.recv_buf_idx)
                    .map_err(|_| EntryError::NullPeerBuffer {
                        rank: peer_rank,
                        index: self.params.recv_buf_idx,
                    })?;
            peer_recv_bufs[peer_rank] = Some(recv);
        }

        let part = block_partition(self.params.cnt, comm_size, rank);
        if part.main_block_count == 0 {
            return Err(EntryError::ZeroSegment);
        }

        let es = self.params.dtype.count_bytes();
        let tmp_bytes = self.peer_count.max(1) * part.block_count * es;
        let tmp_buf = TempBuffer::alloc(self.base.api(), tmp_bytes)?;

        log::debug!(
            "rank {rank}, main_block_count: {}, block_count: {}, tmp buf size: {}, cnt: {}",
            part.main_block_count,
            part.block_count,
            tmp_buf.size(),
            self.params.cnt
        );

        let pre_copy_count = self.rs_policy.pre_copy_event_count(self.peer_count);
        self.pre_copy_events = self.base.pool_mut().create_set(pre_copy_count);
        // at least one kernel event even with no peers: the staging copy
        // that feeds the all-gather signals it
        let kernel_count = self.rs_policy.reduce_event_count(self.peer_count).max(1);
        self.kernel_events = self.base.pool_mut().create_set(kernel_count);
        let post_copy_count = self.ag_policy.all_gather_event_count(comm_size);
        self.post_copy_events = self.base.pool_mut().create_set(post_copy_count);

        self.base.fill_barrier();
        let barrier = self.base.barrier_event();

        let rs_args = ReduceScatterArgs {
            send_buf: self.params.send_buf,
            tmp_buf: tmp_buf.view(),
            peer_send_bufs: &peer_send_bufs,
            block_count: part.block_count,
            block_offset: part.offset,
            peer_buf_offset: self.params.peer_buf_offset,
            dtype: self.params.dtype,
            op: self.params.op,
        };
        reduce_scatter::fill(
            self.base.list_mut(),
            self.rs_policy,
            &rs_args,
            barrier,
            &self.pre_copy_events,
            &self.kernel_events,
        );

        let ag_args = AllGatherArgs {
            tmp_buf: tmp_buf.view(),
            recv_buf: self.params.recv_buf,
            peer_recv_bufs: &peer_recv_bufs,
            rank,
            block_count: part.block_count,
            main_block_count: part.main_block_count,
            peer_buf_offset: self.params.peer_buf_offset,
            dtype: self.params.dtype,
        };
        all_gather::fill(
            self.base.list_mut(),
            self.ag_policy,
            &ag_args,
            &self.kernel_events,
            &self.post_copy_events,
        );

        self.tmp_buf = Some(tmp_buf);
        self.base.set_status(EntryStatus::Initialized);
        Ok(())
    }

    /// Submit the built device work, or fast-complete a skip entry without
    /// touching the device queue.
    pub fn start(&mut self) -> Result<(), EntryError> {
        if self.skip {
            self.base.signal_entry_event();
            self.base.set_status(EntryStatus::Complete);
            return Ok(());
        }
        if self.base.status() != EntryStatus::Initialized {
            return Err(EntryError::InvalidState(
                self.base.status(),
                EntryStatus::Initialized,
            ));
        }
        self.base.submit()?;
        Ok(())
    }

    /// Non-blocking completion poll; safe to call any number of times.
    pub fn update(&mut self) -> EntryStatus {
        if self.base.status() != EntryStatus::Running {
            return self.base.status();
        }
        for &event in self.post_copy_events.handles() {
            if !self.base.is_event_completed(event) {
                return EntryStatus::Running;
            }
        }
        self.base.signal_entry_event();
        self.base.set_status(EntryStatus::Complete);
        EntryStatus::Complete
    }

    pub fn name(&self) -> &'static str {
        "A2A_ALLREDUCE"
    }

    pub fn name_ext(&self) -> String {
        format!(
            "{}:{}",
            self.name(),
            self.params.cnt * self.params.dtype.count_bytes()
        )
    }

    pub fn dump_detail(&self) -> String {
        format!(
            "dt {:?}, cnt {}, send_buf {:?}, recv_buf {:?}, op {:?}, {}",
            self.params.dtype,
            self.params.cnt,
            self.params.send_buf,
            self.params.recv_buf,
            self.params.op,
            self.base.comm()
        )
    }
}
