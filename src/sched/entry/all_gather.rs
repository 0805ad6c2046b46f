//! All-gather stage: fills device work distributing the reduced block (slot
//! 0 of the temporary buffer) into the local receive buffer and, by direct
//! write, into every peer's receive buffer at this rank's designated offset.
//!
//! No command here runs before the reduce-scatter kernels it depends on:
//! the full kernel event set is an explicit input dependency of every copy,
//! regardless of queue order.

use crate::coll::DataType;
use crate::device::{Buffer, Command, CommandKind, CommandList};
use crate::sched::policy::{align_split, KernelPolicy};

use super::EventSet;

pub struct AllGatherArgs<'a> {
    /// Reduced block at slot 0.
    pub tmp_buf: Buffer,
    pub recv_buf: Buffer,
    /// Peer receive buffers indexed by rank; `None` at the local rank.
    pub peer_recv_bufs: &'a [Option<Buffer>],
    pub rank: usize,
    pub block_count: usize,
    pub main_block_count: usize,
    /// Extra element offset applied when addressing peer memory.
    pub peer_buf_offset: usize,
    pub dtype: DataType,
}

pub fn fill(
    list: &mut CommandList,
    policy: KernelPolicy,
    args: &AllGatherArgs<'_>,
    kernel_events: &EventSet,
    post_copy_events: &EventSet,
) {
    let es = args.dtype.count_bytes();
    let block_bytes = args.block_count * es;
    // every receive buffer places rank r's block at the same element offset
    let dst_off = args.rank * args.main_block_count * es;
    let deps = kernel_events.handles().to_vec();

    match policy {
        KernelPolicy::PerPeer | KernelPolicy::Merged => {
            let mut next_event = 0;
            list.push(Command::new(
                CommandKind::Copy {
                    src: args.tmp_buf,
                    dst: args.recv_buf.byte_add(dst_off),
                    bytes: block_bytes,
                },
                deps.clone(),
                post_copy_events.handles()[next_event],
            ));
            next_event += 1;
            for peer in args.peer_recv_bufs.iter().flatten() {
                list.push(Command::new(
                    CommandKind::Copy {
                        src: args.tmp_buf,
                        dst: peer.byte_add(dst_off + args.peer_buf_offset * es),
                        bytes: block_bytes,
                    },
                    deps.clone(),
                    post_copy_events.handles()[next_event],
                ));
                next_event += 1;
            }
            debug_assert_eq!(next_event, post_copy_events.len());
        }
        KernelPolicy::Monolithic => {
            let (aligned, leftover) = align_split(args.block_count, es);
            let splits = [(0usize, aligned), (aligned, leftover)];
            for (k, (start, count)) in splits.into_iter().enumerate() {
                let event = post_copy_events.handles()[k];
                let dsts: Vec<Buffer> = args
                    .peer_recv_bufs
                    .iter()
                    .flatten()
                    .map(|peer| peer.byte_add(dst_off + (args.peer_buf_offset + start) * es))
                    .collect();
                if count == 0 || dsts.is_empty() {
                    list.push(Command::new(CommandKind::Barrier, deps.clone(), event));
                    continue;
                }
                list.push(Command::new(
                    CommandKind::Broadcast {
                        src: args.tmp_buf.byte_add(start * es),
                        dsts,
                        bytes: count * es,
                    },
                    deps.clone(),
                    event,
                ));
            }
            // non-inplace local copy out of the temporary buffer
            list.push(Command::new(
                CommandKind::Copy {
                    src: args.tmp_buf,
                    dst: args.recv_buf.byte_add(dst_off),
                    bytes: block_bytes,
                },
                deps,
                post_copy_events.handles()[2],
            ));
        }
    }
}
