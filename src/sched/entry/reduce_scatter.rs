//! Reduce-scatter stage: fills device work that leaves the reduction of
//! every rank's contribution for the local block in slot 0 of the temporary
//! buffer.
//!
//! Temporary-buffer layout is one block-sized slot per peer. Staged policies
//! copy each peer's segment into its slot first; slot 0 doubles as the
//! accumulator the kernels reduce into.

use crate::coll::{DataType, ReduceOp};
use crate::device::{Buffer, Command, CommandKind, CommandList, EventHandle};
use crate::sched::policy::{align_split, KernelPolicy};

use super::EventSet;

pub struct ReduceScatterArgs<'a> {
    pub send_buf: Buffer,
    pub tmp_buf: Buffer,
    /// Peer send buffers in slot order (peer `i` is rank
    /// `(rank + i + 1) % comm_size`).
    pub peer_send_bufs: &'a [Buffer],
    pub block_count: usize,
    /// Element offset of the local rank's owned block.
    pub block_offset: usize,
    /// Extra element offset applied when addressing peer memory.
    pub peer_buf_offset: usize,
    pub dtype: DataType,
    pub op: ReduceOp,
}

pub fn fill(
    list: &mut CommandList,
    policy: KernelPolicy,
    args: &ReduceScatterArgs<'_>,
    barrier: EventHandle,
    pre_copy_events: &EventSet,
    kernel_events: &EventSet,
) {
    let es = args.dtype.count_bytes();
    let block_bytes = args.block_count * es;
    let local_seg = args.send_buf.byte_add(args.block_offset * es);
    // slot 0 is the accumulator and the stage's output
    let acc = args.tmp_buf;
    let peer_count = args.peer_send_bufs.len();

    debug_assert_eq!(pre_copy_events.len(), policy.pre_copy_event_count(peer_count));

    if peer_count == 0 {
        // Single-rank out-of-place: nothing to reduce, stage the local block
        // so the all-gather copies it out uniformly.
        list.push(Command::new(
            CommandKind::Copy {
                src: local_seg,
                dst: acc,
                bytes: block_bytes,
            },
            vec![barrier],
            kernel_events.handles()[0],
        ));
        for &event in &kernel_events.handles()[1..] {
            list.push(Command::new(CommandKind::Barrier, vec![barrier], event));
        }
        return;
    }

    let peer_seg = |peer: &Buffer, extra_elems: usize| {
        peer.byte_add((args.block_offset + args.peer_buf_offset + extra_elems) * es)
    };

    match policy {
        KernelPolicy::PerPeer => {
            for (i, peer) in args.peer_send_bufs.iter().enumerate() {
                list.push(Command::new(
                    CommandKind::Copy {
                        src: peer_seg(peer, 0),
                        dst: args.tmp_buf.byte_add(i * block_bytes),
                        bytes: block_bytes,
                    },
                    vec![barrier],
                    pre_copy_events.handles()[i],
                ));
            }
            // Kernel i folds slot i into the accumulator; the chain through
            // kernel events serializes the accumulation.
            for i in 0..peer_count {
                let slot = args.tmp_buf.byte_add(i * block_bytes);
                let inputs = if i == 0 {
                    vec![local_seg, slot]
                } else {
                    vec![acc, slot]
                };
                let mut wait = vec![pre_copy_events.handles()[i]];
                if i > 0 {
                    wait.push(kernel_events.handles()[i - 1]);
                }
                list.push(Command::new(
                    CommandKind::Reduce {
                        inputs,
                        output: acc,
                        count: args.block_count,
                        dtype: args.dtype,
                        op: args.op,
                    },
                    wait,
                    kernel_events.handles()[i],
                ));
            }
        }
        KernelPolicy::Merged => {
            for (i, peer) in args.peer_send_bufs.iter().enumerate() {
                list.push(Command::new(
                    CommandKind::Copy {
                        src: peer_seg(peer, 0),
                        dst: args.tmp_buf.byte_add(i * block_bytes),
                        bytes: block_bytes,
                    },
                    vec![barrier],
                    pre_copy_events.handles()[i],
                ));
            }
            let mut inputs = vec![local_seg];
            inputs.extend((0..peer_count).map(|i| args.tmp_buf.byte_add(i * block_bytes)));
            list.push(Command::new(
                CommandKind::Reduce {
                    inputs,
                    output: acc,
                    count: args.block_count,
                    dtype: args.dtype,
                    op: args.op,
                },
                pre_copy_events.handles().to_vec(),
                kernel_events.handles()[0],
            ));
        }
        KernelPolicy::Monolithic => {
            // No staging copies; the aligned/leftover kernel pair reads peer
            // memory directly. An empty half still signals its event so the
            // set size stays policy-determined.
            let (aligned, leftover) = align_split(args.block_count, es);
            let splits = [(0usize, aligned), (aligned, leftover)];
            for (k, (start, count)) in splits.into_iter().enumerate() {
                let event = kernel_events.handles()[k];
                if count == 0 {
                    list.push(Command::new(CommandKind::Barrier, vec![barrier], event));
                    continue;
                }
                let mut inputs = vec![local_seg.byte_add(start * es)];
                inputs.extend(args.peer_send_bufs.iter().map(|peer| peer_seg(peer, start)));
                list.push(Command::new(
                    CommandKind::Reduce {
                        inputs,
                        output: acc.byte_add(start * es),
                        count,
                        dtype: args.dtype,
                        op: args.op,
                    },
                    vec![barrier],
                    event,
                ));
            }
        }
    }
}
