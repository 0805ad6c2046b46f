//! Multi-rank allreduce over the in-process host device: every rank of the
//! simulated cluster shares one device arena and one peer-buffer registry,
//! standing in for IPC-mapped peer memory.

use std::sync::Arc;

use devcoll::coll::{DataType, ReduceOp};
use devcoll::comm::{Communicator, CommunicatorId};
use devcoll::config::CollConfig;
use devcoll::device::host::HostDevice;
use devcoll::device::{Buffer, DeviceApi};
use devcoll::registry::PeerBufferRegistry;
use devcoll::sched::entry::allreduce::{A2aAllReduceEntry, AllReduceParams};
use devcoll::sched::entry::{EntryError, EntryStatus};
use devcoll::sched::Schedule;

const SEND_BUF_IDX: usize = 0;
const RECV_BUF_IDX: usize = 1;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn i32_bytes(values: &[i32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_ne_bytes()).collect()
}

fn i32_from_bytes(bytes: &[u8]) -> Vec<i32> {
    bytes
        .chunks_exact(4)
        .map(|c| i32::from_ne_bytes(c.try_into().unwrap()))
        .collect()
}

struct Cluster {
    device: Arc<HostDevice>,
    api: Arc<dyn DeviceApi>,
    registry: Arc<PeerBufferRegistry>,
    send_bufs: Vec<Buffer>,
    recv_bufs: Vec<Buffer>,
    comm_size: usize,
}

impl Cluster {
    fn new(comm_size: usize, bytes_per_rank: usize) -> Self {
        let device = Arc::new(HostDevice::new());
        let api: Arc<dyn DeviceApi> = device.clone();
        let registry = Arc::new(PeerBufferRegistry::new());
        let mut send_bufs = Vec::with_capacity(comm_size);
        let mut recv_bufs = Vec::with_capacity(comm_size);
        for rank in 0..comm_size {
            let send = Buffer::new(api.alloc_device(bytes_per_rank).unwrap());
            let recv = Buffer::new(api.alloc_device(bytes_per_rank).unwrap());
            registry.register(rank, SEND_BUF_IDX, send).unwrap();
            registry.register(rank, RECV_BUF_IDX, recv).unwrap();
            send_bufs.push(send);
            recv_bufs.push(recv);
        }
        Cluster {
            device,
            api,
            registry,
            send_bufs,
            recv_bufs,
            comm_size,
        }
    }

    fn entry(
        &self,
        rank: usize,
        cnt: usize,
        dtype: DataType,
        op: ReduceOp,
        config: &CollConfig,
    ) -> A2aAllReduceEntry {
        let comm = Arc::new(Communicator::new(CommunicatorId(7), rank, self.comm_size));
        let params = AllReduceParams {
            send_buf: self.send_bufs[rank],
            recv_buf: self.recv_bufs[rank],
            cnt,
            dtype,
            op,
            send_buf_idx: SEND_BUF_IDX,
            recv_buf_idx: RECV_BUF_IDX,
            peer_buf_offset: 0,
        };
        A2aAllReduceEntry::new(
            Arc::clone(&self.api),
            comm,
            params,
            config,
            Arc::clone(&self.registry),
            vec![],
        )
    }

    fn run_to_completion(&self, schedule: &mut Schedule) {
        for _ in 0..100_000 {
            if schedule.completed() && self.device.pending() == 0 {
                return;
            }
            self.device.progress_one().unwrap();
            schedule.progress();
        }
        panic!("schedule did not complete");
    }
}

fn run_i32(
    comm_size: usize,
    cnt: usize,
    config: &CollConfig,
    op: ReduceOp,
    inputs: &[Vec<i32>],
) -> Vec<Vec<i32>> {
    init_logging();
    let bytes = cnt * 4;
    let cluster = Cluster::new(comm_size, bytes);
    for rank in 0..comm_size {
        cluster
            .device
            .upload(cluster.send_bufs[rank], &i32_bytes(&inputs[rank]))
            .unwrap();
    }
    let mut schedule = Schedule::new(Arc::clone(&cluster.api));
    for rank in 0..comm_size {
        schedule
            .enqueue(cluster.entry(rank, cnt, DataType::Int32, op, config))
            .unwrap();
    }
    schedule.initialize_all().unwrap();
    schedule.start_all().unwrap();
    cluster.run_to_completion(&mut schedule);
    (0..comm_size)
        .map(|rank| {
            i32_from_bytes(
                &cluster
                    .device
                    .download(cluster.recv_bufs[rank], bytes)
                    .unwrap(),
            )
        })
        .collect()
}

fn make_inputs(comm_size: usize, cnt: usize) -> Vec<Vec<i32>> {
    (0..comm_size)
        .map(|rank| {
            (0..cnt)
                .map(|j| (rank as i32 + 1) * 10 + j as i32)
                .collect()
        })
        .collect()
}

fn elementwise_sum(inputs: &[Vec<i32>]) -> Vec<i32> {
    let cnt = inputs[0].len();
    (0..cnt)
        .map(|j| inputs.iter().map(|v| v[j]).sum())
        .collect()
}

fn policy_configs() -> Vec<(&'static str, CollConfig)> {
    vec![
        ("per_peer", CollConfig::default()),
        (
            "merged",
            CollConfig {
                enable_single_reduce_kernel: true,
                ..Default::default()
            },
        ),
        (
            "monolithic",
            CollConfig {
                reduce_scatter_monolithic_kernel: true,
                all_gather_monolithic_kernel: true,
                ..Default::default()
            },
        ),
    ]
}

#[test]
fn sum_all_policies_even_split() {
    let inputs = make_inputs(4, 64);
    let expected = elementwise_sum(&inputs);
    for (name, config) in policy_configs() {
        let outputs = run_i32(4, 64, &config, ReduceOp::Sum, &inputs);
        for (rank, output) in outputs.iter().enumerate() {
            assert_eq!(output, &expected, "policy {name}, rank {rank}");
        }
    }
}

#[test]
fn sum_all_policies_uneven_split() {
    // 70 over 4 ranks: blocks {17,17,17,19}; exercises both halves of the
    // aligned/leftover split
    let inputs = make_inputs(4, 70);
    let expected = elementwise_sum(&inputs);
    for (name, config) in policy_configs() {
        let outputs = run_i32(4, 70, &config, ReduceOp::Sum, &inputs);
        for (rank, output) in outputs.iter().enumerate() {
            assert_eq!(output, &expected, "policy {name}, rank {rank}");
        }
    }
}

#[test]
fn sum_with_offset_views_into_registered_regions() {
    // registered buffers are bases of a larger region while the operation
    // views sit a few elements in; every peer access goes through the
    // element offset, and the bytes below the views must survive untouched
    init_logging();
    let comm_size = 3;
    let cnt = 10;
    let offset = 4;
    let region_bytes = (offset + cnt) * 4;
    let prefix = vec![0x5au8; offset * 4];
    let inputs = make_inputs(comm_size, cnt);
    let expected = elementwise_sum(&inputs);
    for (name, config) in policy_configs() {
        let device = Arc::new(HostDevice::new());
        let api: Arc<dyn DeviceApi> = device.clone();
        let registry = Arc::new(PeerBufferRegistry::new());
        let mut send_bases = Vec::with_capacity(comm_size);
        let mut recv_bases = Vec::with_capacity(comm_size);
        for rank in 0..comm_size {
            let send_base = Buffer::new(api.alloc_device(region_bytes).unwrap());
            let recv_base = Buffer::new(api.alloc_device(region_bytes).unwrap());
            registry.register(rank, SEND_BUF_IDX, send_base).unwrap();
            registry.register(rank, RECV_BUF_IDX, recv_base).unwrap();
            device.upload(send_base, &prefix).unwrap();
            device.upload(recv_base, &prefix).unwrap();
            device
                .upload(send_base.byte_add(offset * 4), &i32_bytes(&inputs[rank]))
                .unwrap();
            send_bases.push(send_base);
            recv_bases.push(recv_base);
        }
        let mut schedule = Schedule::new(Arc::clone(&api));
        for rank in 0..comm_size {
            let comm = Arc::new(Communicator::new(CommunicatorId(7), rank, comm_size));
            let params = AllReduceParams {
                send_buf: send_bases[rank].byte_add(offset * 4),
                recv_buf: recv_bases[rank].byte_add(offset * 4),
                cnt,
                dtype: DataType::Int32,
                op: ReduceOp::Sum,
                send_buf_idx: SEND_BUF_IDX,
                recv_buf_idx: RECV_BUF_IDX,
                peer_buf_offset: offset,
            };
            let entry = A2aAllReduceEntry::new(
                Arc::clone(&api),
                comm,
                params,
                &config,
                Arc::clone(&registry),
                vec![],
            );
            schedule.enqueue(entry).unwrap();
        }
        schedule.initialize_all().unwrap();
        schedule.start_all().unwrap();
        for _ in 0..100_000 {
            if schedule.completed() && device.pending() == 0 {
                break;
            }
            device.progress_one().unwrap();
            schedule.progress();
        }
        assert!(schedule.completed(), "policy {name}");
        for rank in 0..comm_size {
            let region = device.download(recv_bases[rank], region_bytes).unwrap();
            assert_eq!(
                &region[..offset * 4],
                &prefix[..],
                "policy {name}, rank {rank}: bytes below the view were clobbered"
            );
            let output = i32_from_bytes(&region[offset * 4..]);
            assert_eq!(output, expected, "policy {name}, rank {rank}");
        }
    }
}

#[test]
fn policies_agree_elementwise() {
    let inputs = make_inputs(3, 10);
    let runs: Vec<_> = policy_configs()
        .into_iter()
        .map(|(name, config)| (name, run_i32(3, 10, &config, ReduceOp::Sum, &inputs)))
        .collect();
    for window in runs.windows(2) {
        assert_eq!(
            window[0].1, window[1].1,
            "{} and {} disagree",
            window[0].0, window[1].0
        );
    }
}

#[test]
fn max_reduction() {
    let inputs = vec![
        vec![5, -3, 9, 0, 2, 2, 7, 1],
        vec![1, 8, -9, 4, 2, 6, 0, 3],
        vec![3, 3, 3, 3, 3, 3, 3, 3],
    ];
    let expected = vec![5, 8, 9, 4, 3, 6, 7, 3];
    for (name, config) in policy_configs() {
        let outputs = run_i32(3, 8, &config, ReduceOp::Max, &inputs);
        for output in &outputs {
            assert_eq!(output, &expected, "policy {name}");
        }
    }
}

#[test]
fn float32_sum() {
    init_logging();
    let comm_size = 3;
    let cnt = 11;
    let cluster = Cluster::new(comm_size, cnt * 4);
    for rank in 0..comm_size {
        let values: Vec<f32> = (0..cnt).map(|j| rank as f32 + j as f32 * 0.5).collect();
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_ne_bytes()).collect();
        cluster
            .device
            .upload(cluster.send_bufs[rank], &bytes)
            .unwrap();
    }
    let mut schedule = Schedule::new(Arc::clone(&cluster.api));
    for rank in 0..comm_size {
        schedule
            .enqueue(cluster.entry(
                rank,
                cnt,
                DataType::Float32,
                ReduceOp::Sum,
                &CollConfig::default(),
            ))
            .unwrap();
    }
    schedule.initialize_all().unwrap();
    schedule.start_all().unwrap();
    cluster.run_to_completion(&mut schedule);
    for rank in 0..comm_size {
        let bytes = cluster
            .device
            .download(cluster.recv_bufs[rank], cnt * 4)
            .unwrap();
        let output: Vec<f32> = bytes
            .chunks_exact(4)
            .map(|c| f32::from_ne_bytes(c.try_into().unwrap()))
            .collect();
        for (j, value) in output.iter().enumerate() {
            let expected = (0..comm_size).map(|r| r as f32 + j as f32 * 0.5).sum::<f32>();
            assert!((value - expected).abs() < 1e-5, "rank {rank} index {j}");
        }
    }
}

#[test]
fn int8_sum_with_monolithic_flags() {
    // the monolithic all-gather must stay disabled for int8 regardless of
    // flags; the operation still has to produce correct results
    init_logging();
    let comm_size = 3;
    let cnt = 9;
    let config = CollConfig {
        reduce_scatter_monolithic_kernel: true,
        all_gather_monolithic_kernel: true,
        ..Default::default()
    };
    let cluster = Cluster::new(comm_size, cnt);
    for rank in 0..comm_size {
        let values: Vec<u8> = (0..cnt).map(|j| (rank * 10 + j) as u8).collect();
        cluster
            .device
            .upload(cluster.send_bufs[rank], &values)
            .unwrap();
    }
    let mut schedule = Schedule::new(Arc::clone(&cluster.api));
    for rank in 0..comm_size {
        schedule
            .enqueue(cluster.entry(rank, cnt, DataType::Int8, ReduceOp::Sum, &config))
            .unwrap();
    }
    schedule.initialize_all().unwrap();
    schedule.start_all().unwrap();
    cluster.run_to_completion(&mut schedule);
    for rank in 0..comm_size {
        let output = cluster
            .device
            .download(cluster.recv_bufs[rank], cnt)
            .unwrap();
        let expected: Vec<u8> = (0..cnt)
            .map(|j| (0..comm_size).map(|r| (r * 10 + j) as i8).sum::<i8>() as u8)
            .collect();
        assert_eq!(output, expected, "rank {rank}");
    }
}

#[test]
fn single_rank_in_place_skips() {
    init_logging();
    let cluster = Cluster::new(1, 16);
    let comm = Arc::new(Communicator::new(CommunicatorId(1), 0, 1));
    let params = AllReduceParams {
        send_buf: cluster.send_bufs[0],
        recv_buf: cluster.send_bufs[0],
        cnt: 4,
        dtype: DataType::Int32,
        op: ReduceOp::Sum,
        send_buf_idx: SEND_BUF_IDX,
        recv_buf_idx: SEND_BUF_IDX,
        peer_buf_offset: 0,
    };
    let mut entry = A2aAllReduceEntry::new(
        Arc::clone(&cluster.api),
        comm,
        params,
        &CollConfig::default(),
        Arc::clone(&cluster.registry),
        vec![],
    );
    assert!(entry.skip());
    entry.start().unwrap();
    assert_eq!(entry.status(), EntryStatus::Complete);
    assert!(cluster.device.is_signaled(entry.entry_event()));
    assert_eq!(cluster.device.pending(), 0);
}

#[test]
fn single_rank_out_of_place_copies() {
    let inputs = vec![vec![4, 8, 15, 16, 23]];
    for (name, config) in policy_configs() {
        let outputs = run_i32(1, 5, &config, ReduceOp::Sum, &inputs);
        assert_eq!(outputs[0], inputs[0], "policy {name}");
    }
}

#[test]
fn zero_count_skips_every_rank() {
    init_logging();
    let cluster = Cluster::new(3, 0);
    let mut schedule = Schedule::new(Arc::clone(&cluster.api));
    for rank in 0..3 {
        let entry = cluster.entry(rank, 0, DataType::Int32, ReduceOp::Sum, &CollConfig::default());
        assert!(entry.skip(), "rank {rank} must skip for cnt=0");
        let event = schedule.enqueue(entry).unwrap();
        assert!(cluster.device.is_signaled(event));
    }
    assert!(schedule.completed());
    assert_eq!(cluster.device.pending(), 0);
}

#[test]
fn sparse_count_excludes_trailing_ranks() {
    // cnt=3, comm_size=5: ranks 3 and 4 own nothing and skip, but still
    // contribute inputs and still receive the result by peer write
    init_logging();
    let comm_size = 5;
    let cnt = 3;
    let cluster = Cluster::new(comm_size, cnt * 4);
    let inputs = make_inputs(comm_size, cnt);
    for rank in 0..comm_size {
        cluster
            .device
            .upload(cluster.send_bufs[rank], &i32_bytes(&inputs[rank]))
            .unwrap();
    }
    let mut schedule = Schedule::new(Arc::clone(&cluster.api));
    for rank in 0..comm_size {
        let entry = cluster.entry(rank, cnt, DataType::Int32, ReduceOp::Sum, &CollConfig::default());
        assert_eq!(entry.skip(), rank >= cnt, "rank {rank}");
        schedule.enqueue(entry).unwrap();
    }
    assert_eq!(schedule.pending(), cnt);
    schedule.initialize_all().unwrap();
    schedule.start_all().unwrap();
    cluster.run_to_completion(&mut schedule);
    let expected = elementwise_sum(&inputs);
    for rank in 0..comm_size {
        let output = i32_from_bytes(
            &cluster
                .device
                .download(cluster.recv_bufs[rank], cnt * 4)
                .unwrap(),
        );
        assert_eq!(output, expected, "rank {rank}");
    }
}

#[test]
fn update_is_monotonic() {
    init_logging();
    let comm_size = 2;
    let cnt = 32;
    let cluster = Cluster::new(comm_size, cnt * 4);
    let inputs = make_inputs(comm_size, cnt);
    for rank in 0..comm_size {
        cluster
            .device
            .upload(cluster.send_bufs[rank], &i32_bytes(&inputs[rank]))
            .unwrap();
    }
    let mut entry = cluster.entry(0, cnt, DataType::Int32, ReduceOp::Sum, &CollConfig::default());
    entry.initialize().unwrap();
    entry.start().unwrap();

    // nothing has executed yet: repeated polls must stay Running
    for _ in 0..8 {
        assert_eq!(entry.update(), EntryStatus::Running);
    }

    let mut completed = false;
    for _ in 0..100_000 {
        let stepped = cluster.device.progress_one().unwrap();
        let status = entry.update();
        if completed {
            assert_eq!(status, EntryStatus::Complete, "completion must not regress");
        }
        if status == EntryStatus::Complete {
            completed = true;
        }
        if !stepped {
            break;
        }
    }
    assert!(completed);
    assert_eq!(entry.update(), EntryStatus::Complete);
    assert!(cluster.device.is_signaled(entry.entry_event()));
}

#[test]
fn schedule_destroys_issued_events_on_drop() {
    // the completion events handed out at enqueue stay pollable for as long
    // as the schedule lives, including those of fast-completed skip entries,
    // and are destroyed with it
    init_logging();
    let comm_size = 2;
    let cnt = 8;
    let cluster = Cluster::new(comm_size, cnt * 4);
    let inputs = make_inputs(comm_size, cnt);
    for rank in 0..comm_size {
        cluster
            .device
            .upload(cluster.send_bufs[rank], &i32_bytes(&inputs[rank]))
            .unwrap();
    }
    let mut events = Vec::new();
    {
        let mut schedule = Schedule::new(Arc::clone(&cluster.api));
        for rank in 0..comm_size {
            let entry = cluster.entry(rank, cnt, DataType::Int32, ReduceOp::Sum, &CollConfig::default());
            events.push(schedule.enqueue(entry).unwrap());
        }
        let skip_entry = cluster.entry(0, 0, DataType::Int32, ReduceOp::Sum, &CollConfig::default());
        assert!(skip_entry.skip());
        events.push(schedule.enqueue(skip_entry).unwrap());
        schedule.initialize_all().unwrap();
        schedule.start_all().unwrap();
        cluster.run_to_completion(&mut schedule);
        for &event in &events {
            assert!(cluster.device.is_signaled(event));
        }
    }
    for &event in &events {
        assert!(!cluster.device.is_signaled(event));
    }
}

#[test]
fn external_wait_events_gate_all_work() {
    init_logging();
    let comm_size = 2;
    let cnt = 8;
    let cluster = Cluster::new(comm_size, cnt * 4);
    let inputs = make_inputs(comm_size, cnt);
    for rank in 0..comm_size {
        cluster
            .device
            .upload(cluster.send_bufs[rank], &i32_bytes(&inputs[rank]))
            .unwrap();
    }
    let gate = cluster.api.create_event();
    let comm = Arc::new(Communicator::new(CommunicatorId(7), 0, comm_size));
    let params = AllReduceParams {
        send_buf: cluster.send_bufs[0],
        recv_buf: cluster.recv_bufs[0],
        cnt,
        dtype: DataType::Int32,
        op: ReduceOp::Sum,
        send_buf_idx: SEND_BUF_IDX,
        recv_buf_idx: RECV_BUF_IDX,
        peer_buf_offset: 0,
    };
    let mut entry = A2aAllReduceEntry::new(
        Arc::clone(&cluster.api),
        comm,
        params,
        &CollConfig::default(),
        Arc::clone(&cluster.registry),
        vec![gate],
    );
    entry.initialize().unwrap();
    entry.start().unwrap();

    assert_eq!(cluster.device.progress().unwrap(), 0);
    assert_eq!(entry.update(), EntryStatus::Running);

    cluster.api.signal(gate);
    cluster.device.progress().unwrap();
    assert_eq!(entry.update(), EntryStatus::Complete);
}

#[test]
fn missing_peer_buffer_is_fatal() {
    init_logging();
    let cluster = Cluster::new(2, 16);
    cluster.registry.deregister(1, SEND_BUF_IDX).unwrap();
    let mut entry = cluster.entry(0, 4, DataType::Int32, ReduceOp::Sum, &CollConfig::default());
    let err = entry.initialize().unwrap_err();
    assert!(
        matches!(err, EntryError::NullPeerBuffer { rank: 1, index: SEND_BUF_IDX }),
        "unexpected error: {err}"
    );
}

#[test]
fn read_based_all_gather_rejected() {
    init_logging();
    let cluster = Cluster::new(2, 16);
    let config = CollConfig {
        all_gather_topo_read: true,
        ..Default::default()
    };
    let mut entry = cluster.entry(0, 4, DataType::Int32, ReduceOp::Sum, &config);
    assert!(matches!(
        entry.initialize().unwrap_err(),
        EntryError::UnsupportedConfig(_)
    ));
}

#[test]
fn entry_introspection() {
    let cluster = Cluster::new(2, 16);
    let entry = cluster.entry(0, 4, DataType::Int32, ReduceOp::Sum, &CollConfig::default());
    assert_eq!(entry.name(), "A2A_ALLREDUCE");
    assert_eq!(entry.name_ext(), "A2A_ALLREDUCE:16");
    let detail = entry.dump_detail();
    assert!(detail.contains("cnt 4"));
    assert!(detail.contains("comm 7 rank 0/2"));
}
