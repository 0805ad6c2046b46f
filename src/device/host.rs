//! In-process device backend over host memory.
//!
//! Implements the full [`DeviceApi`] contract against a plain byte arena and
//! executes submitted commands cooperatively: each `progress_one` call runs
//! the first queued command whose wait events are all signaled, then signals
//! its completion event. This is the reference semantics for event-graph
//! completion and the backend the test suite runs real multi-rank numerics
//! on.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::coll::{DataType, ReduceOp};

use super::{
    Buffer, BufferHandle, Command, CommandKind, CommandList, DeviceApi, DeviceError, EventHandle,
};

struct HostState {
    buffers: HashMap<u64, Vec<u8>>,
    next_buffer: u64,
    events: HashMap<u64, bool>,
    next_event: u64,
    queue: Vec<Command>,
}

pub struct HostDevice {
    state: Mutex<HostState>,
}

impl HostDevice {
    pub fn new() -> Self {
        HostDevice {
            state: Mutex::new(HostState {
                buffers: HashMap::new(),
                next_buffer: 1,
                events: HashMap::new(),
                next_event: 1,
                queue: Vec::new(),
            }),
        }
    }

    /// Copy `data` into device memory at the view's offset.
    pub fn upload(&self, buf: Buffer, data: &[u8]) -> Result<(), DeviceError> {
        let mut state = self.state.lock().unwrap();
        let region = region_mut(&mut state.buffers, buf, data.len())?;
        region.copy_from_slice(data);
        Ok(())
    }

    /// Copy `len` bytes out of device memory at the view's offset.
    pub fn download(&self, buf: Buffer, len: usize) -> Result<Vec<u8>, DeviceError> {
        let state = self.state.lock().unwrap();
        region(&state.buffers, buf, len).map(|r| r.to_vec())
    }

    /// Execute the first queued command whose dependencies are satisfied.
    /// Returns `false` when nothing is ready.
    pub fn progress_one(&self) -> Result<bool, DeviceError> {
        let mut state = self.state.lock().unwrap();
        let ready = state.queue.iter().position(|cmd| {
            cmd.wait
                .iter()
                .all(|ev| state.events.get(&ev.0).copied().unwrap_or(false))
        });
        let Some(idx) = ready else {
            return Ok(false);
        };
        let cmd = state.queue.remove(idx);
        execute(&mut state, &cmd)?;
        state.events.insert(cmd.signal.0, true);
        log::trace!("host device executed command, {} pending", state.queue.len());
        Ok(true)
    }

    /// Drain every runnable command; returns how many executed.
    pub fn progress(&self) -> Result<usize, DeviceError> {
        let mut executed = 0;
        while self.progress_one()? {
            executed += 1;
        }
        Ok(executed)
    }

    /// Number of submitted commands not yet executed.
    pub fn pending(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }
}

impl Default for HostDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceApi for HostDevice {
    fn alloc_device(&self, bytes: usize) -> Result<BufferHandle, DeviceError> {
        let mut state = self.state.lock().unwrap();
        let handle = BufferHandle(state.next_buffer);
        state.next_buffer += 1;
        state.buffers.insert(handle.0, vec![0u8; bytes]);
        Ok(handle)
    }

    fn free(&self, handle: BufferHandle) {
        self.state.lock().unwrap().buffers.remove(&handle.0);
    }

    fn create_event(&self) -> EventHandle {
        let mut state = self.state.lock().unwrap();
        let event = EventHandle(state.next_event);
        state.next_event += 1;
        state.events.insert(event.0, false);
        event
    }

    fn destroy_event(&self, event: EventHandle) {
        self.state.lock().unwrap().events.remove(&event.0);
    }

    fn is_signaled(&self, event: EventHandle) -> bool {
        self.state
            .lock()
            .unwrap()
            .events
            .get(&event.0)
            .copied()
            .unwrap_or(false)
    }

    fn signal(&self, event: EventHandle) {
        self.state.lock().unwrap().events.insert(event.0, true);
    }

    fn submit(&self, list: CommandList) -> Result<(), DeviceError> {
        let mut state = self.state.lock().unwrap();
        state.queue.extend(list.into_commands());
        Ok(())
    }
}

fn region<'a>(
    buffers: &'a HashMap<u64, Vec<u8>>,
    buf: Buffer,
    len: usize,
) -> Result<&'a [u8], DeviceError> {
    let backing = buffers
        .get(&buf.handle().0)
        .ok_or(DeviceError::InvalidHandle(buf.handle()))?;
    let offset = buf.byte_offset();
    backing
        .get(offset..offset + len)
        .ok_or(DeviceError::OutOfBounds {
            handle: buf.handle(),
            offset,
            len,
        })
}

fn region_mut<'a>(
    buffers: &'a mut HashMap<u64, Vec<u8>>,
    buf: Buffer,
    len: usize,
) -> Result<&'a mut [u8], DeviceError> {
    let backing = buffers
        .get_mut(&buf.handle().0)
        .ok_or(DeviceError::InvalidHandle(buf.handle()))?;
    let offset = buf.byte_offset();
    backing
        .get_mut(offset..offset + len)
        .ok_or(DeviceError::OutOfBounds {
            handle: buf.handle(),
            offset,
            len,
        })
}

fn execute(state: &mut HostState, cmd: &Command) -> Result<(), DeviceError> {
    match &cmd.kind {
        CommandKind::Barrier => {}
        CommandKind::Copy { src, dst, bytes } => {
            // Staged through an owned copy so src and dst may share a backing
            // allocation.
            let data = region(&state.buffers, *src, *bytes)?.to_vec();
            region_mut(&mut state.buffers, *dst, *bytes)?.copy_from_slice(&data);
        }
        CommandKind::Broadcast { src, dsts, bytes } => {
            let data = region(&state.buffers, *src, *bytes)?.to_vec();
            for dst in dsts {
                region_mut(&mut state.buffers, *dst, *bytes)?.copy_from_slice(&data);
            }
        }
        CommandKind::Reduce {
            inputs,
            output,
            count,
            dtype,
            op,
        } => {
            let bytes = count * dtype.count_bytes();
            let Some((first, rest)) = inputs.split_first() else {
                return Ok(());
            };
            // Inputs may alias the output region; snapshot before writing.
            let mut acc = region(&state.buffers, *first, bytes)?.to_vec();
            for input in rest {
                let src = region(&state.buffers, *input, bytes)?.to_vec();
                reduce_region(*dtype, *op, &mut acc, &src, *count);
            }
            region_mut(&mut state.buffers, *output, bytes)?.copy_from_slice(&acc);
        }
    }
    Ok(())
}

trait ReduceElem: Copy {
    fn combine(op: ReduceOp, a: Self, b: Self) -> Self;
}

macro_rules! int_reduce_elem {
    ($($ty:ty),*) => {$(
        impl ReduceElem for $ty {
            fn combine(op: ReduceOp, a: Self, b: Self) -> Self {
                match op {
                    ReduceOp::Sum => a.wrapping_add(b),
                    ReduceOp::Prod => a.wrapping_mul(b),
                    ReduceOp::Max => a.max(b),
                    ReduceOp::Min => a.min(b),
                }
            }
        }
    )*};
}

int_reduce_elem!(i8, u8, i32, u32, i64, u64);

macro_rules! float_reduce_elem {
    ($($ty:ty),*) => {$(
        impl ReduceElem for $ty {
            fn combine(op: ReduceOp, a: Self, b: Self) -> Self {
                match op {
                    ReduceOp::Sum => a + b,
                    ReduceOp::Prod => a * b,
                    ReduceOp::Max => a.max(b),
                    ReduceOp::Min => a.min(b),
                }
            }
        }
    )*};
}

float_reduce_elem!(f32, f64);

macro_rules! reduce_lanes {
    ($ty:ty, $acc:expr, $src:expr, $count:expr, $op:expr) => {{
        const SZ: usize = std::mem::size_of::<$ty>();
        for i in 0..$count {
            let a = <$ty>::from_ne_bytes($acc[i * SZ..(i + 1) * SZ].try_into().unwrap());
            let b = <$ty>::from_ne_bytes($src[i * SZ..(i + 1) * SZ].try_into().unwrap());
            let r = <$ty as ReduceElem>::combine($op, a, b);
            $acc[i * SZ..(i + 1) * SZ].copy_from_slice(&r.to_ne_bytes());
        }
    }};
}

fn reduce_region(dtype: DataType, op: ReduceOp, acc: &mut [u8], src: &[u8], count: usize) {
    match dtype {
        DataType::Int8 => reduce_lanes!(i8, acc, src, count, op),
        DataType::Uint8 => reduce_lanes!(u8, acc, src, count, op),
        DataType::Int32 => reduce_lanes!(i32, acc, src, count, op),
        DataType::Uint32 => reduce_lanes!(u32, acc, src, count, op),
        DataType::Int64 => reduce_lanes!(i64, acc, src, count, op),
        DataType::Uint64 => reduce_lanes!(u64, acc, src, count, op),
        DataType::Float32 => reduce_lanes!(f32, acc, src, count, op),
        DataType::Float64 => reduce_lanes!(f64, acc, src, count, op),
    }
}
