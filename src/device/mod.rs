//! Device capability surface.
//!
//! The core never calls a vendor runtime directly. Everything it needs from
//! the device layer (memory, events, command submission) enters through
//! [`DeviceApi`]; the in-process [`host::HostDevice`] backend implements the
//! same contract over host memory and drives submitted work cooperatively.

pub mod alloc;
pub mod host;

use thiserror::Error;

use crate::coll::{DataType, ReduceOp};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct EventHandle(pub u64);

/// A view into device memory: an opaque allocation handle plus a byte offset.
///
/// Local and remote (IPC-mapped) memory address uniformly through this type;
/// views into peer memory are borrows scoped to one entry and must not be
/// retained across operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Buffer {
    handle: BufferHandle,
    byte_offset: usize,
}

impl Buffer {
    #[inline]
    pub fn new(handle: BufferHandle) -> Self {
        Buffer {
            handle,
            byte_offset: 0,
        }
    }

    #[inline]
    pub fn handle(&self) -> BufferHandle {
        self.handle
    }

    #[inline]
    pub fn byte_offset(&self) -> usize {
        self.byte_offset
    }

    /// A view `n` bytes further into the same allocation.
    #[inline]
    pub fn byte_add(self, n: usize) -> Self {
        Buffer {
            handle: self.handle,
            byte_offset: self.byte_offset + n,
        }
    }
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device out of memory allocating {0} bytes")]
    OutOfMemory(usize),
    #[error("invalid buffer handle {0:?}")]
    InvalidHandle(BufferHandle),
    #[error("access of {len} bytes at offset {offset} out of bounds for handle {handle:?}")]
    OutOfBounds {
        handle: BufferHandle,
        offset: usize,
        len: usize,
    },
}

/// One unit of device work.
///
/// `Barrier` performs no data movement; it exists to fan event dependencies
/// in and out of the graph (external wait events, padding a fixed-size event
/// set when a kernel split leaves one half empty).
pub enum CommandKind {
    Copy {
        src: Buffer,
        dst: Buffer,
        bytes: usize,
    },
    /// Elementwise reduction of `inputs` into `output`. Inputs may alias the
    /// output region; the executing backend reads all inputs before writing.
    Reduce {
        inputs: Vec<Buffer>,
        output: Buffer,
        count: usize,
        dtype: DataType,
        op: ReduceOp,
    },
    /// One source written to several destinations (the monolithic peer-write
    /// kernel shape).
    Broadcast {
        src: Buffer,
        dsts: Vec<Buffer>,
        bytes: usize,
    },
    Barrier,
}

pub struct Command {
    pub kind: CommandKind,
    /// Input dependencies: the command may not execute until every listed
    /// event is signaled.
    pub wait: Vec<EventHandle>,
    /// Signaled exactly once, after the command executes.
    pub signal: EventHandle,
}

impl Command {
    pub fn new(kind: CommandKind, wait: Vec<EventHandle>, signal: EventHandle) -> Self {
        Command { kind, wait, signal }
    }
}

/// Ordered collection of commands one entry builds during initialization and
/// submits at start. Execution order is governed by the event graph, not by
/// list position.
#[derive(Default)]
pub struct CommandList {
    commands: Vec<Command>,
}

impl CommandList {
    pub fn push(&mut self, command: Command) {
        self.commands.push(command);
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn into_commands(self) -> Vec<Command> {
        self.commands
    }
}

/// Capability surface consumed from the device runtime.
///
/// Event polling is idempotent and monotonic: once `is_signaled` reports
/// `true` for a handle it never reports `false` again. `submit` only
/// enqueues; nothing here blocks the calling thread.
pub trait DeviceApi: Send + Sync {
    fn alloc_device(&self, bytes: usize) -> Result<BufferHandle, DeviceError>;
    fn free(&self, handle: BufferHandle);

    fn create_event(&self) -> EventHandle;
    fn destroy_event(&self, event: EventHandle);
    fn is_signaled(&self, event: EventHandle) -> bool;
    fn signal(&self, event: EventHandle);

    fn submit(&self, list: CommandList) -> Result<(), DeviceError>;
}
