//! Entry framework: the schedulable unit of device work.
//!
//! An entry is driven by the outer scheduler through a non-blocking
//! lifecycle: construct, initialize (build device work), start (submit or
//! fast-complete), then repeated update polls until complete. Nothing in
//! this module blocks; completion is observed purely through device events.

pub mod all_gather;
pub mod allreduce;
pub mod reduce_scatter;

use std::sync::Arc;

use thiserror::Error;

use crate::comm::Communicator;
use crate::device::{Command, CommandKind, CommandList, DeviceApi, DeviceError, EventHandle};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryStatus {
    Created,
    Initialized,
    Running,
    Complete,
}

/// All entry failures are fatal for the whole collective: they are raised at
/// initialization or submission and there is no partial-success or retry
/// semantics at this layer.
#[derive(Debug, Error)]
pub enum EntryError {
    #[error("null IPC buffer received from rank {rank} (buffer index {index})")]
    NullPeerBuffer { rank: usize, index: usize },
    #[error("unsupported configuration: {0}")]
    UnsupportedConfig(&'static str),
    #[error("wrong segment count")]
    ZeroSegment,
    #[error("entry is in state {0:?}, expected {1:?}")]
    InvalidState(EntryStatus, EntryStatus),
    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// An ordered set of completion events; satisfied iff every handle polls
/// signaled.
#[derive(Default)]
pub struct EventSet {
    events: Vec<EventHandle>,
}

impl EventSet {
    #[inline]
    pub fn handles(&self) -> &[EventHandle] {
        &self.events
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn satisfied(&self, api: &dyn DeviceApi) -> bool {
        self.events.iter().all(|ev| api.is_signaled(*ev))
    }
}

/// Per-entry event allocator. Tracks every handle it hands out and destroys
/// them when the entry is retired.
pub struct EventPool {
    api: Arc<dyn DeviceApi>,
    created: Vec<EventHandle>,
}

impl EventPool {
    pub fn new(api: Arc<dyn DeviceApi>) -> Self {
        EventPool {
            api,
            created: Vec::new(),
        }
    }

    pub fn create(&mut self) -> EventHandle {
        let event = self.api.create_event();
        self.created.push(event);
        event
    }

    pub fn create_set(&mut self, count: usize) -> EventSet {
        EventSet {
            events: (0..count).map(|_| self.create()).collect(),
        }
    }

    pub fn created_count(&self) -> usize {
        self.created.len()
    }
}

impl Drop for EventPool {
    fn drop(&mut self) {
        for event in self.created.drain(..) {
            self.api.destroy_event(event);
        }
    }
}

/// State shared by every concrete entry: the device handle, communicator
/// reference, event pool, the command list under construction, and the
/// external completion event the outer scheduler watches.
pub struct BaseEntry {
    api: Arc<dyn DeviceApi>,
    comm: Arc<Communicator>,
    pool: EventPool,
    list: CommandList,
    wait_events: Vec<EventHandle>,
    entry_event: EventHandle,
    barrier_event: EventHandle,
    status: EntryStatus,
}

impl BaseEntry {
    pub fn new(
        api: Arc<dyn DeviceApi>,
        comm: Arc<Communicator>,
        wait_events: Vec<EventHandle>,
    ) -> Self {
        let mut pool = EventPool::new(Arc::clone(&api));
        // Not pool-owned: the outer scheduler keeps watching this handle
        // after the entry is retired and destroys it with the schedule.
        let entry_event = api.create_event();
        let barrier_event = pool.create();
        BaseEntry {
            api,
            comm,
            pool,
            list: CommandList::default(),
            wait_events,
            entry_event,
            barrier_event,
            status: EntryStatus::Created,
        }
    }

    #[inline]
    pub fn api(&self) -> &Arc<dyn DeviceApi> {
        &self.api
    }

    #[inline]
    pub fn comm(&self) -> &Communicator {
        &self.comm
    }

    #[inline]
    pub fn status(&self) -> EntryStatus {
        self.status
    }

    pub(crate) fn set_status(&mut self, status: EntryStatus) {
        self.status = status;
    }

    /// Signaled once the entry has fully completed; the only handle the
    /// outer scheduler needs to watch.
    #[inline]
    pub fn entry_event(&self) -> EventHandle {
        self.entry_event
    }

    /// Fan-in point for the external wait events: every stage command
    /// depends (directly or transitively) on this.
    #[inline]
    pub fn barrier_event(&self) -> EventHandle {
        self.barrier_event
    }

    pub(crate) fn pool_mut(&mut self) -> &mut EventPool {
        &mut self.pool
    }

    pub(crate) fn list_mut(&mut self) -> &mut CommandList {
        &mut self.list
    }

    /// First command of every entry: waits on the external dependencies and
    /// signals the barrier event the stages hang off.
    pub(crate) fn fill_barrier(&mut self) {
        let wait = self.wait_events.clone();
        self.list
            .push(Command::new(CommandKind::Barrier, wait, self.barrier_event));
    }

    /// Submit all built device work. Only enqueues; never blocks.
    pub(crate) fn submit(&mut self) -> Result<(), DeviceError> {
        let list = std::mem::take(&mut self.list);
        self.api.submit(list)?;
        self.status = EntryStatus::Running;
        Ok(())
    }

    #[inline]
    pub fn is_event_completed(&self, event: EventHandle) -> bool {
        self.api.is_signaled(event)
    }

    pub(crate) fn signal_entry_event(&self) {
        self.api.signal(self.entry_event);
    }
}
