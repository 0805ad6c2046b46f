//! Cooperative schedule shell the outer scheduler drives.

pub mod entry;
pub mod partition;
pub mod policy;

use std::sync::Arc;

use entry::allreduce::A2aAllReduceEntry;
use entry::{EntryError, EntryStatus};

use crate::device::{DeviceApi, EventHandle};

/// Pending entries of one collective schedule. The owner repeatedly calls
/// [`Schedule::progress`]; completed entries are retired (dropping their
/// temporary buffers) as soon as they report complete.
///
/// The completion events handed out by [`Schedule::enqueue`] outlive their
/// entries and belong to the schedule: they stay pollable until the schedule
/// is dropped, which destroys them.
pub struct Schedule {
    api: Arc<dyn DeviceApi>,
    entries: Vec<A2aAllReduceEntry>,
    issued_events: Vec<EventHandle>,
}

impl Schedule {
    pub fn new(api: Arc<dyn DeviceApi>) -> Self {
        Schedule {
            api,
            entries: Vec::new(),
            issued_events: Vec::new(),
        }
    }

    /// Take ownership of an entry. Skip entries never join the pending list:
    /// they fast-complete here, signaling their completion event without any
    /// device work. Returns the entry's completion event either way.
    pub fn enqueue(&mut self, mut entry: A2aAllReduceEntry) -> Result<EventHandle, EntryError> {
        let event = entry.entry_event();
        self.issued_events.push(event);
        if entry.skip() {
            entry.start()?;
            return Ok(event);
        }
        self.entries.push(entry);
        Ok(event)
    }

    pub fn initialize_all(&mut self) -> Result<(), EntryError> {
        for entry in &mut self.entries {
            entry.initialize()?;
        }
        Ok(())
    }

    pub fn start_all(&mut self) -> Result<(), EntryError> {
        for entry in &mut self.entries {
            entry.start()?;
        }
        Ok(())
    }

    /// Poll every pending entry once and retire the completed ones. Never
    /// blocks; call again whenever the owner ticks.
    pub fn progress(&mut self) {
        let mut idx = 0;
        while idx < self.entries.len() {
            if self.entries[idx].update() == EntryStatus::Complete {
                self.entries.swap_remove(idx);
            } else {
                idx += 1;
            }
        }
    }

    pub fn completed(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn pending(&self) -> usize {
        self.entries.len()
    }
}

impl Drop for Schedule {
    fn drop(&mut self) {
        for event in self.issued_events.drain(..) {
            self.api.destroy_event(event);
        }
    }
}
