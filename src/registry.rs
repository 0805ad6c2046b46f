//! Peer device-buffer registry.
//!
//! Stand-in for the result table of the IPC handle-exchange protocol: once
//! ranks have exchanged memory handles, every rank can look up a view into a
//! peer's device buffer by `(peer_rank, buffer_index)`. Registrations rotate
//! between operations, so entries resolve peers once per initialization and
//! never cache the result.

use dashmap::DashMap;
use thiserror::Error;

use crate::device::Buffer;

#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("no buffer registered for rank {rank} index {index}")]
    NotFound { rank: usize, index: usize },
    #[error("buffer already registered for rank {rank} index {index}")]
    Exists { rank: usize, index: usize },
}

pub struct PeerBufferRegistry {
    buffers: DashMap<(usize, usize), Buffer>,
}

impl PeerBufferRegistry {
    pub fn new() -> Self {
        PeerBufferRegistry {
            buffers: DashMap::new(),
        }
    }

    pub fn register(&self, rank: usize, index: usize, buffer: Buffer) -> Result<(), Error> {
        match self.buffers.insert((rank, index), buffer) {
            Some(_) => Err(Error::Exists { rank, index }),
            None => Ok(()),
        }
    }

    pub fn deregister(&self, rank: usize, index: usize) -> Option<Buffer> {
        self.buffers.remove(&(rank, index)).map(|(_, buffer)| buffer)
    }

    /// Resolve a peer's buffer view. A missing registration means the
    /// handle-exchange contract with that rank is broken; callers treat it
    /// as fatal for the whole collective.
    pub fn resolve(&self, peer_rank: usize, index: usize) -> Result<Buffer, Error> {
        self.buffers
            .get(&(peer_rank, index))
            .map(|entry| *entry.value())
            .ok_or(Error::NotFound {
                rank: peer_rank,
                index,
            })
    }
}

impl Default for PeerBufferRegistry {
    fn default() -> Self {
        Self::new()
    }
}
