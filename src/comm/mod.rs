use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CommunicatorId(pub u32);

/// A fixed, ordered set of ranks over which one collective operates.
///
/// Owned by the surrounding runtime; entries hold a shared reference for the
/// duration of a single operation and never mutate it.
#[derive(Debug, Clone)]
pub struct Communicator {
    id: CommunicatorId,
    rank: usize,
    num_ranks: usize,
}

impl Communicator {
    pub fn new(id: CommunicatorId, rank: usize, num_ranks: usize) -> Self {
        assert!(num_ranks >= 1, "communicator must have at least one rank");
        assert!(rank < num_ranks, "rank {rank} out of range for size {num_ranks}");
        Communicator {
            id,
            rank,
            num_ranks,
        }
    }

    #[inline]
    pub fn id(&self) -> CommunicatorId {
        self.id
    }

    #[inline]
    pub fn rank(&self) -> usize {
        self.rank
    }

    #[inline]
    pub fn num_ranks(&self) -> usize {
        self.num_ranks
    }

    /// Number of remote participants.
    #[inline]
    pub fn peer_count(&self) -> usize {
        self.num_ranks - 1
    }
}

impl fmt::Display for Communicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "comm {} rank {}/{}", self.id.0, self.rank, self.num_ranks)
    }
}
