//! Process maps: which rank owns each tile ordinal.

use std::{fmt::Debug, sync::Arc};

use thiserror::Error;

pub use blocked::BlockedPmap;
pub use cyclic::CyclicPmap;
pub use replicated::ReplicatedPmap;

use crate::runtime::Rank;

pub mod blocked;
pub mod cyclic;
pub mod replicated;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PmapError {
    #[error("process map needs at least one process")]
    NoProcess,
    #[error("rank {0} is out of {1} processes")]
    Rank(Rank, usize),
    #[error("process grid {0}x{1} does not fit in {2} processes")]
    Grid(usize, usize, usize),
}

/// Maps tile ordinals `0..size` to owning ranks. Every query is local and O(1).
pub trait Pmap: Debug + Send + Sync {
    /// Rank of this process.
    fn rank(&self) -> Rank;

    /// Number of processes.
    fn procs(&self) -> usize;

    /// Number of tiles mapped.
    fn size(&self) -> usize;

    /// Rank owning `ordinal`.
    fn owner(&self, ordinal: usize) -> Rank;

    /// Ordinals owned by this process, ascending.
    fn local(&self) -> &[usize];

    #[inline]
    fn is_local(&self, ordinal: usize) -> bool {
        self.owner(ordinal) == self.rank()
    }

    #[inline]
    fn local_size(&self) -> usize {
        self.local().len()
    }

    /// Whether every process holds every ordinal.
    #[inline]
    fn is_replicated(&self) -> bool {
        false
    }
}

pub type SharedPmap = Arc<dyn Pmap>;

fn check(rank: Rank, procs: usize) -> Result<(), PmapError> {
    match (rank, procs) {
        (_, 0) => Err(PmapError::NoProcess),
        (rank, procs) if rank >= procs => Err(PmapError::Rank(rank, procs)),
        _ => Ok(()),
    }
}
