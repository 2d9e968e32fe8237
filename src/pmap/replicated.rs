use std::sync::Arc;

use super::{Pmap, PmapError, check};
use crate::runtime::{Rank, World};

/// Every rank holds every tile.
#[derive(Debug, Clone)]
pub struct ReplicatedPmap {
    rank: Rank,
    procs: usize,
    local: Arc<[usize]>,
}

impl ReplicatedPmap {
    pub fn new(rank: Rank, procs: usize, size: usize) -> Result<Self, PmapError> {
        check(rank, procs)?;
        let local = (0..size).collect();
        Ok(Self { rank, procs, local })
    }

    #[inline]
    pub fn for_world(world: &World, size: usize) -> Self {
        let rank = world.rank();
        let procs = world.size();
        let local = (0..size).collect();
        Self { rank, procs, local }
    }
}

impl Pmap for ReplicatedPmap {
    #[inline]
    fn rank(&self) -> Rank {
        self.rank
    }

    #[inline]
    fn procs(&self) -> usize {
        self.procs
    }

    #[inline]
    fn size(&self) -> usize {
        self.local.len()
    }

    /// Every tile is owned by the asking rank.
    #[inline]
    fn owner(&self, _ordinal: usize) -> Rank {
        self.rank
    }

    #[inline]
    fn local(&self) -> &[usize] {
        &self.local
    }

    #[inline]
    fn is_local(&self, ordinal: usize) -> bool {
        ordinal < self.local.len()
    }

    #[inline]
    fn is_replicated(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::ReplicatedPmap;
    use crate::pmap::Pmap;

    #[test]
    fn test_replicated() -> Result<(), Box<dyn Error>> {
        for rank in 0..3 {
            let pmap = ReplicatedPmap::new(rank, 3, 5)?;
            assert!(pmap.is_replicated());
            assert_eq!(pmap.local(), &[0, 1, 2, 3, 4]);
            assert!((0..5).all(|ordinal| pmap.is_local(ordinal) && pmap.owner(ordinal) == rank));
            assert!(!pmap.is_local(5));
        }
        Ok(())
    }
}
