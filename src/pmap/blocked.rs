use std::sync::Arc;

use super::{Pmap, PmapError, check};
use crate::runtime::{Rank, World};

/// Splits the ordinals into contiguous blocks, one per rank.
///
/// Blocks hold `ceil(size / procs)` tiles on the lowest `size % procs` ranks and one fewer on
/// the rest, so 10 tiles over 4 ranks split as 3, 3, 2, 2 rather than 3, 3, 3, 1. Every rank
/// owns a tile whenever `size >= procs`.
#[derive(Debug, Clone)]
pub struct BlockedPmap {
    rank: Rank,
    procs: usize,
    size: usize,
    block: usize,
    remainder: usize,
    local: Arc<[usize]>,
}

impl BlockedPmap {
    pub fn new(rank: Rank, procs: usize, size: usize) -> Result<Self, PmapError> {
        check(rank, procs)?;
        Ok(Self::build(rank, procs, size))
    }

    /// A blocked map of `size` tiles over all ranks of `world`.
    #[inline]
    pub fn for_world(world: &World, size: usize) -> Self {
        Self::build(world.rank(), world.size(), size)
    }

    fn build(rank: Rank, procs: usize, size: usize) -> Self {
        let block = size / procs;
        let remainder = size % procs;
        let start = rank * block + rank.min(remainder);
        let len = block + usize::from(rank < remainder);
        let local = (start..start + len).collect();
        Self {
            rank,
            procs,
            size,
            block,
            remainder,
            local,
        }
    }
}

impl Pmap for BlockedPmap {
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
        self.size
    }

    #[inline]
    fn owner(&self, ordinal: usize) -> Rank {
        let boundary = self.remainder * (self.block + 1);
        match ordinal < boundary {
            true => ordinal / (self.block + 1),
            false => self.remainder + (ordinal - boundary) / self.block,
        }
    }

    #[inline]
    fn local(&self) -> &[usize] {
        &self.local
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use itertools::Itertools;

    use super::BlockedPmap;
    use crate::pmap::{Pmap, PmapError, tests::assert_partition};

    #[test]
    fn test_partition() -> Result<(), Box<dyn Error>> {
        for (procs, size) in itertools::iproduct!(1..6, [0, 1, 3, 10, 17]) {
            let pmaps: Vec<_> = (0..procs)
                .map(|rank| BlockedPmap::new(rank, procs, size))
                .try_collect()?;
            if size > 0 {
                assert_partition(&pmaps);
            }
            let sizes = pmaps.iter().map(Pmap::local_size).collect_vec();
            assert!(sizes.iter().all(|&len| len <= size.div_ceil(procs)));
            assert!(sizes.iter().tuple_windows().all(|(x, y)| x >= y));
            if size >= procs {
                assert!(sizes.iter().all(|&len| len > 0));
            }
        }
        Ok(())
    }

    #[test]
    fn test_blocks() -> Result<(), Box<dyn Error>> {
        let pmaps: Vec<_> = (0..4).map(|rank| BlockedPmap::new(rank, 4, 10)).try_collect()?;
        let sizes = pmaps.iter().map(Pmap::local_size).collect_vec();
        assert_eq!(sizes, [3, 3, 2, 2]);
        assert_eq!(pmaps[1].local(), &[3, 4, 5]);
        assert_eq!(pmaps[3].owner(9), 3);
        assert_eq!(pmaps[0].owner(6), 2);

        assert!(matches!(BlockedPmap::new(4, 4, 10), Err(PmapError::Rank(4, 4))));
        assert!(matches!(BlockedPmap::new(0, 0, 10), Err(PmapError::NoProcess)));
        Ok(())
    }
}
