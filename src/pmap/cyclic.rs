use std::sync::Arc;

use super::{Pmap, PmapError, check};
use crate::runtime::Rank;

/// Deals the tiles of a `rows × cols` matrix round-robin over a `proc_rows × proc_cols` process
/// grid: tile `(r, c)` belongs to rank `(r % proc_rows) * proc_cols + c % proc_cols`.
///
/// Ranks outside the grid own nothing.
#[derive(Debug, Clone)]
pub struct CyclicPmap {
    rank: Rank,
    procs: usize,
    rows: usize,
    cols: usize,
    proc_rows: usize,
    proc_cols: usize,
    local: Arc<[usize]>,
}

impl CyclicPmap {
    pub fn new(
        rank: Rank,
        procs: usize,
        rows: usize,
        cols: usize,
        proc_rows: usize,
        proc_cols: usize,
    ) -> Result<Self, PmapError> {
        check(rank, procs)?;
        if proc_rows == 0 || proc_cols == 0 || proc_rows * proc_cols > procs {
            return Err(PmapError::Grid(proc_rows, proc_cols, procs));
        }

        let local: Arc<[usize]> = match rank < proc_rows * proc_cols {
            true => {
                let rank_row = rank / proc_cols;
                let rank_col = rank % proc_cols;
                itertools::iproduct!(
                    (rank_row..rows).step_by(proc_rows),
                    (rank_col..cols).step_by(proc_cols)
                )
                .map(|(r, c)| r * cols + c)
                .collect()
            }
            false => [].into(),
        };
        Ok(Self {
            rank,
            procs,
            rows,
            cols,
            proc_rows,
            proc_cols,
            local,
        })
    }

    #[inline]
    pub fn rows(&self) -> usize {
        self.rows
    }

    #[inline]
    pub fn cols(&self) -> usize {
        self.cols
    }

    #[inline]
    pub fn proc_rows(&self) -> usize {
        self.proc_rows
    }

    #[inline]
    pub fn proc_cols(&self) -> usize {
        self.proc_cols
    }
}

impl Pmap for CyclicPmap {
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
        self.rows * self.cols
    }

    #[inline]
    fn owner(&self, ordinal: usize) -> Rank {
        let row = ordinal / self.cols;
        let col = ordinal % self.cols;
        (row % self.proc_rows) * self.proc_cols + col % self.proc_cols
    }

    #[inline]
    fn local(&self) -> &[usize] {
        &self.local
    }
}
