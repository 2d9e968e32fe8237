//! 2-D process grids for distributing matrix-shaped work.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    pmap::{CyclicPmap, PmapError},
    runtime::{Group, Rank, World},
    shape::Shape,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GridError {
    #[error("process grid needs a non-empty tile matrix, got {0} x {1}")]
    Empty(usize, usize),
    #[error("process grid needs non-zero element extents, got {0} x {1}")]
    Extent(usize, usize),
    #[error("rank {0} is out of {1} processes")]
    Rank(Rank, usize),
    #[error("process row {0} is out of {1} process rows")]
    ProcRow(usize, usize),
    #[error("process column {0} is out of {1} process columns")]
    ProcCol(usize, usize),
    #[error("{0} tiles cannot hold line {1} of a matrix with {2} lines")]
    Line(usize, usize, usize),
    #[error(transparent)]
    Pmap(#[from] PmapError),
}

/// Parameters of the Newton solver choosing the number of process rows.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct GridConfig {
    pub max_iterations: usize,
    /// The solver stops once a step moves the estimate by no more than this.
    pub tolerance: f64,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            max_iterations: 21,
            tolerance: 0.1,
        }
    }
}

/// A `proc_rows × proc_cols` arrangement of ranks over a `rows × cols` tile matrix.
///
/// Ranks beyond `proc_rows * proc_cols` sit outside the grid and hold no local tiles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessGrid {
    rank: Rank,
    procs: usize,
    rows: usize,
    cols: usize,
    proc_rows: usize,
    proc_cols: usize,
    rank_row: Option<usize>,
    rank_col: Option<usize>,
    local_rows: usize,
    local_cols: usize,
}

impl ProcessGrid {
    /// Builds the grid for this rank of `world`.
    ///
    /// `row_size` and `col_size` are the element extents of the matrix rows and columns.
    pub fn new(
        world: &World,
        rows: usize,
        cols: usize,
        row_size: usize,
        col_size: usize,
    ) -> Result<Self, GridError> {
        Self::for_rank(
            world.rank(),
            world.size(),
            rows,
            cols,
            row_size,
            col_size,
            world.grid_config(),
        )
    }

    /// Builds the grid as seen by `rank` out of `procs` processes.
    pub fn for_rank(
        rank: Rank,
        procs: usize,
        rows: usize,
        cols: usize,
        row_size: usize,
        col_size: usize,
        config: &GridConfig,
    ) -> Result<Self, GridError> {
        if rows == 0 || cols == 0 {
            return Err(GridError::Empty(rows, cols));
        }
        if row_size == 0 || col_size == 0 {
            return Err(GridError::Extent(row_size, col_size));
        }
        if rank >= procs {
            return Err(GridError::Rank(rank, procs));
        }

        let (proc_rows, proc_cols) = match procs {
            1 => (1, 1),
            _ if rows * cols <= procs => (rows, cols),
            _ => Self::solve(procs, rows, cols, row_size, col_size, config),
        };

        let (rank_row, rank_col) = match rank < proc_rows * proc_cols {
            true => (Some(rank / proc_cols), Some(rank % proc_cols)),
            false => (None, None),
        };
        let local_rows =
            rank_row.map_or(0, |r| rows / proc_rows + usize::from(r < rows % proc_rows));
        let local_cols =
            rank_col.map_or(0, |c| cols / proc_cols + usize::from(c < cols % proc_cols));

        log::debug!(
            "rank {rank} of {procs}: {proc_rows} x {proc_cols} process grid over {rows} x {cols} tiles"
        );
        Ok(Self {
            rank,
            procs,
            rows,
            cols,
            proc_rows,
            proc_cols,
            rank_row,
            rank_col,
            local_rows,
            local_cols,
        })
    }

    fn solve(
        procs: usize,
        rows: usize,
        cols: usize,
        row_size: usize,
        col_size: usize,
        config: &GridConfig,
    ) -> (usize, usize) {
        let min_proc_rows = procs.div_ceil(cols).max(1);
        let max_proc_rows = procs.min(rows);

        let estimate =
            Self::optimal_proc_rows(procs as f64, row_size as f64, col_size as f64, config);
        let proc_rows = estimate.clamp(min_proc_rows, max_proc_rows);
        let proc_cols = procs / proc_rows;

        match min_proc_rows < proc_rows && proc_rows < max_proc_rows {
            true => Self::minimize_unused_procs(
                proc_rows,
                proc_cols,
                procs,
                min_proc_rows,
                max_proc_rows,
            ),
            false => (proc_rows, proc_cols),
        }
    }

    /// Newton iteration for the positive root of `Nn(2x^4 - x^3) + Mm(Px - 2P^2)`,
    /// starting from `sqrt(P)`, rounded to the nearest integer.
    fn optimal_proc_rows(procs: f64, row_size: f64, col_size: f64, config: &GridConfig) -> usize {
        let p_mm = procs * row_size;
        let two_p = 2.0 * procs;

        let mut x = procs.sqrt();
        for _ in 0..config.max_iterations {
            let x2 = x * x;
            let nn_x2 = col_size * x2;
            let f = nn_x2 * (2.0 * x2 - x) + p_mm * (x - two_p);
            let df = nn_x2 * (8.0 * x - 3.0) + p_mm;

            let next = x - f / df;
            let residual = (next - x).abs();
            x = next;
            if residual <= config.tolerance {
                break;
            }
        }
        // negative or NaN estimates saturate to 0 and get clamped by the caller
        (x + 0.5) as usize
    }

    /// Searches around `x` for the `(x, procs / x)` pair leaving the fewest processes unused.
    fn minimize_unused_procs(
        x: usize,
        y: usize,
        procs: usize,
        min_x: usize,
        max_x: usize,
    ) -> (usize, usize) {
        let (mut x, mut y) = (x, y);
        let mut unused = procs - x * y;
        if unused == 0 {
            return (x, y);
        }

        let delta = (procs.ilog2() as usize).max(1);
        let min_test_x = min_x.max(x.saturating_sub(delta));
        let max_test_x = (x + delta).min(max_x);
        for test_x in (min_test_x..=max_test_x).rev() {
            let test_y = procs / test_x;
            let test_unused = procs - test_x * test_y;
            if test_unused < unused {
                (x, y, unused) = (test_x, test_y, test_unused);
                if unused == 0 {
                    break;
                }
            }
        }
        (x, y)
    }

    #[inline]
    pub fn rank(&self) -> Rank {
        self.rank
    }

    #[inline]
    pub fn procs(&self) -> usize {
        self.procs
    }

    /// Tile rows.
    #[inline]
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Tile columns.
    #[inline]
    pub fn cols(&self) -> usize {
        self.cols
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.rows * self.cols
    }

    #[inline]
    pub fn proc_rows(&self) -> usize {
        self.proc_rows
    }

    #[inline]
    pub fn proc_cols(&self) -> usize {
        self.proc_cols
    }

    /// Number of ranks inside the grid.
    #[inline]
    pub fn proc_size(&self) -> usize {
        self.proc_rows * self.proc_cols
    }

    /// Process row of this rank, `None` outside the grid.
    #[inline]
    pub fn rank_row(&self) -> Option<usize> {
        self.rank_row
    }

    /// Process column of this rank, `None` outside the grid.
    #[inline]
    pub fn rank_col(&self) -> Option<usize> {
        self.rank_col
    }

    #[inline]
    pub fn local_rows(&self) -> usize {
        self.local_rows
    }

    #[inline]
    pub fn local_cols(&self) -> usize {
        self.local_cols
    }

    #[inline]
    pub fn local_size(&self) -> usize {
        self.local_rows * self.local_cols
    }

    /// Rank responsible for tile `(row, col)`.
    #[inline]
    pub fn owner(&self, row: usize, col: usize) -> Rank {
        (row % self.proc_rows) * self.proc_cols + col % self.proc_cols
    }

    /// Tile rows handled by this rank.
    pub fn local_row_indices(&self) -> impl Iterator<Item = usize> + '_ {
        let start = self.rank_row.unwrap_or(self.rows);
        (start..self.rows).step_by(self.proc_rows)
    }

    /// Tile columns handled by this rank.
    pub fn local_col_indices(&self) -> impl Iterator<Item = usize> + '_ {
        let start = self.rank_col.unwrap_or(self.cols);
        (start..self.cols).step_by(self.proc_cols)
    }

    /// All ranks of process row `proc_row`.
    pub fn row_group(&self, proc_row: usize) -> Result<Group, GridError> {
        if proc_row >= self.proc_rows {
            return Err(GridError::ProcRow(proc_row, self.proc_rows));
        }
        let start = proc_row * self.proc_cols;
        Ok(Group::new(start..start + self.proc_cols))
    }

    /// All ranks of process column `proc_col`.
    pub fn col_group(&self, proc_col: usize) -> Result<Group, GridError> {
        if proc_col >= self.proc_cols {
            return Err(GridError::ProcCol(proc_col, self.proc_cols));
        }
        Ok(Group::new((proc_col..self.proc_size()).step_by(self.proc_cols)))
    }

    /// Ranks of process row `proc_row` whose columns hold a non-zero tile in line `row` of
    /// `shape`, a matrix of `size` tiles with `cols` columns. Empty when nobody qualifies.
    pub fn make_row_group(
        &self,
        proc_row: usize,
        shape: &Shape,
        row: usize,
        size: usize,
    ) -> Result<Group, GridError> {
        if proc_row >= self.proc_rows {
            return Err(GridError::ProcRow(proc_row, self.proc_rows));
        }
        if size % self.cols != 0 || row >= size / self.cols {
            return Err(GridError::Line(size, row, self.cols));
        }

        let start = row * self.cols;
        let mut flags = vec![false; self.proc_cols];
        for col in (0..self.cols).filter(|&col| !shape.is_zero(start + col)) {
            flags[col % self.proc_cols] = true;
        }
        let p_start = proc_row * self.proc_cols;
        let ranks = flags
            .into_iter()
            .enumerate()
            .filter_map(|(p, flag)| flag.then_some(p_start + p));
        Ok(Group::new(ranks))
    }

    /// Ranks of process column `proc_col` whose rows hold a non-zero tile in line `col` of
    /// `shape`, a matrix of `size` tiles with `rows` rows. Empty when nobody qualifies.
    pub fn make_col_group(
        &self,
        proc_col: usize,
        shape: &Shape,
        col: usize,
        size: usize,
    ) -> Result<Group, GridError> {
        if proc_col >= self.proc_cols {
            return Err(GridError::ProcCol(proc_col, self.proc_cols));
        }
        if size % self.rows != 0 || col >= size / self.rows {
            return Err(GridError::Line(size, col, self.rows));
        }

        let stride = size / self.rows;
        let ranks = (0..self.proc_rows)
            .filter(|&proc_row| {
                (proc_row..self.rows)
                    .step_by(self.proc_rows)
                    .any(|row| !shape.is_zero(row * stride + col))
            })
            .map(|proc_row| proc_row * self.proc_cols + proc_col);
        Ok(Group::new(ranks))
    }

    /// Cyclic map of a `rows × cols` matrix sharing this grid's columns.
    pub fn make_col_phase_pmap(&self, rows: usize) -> Result<CyclicPmap, GridError> {
        let pmap = CyclicPmap::new(
            self.rank,
            self.procs,
            rows,
            self.cols,
            self.proc_rows,
            self.proc_cols,
        )?;
        Ok(pmap)
    }

    /// Cyclic map of a `rows × cols` matrix sharing this grid's rows.
    pub fn make_row_phase_pmap(&self, cols: usize) -> Result<CyclicPmap, GridError> {
        let pmap = CyclicPmap::new(
            self.rank,
            self.procs,
            self.rows,
            cols,
            self.proc_rows,
            self.proc_cols,
        )?;
        Ok(pmap)
    }
}
