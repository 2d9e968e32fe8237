use std::{fmt, sync::Arc};

use itertools::Itertools;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::{Range1, RangeError};

/// Partition of one dimension into contiguous tiles, given by strictly increasing boundaries.
///
/// Tile indices start at `start_tile`, which is usually zero.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TiledRange1 {
    start_tile: usize,
    boundaries: Arc<[usize]>,
    /// Maps `element - boundaries[0]` to its tile index.
    elem2tile: Arc<[usize]>,
}

impl Default for TiledRange1 {
    fn default() -> Self {
        Self {
            start_tile: 0,
            boundaries: [0].into(),
            elem2tile: [].into(),
        }
    }
}

impl PartialEq for TiledRange1 {
    fn eq(&self, other: &Self) -> bool {
        self.start_tile == other.start_tile && self.boundaries == other.boundaries
    }
}

impl Eq for TiledRange1 {}

impl fmt::Display for TiledRange1 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "( tiles = {}, elements = {} )",
            self.tiles(),
            self.elements()
        )
    }
}

impl TiledRange1 {
    #[inline]
    pub fn new(boundaries: impl IntoIterator<Item = usize>) -> Result<Self, RangeError> {
        Self::with_start(boundaries, 0)
    }

    pub fn with_start(
        boundaries: impl IntoIterator<Item = usize>,
        start_tile: usize,
    ) -> Result<Self, RangeError> {
        let boundaries = boundaries.into_iter().collect_vec();
        let valid = boundaries.len() >= 2
            && boundaries.iter().tuple_windows().all(|(x, y)| x < y);
        if !valid {
            return Err(RangeError::InvalidTiling(boundaries));
        }

        let elem2tile = boundaries
            .iter()
            .tuple_windows()
            .enumerate()
            .flat_map(|(tile, (&start, &finish))| {
                std::iter::repeat_n(start_tile + tile, finish - start)
            })
            .collect();
        let boundaries = boundaries.into();
        Ok(Self {
            start_tile,
            boundaries,
            elem2tile,
        })
    }

    /// Replaces the tiling in place.
    pub fn resize(
        &mut self,
        boundaries: impl IntoIterator<Item = usize>,
        start_tile: usize,
    ) -> Result<(), RangeError> {
        *self = Self::with_start(boundaries, start_tile)?;
        Ok(())
    }

    #[inline]
    pub fn boundaries(&self) -> &[usize] {
        &self.boundaries
    }

    #[inline]
    pub fn tile_count(&self) -> usize {
        self.boundaries.len().saturating_sub(1)
    }

    /// The range of tile indices.
    #[inline]
    pub fn tiles(&self) -> Range1 {
        Range1::new(self.start_tile, self.start_tile + self.tile_count())
    }

    /// The range of element indices.
    #[inline]
    pub fn elements(&self) -> Range1 {
        let start = self.boundaries.first().copied().unwrap_or_default();
        let finish = self.boundaries.last().copied().unwrap_or_default();
        Range1::new(start, finish)
    }

    /// Element range of tile `index`, counted from the start tile.
    pub fn tile(&self, index: usize) -> Result<Range1, RangeError> {
        let tiles = self.tiles();
        if !tiles.includes(index) {
            return Err(RangeError::OutOfRange(index.into(), tiles.into()));
        }
        let i = index - self.start_tile;
        Ok(Range1::new(self.boundaries[i], self.boundaries[i + 1]))
    }

    /// The tile containing `element`.
    pub fn element_to_tile(&self, element: usize) -> Result<usize, RangeError> {
        let elements = self.elements();
        self.find(element)
            .ok_or_else(|| RangeError::OutOfRange(element.into(), elements.into()))
    }

    /// Like [`TiledRange1::element_to_tile`], but returns `None` for elements outside the range.
    #[inline]
    pub fn find(&self, element: usize) -> Option<usize> {
        let offset = element.checked_sub(self.elements().start)?;
        self.elem2tile.get(offset).copied()
    }

    /// Iterates the element ranges of all tiles.
    pub fn iter(&self) -> impl Iterator<Item = Range1> + '_ {
        self.boundaries
            .iter()
            .tuple_windows()
            .map(|(&start, &finish)| Range1::new(start, finish))
    }
}
