use std::{fmt, sync::Arc};

use itertools::Itertools;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::{Index, Permutation, Range, RangeError, TiledRange1};

/// An N-dimensional tiling: one [`TiledRange1`] per dimension.
///
/// Tiles are numbered by the row-major ordinal of their tile index.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TiledRange {
    dims: Arc<[TiledRange1]>,
    tiles: Range,
    elements: Range,
}

impl fmt::Display for TiledRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "( {} )", self.dims.iter().format(", "))
    }
}

impl FromIterator<TiledRange1> for TiledRange {
    fn from_iter<I: IntoIterator<Item = TiledRange1>>(iter: I) -> Self {
        Self::new(iter)
    }
}

impl TiledRange {
    pub fn new(dims: impl IntoIterator<Item = TiledRange1>) -> Self {
        let dims: Arc<[TiledRange1]> = dims.into_iter().collect();
        let tiles = Range::from_dims(dims.iter().map(TiledRange1::tiles));
        let elements = Range::from_dims(dims.iter().map(TiledRange1::elements));
        Self {
            dims,
            tiles,
            elements,
        }
    }

    #[inline]
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    #[inline]
    pub fn dims(&self) -> &[TiledRange1] {
        &self.dims
    }

    /// The range of tile indices.
    #[inline]
    pub fn tiles(&self) -> &Range {
        &self.tiles
    }

    /// The range of element indices.
    #[inline]
    pub fn elements(&self) -> &Range {
        &self.elements
    }

    /// Number of tiles.
    #[inline]
    pub fn volume(&self) -> usize {
        self.tiles.volume()
    }

    #[inline]
    pub fn ordinal(&self, index: &[usize]) -> Result<usize, RangeError> {
        self.tiles.ordinal(index)
    }

    #[inline]
    pub fn coord(&self, ordinal: usize) -> Result<Index, RangeError> {
        self.tiles.coord(ordinal)
    }

    /// Element range covered by the tile at `index`.
    pub fn make_tile_range_at(&self, index: &[usize]) -> Result<Range, RangeError> {
        if !self.tiles.includes(index) {
            return Err(RangeError::OutOfRange(index.into(), self.tiles.clone()));
        }
        let dims: Vec<_> = self
            .dims
            .iter()
            .zip_eq(index)
            .map(|(dim, &i)| dim.tile(i))
            .try_collect()?;
        Ok(Range::from_dims(dims))
    }

    /// Element range covered by the tile at `ordinal`.
    #[inline]
    pub fn make_tile_range(&self, ordinal: usize) -> Result<Range, RangeError> {
        let index = self.coord(ordinal)?;
        self.make_tile_range_at(&index)
    }

    /// Tile index containing the element at `element`.
    pub fn element_to_tile(&self, element: &[usize]) -> Result<Index, RangeError> {
        if element.len() != self.rank() {
            return Err(RangeError::Rank(self.rank(), element.len()));
        }
        let index: Vec<_> = self
            .dims
            .iter()
            .zip_eq(element)
            .map(|(dim, &e)| dim.find(e))
            .collect::<Option<_>>()
            .ok_or_else(|| RangeError::OutOfRange(element.into(), self.elements.clone()))?;
        Ok(index.into())
    }

    /// Tiled range with dimensions rearranged by `perm`.
    pub fn permute(&self, perm: &Permutation) -> Self {
        Self::new(perm.apply(&self.dims))
    }

    /// Row-major ordinal in `self` of the tile found at `ordinal` in the range `self` was permuted from.
    pub fn permute_ordinal(
        &self,
        perm: &Permutation,
        source: &TiledRange,
        ordinal: usize,
    ) -> Result<usize, RangeError> {
        let index = source.coord(ordinal)?;
        self.ordinal(&(perm ^ &index))
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use itertools::Itertools;

    use super::TiledRange;
    use crate::range::{Index, Permutation, Range, RangeError, TiledRange1};

    fn make_trange() -> Result<TiledRange, Box<dyn Error>> {
        Ok(TiledRange::new([
            TiledRange1::new([0, 3, 7, 10])?,
            TiledRange1::new([0, 5, 10])?,
        ]))
    }

    #[test]
    fn test_tile_ranges() -> Result<(), Box<dyn Error>> {
        let trange = make_trange()?;
        assert_eq!(trange.rank(), 2);
        assert_eq!(trange.volume(), 6);
        assert_eq!(trange.elements(), &Range::from_extent((10, 10)));

        assert_eq!(trange.make_tile_range(0)?, Range::new([0, 0], [3, 5])?);
        assert_eq!(trange.make_tile_range(3)?, Range::new([3, 5], [7, 10])?);
        assert_eq!(trange.coord(5)?, Index::from((2, 1)));
        assert!(matches!(
            trange.make_tile_range(6),
            Err(RangeError::Ordinal(6, 6))
        ));

        let volume: usize = (0..trange.volume())
            .map(|ordinal| trange.make_tile_range(ordinal).map(|r| r.volume()))
            .try_fold(0, |acc, v| v.map(|v| acc + v))?;
        assert_eq!(volume, trange.elements().volume());
        Ok(())
    }

    #[test]
    fn test_element_to_tile() -> Result<(), Box<dyn Error>> {
        let trange = make_trange()?;
        assert_eq!(trange.element_to_tile(&[4, 5])?, Index::from((1, 1)));
        assert!(trange.element_to_tile(&[10, 0]).is_err());
        assert!(trange.element_to_tile(&[1]).is_err());
        Ok(())
    }

    #[test]
    fn test_permute() -> Result<(), Box<dyn Error>> {
        let trange = make_trange()?;
        let perm = Permutation::new([1, 0])?;
        let permuted = trange.permute(&perm);
        assert_eq!(permuted.dims()[0], trange.dims()[1]);
        assert_eq!(permuted.tiles(), &Range::from_extent((2, 3)));

        for ordinal in 0..trange.volume() {
            let target = permuted.permute_ordinal(&perm, &trange, ordinal)?;
            let source = trange.make_tile_range(ordinal)?;
            assert_eq!(permuted.make_tile_range(target)?, source.permute(&perm));
        }
        let ordinals = (0..trange.volume())
            .map(|ordinal| permuted.permute_ordinal(&perm, &trange, ordinal))
            .try_collect::<_, Vec<_>, _>()?;
        assert_eq!(ordinals, [0, 3, 1, 4, 2, 5]);
        Ok(())
    }
}
