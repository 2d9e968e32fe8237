use std::sync::Arc;

use casey::snake;
use derive_more::{Deref, Display, From};
use itertools::Itertools;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use permutation::Permutation;
pub use tiled_range::TiledRange;
pub use tiled_range1::TiledRange1;

pub mod permutation;
pub mod tiled_range;
pub mod tiled_range1;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RangeError {
    #[error("invalid tiling: boundaries {0:?} must hold at least two strictly increasing values")]
    InvalidTiling(Vec<usize>),
    #[error("index {0} is out of range {1}")]
    OutOfRange(Index, Range),
    #[error("ordinal {0} is out of range of volume {1}")]
    Ordinal(usize, usize),
    #[error("rank mismatch: expected {0} dimensions, found {1}")]
    Rank(usize, usize),
    #[error("invalid range bounds: start {0} exceeds finish {1}")]
    Bounds(Index, Index),
    #[error("invalid permutation {0:?}")]
    Permutation(Vec<usize>),
}

/// A coordinate, either of a tile or of an element.
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Deref, From, Display)]
#[display("({})", _0.iter().format(", "))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Index(Arc<[usize]>);

impl From<Vec<usize>> for Index {
    #[inline]
    fn from(value: Vec<usize>) -> Self {
        Self(value.into())
    }
}

impl From<&[usize]> for Index {
    #[inline]
    fn from(value: &[usize]) -> Self {
        Self(value.into())
    }
}

impl<const N: usize> From<[usize; N]> for Index {
    #[inline]
    fn from(value: [usize; N]) -> Self {
        Self(value.into())
    }
}

impl From<usize> for Index {
    #[inline]
    fn from(value: usize) -> Self {
        Self([value].into())
    }
}

macro_rules! impl_index_from {
    ($($t:ident),+) => {
        impl From<($(impl_index_from!(@usize $t)),+)> for Index {
            #[inline]
            fn from(($(snake!($t)),+): ($(impl_index_from!(@usize $t)),+)) -> Self {
                Self([$(snake!($t)),+].into())
            }
        }
    };
    (@usize $t:ident) => { usize };
}

impl_index_from!(T0, T1);
impl_index_from!(T0, T1, T2);
impl_index_from!(T0, T1, T2, T3);
impl_index_from!(T0, T1, T2, T3, T4);
impl_index_from!(T0, T1, T2, T3, T4, T5);

/// A half-open interval `[start, finish)` along one dimension.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[display("[ {start}, {finish} )")]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Range1 {
    pub start: usize,
    pub finish: usize,
}

impl Range1 {
    #[inline]
    pub fn new(start: usize, finish: usize) -> Self {
        Self { start, finish }
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.finish - self.start
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.start == self.finish
    }

    #[inline]
    pub fn includes(&self, index: usize) -> bool {
        (self.start..self.finish).contains(&index)
    }

    #[inline]
    pub fn iter(&self) -> std::ops::Range<usize> {
        self.start..self.finish
    }
}

impl From<Range1> for Range {
    #[inline]
    fn from(value: Range1) -> Self {
        Self {
            start: value.start.into(),
            finish: value.finish.into(),
        }
    }
}

/// A half-open N-dimensional box `[start, finish)`, ordered row-major.
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash, Display)]
#[display("[ {start}, {finish} )")]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Range {
    start: Index,
    finish: Index,
}

impl Range {
    pub fn new(start: impl Into<Index>, finish: impl Into<Index>) -> Result<Self, RangeError> {
        let start = start.into();
        let finish = finish.into();
        if start.len() != finish.len() {
            return Err(RangeError::Rank(start.len(), finish.len()));
        }
        if start.iter().zip_eq(finish.iter()).any(|(s, f)| s > f) {
            return Err(RangeError::Bounds(start, finish));
        }
        Ok(Self { start, finish })
    }

    /// Creates a range starting from the origin.
    #[inline]
    pub fn from_extent(extent: impl Into<Index>) -> Self {
        let finish = extent.into();
        let start = vec![0; finish.len()].into();
        Self { start, finish }
    }

    /// Builds a range from per-dimension intervals.
    pub fn from_dims(dims: impl IntoIterator<Item = Range1>) -> Self {
        let (start, finish): (Vec<_>, Vec<_>) =
            dims.into_iter().map(|r| (r.start, r.finish)).unzip();
        Self {
            start: start.into(),
            finish: finish.into(),
        }
    }

    #[inline]
    pub fn rank(&self) -> usize {
        self.start.len()
    }

    #[inline]
    pub fn start(&self) -> &Index {
        &self.start
    }

    #[inline]
    pub fn finish(&self) -> &Index {
        &self.finish
    }

    #[inline]
    pub fn dim(&self, axis: usize) -> Range1 {
        Range1::new(self.start[axis], self.finish[axis])
    }

    #[inline]
    pub fn extent(&self) -> Vec<usize> {
        self.start
            .iter()
            .zip_eq(self.finish.iter())
            .map(|(s, f)| f - s)
            .collect()
    }

    /// Number of indices in the range. A rank-0 range is empty.
    #[inline]
    pub fn volume(&self) -> usize {
        match self.rank() {
            0 => 0,
            _ => self.extent().into_iter().product(),
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.volume() == 0
    }

    #[inline]
    pub fn includes(&self, index: &[usize]) -> bool {
        index.len() == self.rank()
            && itertools::izip!(index, self.start.iter(), self.finish.iter())
                .all(|(i, s, f)| (s..f).contains(&i))
    }

    /// Row-major ordinal of `index` relative to `start`.
    pub fn ordinal(&self, index: &[usize]) -> Result<usize, RangeError> {
        if !self.includes(index) {
            return Err(RangeError::OutOfRange(index.into(), self.clone()));
        }
        let ordinal = itertools::izip!(index, self.start.iter(), self.finish.iter())
            .fold(0, |acc, (i, s, f)| acc * (f - s) + (i - s));
        Ok(ordinal)
    }

    /// Inverse of [`Range::ordinal`].
    pub fn coord(&self, ordinal: usize) -> Result<Index, RangeError> {
        let volume = self.volume();
        if ordinal >= volume {
            return Err(RangeError::Ordinal(ordinal, volume));
        }
        let mut rest = ordinal;
        let mut index = vec![0; self.rank()];
        for (axis, extent) in self.extent().into_iter().enumerate().rev() {
            index[axis] = self.start[axis] + rest % extent;
            rest /= extent;
        }
        Ok(index.into())
    }

    /// Iterates all indices in row-major order.
    pub fn iter(&self) -> impl Iterator<Item = Index> + '_ {
        (0..self.volume()).map(|ordinal| {
            let mut rest = ordinal;
            let mut index = vec![0; self.rank()];
            for axis in (0..self.rank()).rev() {
                let extent = self.finish[axis] - self.start[axis];
                index[axis] = self.start[axis] + rest % extent;
                rest /= extent;
            }
            Index::from(index)
        })
    }

    /// Applies `perm` to both corners.
    pub fn permute(&self, perm: &Permutation) -> Self {
        Self {
            start: perm ^ &self.start,
            finish: perm ^ &self.finish,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use itertools::Itertools;

    use super::{Index, Permutation, Range, RangeError};

    #[test]
    fn test_ordinal_coord() -> Result<(), Box<dyn Error>> {
        let range = Range::new([1, 2, 0], [3, 5, 4])?;
        assert_eq!(range.volume(), 2 * 3 * 4);

        for (ordinal, index) in range.iter().enumerate() {
            assert_eq!(range.ordinal(&index)?, ordinal);
            assert_eq!(range.coord(ordinal)?, index);
        }
        assert_eq!(range.ordinal(&[1, 2, 1])?, 1);
        assert_eq!(range.ordinal(&[2, 2, 0])?, 12);

        assert!(matches!(
            range.ordinal(&[0, 2, 0]),
            Err(RangeError::OutOfRange(..))
        ));
        assert!(matches!(range.coord(24), Err(RangeError::Ordinal(24, 24))));
        Ok(())
    }

    #[test]
    fn test_iter_row_major() -> Result<(), Box<dyn Error>> {
        let range = Range::from_extent((2, 3));
        let indices = range.iter().collect_vec();
        let expected = itertools::iproduct!(0..2usize, 0..3usize)
            .map(Index::from)
            .collect_vec();
        assert_eq!(indices, expected);
        Ok(())
    }

    #[test]
    fn test_permute() -> Result<(), Box<dyn Error>> {
        let range = Range::new([0, 1, 2], [3, 4, 5])?;
        let perm = Permutation::new([2, 0, 1])?;
        let permuted = range.permute(&perm);
        assert_eq!(permuted, Range::new([1, 2, 0], [4, 5, 3])?);
        assert_eq!(permuted.permute(&-&perm), range);
        assert_eq!(format!("{permuted}"), "[ (1, 2, 0), (4, 5, 3) )");
        Ok(())
    }

    #[test]
    fn test_invalid_bounds() {
        assert!(matches!(
            Range::new([0, 3], [1, 2]),
            Err(RangeError::Bounds(..))
        ));
        assert!(matches!(Range::new([0], [1, 2]), Err(RangeError::Rank(1, 2))));
    }
}
