//! Dense row-major tiles and the kernels acting on them.

use std::{fmt, sync::Arc};

use itertools::Itertools;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use contract::ContractOp;
pub use ops::{BinaryKind, BinaryOp, Strategy, UnaryKind, UnaryOp};

use crate::{
    num::Scalar,
    range::{Index, Permutation, Range, RangeError},
};

pub mod contract;
pub mod ops;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TileError {
    #[error("tile data of length {1} does not fill range {0}")]
    Size(Range, usize),
    #[error("tile ranges mismatch: {0} and {1}")]
    RangeMismatch(Range, Range),
    #[error("both operands are zero tiles")]
    Zero,
    #[error("cannot contract {2} inner dimensions of rank {0} and rank {1} operands")]
    Inner(usize, usize, usize),
    #[error("cannot contract {2} inner dimensions of ranges {0} and {1}")]
    Contract(Range, Range, usize),
    #[error(transparent)]
    Range(#[from] RangeError),
}

/// A dense block of elements covering an element range, stored row-major.
///
/// Clones share storage. Kernels write in place only when the storage is not shared.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Tile<T> {
    range: Range,
    data: Arc<[T]>,
}

impl<T: Scalar> fmt::Display for Tile<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}: [{}]",
            T::DATA_TYPE,
            self.range,
            self.data.iter().format(", ")
        )
    }
}

impl<T: Scalar> Tile<T> {
    pub fn new(range: Range, data: impl Into<Arc<[T]>>) -> Result<Self, TileError> {
        let data = data.into();
        if data.len() != range.volume() {
            return Err(TileError::Size(range, data.len()));
        }
        Ok(Self { range, data })
    }

    /// A tile with every element set to `value`.
    pub fn filled(range: Range, value: T) -> Self {
        let data = vec![value; range.volume()].into();
        Self { range, data }
    }

    #[inline]
    pub fn zeros(range: Range) -> Self {
        Self::filled(range, T::zero())
    }

    /// A tile whose element at each index is `f(index)`.
    pub fn from_fn(range: Range, f: impl FnMut(Index) -> T) -> Self {
        let data = range.iter().map(f).collect();
        Self { range, data }
    }

    #[inline]
    pub fn range(&self) -> &Range {
        &self.range
    }

    #[inline]
    pub fn data(&self) -> &[T] {
        &self.data
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns `true` if no other handle shares the storage.
    #[inline]
    pub fn is_unique(&mut self) -> bool {
        Arc::get_mut(&mut self.data).is_some()
    }

    /// The element at an absolute element index.
    pub fn get(&self, index: &[usize]) -> Result<T, TileError> {
        let ordinal = self.range.ordinal(index)?;
        Ok(self.data[ordinal])
    }

    /// Mutable access to the elements, copying them first if the storage is shared.
    #[inline]
    pub fn make_mut(&mut self) -> &mut [T] {
        Arc::make_mut(&mut self.data)
    }

    /// Applies `f` to every element, reusing the storage if it is not shared.
    pub fn map(mut self, f: impl Fn(T) -> T) -> Self {
        match Arc::get_mut(&mut self.data) {
            Some(data) => data.iter_mut().for_each(|x| *x = f(*x)),
            None => self.data = self.data.iter().map(|&x| f(x)).collect(),
        }
        self
    }

    /// Rearranges dimensions by `perm` into fresh storage.
    ///
    /// The element at index `x` moves to `perm ^ x` of the permuted range.
    pub fn permute(&self, perm: &Permutation) -> Result<Self, TileError> {
        perm.check(self.range.rank())?;
        if perm.is_identity() {
            return Ok(self.clone());
        }

        let extent = self.range.extent();
        let range = self.range.permute(perm);
        let target_strides = strides(&range.extent());
        // stride in the output for a unit step along each input axis
        let strides = perm.iter().map(|&p| target_strides[p]).collect_vec();

        let mut data = vec![T::zero(); self.len()];
        let mut index = vec![0; extent.len()];
        let mut offset = 0;
        for &x in self.data.iter() {
            data[offset] = x;
            // odometer increment in row-major order
            for axis in (0..extent.len()).rev() {
                index[axis] += 1;
                offset += strides[axis];
                if index[axis] < extent[axis] {
                    break;
                }
                offset -= strides[axis] * extent[axis];
                index[axis] = 0;
            }
        }

        let data = data.into();
        Ok(Self { range, data })
    }
}

/// Row-major strides of an extent.
pub(crate) fn strides(extent: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; extent.len()];
    for axis in (0..extent.len().saturating_sub(1)).rev() {
        strides[axis] = strides[axis + 1] * extent[axis + 1];
    }
    strides
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use half::f16;
    use itertools::Itertools;

    use super::{Tile, TileError, strides};
    use crate::range::{Index, Permutation, Range};

    #[test]
    fn test_strides() {
        assert_eq!(strides(&[2, 3, 4]), [12, 4, 1]);
        assert_eq!(strides(&[5]), [1]);
        assert!(strides(&[]).is_empty());
    }

    #[test]
    fn test_create() -> Result<(), Box<dyn Error>> {
        let range = Range::new([2, 0], [4, 3])?;
        let tile = Tile::new(range.clone(), (0..6).map(|x| x as f32).collect_vec())?;
        assert_eq!(tile.get(&[3, 1])?, 4.0);
        assert!(matches!(tile.get(&[0, 0]), Err(TileError::Range(_))));
        assert!(matches!(
            Tile::new(range.clone(), vec![0.0f32; 5]),
            Err(TileError::Size(_, 5))
        ));

        let tile = Tile::from_fn(range.clone(), |index| (index[0] * 10 + index[1]) as i32);
        assert_eq!(tile.data(), [20, 21, 22, 30, 31, 32]);
        assert_eq!(Tile::<f16>::zeros(range).data(), [f16::ZERO; 6]);
        Ok(())
    }

    #[test]
    fn test_permute() -> Result<(), Box<dyn Error>> {
        let range = Range::new([0, 1, 2], [2, 4, 6])?;
        let tile = Tile::from_fn(range, |index| {
            (index[0] * 100 + index[1] * 10 + index[2]) as i64
        });

        let perm = Permutation::new([2, 0, 1])?;
        let permuted = tile.permute(&perm)?;
        assert_eq!(permuted.range(), &Range::new([1, 2, 0], [4, 6, 2])?);
        for index in tile.range().iter() {
            let target: Index = &perm ^ &index;
            assert_eq!(permuted.get(&target)?, tile.get(&index)?);
        }

        let back = permuted.permute(&perm.inverse())?;
        assert_eq!(back, tile);
        assert!(matches!(
            tile.permute(&Permutation::new([1, 0])?),
            Err(TileError::Range(_))
        ));
        Ok(())
    }

    #[test]
    fn test_map_shares() -> Result<(), Box<dyn Error>> {
        let tile = Tile::filled(Range::from_extent((2, 2)), 2.0f64);
        let shared = tile.clone();
        let mut doubled = tile.map(|x| x * 2.0);
        assert_eq!(shared.data(), [2.0; 4]);
        assert_eq!(doubled.data(), [4.0; 4]);
        assert!(doubled.is_unique());

        doubled.make_mut()[0] = 1.0;
        assert_eq!(doubled.data(), [1.0, 4.0, 4.0, 4.0]);
        Ok(())
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_serde() -> Result<(), Box<dyn Error>> {
        let range = Range::new([1, 0], [3, 2])?;
        let tile = Tile::from_fn(range, |index| (index[0] * 2 + index[1]) as i32);
        let json = serde_json::to_string(&tile)?;
        let output: Tile<i32> = serde_json::from_str(&json)?;
        assert_eq!(output, tile);
        Ok(())
    }
}
