use std::sync::Arc;

use itertools::Itertools;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    range::{Permutation, RangeError, TiledRange},
    runtime::World,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShapeError {
    #[error("tile ordinal {0} is out of range of volume {1}")]
    OutOfRange(usize, usize),
    #[error("shape of volume {0} does not match tiled range of volume {1}")]
    Volume(usize, usize),
    #[error(transparent)]
    Range(#[from] RangeError),
}

/// A fixed-size bit set.
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Bitmap {
    len: usize,
    words: Arc<[u64]>,
}

impl Bitmap {
    const BITS: usize = u64::BITS as usize;

    /// A bitmap of `len` cleared bits.
    pub fn new(len: usize) -> Self {
        let words = vec![0; len.div_ceil(Self::BITS)].into();
        Self { len, words }
    }

    /// A bitmap with exactly the listed bits set.
    pub fn from_ordinals(
        len: usize,
        ordinals: impl IntoIterator<Item = usize>,
    ) -> Result<Self, ShapeError> {
        let mut words = vec![0u64; len.div_ceil(Self::BITS)];
        for ordinal in ordinals {
            if ordinal >= len {
                return Err(ShapeError::OutOfRange(ordinal, len));
            }
            words[ordinal / Self::BITS] |= 1 << (ordinal % Self::BITS);
        }
        Ok(Self::from_words(len, words))
    }

    /// A bitmap with bit `i` set iff `f(i)`.
    pub fn from_fn(len: usize, f: impl Fn(usize) -> bool) -> Self {
        let mut words = vec![0u64; len.div_ceil(Self::BITS)];
        for index in (0..len).filter(|&index| f(index)) {
            words[index / Self::BITS] |= 1 << (index % Self::BITS);
        }
        Self::from_words(len, words)
    }

    fn from_words(len: usize, words: Vec<u64>) -> Self {
        let words = words.into();
        Self { len, words }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn get(&self, index: usize) -> bool {
        index < self.len && self.words[index / Self::BITS] & (1 << (index % Self::BITS)) != 0
    }

    #[inline]
    pub fn count_ones(&self) -> usize {
        self.words.iter().map(|word| word.count_ones() as usize).sum()
    }

    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len).filter(|&index| self.get(index))
    }

    fn zip_with(&self, other: &Self, f: impl Fn(u64, u64) -> u64) -> Self {
        let words = self
            .words
            .iter()
            .zip_eq(other.words.iter())
            .map(|(&x, &y)| f(x, y))
            .collect();
        Self::from_words(self.len, words)
    }
}

/// Which tiles of a tiled range are structurally non-zero.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Shape {
    /// Every tile is non-zero.
    #[default]
    Dense,
    /// Bit `i` is set iff tile `i` is non-zero.
    Sparse(Bitmap),
}

impl From<Bitmap> for Shape {
    #[inline]
    fn from(value: Bitmap) -> Self {
        Self::Sparse(value)
    }
}

impl Shape {
    /// Merges the tiles listed by every rank into one sparse shape. Collective.
    ///
    /// Listing a tile on several ranks is the same as listing it once.
    pub async fn sparse_from_tiles(
        world: &World,
        volume: usize,
        tiles: impl IntoIterator<Item = usize>,
    ) -> Result<Self, ShapeError> {
        let local = Bitmap::from_ordinals(volume, tiles)?;
        let words = world.all_reduce_bitwise_or(local.words.to_vec()).await;
        log::debug!("rank {} merged sparse shape of {volume} tiles", world.rank());
        Ok(Self::Sparse(Bitmap::from_words(volume, words)))
    }

    /// A sparse shape from an explicit bitmap, without communication.
    pub fn from_bitmap(volume: usize, bitmap: Bitmap) -> Result<Self, ShapeError> {
        let shape = Self::Sparse(bitmap);
        shape.validate(volume)?;
        Ok(shape)
    }

    #[inline]
    pub fn is_dense(&self) -> bool {
        matches!(self, Self::Dense)
    }

    /// Returns `true` if tile `ordinal` is structurally zero.
    #[inline]
    pub fn is_zero(&self, ordinal: usize) -> bool {
        match self {
            Shape::Dense => false,
            Shape::Sparse(bitmap) => !bitmap.get(ordinal),
        }
    }

    /// Checks that the shape describes a tiled range of `volume` tiles.
    pub fn validate(&self, volume: usize) -> Result<(), ShapeError> {
        match self {
            Shape::Sparse(bitmap) if bitmap.len() != volume => {
                Err(ShapeError::Volume(bitmap.len(), volume))
            }
            _ => Ok(()),
        }
    }

    /// Number of non-zero tiles in a range of `volume` tiles.
    pub fn count_nonzero(&self, volume: usize) -> usize {
        match self {
            Shape::Dense => volume,
            Shape::Sparse(bitmap) => bitmap.count_ones(),
        }
    }

    /// Moves every flag to the position of its tile in the tiled range permuted by `perm`.
    pub fn permute(&self, perm: &Permutation, source: &TiledRange) -> Result<Self, ShapeError> {
        let bitmap = match self {
            Shape::Dense => return Ok(Shape::Dense),
            Shape::Sparse(bitmap) => bitmap,
        };
        let target = source.permute(perm);
        let ordinals: Vec<_> = bitmap
            .iter_ones()
            .map(|ordinal| target.permute_ordinal(perm, source, ordinal))
            .try_collect()?;
        let bitmap = Bitmap::from_ordinals(target.volume(), ordinals)?;
        Ok(Shape::Sparse(bitmap))
    }

    /// Non-zero tiles of either shape.
    pub fn union(&self, other: &Self) -> Self {
        match (self, other) {
            (Shape::Sparse(x), Shape::Sparse(y)) => Shape::Sparse(x.zip_with(y, |x, y| x | y)),
            _ => Shape::Dense,
        }
    }

    /// Non-zero tiles of both shapes.
    pub fn intersect(&self, other: &Self) -> Self {
        match (self, other) {
            (Shape::Sparse(x), Shape::Sparse(y)) => Shape::Sparse(x.zip_with(y, |x, y| x & y)),
            (Shape::Dense, shape) | (shape, Shape::Dense) => shape.clone(),
        }
    }

    /// Shape of the tile product of an `m × k` left and a `k × n` right operand.
    pub fn contract(left: &Self, right: &Self, m: usize, k: usize, n: usize) -> Self {
        if left.is_dense() && right.is_dense() {
            return Shape::Dense;
        }
        let bitmap = Bitmap::from_fn(m * n, |ordinal| {
            let (i, j) = (ordinal / n, ordinal % n);
            (0..k).any(|l| !left.is_zero(i * k + l) && !right.is_zero(l * n + j))
        });
        Shape::Sparse(bitmap)
    }
}
