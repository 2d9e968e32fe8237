use derive_more::Display;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::{Tile, TileError};
use crate::{
    num::Scalar,
    range::{Permutation, Range},
};

/// How an op produces its output storage. Chosen once when the op is built.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Strategy {
    /// Writes the output permuted into fresh storage.
    Permute,
    /// Writes into the storage of a consumable argument when nobody else shares it.
    Consume,
    /// Writes into fresh storage.
    #[default]
    Copy,
}

impl Strategy {
    fn select(perm: &Permutation, consumable: bool) -> Self {
        match (perm.is_identity(), consumable) {
            (false, _) => Self::Permute,
            (true, true) => Self::Consume,
            (true, false) => Self::Copy,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum UnaryKind<T> {
    #[default]
    Noop,
    #[display("scale({_0})")]
    Scale(T),
    Neg,
}

/// An element-wise op on one tile, optionally followed by a permutation.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct UnaryOp<T> {
    kind: UnaryKind<T>,
    perm: Permutation,
    strategy: Strategy,
}

impl<T: Scalar> UnaryOp<T> {
    pub fn new(kind: UnaryKind<T>, perm: Permutation, consumable: bool) -> Self {
        let strategy = Strategy::select(&perm, consumable);
        Self {
            kind,
            perm,
            strategy,
        }
    }

    #[inline]
    pub fn noop() -> Self {
        Self::new(UnaryKind::Noop, Permutation::default(), false)
    }

    #[inline]
    pub fn scale(factor: T) -> Self {
        Self::new(UnaryKind::Scale(factor), Permutation::default(), false)
    }

    #[inline]
    pub fn neg() -> Self {
        Self::new(UnaryKind::Neg, Permutation::default(), false)
    }

    /// The same op followed by `perm`.
    pub fn with_perm(self, perm: Permutation) -> Self {
        let consumable = self.strategy == Strategy::Consume;
        Self::new(self.kind, perm, consumable)
    }

    /// The same op, allowed to overwrite its argument.
    pub fn consumable(self) -> Self {
        Self::new(self.kind, self.perm, true)
    }

    #[inline]
    pub fn kind(&self) -> UnaryKind<T> {
        self.kind
    }

    #[inline]
    pub fn perm(&self) -> &Permutation {
        &self.perm
    }

    #[inline]
    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    #[inline]
    fn eval(&self, x: T) -> T {
        match self.kind {
            UnaryKind::Noop => x,
            UnaryKind::Scale(factor) => x * factor,
            UnaryKind::Neg => -x,
        }
    }

    pub fn apply(&self, tile: Tile<T>) -> Result<Tile<T>, TileError> {
        let noop = matches!(self.kind, UnaryKind::Noop);
        match self.strategy {
            Strategy::Permute => {
                let tile = tile.permute(&self.perm)?;
                match noop {
                    true => Ok(tile),
                    false => Ok(tile.map(|x| self.eval(x))),
                }
            }
            _ if noop => Ok(tile),
            Strategy::Consume => Ok(tile.map(|x| self.eval(x))),
            Strategy::Copy => {
                let data: Vec<_> = tile.data().iter().map(|&x| self.eval(x)).collect();
                Tile::new(tile.range().clone(), data)
            }
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum BinaryKind {
    #[default]
    Add,
    Subt,
    Mult,
}

/// An element-wise op on two tiles of the same range, scaled and optionally permuted.
///
/// Either operand may be a zero tile, passed as `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct BinaryOp<T> {
    kind: BinaryKind,
    factor: T,
    perm: Permutation,
    consumable: [bool; 2],
    strategy: Strategy,
}

impl<T: Scalar> BinaryOp<T> {
    pub fn new(kind: BinaryKind) -> Self {
        let perm = Permutation::default();
        let consumable = [false; 2];
        let strategy = Strategy::select(&perm, false);
        Self {
            kind,
            factor: T::one(),
            perm,
            consumable,
            strategy,
        }
    }

    #[inline]
    pub fn add() -> Self {
        Self::new(BinaryKind::Add)
    }

    #[inline]
    pub fn subt() -> Self {
        Self::new(BinaryKind::Subt)
    }

    #[inline]
    pub fn mult() -> Self {
        Self::new(BinaryKind::Mult)
    }

    pub fn scale(mut self, factor: T) -> Self {
        self.factor = factor;
        self
    }

    pub fn with_perm(mut self, perm: Permutation) -> Self {
        self.strategy = Strategy::select(&perm, self.consumable.contains(&true));
        self.perm = perm;
        self
    }

    /// Allows the op to overwrite its left and/or right argument.
    pub fn consumable(mut self, left: bool, right: bool) -> Self {
        self.consumable = [left, right];
        self.strategy = Strategy::select(&self.perm, left || right);
        self
    }

    #[inline]
    pub fn kind(&self) -> BinaryKind {
        self.kind
    }

    #[inline]
    pub fn factor(&self) -> T {
        self.factor
    }

    #[inline]
    pub fn perm(&self) -> &Permutation {
        &self.perm
    }

    #[inline]
    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    #[inline]
    fn eval(&self, x: T, y: T) -> T {
        let z = match self.kind {
            BinaryKind::Add => x + y,
            BinaryKind::Subt => x - y,
            BinaryKind::Mult => x * y,
        };
        z * self.factor
    }

    #[inline]
    fn is_scaled(&self) -> bool {
        self.factor != T::one()
    }

    /// Combines two tiles. A `None` operand stands for a tile of zeros with the other's range.
    pub fn apply(
        &self,
        left: Option<Tile<T>>,
        right: Option<Tile<T>>,
    ) -> Result<Tile<T>, TileError> {
        let tile = match (left, right) {
            (None, None) => return Err(TileError::Zero),
            (Some(x), Some(y)) => self.combine(x, y)?,
            (Some(x), None) => match self.kind {
                BinaryKind::Mult => Tile::zeros(x.range().clone()),
                _ if self.is_scaled() => x.map(|x| x * self.factor),
                _ => x,
            },
            (None, Some(y)) => match self.kind {
                BinaryKind::Mult => Tile::zeros(y.range().clone()),
                BinaryKind::Subt => y.map(|y| -y * self.factor),
                BinaryKind::Add if self.is_scaled() => y.map(|y| y * self.factor),
                BinaryKind::Add => y,
            },
        };
        match self.strategy {
            Strategy::Permute => tile.permute(&self.perm),
            _ => Ok(tile),
        }
    }

    fn combine(&self, mut x: Tile<T>, mut y: Tile<T>) -> Result<Tile<T>, TileError> {
        if x.range() != y.range() {
            return Err(TileError::RangeMismatch(x.range().clone(), y.range().clone()));
        }
        let [left, right] = self.consumable;
        let reuse = self.strategy == Strategy::Consume;
        match (reuse && left && x.is_unique(), reuse && right && y.is_unique()) {
            (true, _) => {
                zip_in_place(x.make_mut(), y.data(), |x, y| self.eval(x, y));
                Ok(x)
            }
            (_, true) => {
                zip_in_place(y.make_mut(), x.data(), |y, x| self.eval(x, y));
                Ok(y)
            }
            _ => {
                let range: Range = x.range().clone();
                let mut data = x.data().to_vec();
                zip_in_place(&mut data, y.data(), |x, y| self.eval(x, y));
                Tile::new(range, data)
            }
        }
    }
}

/// `output[i] = f(output[i], other[i])`.
pub(crate) fn zip_in_place<T: Scalar>(
    output: &mut [T],
    other: &[T],
    f: impl Fn(T, T) -> T + Sync,
) {
    #[cfg(not(feature = "rayon"))]
    {
        use itertools::Itertools;

        output
            .iter_mut()
            .zip_eq(other.iter())
            .for_each(|(x, &y)| *x = f(*x, y));
    }
    #[cfg(feature = "rayon")]
    {
        use rayon::prelude::*;

        output
            .par_iter_mut()
            .zip_eq(other.par_iter())
            .for_each(|(x, &y)| *x = f(*x, y));
    }
}
