use std::{
    ops::{BitXor, Neg},
    sync::Arc,
};

use derive_more::{Deref, Display};
use itertools::Itertools;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::{Index, RangeError};

/// A permutation of dimensions. Applying it moves element `i` of a coordinate to position `p[i]`.
///
/// The empty permutation acts as the identity of any dimension.
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash, Deref, Display)]
#[display("{{{}}}", _0.iter().format(", "))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Permutation(Arc<[usize]>);

impl Permutation {
    pub fn new(p: impl Into<Vec<usize>>) -> Result<Self, RangeError> {
        let p: Vec<usize> = p.into();
        let mut seen = vec![false; p.len()];
        for &x in &p {
            match seen.get_mut(x) {
                Some(flag) if !*flag => *flag = true,
                _ => return Err(RangeError::Permutation(p)),
            }
        }
        Ok(Self(p.into()))
    }

    #[inline]
    pub fn identity(dim: usize) -> Self {
        Self((0..dim).collect())
    }

    #[inline]
    pub fn dim(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn is_identity(&self) -> bool {
        self.0.iter().enumerate().all(|(i, &p)| i == p)
    }

    /// Checks that the permutation can act on a coordinate of `rank` dimensions.
    #[inline]
    pub fn check(&self, rank: usize) -> Result<(), RangeError> {
        match self.dim() {
            0 => Ok(()),
            dim if dim == rank => Ok(()),
            dim => Err(RangeError::Rank(rank, dim)),
        }
    }

    pub fn inverse(&self) -> Self {
        let mut inverse = vec![0; self.dim()];
        for (i, &p) in self.0.iter().enumerate() {
            inverse[p] = i;
        }
        Self(inverse.into())
    }

    /// Returns `result` with `result[p[i]] = x[i]`.
    ///
    /// # Panics
    /// If a non-empty permutation is applied on a slice of different length.
    pub fn apply<T: Clone>(&self, x: &[T]) -> Vec<T> {
        if self.0.is_empty() {
            return x.to_vec();
        }
        assert_eq!(self.dim(), x.len(), "permutation {self} cannot act on {} dims", x.len());
        let mut result = x.to_vec();
        for (i, &p) in self.0.iter().enumerate() {
            result[p] = x[i].clone();
        }
        result
    }
}

impl Neg for &Permutation {
    type Output = Permutation;

    #[inline]
    fn neg(self) -> Self::Output {
        self.inverse()
    }
}

impl BitXor<&Index> for &Permutation {
    type Output = Index;

    #[inline]
    fn bitxor(self, rhs: &Index) -> Self::Output {
        self.apply(rhs).into()
    }
}

impl BitXor<&[usize]> for &Permutation {
    type Output = Index;

    #[inline]
    fn bitxor(self, rhs: &[usize]) -> Self::Output {
        self.apply(rhs).into()
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::{Index, Permutation};
    use crate::range::RangeError;

    #[test]
    fn test_apply() -> Result<(), Box<dyn Error>> {
        let perm = Permutation::new([1, 2, 0])?;
        let index = Index::from((10, 20, 30));
        assert_eq!(&perm ^ &index, Index::from((30, 10, 20)));
        assert_eq!(&-&perm ^ &(&perm ^ &index), index);
        assert_eq!(format!("{perm}"), "{1, 2, 0}");
        Ok(())
    }

    #[test]
    fn test_identity() -> Result<(), Box<dyn Error>> {
        assert!(Permutation::identity(4).is_identity());
        assert!(Permutation::default().is_identity());
        assert!(!Permutation::new([1, 0])?.is_identity());
        assert_eq!(Permutation::new([1, 0])?.inverse(), Permutation::new([1, 0])?);

        let index = Index::from((3, 4));
        assert_eq!(&Permutation::default() ^ &index, index);
        Ok(())
    }

    #[test]
    fn test_invalid() {
        assert!(matches!(
            Permutation::new([0, 0, 1]),
            Err(RangeError::Permutation(_))
        ));
        assert!(matches!(
            Permutation::new([0, 3]),
            Err(RangeError::Permutation(_))
        ));
    }
}
