use itertools::Itertools;

use super::{Tile, TileError, ops::zip_in_place};
use crate::{
    num::Scalar,
    range::{Permutation, Range},
};

/// Contracts the trailing `inner` dimensions of a left tile with the leading `inner` dimensions
/// of a right tile, as a matrix product of the flattened outer and inner dimensions.
///
/// Partial products are summed with [`ContractOp::reduce`]; [`ContractOp::finalize`] applies
/// the factor and the result permutation once the sum is complete.
#[derive(Debug, Clone, PartialEq)]
pub struct ContractOp<T> {
    factor: T,
    perm: Permutation,
    left_rank: usize,
    right_rank: usize,
    inner: usize,
}

impl<T: Scalar> ContractOp<T> {
    pub fn new(left_rank: usize, right_rank: usize, inner: usize) -> Result<Self, TileError> {
        if inner > left_rank || inner > right_rank || left_rank + right_rank == 2 * inner {
            return Err(TileError::Inner(left_rank, right_rank, inner));
        }
        Ok(Self {
            factor: T::one(),
            perm: Permutation::default(),
            left_rank,
            right_rank,
            inner,
        })
    }

    pub fn scale(mut self, factor: T) -> Self {
        self.factor = factor;
        self
    }

    /// The same op with its result permuted by `perm`.
    pub fn with_perm(mut self, perm: Permutation) -> Result<Self, TileError> {
        perm.check(self.result_rank())?;
        self.perm = perm;
        Ok(self)
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
    pub fn left_rank(&self) -> usize {
        self.left_rank
    }

    #[inline]
    pub fn right_rank(&self) -> usize {
        self.right_rank
    }

    #[inline]
    pub fn inner(&self) -> usize {
        self.inner
    }

    #[inline]
    pub fn left_outer(&self) -> usize {
        self.left_rank - self.inner
    }

    #[inline]
    pub fn right_outer(&self) -> usize {
        self.right_rank - self.inner
    }

    /// Rank of the result, before and after the permutation.
    #[inline]
    pub fn result_rank(&self) -> usize {
        self.left_outer() + self.right_outer()
    }

    /// Element range of the unpermuted product of tiles over `left` and `right`.
    pub fn product_range(&self, left: &Range, right: &Range) -> Result<Range, TileError> {
        let mismatch = || TileError::Contract(left.clone(), right.clone(), self.inner);
        if left.rank() != self.left_rank || right.rank() != self.right_rank {
            return Err(mismatch());
        }
        let outer = self.left_outer();
        if (0..self.inner).any(|axis| left.dim(outer + axis) != right.dim(axis)) {
            return Err(mismatch());
        }
        let dims = (0..outer)
            .map(|axis| left.dim(axis))
            .chain((self.inner..self.right_rank).map(|axis| right.dim(axis)));
        Ok(Range::from_dims(dims))
    }

    /// The unscaled, unpermuted product of two tiles.
    pub fn contract(&self, left: &Tile<T>, right: &Tile<T>) -> Result<Tile<T>, TileError> {
        let range = self.product_range(left.range(), right.range())?;
        let extent = left.range().extent();
        let (outer, inner) = extent.split_at(self.left_outer());
        let m: usize = outer.iter().product();
        let k: usize = inner.iter().product();
        let n = right.len() / k;

        let a = left.data();
        let b = right.data();
        let mut c = vec![T::zero(); m * n];

        #[cfg(not(feature = "rayon"))]
        for (i, l) in itertools::iproduct!(0..m, 0..k) {
            let x = a[i * k + l];
            let row = &mut c[i * n..(i + 1) * n];
            row.iter_mut()
                .zip_eq(&b[l * n..(l + 1) * n])
                .for_each(|(z, &y)| *z += x * y);
        }
        #[cfg(feature = "rayon")]
        {
            use rayon::prelude::*;

            c.par_chunks_mut(n).enumerate().for_each(|(i, row)| {
                for l in 0..k {
                    let x = a[i * k + l];
                    row.iter_mut()
                        .zip_eq(&b[l * n..(l + 1) * n])
                        .for_each(|(z, &y)| *z += x * y);
                }
            });
        }

        Tile::new(range, c)
    }

    /// Adds a partial product into the running sum.
    pub fn reduce(&self, sum: Option<Tile<T>>, tile: Tile<T>) -> Result<Tile<T>, TileError> {
        let Some(mut sum) = sum else {
            return Ok(tile);
        };
        if sum.range() != tile.range() {
            return Err(TileError::RangeMismatch(
                sum.range().clone(),
                tile.range().clone(),
            ));
        }
        zip_in_place(sum.make_mut(), tile.data(), |x, y| x + y);
        Ok(sum)
    }

    /// Scales and permutes a complete sum.
    pub fn finalize(&self, sum: Tile<T>) -> Result<Tile<T>, TileError> {
        let sum = match self.factor == T::one() {
            true => sum,
            false => sum.map(|x| x * self.factor),
        };
        sum.permute(&self.perm)
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use itertools::Itertools;

    use super::ContractOp;
    use crate::{
        range::{Permutation, Range},
        tile::{Tile, TileError},
    };

    /// Reference product of an `m × k` and a `k × n` row-major matrix.
    fn gemm(a: &[f64], b: &[f64], m: usize, k: usize, n: usize) -> Vec<f64> {
        itertools::iproduct!(0..m, 0..n)
            .map(|(i, j)| (0..k).map(|l| a[i * k + l] * b[l * n + j]).sum())
            .collect()
    }

    #[test]
    fn test_contract() -> Result<(), Box<dyn Error>> {
        fastrand::seed(42);
        let a = (0..2 * 3 * 4).map(|_| fastrand::f64()).collect_vec();
        let b = (0..3 * 4 * 5).map(|_| fastrand::f64()).collect_vec();
        let left = Tile::new(Range::new([0, 0, 4], [2, 3, 8])?, a.clone())?;
        let right = Tile::new(Range::new([0, 4, 1], [3, 8, 6])?, b.clone())?;

        let op = ContractOp::new(3, 3, 2)?;
        let product = op.contract(&left, &right)?;
        assert_eq!(product.range(), &Range::new([0, 1], [2, 6])?);
        let expected = gemm(&a, &b, 2, 12, 5);
        for (x, y) in product.data().iter().zip_eq(&expected) {
            crate::assert_approx_eq!(*x, *y, 1e-12);
        }

        let twice = op.reduce(Some(product.clone()), product.clone())?;
        let op = op.scale(0.5).with_perm(Permutation::new([1, 0])?)?;
        let output = op.finalize(twice)?;
        assert_eq!(output.range(), &Range::new([1, 0], [6, 2])?);
        for (i, j) in itertools::iproduct!(0..2, 1..6) {
            crate::assert_approx_eq!(output.get(&[j, i])?, product.get(&[i, j])?, 1e-12);
        }
        Ok(())
    }

    #[test]
    fn test_outer_product() -> Result<(), Box<dyn Error>> {
        let left = Tile::new(Range::from_extent(2usize), vec![1, 2])?;
        let right = Tile::new(Range::from_extent(3usize), vec![3, 4, 5])?;
        let product = ContractOp::new(1, 1, 0)?.contract(&left, &right)?;
        assert_eq!(product.data(), [3, 4, 5, 6, 8, 10]);
        Ok(())
    }

    #[test]
    fn test_invalid() -> Result<(), Box<dyn Error>> {
        assert!(matches!(
            ContractOp::<f32>::new(2, 2, 2),
            Err(TileError::Inner(2, 2, 2))
        ));
        assert!(matches!(
            ContractOp::<f32>::new(1, 3, 2),
            Err(TileError::Inner(1, 3, 2))
        ));

        let op = ContractOp::<f32>::new(2, 2, 1)?;
        let left = Tile::zeros(Range::from_extent((2, 3)));
        let right = Tile::zeros(Range::from_extent((4, 2)));
        assert!(matches!(
            op.contract(&left, &right),
            Err(TileError::Contract(_, _, 1))
        ));
        assert!(op.with_perm(Permutation::new([0, 2, 1])?).is_err());
        Ok(())
    }
}
