use std::sync::Arc;

use super::{DistEval, EvalError, TileCells};
use crate::{
    Distributed,
    array::DistArray,
    dist::{Distribution, HasRange, HasWorld, ReadableTile, local_nonzero},
    num::Scalar,
    pmap::SharedPmap,
    runtime::{Promise, fatal, platform},
    tile::{Tile, ops::UnaryOp},
};

#[derive(Distributed)]
#[distributed(crate = "crate", bound = "T: Scalar")]
struct Inner<T> {
    #[distributed]
    dist: Distribution,
    cells: TileCells<T>,
    array: DistArray<T>,
    op: UnaryOp<T>,
}

/// Leaf of an evaluation tree: applies a unary op to every tile of an array.
///
/// Output tile `o` is produced from the source tile the op's permutation moves to `o`. Source
/// tiles owned elsewhere are fetched.
#[derive(Distributed)]
#[distributed(crate = "crate", bound = "T: Scalar")]
pub struct ArrayEval<T>(Arc<Inner<T>>);

impl<T> Clone for ArrayEval<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T: Scalar> ArrayEval<T> {
    /// Wraps `array`, distributing the output with `pmap`. Collective.
    pub fn new(array: &DistArray<T>, op: UnaryOp<T>, pmap: SharedPmap) -> Result<Self, EvalError> {
        let source = array.trange()?;
        op.perm().check(source.rank())?;
        let trange = source.permute(op.perm());
        let shape = array.shape()?.permute(op.perm(), source)?;
        if pmap.size() != trange.volume() {
            return Err(EvalError::Pmap(pmap.size(), trange.volume()));
        }

        let dist = Distribution::new(array.world()?, trange, shape, pmap);
        let cells = TileCells::new(&dist);
        let inner = Inner {
            dist,
            cells,
            array: array.clone(),
            op,
        };
        Ok(Self(Arc::new(inner)))
    }

    #[inline]
    pub fn array(&self) -> &DistArray<T> {
        &self.0.array
    }

    #[inline]
    pub fn op(&self) -> &UnaryOp<T> {
        &self.0.op
    }
}

impl<T: Scalar> ReadableTile<T> for ArrayEval<T> {
    type Error = EvalError;

    #[inline]
    fn get(&self, ordinal: usize) -> Result<Promise<Tile<T>>, Self::Error> {
        self.0.cells.get(&self.0.dist, ordinal)
    }
}

impl<T: Scalar> DistEval<T> for ArrayEval<T> {
    #[inline]
    fn move_tile(&self, ordinal: usize) -> Result<Promise<Tile<T>>, EvalError> {
        self.0.cells.take(&self.0.dist, ordinal)
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    fn eval(&self) -> Result<Promise<()>, EvalError> {
        let inner = &self.0;
        inner.cells.start()?;

        let source = inner.array.trange()?;
        let inverse = inner.op.perm().inverse();
        for ordinal in local_nonzero(inner) {
            let input = source.permute_ordinal(&inverse, inner.trange(), ordinal)?;
            let promise = inner.array.get(input)?;

            let inner = inner.clone();
            self.world().spawn(async move {
                let tile = promise.get().await;
                let op = inner.op.clone();
                match platform::handle(move || op.apply(tile)).await {
                    Ok(tile) => inner.cells.set(ordinal, tile),
                    Err(err) => fatal(err),
                }
            });
        }

        log::debug!(
            "rank {} evaluates array {} into {}",
            self.world().rank(),
            inner.array.id()?,
            inner.dist.id
        );
        Ok(inner.cells.completion(self.world()))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use itertools::Itertools;

    use super::ArrayEval;
    use crate::{
        array::DistArray,
        dist::{HasPmap, HasRange, ReadableTile},
        eval::{DistEval, EvalError, tests::TestResult},
        pmap::BlockedPmap,
        range::{Permutation, Range, TiledRange, TiledRange1},
        runtime::ClusterBuilder,
        tile::{Tile, ops::UnaryOp},
    };

    fn make_trange() -> TestResult<TiledRange> {
        Ok(TiledRange::new([
            TiledRange1::new([0, 2, 5])?,
            TiledRange1::new([0, 3, 4, 6])?,
        ]))
    }

    /// Fills every local tile of `array` with its global row-major element values.
    fn fill_iota(array: &DistArray<f64>) -> TestResult<()> {
        let trange = array.trange()?.clone();
        let cols = trange.elements().dim(1).size() as f64;
        for (ordinal, _) in array.local()?.collect_vec() {
            let range = trange.make_tile_range(ordinal)?;
            let tile = Tile::from_fn(range, |index| index[0] as f64 * cols + index[1] as f64);
            array.set(ordinal, tile)?;
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_scale() -> TestResult<()> {
        let cluster = ClusterBuilder::new(2).build().await?;
        let outputs = cluster
            .run(|world| async move {
                let array = DistArray::<f64>::builder(&world, make_trange()?).dense()?;
                array.set_all_local(2.0)?;

                let pmap = array.pmap()?.clone();
                let eval = ArrayEval::new(&array, UnaryOp::scale(3.0), pmap)?;
                eval.eval()?.get().await;

                let mut tiles = vec![];
                for &ordinal in eval.pmap().local() {
                    let tile = eval.get(ordinal)?.get().await;
                    tiles.push(tile.data().iter().all(|&x| x == 6.0));
                }
                assert!(matches!(eval.eval(), Err(EvalError::AlreadyEvaluated)));
                world.fence().await;
                TestResult::Ok(tiles)
            })
            .await;

        let mut count = 0;
        for output in outputs {
            let tiles = output.map_err(|err| err.to_string())?;
            assert!(tiles.iter().all(|&x| x));
            count += tiles.len();
        }
        assert_eq!(count, 6);
        Ok(())
    }

    #[tokio::test]
    async fn test_permute() -> TestResult<()> {
        let cluster = ClusterBuilder::new(3).build().await?;
        let outputs = cluster
            .run(|world| async move {
                let array = DistArray::<f64>::builder(&world, make_trange()?).dense()?;
                fill_iota(&array)?;

                let perm = Permutation::new([1, 0])?;
                let op = UnaryOp::neg().with_perm(perm.clone());
                let pmap = Arc::new(BlockedPmap::for_world(&world, 6));
                let eval = ArrayEval::new(&array, op, pmap)?;
                eval.eval()?;

                let mut checked = 0;
                for &ordinal in eval.pmap().local() {
                    let tile = eval.move_tile(ordinal)?.get().await;
                    let range = tile.range().clone();
                    assert_eq!(range, eval.trange().make_tile_range(ordinal)?);
                    for index in range.iter() {
                        let expected = -(index[1] as f64 * 6.0 + index[0] as f64);
                        assert_eq!(tile.get(&index)?, expected);
                    }
                    assert!(matches!(
                        eval.move_tile(ordinal),
                        Err(EvalError::Consumed(o)) if o == ordinal
                    ));
                    checked += 1;
                }
                assert_eq!(
                    eval.0.dist.trange.elements(),
                    &Range::from_extent((6usize, 5usize))
                );
                world.fence().await;
                TestResult::Ok(checked)
            })
            .await;

        let checked: usize = outputs
            .into_iter()
            .map(|output| output.map_err(|err| err.to_string()))
            .sum::<Result<_, _>>()?;
        assert_eq!(checked, 6);
        Ok(())
    }

    #[tokio::test]
    async fn test_permute_sparse() -> TestResult<()> {
        let cluster = ClusterBuilder::new(2).build().await?;
        let outputs = cluster
            .run(|world| async move {
                let array = DistArray::<f64>::builder(&world, make_trange()?)
                    .sparse_from_tiles([1, 5])
                    .await?;
                fill_iota(&array)?;

                let op = UnaryOp::noop().with_perm(Permutation::new([1, 0])?);
                let pmap = Arc::new(BlockedPmap::for_world(&world, 6));
                let eval = ArrayEval::new(&array, op, pmap)?;
                let output = DistArray::from_eval(&eval)?;

                let mut nonzero = vec![];
                for ordinal in 0..output.size()? {
                    if output.is_zero(ordinal)? {
                        continue;
                    }
                    let tile = output.get(ordinal)?.get().await;
                    assert_eq!(tile.range(), &output.trange()?.make_tile_range(ordinal)?);
                    for index in tile.range().iter() {
                        let expected = index[1] as f64 * 6.0 + index[0] as f64;
                        assert_eq!(tile.get(&index)?, expected);
                    }
                    nonzero.push(ordinal);
                }
                world.fence().await;
                TestResult::Ok(nonzero)
            })
            .await;
        for output in outputs {
            assert_eq!(output.map_err(|err| err.to_string())?, [2, 5]);
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_not_local() -> TestResult<()> {
        let cluster = ClusterBuilder::new(2).build().await?;
        let outputs = cluster
            .run(|world| async move {
                let array = DistArray::<f64>::builder(&world, make_trange()?)
                    .sparse_from_tiles([0, 5])
                    .await?;
                array.set_all_local(1.0)?;

                let pmap = array.pmap()?.clone();
                let eval = ArrayEval::new(&array, UnaryOp::noop(), pmap)?;
                eval.eval()?.get().await;

                let remote = match world.rank() {
                    0 => 5,
                    _ => 0,
                };
                let not_local = matches!(
                    eval.get(remote),
                    Err(EvalError::NotLocal(o, _)) if o == remote
                );
                let zero = matches!(eval.get(1), Err(EvalError::ZeroTile(1)));
                let out_of_range = matches!(eval.get(6), Err(EvalError::OutOfRange(6, 6)));
                world.fence().await;
                TestResult::Ok([not_local, zero, out_of_range])
            })
            .await;
        for output in outputs {
            assert_eq!(output.map_err(|err| err.to_string())?, [true; 3]);
        }
        Ok(())
    }
}
