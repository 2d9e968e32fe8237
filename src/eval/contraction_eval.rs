use std::sync::Arc;

use futures::{StreamExt, stream::FuturesUnordered};
use itertools::Itertools;
use rustc_hash::FxHashMap as HashMap;

use super::{DistEval, EvalError, SharedEval, Stream, TileCells, expect, publish, receive};
use crate::{
    Distributed,
    dist::{Distribution, HasPmap, HasRange, HasShape, HasWorld, ReadableTile, local_nonzero},
    grid::ProcessGrid,
    num::Scalar,
    pmap::BlockedPmap,
    range::TiledRange,
    runtime::{Group, MessageKey, Promise, fatal, platform},
    shape::Shape,
    tile::{Tile, TileError, contract::ContractOp},
};

#[derive(Distributed)]
#[distributed(crate = "crate", bound = "T: Scalar")]
struct Inner<T> {
    #[distributed]
    dist: Distribution,
    cells: TileCells<T>,
    left: SharedEval<T>,
    right: SharedEval<T>,
    op: ContractOp<T>,
    /// Tiling of the product before the result permutation.
    product: TiledRange,
    grid: ProcessGrid,
    /// Tile counts of the `m × k` left and `k × n` right matrices.
    m: usize,
    k: usize,
    n: usize,
}

/// Tensor contraction of two children, seen as a product of an `m × k` and a `k × n` tile
/// matrix.
///
/// Ranks are laid out on a [`ProcessGrid`] over the `m × n` product. Every left tile `(i, l)` is
/// broadcast along process row `i` to the ranks whose columns need it, every right tile `(l, j)`
/// along process column `j`. Each rank sums the partial products of its tiles as operands
/// arrive and hands the result to its owner under a blocked map.
#[derive(Distributed)]
#[distributed(crate = "crate", bound = "T: Scalar")]
pub struct ContractionEval<T>(Arc<Inner<T>>);

impl<T> Clone for ContractionEval<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T: Scalar> ContractionEval<T> {
    /// Collective.
    pub fn new(
        left: SharedEval<T>,
        right: SharedEval<T>,
        op: ContractOp<T>,
    ) -> Result<Self, EvalError> {
        let (x, y) = (left.trange(), right.trange());
        if x.rank() != op.left_rank() || y.rank() != op.right_rank() {
            let err = TileError::Inner(x.rank(), y.rank(), op.inner());
            return Err(err.into());
        }
        let outer = op.left_outer();
        if x.dims()[outer..] != y.dims()[..op.inner()] {
            return Err(EvalError::RangeMismatch(x.clone(), y.clone()));
        }

        let product = TiledRange::new(
            x.dims()[..outer]
                .iter()
                .chain(&y.dims()[op.inner()..])
                .cloned(),
        );
        let tiles = x.tiles().extent();
        let m: usize = tiles[..outer].iter().product();
        let k: usize = tiles[outer..].iter().product();
        let n: usize = y.tiles().extent()[op.inner()..].iter().product();
        let row_size: usize = x.elements().extent()[..outer].iter().product();
        let col_size: usize = y.elements().extent()[op.inner()..].iter().product();

        let shape = Shape::contract(left.shape(), right.shape(), m, k, n);
        let shape = shape.permute(op.perm(), &product)?;
        let trange = product.permute(op.perm());

        let world = left.world().clone();
        let grid = ProcessGrid::new(&world, m, n, row_size, col_size)?;
        let pmap = Arc::new(BlockedPmap::for_world(&world, trange.volume()));
        let dist = Distribution::new(&world, trange, shape, pmap);
        let cells = TileCells::new(&dist);

        let inner = Inner {
            dist,
            cells,
            left,
            right,
            op,
            product,
            grid,
            m,
            k,
            n,
        };
        Ok(Self(Arc::new(inner)))
    }

    #[inline]
    pub fn grid(&self) -> &ProcessGrid {
        &self.0.grid
    }

    #[inline]
    pub fn op(&self) -> &ContractOp<T> {
        &self.0.op
    }
}

impl<T: Scalar> Inner<T> {
    /// Restricts a broadcast group to this rank when the child holds every tile anyway.
    fn narrow(&self, group: Group, child: &SharedEval<T>) -> Group {
        let rank = self.world().rank();
        match child.pmap().is_replicated() {
            true if group.contains(rank) => Group::new([rank]),
            true => Group::new([]),
            false => group,
        }
    }

    /// Forwards each local non-zero left tile to the ranks that multiply it.
    fn broadcast_left(self: &Arc<Self>) -> Result<usize, EvalError> {
        let (k, n) = (self.k, self.n);
        let mut count = 0;
        for &a in self.left.pmap().local() {
            if self.left.is_zero(a) {
                continue;
            }
            let (i, l) = (a / k, a % k);
            let proc_row = i % self.grid.proc_rows();
            let group = self.grid.make_row_group(proc_row, self.right.shape(), l, k * n)?;
            let group = self.narrow(group, &self.left);
            if group.is_empty() {
                continue;
            }
            let promise = self.left.move_tile(a)?;
            self.forward(promise, Stream::Left.tag(a), group);
            count += 1;
        }
        Ok(count)
    }

    /// Forwards each local non-zero right tile to the ranks that multiply it.
    fn broadcast_right(self: &Arc<Self>) -> Result<usize, EvalError> {
        let (m, k, n) = (self.m, self.k, self.n);
        let mut count = 0;
        for &b in self.right.pmap().local() {
            if self.right.is_zero(b) {
                continue;
            }
            let (l, j) = (b / n, b % n);
            let proc_col = j % self.grid.proc_cols();
            let group = self.grid.make_col_group(proc_col, self.left.shape(), l, m * k)?;
            let group = self.narrow(group, &self.right);
            if group.is_empty() {
                continue;
            }
            let promise = self.right.move_tile(b)?;
            self.forward(promise, Stream::Right.tag(b), group);
            count += 1;
        }
        Ok(count)
    }

    fn forward(self: &Arc<Self>, promise: Promise<Tile<T>>, tag: u64, group: Group) {
        let inner = self.clone();
        self.world().spawn(async move {
            let tile = promise.get().await;
            inner.world().broadcast(inner.dist.id, tag, &group, tile);
        });
    }

    /// Schedules the partial products of every local non-zero product tile.
    fn compute(self: &Arc<Self>) -> Result<usize, EvalError> {
        let world = self.world();
        let (k, n) = (self.k, self.n);
        let id = self.dist.id;
        let mut lefts = HashMap::default();
        let mut rights = HashMap::default();
        let cols = self.grid.local_col_indices().collect_vec();

        let mut count = 0;
        for (i, &j) in itertools::iproduct!(self.grid.local_row_indices(), &cols) {
            let q = i * n + j;
            if !self.product_nonzero(q) {
                continue;
            }

            let mut operands = vec![];
            for l in 0..k {
                let (a, b) = (i * k + l, l * n + j);
                if self.left.is_zero(a) || self.right.is_zero(b) {
                    continue;
                }
                let x: &Promise<Tile<T>> = lefts.entry(a).or_insert_with(|| {
                    let key = MessageKey::new(id, Stream::Left.tag(a), self.left.owner(a));
                    receive(world, key)
                });
                let y: &Promise<Tile<T>> = rights.entry(b).or_insert_with(|| {
                    let key = MessageKey::new(id, Stream::Right.tag(b), self.right.owner(b));
                    receive(world, key)
                });
                operands.push((x.clone(), y.clone()));
            }

            let range = self.product.make_tile_range(q)?;
            let ordinal = self.trange().permute_ordinal(self.op.perm(), &self.product, q)?;
            let inner = self.clone();
            world.spawn(async move {
                let tile = inner.reduce(operands).await;
                let tile = tile.unwrap_or_else(|| Tile::zeros(range));
                let op = inner.op.clone();
                match platform::handle(move || op.finalize(tile)).await {
                    Ok(tile) => publish(&inner.dist, &inner.cells, ordinal, tile),
                    Err(err) => fatal(err),
                }
            });
            count += 1;
        }
        Ok(count)
    }

    /// Sums partial products in the order their operands arrive.
    async fn reduce(
        &self,
        operands: Vec<(Promise<Tile<T>>, Promise<Tile<T>>)>,
    ) -> Option<Tile<T>> {
        let mut products: FuturesUnordered<_> = operands
            .into_iter()
            .map(|(x, y)| {
                let op = self.op.clone();
                async move {
                    let (x, y) = futures::join!(x.get(), y.get());
                    platform::handle(move || op.contract(&x, &y)).await
                }
            })
            .collect();

        let mut sum = None;
        while let Some(product) = products.next().await {
            let product = product.unwrap_or_else(|err| fatal(err));
            sum = Some(self.op.reduce(sum, product).unwrap_or_else(|err| fatal(err)));
        }
        sum
    }

    fn product_nonzero(&self, q: usize) -> bool {
        let (k, n) = (self.k, self.n);
        let (i, j) = (q / n, q % n);
        (0..k).any(|l| !self.left.is_zero(i * k + l) && !self.right.is_zero(l * n + j))
    }

    /// Waits for the local result tiles other ranks produce.
    fn gather(self: &Arc<Self>) -> Result<(), EvalError> {
        let rank = self.world().rank();
        let inverse = self.op.perm().inverse();
        for ordinal in local_nonzero(self) {
            let q = self.product.permute_ordinal(&inverse, self.trange(), ordinal)?;
            let producer = self.grid.owner(q / self.n, q % self.n);
            if producer != rank {
                let target = self.clone();
                expect(&self.dist, ordinal, producer, move |tile| {
                    target.cells.set(ordinal, tile)
                });
            }
        }
        Ok(())
    }
}

impl<T: Scalar> ReadableTile<T> for ContractionEval<T> {
    type Error = EvalError;

    #[inline]
    fn get(&self, ordinal: usize) -> Result<Promise<Tile<T>>, Self::Error> {
        self.0.cells.get(&self.0.dist, ordinal)
    }
}

impl<T: Scalar> DistEval<T> for ContractionEval<T> {
    #[inline]
    fn move_tile(&self, ordinal: usize) -> Result<Promise<Tile<T>>, EvalError> {
        self.0.cells.take(&self.0.dist, ordinal)
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    fn eval(&self) -> Result<Promise<()>, EvalError> {
        let inner = &self.0;
        inner.cells.start()?;
        inner.left.eval()?;
        inner.right.eval()?;

        let lefts = inner.broadcast_left()?;
        let rights = inner.broadcast_right()?;
        let products = inner.compute()?;
        inner.gather()?;

        log::debug!(
            "rank {} contracts {} x {} x {} tiles of {}: sends {lefts} + {rights}, computes {products}",
            self.world().rank(),
            inner.m,
            inner.k,
            inner.n,
            inner.dist.id
        );
        Ok(inner.cells.completion(self.world()))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use itertools::Itertools;

    use super::ContractionEval;
    use crate::{
        array::DistArray,
        dist::{HasRange, HasShape, ReadableTile, local_nonzero},
        eval::{ArrayEval, BinaryEval, DistEval, EvalError, SharedEval, tests::TestResult},
        range::{Permutation, TiledRange, TiledRange1},
        runtime::{ClusterBuilder, World},
        shape::Shape,
        tile::{
            Tile, TileError,
            contract::ContractOp,
            ops::{BinaryOp, UnaryOp},
        },
    };

    const ROWS: [usize; 4] = [0, 2, 5, 6];
    const INNER: [usize; 4] = [0, 3, 4, 7];
    const COLS: [usize; 3] = [0, 1, 4];

    fn a(i: usize, l: usize) -> f64 {
        ((i * 7 + l * 3) % 5) as f64 - 2.0
    }

    fn b(l: usize, j: usize) -> f64 {
        ((l * 2 + j * 5) % 7) as f64 - 3.0
    }

    fn leaf(array: &DistArray<f64>) -> TestResult<SharedEval<f64>> {
        let pmap = array.pmap()?.clone();
        Ok(Arc::new(ArrayEval::new(array, UnaryOp::noop(), pmap)?))
    }

    async fn make_matrix(
        world: &World,
        rows: &[usize],
        cols: &[usize],
        tiles: Option<&[usize]>,
        f: fn(usize, usize) -> f64,
    ) -> TestResult<DistArray<f64>> {
        let trange = TiledRange::new([
            TiledRange1::new(rows.to_vec())?,
            TiledRange1::new(cols.to_vec())?,
        ]);
        let builder = DistArray::builder(world, trange.clone());
        let array = match tiles {
            Some(tiles) => builder.sparse_from_tiles(tiles.iter().copied()).await?,
            None => builder.dense()?,
        };
        for (ordinal, _) in array.local()?.collect_vec() {
            let range = trange.make_tile_range(ordinal)?;
            array.set(ordinal, Tile::from_fn(range, |index| f(index[0], index[1])))?;
        }
        Ok(array)
    }

    /// Contracts the test matrices on `size` ranks and checks every element on every rank.
    async fn check_contract(
        size: usize,
        left_tiles: Option<Vec<usize>>,
        right_tiles: Option<Vec<usize>>,
        transpose: bool,
    ) -> TestResult<()> {
        let cluster = ClusterBuilder::new(size).build().await?;
        let outputs = cluster
            .run(|world| {
                let left_tiles = left_tiles.clone();
                let right_tiles = right_tiles.clone();
                async move {
                    let x = make_matrix(&world, &ROWS, &INNER, left_tiles.as_deref(), a).await?;
                    let y = make_matrix(&world, &INNER, &COLS, right_tiles.as_deref(), b).await?;

                    let zero_a = |i: usize, l: usize| -> TestResult<bool> {
                        let index = x.trange()?.element_to_tile(&[i, l])?;
                        Ok(x.is_zero(x.trange()?.ordinal(&index)?)?)
                    };
                    let zero_b = |l: usize, j: usize| -> TestResult<bool> {
                        let index = y.trange()?.element_to_tile(&[l, j])?;
                        Ok(y.is_zero(y.trange()?.ordinal(&index)?)?)
                    };

                    let mut op = ContractOp::new(2, 2, 1)?.scale(2.0);
                    if transpose {
                        op = op.with_perm(Permutation::new([1, 0])?)?;
                    }
                    let eval = ContractionEval::new(leaf(&x)?, leaf(&y)?, op)?;
                    let expected_shape = Shape::contract(x.shape()?, y.shape()?, 3, 3, 2);
                    let output = DistArray::from_eval(&eval)?;
                    for ordinal in local_nonzero(&eval) {
                        assert!(matches!(
                            eval.move_tile(ordinal),
                            Err(EvalError::Consumed(o)) if o == ordinal
                        ));
                    }
                    assert!(matches!(eval.eval(), Err(EvalError::AlreadyEvaluated)));

                    let mut checked = 0;
                    for ordinal in 0..output.size()? {
                        if output.is_zero(ordinal)? {
                            continue;
                        }
                        let tile = output.get(ordinal)?.get().await;
                        for index in tile.range().iter() {
                            let (i, j) = match transpose {
                                true => (index[1], index[0]),
                                false => (index[0], index[1]),
                            };
                            let mut sum = 0.0;
                            for l in 0..INNER[3] {
                                if !zero_a(i, l)? && !zero_b(l, j)? {
                                    sum += a(i, l) * b(l, j);
                                }
                            }
                            assert_eq!(tile.get(&index)?, 2.0 * sum);
                            checked += 1;
                        }
                    }
                    if !transpose {
                        assert_eq!(output.shape()?, &expected_shape);
                    }
                    world.fence().await;
                    TestResult::Ok(checked)
                }
            })
            .await;

        let expected = outputs[0].as_ref().map_err(|err| err.to_string())?.to_owned();
        for output in outputs {
            assert_eq!(output.map_err(|err| err.to_string())?, expected);
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_dense() -> TestResult<()> {
        for size in 1..=3 {
            check_contract(size, None, None, false).await?;
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_produced_once() -> TestResult<()> {
        for size in 1..=3 {
            let cluster = ClusterBuilder::new(size).build().await?;
            let outputs = cluster
                .run(|world| async move {
                    let left = [0, 4, 5, 7];
                    let right = [1, 2, 4];
                    let x = make_matrix(&world, &ROWS, &INNER, Some(&left[..]), a).await?;
                    let y = make_matrix(&world, &INNER, &COLS, Some(&right[..]), b).await?;
                    let op = ContractOp::new(2, 2, 1)?;
                    let eval = ContractionEval::new(leaf(&x)?, leaf(&y)?, op)?;
                    let nonzero = (0..eval.volume()).filter(|&o| !eval.is_zero(o)).count();

                    let ordinals = local_nonzero(&eval);
                    let mut cells = vec![];
                    for &ordinal in &ordinals {
                        let first = eval.get(ordinal)?;
                        for _ in 0..3 {
                            assert!(eval.get(ordinal)?.ptr_eq(&first));
                        }
                        cells.push(first);
                    }

                    let done = eval.eval()?;
                    for (&ordinal, cell) in ordinals.iter().zip_eq(&cells) {
                        assert!(eval.get(ordinal)?.ptr_eq(cell));
                    }
                    done.get().await;

                    let mut tiles = vec![];
                    for (&ordinal, cell) in ordinals.iter().zip_eq(&cells) {
                        let tile = cell.try_get().ok_or("tile not produced")?;
                        let again = eval.get(ordinal)?.get().await;
                        assert_eq!(again.data(), tile.data());
                        tiles.push(tile);
                    }
                    assert!(matches!(eval.eval(), Err(EvalError::AlreadyEvaluated)));
                    world.fence().await;

                    for (cell, tile) in cells.iter().zip_eq(&tiles) {
                        let current = cell.try_get().ok_or("tile dropped")?;
                        assert_eq!(current.data(), tile.data());
                    }
                    TestResult::Ok((ordinals, nonzero))
                })
                .await;

            let mut produced = vec![];
            let mut nonzero = 0;
            for output in outputs {
                let (ordinals, count) = output.map_err(|err| err.to_string())?;
                produced.extend(ordinals);
                nonzero = count;
            }
            produced.sort_unstable();
            assert_eq!(produced.len(), nonzero);
            assert!(produced.iter().all_unique());
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_sparse() -> TestResult<()> {
        for size in [2, 3, 4] {
            check_contract(size, Some(vec![0, 4, 5, 7]), Some(vec![1, 2, 4]), false).await?;
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_transposed() -> TestResult<()> {
        check_contract(3, None, Some(vec![0, 3, 5]), true).await
    }

    #[tokio::test]
    async fn test_replicated_operand() -> TestResult<()> {
        let cluster = ClusterBuilder::new(2).build().await?;
        let outputs = cluster
            .run(|world| async move {
                let mut x = make_matrix(&world, &ROWS, &INNER, None, a).await?;
                let y = make_matrix(&world, &INNER, &COLS, None, b).await?;
                x.make_replicated()?;

                let op = ContractOp::new(2, 2, 1)?;
                let eval = ContractionEval::new(leaf(&x)?, leaf(&y)?, op)?;
                let output = DistArray::from_eval(&eval)?;

                let tile = output.get_coord(&[2, 1])?.get().await;
                let expected = (0..7).map(|l| a(5, l) * b(l, 3)).sum::<f64>();
                world.fence().await;
                TestResult::Ok(tile.get(&[5, 3])? == expected)
            })
            .await;
        for output in outputs {
            assert!(output.map_err(|err| err.to_string())?);
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_nested() -> TestResult<()> {
        let cluster = ClusterBuilder::new(3).build().await?;
        let outputs = cluster
            .run(|world| async move {
                let x = make_matrix(&world, &ROWS, &INNER, None, a).await?;
                let y = make_matrix(&world, &INNER, &COLS, None, b).await?;
                let z = make_matrix(&world, &INNER, &COLS, None, b).await?;

                let sum: SharedEval<f64> =
                    Arc::new(BinaryEval::new(leaf(&y)?, leaf(&z)?, BinaryOp::add())?);
                let op = ContractOp::new(2, 2, 1)?;
                let eval = ContractionEval::new(leaf(&x)?, sum, op)?;
                let output = DistArray::from_eval(&eval)?;

                let tile = output.get_coord(&[0, 0])?.get().await;
                let expected = (0..7).map(|l| a(1, l) * b(l, 0) * 2.0).sum::<f64>();
                world.fence().await;
                TestResult::Ok(tile.get(&[1, 0])? == expected)
            })
            .await;
        for output in outputs {
            assert!(output.map_err(|err| err.to_string())?);
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_invalid() -> TestResult<()> {
        let cluster = ClusterBuilder::new(1).build().await?;
        let outputs = cluster
            .run(|world| async move {
                let x = make_matrix(&world, &ROWS, &INNER, None, a).await?;
                let y = make_matrix(&world, &ROWS, &COLS, None, b).await?;
                let mismatch = matches!(
                    ContractionEval::new(leaf(&x)?, leaf(&y)?, ContractOp::new(2, 2, 1)?),
                    Err(EvalError::RangeMismatch(_, _))
                );
                let rank = matches!(
                    ContractionEval::new(leaf(&x)?, leaf(&y)?, ContractOp::new(3, 2, 1)?),
                    Err(EvalError::Tile(TileError::Inner(2, 2, 1)))
                );
                world.fence().await;
                TestResult::Ok([mismatch, rank])
            })
            .await;
        for output in outputs {
            assert_eq!(output.map_err(|err| err.to_string())?, [true, true]);
        }
        Ok(())
    }
}
