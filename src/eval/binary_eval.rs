use std::sync::Arc;

use super::{DistEval, EvalError, SharedEval, TileCells, expect, publish};
use crate::{
    Distributed,
    dist::{Distribution, HasPmap, HasRange, HasShape, HasWorld, ReadableTile, local_nonzero},
    num::Scalar,
    pmap::{BlockedPmap, SharedPmap},
    runtime::{Promise, fatal, platform},
    tile::{
        Tile,
        ops::{BinaryKind, BinaryOp},
    },
};

#[derive(Distributed)]
#[distributed(crate = "crate", bound = "T: Scalar")]
struct Inner<T> {
    #[distributed]
    dist: Distribution,
    cells: TileCells<T>,
    left: SharedEval<T>,
    right: SharedEval<T>,
    op: BinaryOp<T>,
}

/// Combines two identically tiled and distributed children tile by tile.
///
/// A tile is produced where the left child lives and handed to the owner of the result tile.
/// A structurally zero operand is passed to the op as `None`.
#[derive(Distributed)]
#[distributed(crate = "crate", bound = "T: Scalar")]
pub struct BinaryEval<T>(Arc<Inner<T>>);

impl<T> Clone for BinaryEval<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T: Scalar> BinaryEval<T> {
    /// Collective.
    pub fn new(
        left: SharedEval<T>,
        right: SharedEval<T>,
        op: BinaryOp<T>,
    ) -> Result<Self, EvalError> {
        let source = left.trange();
        if source != right.trange() {
            return Err(EvalError::RangeMismatch(
                source.clone(),
                right.trange().clone(),
            ));
        }
        let volume = source.volume();
        if (0..volume).any(|ordinal| left.owner(ordinal) != right.owner(ordinal)) {
            return Err(EvalError::PmapMismatch);
        }
        op.perm().check(source.rank())?;

        let shape = match op.kind() {
            BinaryKind::Mult => left.shape().intersect(right.shape()),
            BinaryKind::Add | BinaryKind::Subt => left.shape().union(right.shape()),
        };
        let shape = shape.permute(op.perm(), source)?;
        let trange = source.permute(op.perm());
        let world = left.world().clone();
        let pmap: SharedPmap = match op.perm().is_identity() {
            true => left.pmap().clone(),
            false => Arc::new(BlockedPmap::for_world(&world, volume)),
        };

        let dist = Distribution::new(&world, trange, shape, pmap);
        let cells = TileCells::new(&dist);
        let inner = Inner {
            dist,
            cells,
            left,
            right,
            op,
        };
        Ok(Self(Arc::new(inner)))
    }

    #[inline]
    pub fn left(&self) -> &SharedEval<T> {
        &self.0.left
    }

    #[inline]
    pub fn right(&self) -> &SharedEval<T> {
        &self.0.right
    }

    #[inline]
    pub fn op(&self) -> &BinaryOp<T> {
        &self.0.op
    }
}

/// Moves a child tile out unless it is structurally zero.
fn take_operand<T: Scalar>(
    child: &SharedEval<T>,
    ordinal: usize,
) -> Result<Option<Promise<Tile<T>>>, EvalError> {
    match child.is_zero(ordinal) {
        true => Ok(None),
        false => child.move_tile(ordinal).map(Some),
    }
}

async fn resolve<T: Scalar>(promise: Option<Promise<Tile<T>>>) -> Option<Tile<T>> {
    match promise {
        Some(promise) => Some(promise.get().await),
        None => None,
    }
}

impl<T: Scalar> ReadableTile<T> for BinaryEval<T> {
    type Error = EvalError;

    #[inline]
    fn get(&self, ordinal: usize) -> Result<Promise<Tile<T>>, Self::Error> {
        self.0.cells.get(&self.0.dist, ordinal)
    }
}

impl<T: Scalar> DistEval<T> for BinaryEval<T> {
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

        let world = self.world();
        let rank = world.rank();
        let source = inner.left.trange();
        let perm = inner.op.perm();
        let replicated = inner.left.pmap().is_replicated();

        let mut produced = 0;
        for &input in inner.left.pmap().local() {
            let ordinal = inner.trange().permute_ordinal(perm, source, input)?;
            if inner.is_zero(ordinal) || (replicated && !inner.is_local(ordinal)) {
                continue;
            }
            let left = take_operand(&inner.left, input)?;
            let right = take_operand(&inner.right, input)?;

            let inner = inner.clone();
            world.spawn(async move {
                let (left, right) = futures::join!(resolve(left), resolve(right));
                let op = inner.op.clone();
                match platform::handle(move || op.apply(left, right)).await {
                    Ok(tile) => publish(&inner.dist, &inner.cells, ordinal, tile),
                    Err(err) => fatal(err),
                }
            });
            produced += 1;
        }

        let inverse = perm.inverse();
        for ordinal in local_nonzero(inner) {
            let input = source.permute_ordinal(&inverse, inner.trange(), ordinal)?;
            let producer = inner.left.owner(input);
            if producer != rank {
                let target = inner.clone();
                expect(&inner.dist, ordinal, producer, move |tile| {
                    target.cells.set(ordinal, tile)
                });
            }
        }

        log::debug!("rank {rank} produces {produced} tiles of {}", inner.dist.id);
        Ok(inner.cells.completion(world))
    }
}
