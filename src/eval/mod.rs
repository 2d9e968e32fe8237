//! Single-use asynchronous evaluators producing the tiles of a distributed expression.
//!
//! Every evaluator owns one cell per local non-zero tile of its output. [`DistEval::eval`]
//! schedules the production of those tiles, on this rank or on others that then deliver them.
//! Consumers either read a cell ([`ReadableTile::get`]) or move it out ([`DistEval::move_tile`]).

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};

use itertools::Itertools;
use rustc_hash::{FxHashMap as HashMap, FxHashSet as HashSet};
use thiserror::Error;

pub use array_eval::ArrayEval;
pub use binary_eval::BinaryEval;
pub use contraction_eval::ContractionEval;

use crate::{
    array::ArrayError,
    dist::{
        Distribution, HasPmap, HasRange, HasShape, HasWorld, ReadableTile, local_nonzero,
    },
    grid::GridError,
    num::Scalar,
    range::{RangeError, TiledRange},
    runtime::{MessageKey, Promise, Rank, World, fatal},
    shape::ShapeError,
    tile::{Tile, TileError},
};

pub mod array_eval;
pub mod binary_eval;
pub mod contraction_eval;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EvalError {
    #[error("evaluator has already been evaluated")]
    AlreadyEvaluated,
    #[error("tile {0} has already been moved out")]
    Consumed(usize),
    #[error("tile {0} is owned by rank {1}, not by this rank")]
    NotLocal(usize, Rank),
    #[error("tile {0} is structurally zero")]
    ZeroTile(usize),
    #[error("tile ordinal {0} is out of range of volume {1}")]
    OutOfRange(usize, usize),
    #[error("operand tilings mismatch: {0} and {1}")]
    RangeMismatch(TiledRange, TiledRange),
    #[error("operands are distributed differently")]
    PmapMismatch,
    #[error("process map of {0} tiles does not fit {1} tiles")]
    Pmap(usize, usize),
    #[error(transparent)]
    Array(#[from] ArrayError),
    #[error(transparent)]
    Grid(#[from] GridError),
    #[error(transparent)]
    Tile(#[from] TileError),
    #[error(transparent)]
    Range(#[from] RangeError),
    #[error(transparent)]
    Shape(#[from] ShapeError),
}

/// A node of a distributed evaluation tree.
pub trait DistEval<T: Scalar>:
    HasWorld + HasRange + HasShape + HasPmap + ReadableTile<T, Error = EvalError> + Send + Sync
{
    /// Hands out the cell of a local non-zero tile. Each tile can be moved out once.
    fn move_tile(&self, ordinal: usize) -> Result<Promise<Tile<T>>, EvalError>;

    /// Schedules the production of every local non-zero tile, evaluating children first.
    ///
    /// Can be called once. The returned promise resolves when all local tiles are ready.
    fn eval(&self) -> Result<Promise<()>, EvalError>;
}

pub type SharedEval<T> = Arc<dyn DistEval<T>>;

/// Which stream a message of an evaluator belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub(crate) enum Stream {
    Left = 0,
    Right = 1,
    Result = 2,
}

impl Stream {
    #[inline]
    pub(crate) fn tag(self, ordinal: usize) -> u64 {
        ((ordinal as u64) << 2) | self as u64
    }
}

/// Output cells of an evaluator on one rank.
pub(crate) struct TileCells<T> {
    cells: HashMap<usize, Promise<Tile<T>>>,
    unmoved: Mutex<HashSet<usize>>,
    evaluated: AtomicBool,
}

impl<T: Scalar> TileCells<T> {
    pub fn new(dist: &Distribution) -> Self {
        let ordinals = local_nonzero(dist);
        let unmoved = Mutex::new(ordinals.iter().copied().collect());
        let cells = ordinals
            .into_iter()
            .map(|ordinal| (ordinal, Promise::new()))
            .collect();
        Self {
            cells,
            unmoved,
            evaluated: AtomicBool::new(false),
        }
    }

    fn lookup(
        &self,
        dist: &Distribution,
        ordinal: usize,
    ) -> Result<&Promise<Tile<T>>, EvalError> {
        let volume = dist.volume();
        if ordinal >= volume {
            return Err(EvalError::OutOfRange(ordinal, volume));
        }
        if dist.is_zero(ordinal) {
            return Err(EvalError::ZeroTile(ordinal));
        }
        self.cells
            .get(&ordinal)
            .ok_or_else(|| EvalError::NotLocal(ordinal, dist.owner(ordinal)))
    }

    pub fn get(
        &self,
        dist: &Distribution,
        ordinal: usize,
    ) -> Result<Promise<Tile<T>>, EvalError> {
        let promise = self.lookup(dist, ordinal)?;
        match self.unmoved.lock().expect("failed to lock").contains(&ordinal) {
            true => Ok(promise.clone()),
            false => Err(EvalError::Consumed(ordinal)),
        }
    }

    pub fn take(
        &self,
        dist: &Distribution,
        ordinal: usize,
    ) -> Result<Promise<Tile<T>>, EvalError> {
        let promise = self.lookup(dist, ordinal)?;
        match self.unmoved.lock().expect("failed to lock").remove(&ordinal) {
            true => Ok(promise.clone()),
            false => Err(EvalError::Consumed(ordinal)),
        }
    }

    /// Marks the evaluator as evaluated. Fails on the second call.
    pub fn start(&self) -> Result<(), EvalError> {
        match self.evaluated.swap(true, Ordering::AcqRel) {
            true => Err(EvalError::AlreadyEvaluated),
            false => Ok(()),
        }
    }

    /// Stores a produced tile. Producing a tile twice is fatal.
    pub fn set(&self, ordinal: usize, tile: Tile<T>) {
        let Some(promise) = self.cells.get(&ordinal) else {
            fatal(format_args!("tile {ordinal} has no local cell"))
        };
        if let Err(err) = promise.set(tile) {
            fatal(err)
        }
    }

    /// Resolves once every local tile has been produced.
    pub fn completion(&self, world: &World) -> Promise<()> {
        let pending = self.cells.values().cloned().collect_vec();
        let done = Promise::new();
        let output = done.clone();
        world.spawn(async move {
            for promise in pending {
                promise.get().await;
            }
            _ = output.set(());
        });
        done
    }
}

/// Hands a produced tile to its owner: stored here if local, otherwise sent.
pub(crate) fn publish<T: Scalar>(
    dist: &Distribution,
    cells: &TileCells<T>,
    ordinal: usize,
    tile: Tile<T>,
) {
    let rank = dist.world.rank();
    match dist.owner(ordinal) {
        owner if owner == rank => cells.set(ordinal, tile),
        owner => {
            log::trace!("rank {rank} delivers tile {ordinal} of {} to {owner}", dist.id);
            let key = MessageKey::new(dist.id, Stream::Result.tag(ordinal), rank);
            dist.world.send(owner, key, tile);
        }
    }
}

/// Hands the tile `source` publishes for local `ordinal` to `store` once it arrives.
pub(crate) fn expect<T: Scalar>(
    dist: &Distribution,
    ordinal: usize,
    source: Rank,
    store: impl FnOnce(Tile<T>) + Send + 'static,
) {
    let key = MessageKey::new(dist.id, Stream::Result.tag(ordinal), source);
    let world = dist.world.clone();
    dist.world.spawn(async move {
        let tile = world.recv::<Tile<T>>(key).await;
        store(tile);
    });
}

/// Promise of a tile another rank broadcasts under `key`.
pub(crate) fn receive<T: Scalar>(world: &World, key: MessageKey) -> Promise<Tile<T>> {
    let promise = Promise::new();
    let output = promise.clone();
    let receiver = world.clone();
    world.spawn(async move {
        let tile = receiver.recv::<Tile<T>>(key).await;
        if let Err(err) = output.set(tile) {
            fatal(err)
        }
    });
    promise
}

#[cfg(test)]
pub(crate) mod tests {
    use std::error::Error;

    use super::Stream;

    #[test]
    fn test_tags() {
        assert_eq!(Stream::Left.tag(5), 20);
        assert_eq!(Stream::Right.tag(5), 21);
        assert_eq!(Stream::Result.tag(5), 22);
    }

    pub type TestResult<T> = Result<T, Box<dyn Error + Send + Sync>>;
}
