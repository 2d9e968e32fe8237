//! Distributed tiled arrays.

use std::{
    fmt::{self, Write as _},
    marker::PhantomData,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use futures::FutureExt;
use rustc_hash::FxHashMap as HashMap;
use thiserror::Error;

use crate::{
    Distributed,
    dist::{Distribution, HasPmap, HasRange, HasShape, HasWorld, ReadableTile, local_nonzero},
    eval::{DistEval, EvalError},
    num::Scalar,
    pmap::{BlockedPmap, ReplicatedPmap, SharedPmap},
    range::{Range, RangeError, TiledRange},
    replicator::Replicator,
    runtime::{
        ObjectId, Payload, Promise, Rank, RemoteObject, RuntimeError, World, fatal,
        platform::BoxFuture,
    },
    shape::{Shape, ShapeError},
    tile::Tile,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArrayError {
    #[error("array is not initialized")]
    Uninitialized,
    #[error("array declared with {0} dimensions but tiled range has {1}")]
    DimensionMismatch(usize, usize),
    #[error("tile ordinal {0} is out of range of volume {1}")]
    OutOfRange(usize, usize),
    #[error("tile {0} is owned by rank {1}, not by rank {2}")]
    OwnershipViolation(usize, Rank, Rank),
    #[error("tile {0} is structurally zero")]
    ZeroTile(usize),
    #[error("tile {0} covers {1} but was given a tile over {2}")]
    TileRange(usize, Range, Range),
    #[error("process map of {0} tiles over {1} ranks does not fit {2} tiles over {3} ranks")]
    Pmap(usize, usize, usize, usize),
    #[error("arrays {0} and {1} differ in tiling, shape or distribution")]
    Incompatible(ObjectId, ObjectId),
    #[error(transparent)]
    Range(#[from] RangeError),
    #[error(transparent)]
    Shape(#[from] ShapeError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

struct TileCell<T> {
    promise: Promise<Tile<T>>,
    assigned: AtomicBool,
}

impl<T: Scalar> TileCell<T> {
    fn new() -> Self {
        Self {
            promise: Promise::new(),
            assigned: AtomicBool::new(false),
        }
    }

    /// Reserves the cell for a single writer.
    fn claim(&self) -> Result<(), RuntimeError> {
        match self.assigned.swap(true, Ordering::AcqRel) {
            true => Err(RuntimeError::AlreadySet),
            false => Ok(()),
        }
    }

    /// Gives up a claim made before anything was written.
    fn release(&self) {
        self.assigned.store(false, Ordering::Release);
    }
}

#[derive(Distributed)]
#[distributed(crate = "crate", bound = "T: Scalar")]
struct ArrayImpl<T> {
    #[distributed]
    dist: Distribution,
    /// One cell per local non-zero tile.
    cells: HashMap<usize, TileCell<T>>,
}

impl<T: Scalar> RemoteObject for ArrayImpl<T> {
    fn fetch(&self, ordinal: usize) -> Result<BoxFuture<'static, Payload>, RuntimeError> {
        let Some(cell) = self.cells.get(&ordinal) else {
            return Err(RuntimeError::UnknownTile(self.dist.id, ordinal));
        };
        let promise = cell.promise.clone();
        let future = async move {
            let payload: Payload = Arc::new(promise.get().await);
            payload
        };
        Ok(future.boxed())
    }
}

impl<T: Scalar> ArrayImpl<T> {
    fn check(&self, ordinal: usize) -> Result<(), ArrayError> {
        let volume = self.volume();
        match ordinal < volume {
            true => Ok(()),
            false => Err(ArrayError::OutOfRange(ordinal, volume)),
        }
    }

    /// The cell of a local non-zero tile.
    fn cell(&self, ordinal: usize) -> Result<&TileCell<T>, ArrayError> {
        self.check(ordinal)?;
        if self.is_zero(ordinal) {
            return Err(ArrayError::ZeroTile(ordinal));
        }
        match self.cells.get(&ordinal) {
            Some(cell) => Ok(cell),
            None => {
                let rank = self.world().rank();
                let owner = self.owner(ordinal);
                Err(ArrayError::OwnershipViolation(ordinal, owner, rank))
            }
        }
    }
}

/// Unregisters the array at the next fence once the last handle is gone.
struct ArrayHandle<T> {
    inner: Arc<ArrayImpl<T>>,
}

impl<T> Drop for ArrayHandle<T> {
    fn drop(&mut self) {
        let dist = &self.inner.dist;
        dist.world.defer_unregister(dist.id);
    }
}

/// A distributed array of tiles. Clones are cheap aliases of the same array.
///
/// Construction is collective: every rank must build its arrays in the same order.
pub struct DistArray<T> {
    pimpl: Option<Arc<ArrayHandle<T>>>,
}

impl<T> Default for DistArray<T> {
    fn default() -> Self {
        Self { pimpl: None }
    }
}

impl<T> Clone for DistArray<T> {
    fn clone(&self) -> Self {
        Self {
            pimpl: self.pimpl.clone(),
        }
    }
}

impl<T> fmt::Debug for DistArray<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.pimpl {
            Some(pimpl) => f
                .debug_struct("DistArray")
                .field("id", &pimpl.inner.dist.id)
                .field("rank", &pimpl.inner.dist.world.rank())
                .field("trange", &pimpl.inner.dist.trange)
                .finish(),
            None => f.write_str("DistArray(uninitialized)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ArrayBuilder<T> {
    world: World,
    trange: TiledRange,
    dims: Option<usize>,
    pmap: Option<SharedPmap>,
    phantom: PhantomData<T>,
}

impl<T: Scalar> ArrayBuilder<T> {
    pub fn new(world: &World, trange: TiledRange) -> Self {
        Self {
            world: world.clone(),
            trange,
            dims: None,
            pmap: None,
            phantom: PhantomData,
        }
    }

    /// Declares the number of dimensions the tiled range must have.
    pub fn dims(mut self, dims: usize) -> Self {
        self.dims = Some(dims);
        self
    }

    /// Distributes tiles with `pmap` instead of a blocked map.
    pub fn pmap(mut self, pmap: SharedPmap) -> Self {
        self.pmap = Some(pmap);
        self
    }

    /// An array whose tiles are all non-zero.
    pub fn dense(self) -> Result<DistArray<T>, ArrayError> {
        self.build(Shape::Dense)
    }

    /// An array with a shape every rank already agrees on.
    pub fn sparse(self, shape: Shape) -> Result<DistArray<T>, ArrayError> {
        self.build(shape)
    }

    /// An array whose non-zero tiles are those listed by any rank. Collective.
    pub async fn sparse_from_tiles(
        self,
        tiles: impl IntoIterator<Item = usize>,
    ) -> Result<DistArray<T>, ArrayError> {
        let shape = Shape::sparse_from_tiles(&self.world, self.trange.volume(), tiles).await?;
        self.build(shape)
    }

    fn build(self, shape: Shape) -> Result<DistArray<T>, ArrayError> {
        let Self {
            world,
            trange,
            dims,
            pmap,
            ..
        } = self;

        let rank = trange.rank();
        if let Some(dims) = dims.filter(|&dims| dims != rank) {
            return Err(ArrayError::DimensionMismatch(dims, rank));
        }
        let volume = trange.volume();
        shape.validate(volume)?;

        let pmap = pmap.unwrap_or_else(|| Arc::new(BlockedPmap::for_world(&world, volume)));
        if pmap.size() != volume || pmap.procs() != world.size() {
            return Err(ArrayError::Pmap(pmap.size(), pmap.procs(), volume, world.size()));
        }

        let dist = Distribution::new(&world, trange, shape, pmap);
        let cells = local_nonzero(&dist)
            .into_iter()
            .map(|ordinal| (ordinal, TileCell::new()))
            .collect();
        let id = dist.id;
        let inner = Arc::new(ArrayImpl { dist, cells });
        world.register(id, inner.clone())?;

        log::debug!(
            "rank {} built array {id} of {volume} tiles, {} local",
            world.rank(),
            inner.cells.len()
        );
        let pimpl = Some(Arc::new(ArrayHandle { inner }));
        Ok(DistArray { pimpl })
    }
}

impl<T: Scalar> DistArray<T> {
    pub fn builder(world: &World, trange: TiledRange) -> ArrayBuilder<T> {
        ArrayBuilder::new(world, trange)
    }

    /// Stores the output of `eval` under its pmap. Collective.
    ///
    /// Evaluates `eval` and moves every local non-zero tile out of it.
    pub fn from_eval(eval: &dyn DistEval<T>) -> Result<Self, EvalError> {
        eval.eval()?;
        let array = Self::builder(eval.world(), eval.trange().clone())
            .pmap(eval.pmap().clone())
            .sparse(eval.shape().clone())?;
        for ordinal in local_nonzero(eval) {
            array.set_future(ordinal, eval.move_tile(ordinal)?)?;
        }
        Ok(array)
    }

    #[inline]
    fn pimpl(&self) -> Result<&ArrayImpl<T>, ArrayError> {
        match &self.pimpl {
            Some(pimpl) => Ok(&pimpl.inner),
            None => Err(ArrayError::Uninitialized),
        }
    }

    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.pimpl.is_some()
    }

    /// Returns `true` if both handles alias the same array.
    #[inline]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        match (&self.pimpl, &other.pimpl) {
            (Some(x), Some(y)) => Arc::ptr_eq(x, y),
            _ => false,
        }
    }

    #[inline]
    pub fn id(&self) -> Result<ObjectId, ArrayError> {
        Ok(self.pimpl()?.dist.id)
    }

    #[inline]
    pub fn world(&self) -> Result<&World, ArrayError> {
        Ok(self.pimpl()?.world())
    }

    #[inline]
    pub fn rank(&self) -> Result<Rank, ArrayError> {
        Ok(self.pimpl()?.world().rank())
    }

    #[inline]
    pub fn trange(&self) -> Result<&TiledRange, ArrayError> {
        Ok(self.pimpl()?.trange())
    }

    #[inline]
    pub fn shape(&self) -> Result<&Shape, ArrayError> {
        Ok(self.pimpl()?.shape())
    }

    #[inline]
    pub fn pmap(&self) -> Result<&SharedPmap, ArrayError> {
        Ok(self.pimpl()?.pmap())
    }

    /// Number of tiles.
    #[inline]
    pub fn size(&self) -> Result<usize, ArrayError> {
        Ok(self.pimpl()?.volume())
    }

    pub fn owner(&self, ordinal: usize) -> Result<Rank, ArrayError> {
        let pimpl = self.pimpl()?;
        pimpl.check(ordinal)?;
        Ok(pimpl.owner(ordinal))
    }

    pub fn is_local(&self, ordinal: usize) -> Result<bool, ArrayError> {
        let pimpl = self.pimpl()?;
        pimpl.check(ordinal)?;
        Ok(pimpl.is_local(ordinal))
    }

    pub fn is_zero(&self, ordinal: usize) -> Result<bool, ArrayError> {
        let pimpl = self.pimpl()?;
        pimpl.check(ordinal)?;
        Ok(pimpl.is_zero(ordinal))
    }

    /// Assigns a local non-zero tile. Each tile can be assigned once.
    pub fn set(&self, ordinal: usize, tile: Tile<T>) -> Result<(), ArrayError> {
        let pimpl = self.pimpl()?;
        let cell = pimpl.cell(ordinal)?;
        let range = pimpl.trange().make_tile_range(ordinal)?;
        if tile.range() != &range {
            return Err(ArrayError::TileRange(ordinal, range, tile.range().clone()));
        }
        cell.claim()?;
        log::trace!("rank {} sets tile {ordinal}", pimpl.world().rank());
        cell.promise.set(tile)?;
        Ok(())
    }

    pub fn set_coord(&self, coord: &[usize], tile: Tile<T>) -> Result<(), ArrayError> {
        let ordinal = self.trange()?.ordinal(coord)?;
        self.set(ordinal, tile)
    }

    /// Assigns a local non-zero tile once `promise` resolves.
    pub fn set_future(&self, ordinal: usize, promise: Promise<Tile<T>>) -> Result<(), ArrayError> {
        let pimpl = self.pimpl()?;
        let cell = pimpl.cell(ordinal)?;
        cell.claim()?;

        let range = pimpl.trange().make_tile_range(ordinal)?;
        let output = cell.promise.clone();
        pimpl.world().spawn(async move {
            let tile = promise.get().await;
            if tile.range() != &range {
                fatal(ArrayError::TileRange(ordinal, range, tile.range().clone()))
            }
            if let Err(err) = output.set(tile) {
                fatal(err)
            }
        });
        Ok(())
    }

    /// Fills every local non-zero tile with `value`, one task per tile.
    ///
    /// Either every local cell is claimed or none is: on failure no fill is started.
    pub fn set_all_local(&self, value: T) -> Result<(), ArrayError> {
        let pimpl = self.pimpl()?;
        let mut claimed = Vec::with_capacity(pimpl.cells.len());
        for ordinal in local_nonzero(pimpl) {
            let claim = pimpl.cell(ordinal).and_then(|cell| {
                let range = pimpl.trange().make_tile_range(ordinal)?;
                cell.claim()?;
                Ok((range, cell))
            });
            match claim {
                Ok(claim) => claimed.push(claim),
                Err(err) => {
                    claimed.iter().for_each(|(_, cell)| cell.release());
                    return Err(err);
                }
            }
        }

        for (range, cell) in claimed {
            let output = cell.promise.clone();
            pimpl.world().spawn(async move {
                if let Err(err) = output.set(Tile::filled(range, value)) {
                    fatal(err)
                }
            });
        }
        Ok(())
    }

    /// The tile at `ordinal`: the local cell, or a one-sided fetch from its owner.
    pub fn get(&self, ordinal: usize) -> Result<Promise<Tile<T>>, ArrayError> {
        let pimpl = self.pimpl()?;
        pimpl.check(ordinal)?;
        if pimpl.is_zero(ordinal) {
            return Err(ArrayError::ZeroTile(ordinal));
        }
        match pimpl.cells.get(&ordinal) {
            Some(cell) => Ok(cell.promise.clone()),
            None => {
                let owner = pimpl.owner(ordinal);
                log::trace!(
                    "rank {} fetches tile {ordinal} from {owner}",
                    pimpl.world().rank()
                );
                Ok(pimpl.world().fetch(owner, pimpl.dist.id, ordinal))
            }
        }
    }

    pub fn get_coord(&self, coord: &[usize]) -> Result<Promise<Tile<T>>, ArrayError> {
        let ordinal = self.trange()?.ordinal(coord)?;
        self.get(ordinal)
    }

    /// Local non-zero tiles in ascending ordinal order.
    pub fn local(
        &self,
    ) -> Result<impl Iterator<Item = (usize, Promise<Tile<T>>)> + '_, ArrayError> {
        let pimpl = self.pimpl()?;
        let iter = local_nonzero(pimpl).into_iter().filter_map(|ordinal| {
            let cell = pimpl.cells.get(&ordinal)?;
            Some((ordinal, cell.promise.clone()))
        });
        Ok(iter)
    }

    /// Makes every tile local to every rank. Collective.
    ///
    /// Does nothing if the array is already replicated or the world has a single rank. Otherwise
    /// this handle switches to a replicated copy; other handles keep the original.
    pub fn make_replicated(&mut self) -> Result<(), ArrayError> {
        let pimpl = self.pimpl()?;
        let world = pimpl.world().clone();
        if pimpl.pmap().is_replicated() || world.size() == 1 {
            return Ok(());
        }

        let pmap = Arc::new(ReplicatedPmap::for_world(&world, pimpl.volume()));
        let target = Self::builder(&world, pimpl.trange().clone())
            .pmap(pmap)
            .sparse(pimpl.shape().clone())?;
        let replicator = Replicator::new(self, &target)?;
        replicator.run()?;
        world.defer_drop(replicator);

        *self = target;
        Ok(())
    }

    /// Renders every non-zero tile on rank 0, waiting for each. Other ranks get `None`.
    pub async fn pretty(&self) -> Result<Option<String>, ArrayError> {
        let pimpl = self.pimpl()?;
        if pimpl.world().rank() != 0 {
            return Ok(None);
        }

        let mut output = String::new();
        for ordinal in (0..pimpl.volume()).filter(|&ordinal| !pimpl.is_zero(ordinal)) {
            let tile = self.get(ordinal)?.get().await;
            _ = writeln!(output, "{ordinal}: {tile}");
        }
        Ok(Some(output))
    }
}

impl<T: Scalar> ReadableTile<T> for DistArray<T> {
    type Error = ArrayError;

    #[inline]
    fn get(&self, ordinal: usize) -> Result<Promise<Tile<T>>, Self::Error> {
        DistArray::get(self, ordinal)
    }
}
