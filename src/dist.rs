//! Capabilities shared by distributed arrays and evaluators.

use std::sync::Arc;

use crate::{
    num::Scalar,
    pmap::SharedPmap,
    range::TiledRange,
    runtime::{ObjectId, Promise, Rank, World},
    shape::Shape,
    tile::Tile,
};

pub trait HasWorld {
    fn world(&self) -> &World;
}

pub trait HasRange {
    fn trange(&self) -> &TiledRange;

    /// Number of tiles.
    #[inline]
    fn volume(&self) -> usize {
        self.trange().volume()
    }
}

pub trait HasShape {
    fn shape(&self) -> &Shape;

    #[inline]
    fn is_zero(&self, ordinal: usize) -> bool {
        self.shape().is_zero(ordinal)
    }
}

pub trait HasPmap {
    fn pmap(&self) -> &SharedPmap;

    #[inline]
    fn owner(&self, ordinal: usize) -> Rank {
        self.pmap().owner(ordinal)
    }

    #[inline]
    fn is_local(&self, ordinal: usize) -> bool {
        self.pmap().is_local(ordinal)
    }
}

/// Local ordinals holding a non-zero tile.
pub fn local_nonzero<D: HasShape + HasPmap + ?Sized>(dist: &D) -> Vec<usize> {
    let shape = dist.shape();
    dist.pmap()
        .local()
        .iter()
        .copied()
        .filter(|&ordinal| !shape.is_zero(ordinal))
        .collect()
}

/// Everything that describes how a distributed object is laid out.
#[derive(Debug, Clone)]
pub struct Distribution {
    pub world: World,
    pub trange: TiledRange,
    pub shape: Shape,
    pub pmap: SharedPmap,
    /// Identifies the object's messages on every rank.
    pub id: ObjectId,
}

impl Distribution {
    /// Allocates a fresh object id. Ranks must create distributions in the same order.
    pub fn new(world: &World, trange: TiledRange, shape: Shape, pmap: SharedPmap) -> Self {
        let world = world.clone();
        let id = world.unique_id();
        Self {
            world,
            trange,
            shape,
            pmap,
            id,
        }
    }
}

impl HasWorld for Distribution {
    #[inline]
    fn world(&self) -> &World {
        &self.world
    }
}

impl HasRange for Distribution {
    #[inline]
    fn trange(&self) -> &TiledRange {
        &self.trange
    }
}

impl HasShape for Distribution {
    #[inline]
    fn shape(&self) -> &Shape {
        &self.shape
    }
}

impl HasPmap for Distribution {
    #[inline]
    fn pmap(&self) -> &SharedPmap {
        &self.pmap
    }
}

impl<D: HasWorld + ?Sized> HasWorld for Arc<D> {
    #[inline]
    fn world(&self) -> &World {
        self.as_ref().world()
    }
}

impl<D: HasRange + ?Sized> HasRange for Arc<D> {
    #[inline]
    fn trange(&self) -> &TiledRange {
        self.as_ref().trange()
    }
}

impl<D: HasShape + ?Sized> HasShape for Arc<D> {
    #[inline]
    fn shape(&self) -> &Shape {
        self.as_ref().shape()
    }
}

impl<D: HasPmap + ?Sized> HasPmap for Arc<D> {
    #[inline]
    fn pmap(&self) -> &SharedPmap {
        self.as_ref().pmap()
    }
}

/// Read access to tiles by ordinal.
pub trait ReadableTile<T: Scalar> {
    type Error;

    fn get(&self, ordinal: usize) -> Result<Promise<Tile<T>>, Self::Error>;
}
