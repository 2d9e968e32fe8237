//! Distributed block-sparse tiled arrays.
//!
//! An array is cut into rectangular tiles by a [`TiledRange`](range::TiledRange). A
//! [`Shape`](shape::Shape) marks which tiles are structurally zero and a
//! [`Pmap`](pmap::Pmap) assigns every remaining tile to a rank of a [`World`](runtime::World).
//! Expressions over arrays are evaluated by trees of [`DistEval`](eval::DistEval) nodes whose
//! tiles are produced asynchronously and exchanged between ranks as they become ready.

pub use tessera_derive::Distributed;

pub use array::{ArrayBuilder, ArrayError, DistArray};
pub use eval::{ArrayEval, BinaryEval, ContractionEval, DistEval, EvalError, SharedEval};
pub use runtime::{Cluster, ClusterBuilder, Promise, World};

pub mod array;
pub mod dist;
pub mod eval;
pub mod grid;
pub mod num;
pub mod pmap;
pub mod range;
pub mod replicator;
pub mod runtime;
pub mod shape;
pub mod tile;

#[cfg(test)]
#[macro_export]
macro_rules! assert_approx_eq {
    ($x:expr, $y:expr, $eps:expr) => {{
        let (x, y, eps) = ($x, $y, $eps);
        assert!(
            (x - y).abs() <= eps,
            "assertion failed: `{:?}` is not within `{:?}` of `{:?}`",
            x,
            eps,
            y
        );
    }};
}
