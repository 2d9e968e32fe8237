//! An in-process message-passing world.
//!
//! Every rank owns a [`World`] handle backed by an event loop that serves one-sided fetches and
//! point-to-point deliveries. Ranks share a fabric holding the channels, the barrier and an
//! activity counter used to detect quiescence in [`World::fence`].

use std::{any::Any, sync::Arc};

use derive_more::{Display, From, Into};
use thiserror::Error;

pub use cluster::{Cluster, ClusterBuilder};
pub use collective::Group;
pub use promise::Promise;
pub use world::World;

use platform::BoxFuture;

pub mod cluster;
pub mod collective;
pub mod platform;
pub mod promise;
pub mod world;

pub type Rank = usize;

/// Type-erased message payload.
pub type Payload = Arc<dyn Any + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeError {
    #[error("promise is already set")]
    AlreadySet,
    #[error("world size must be positive")]
    EmptyWorld,
    #[error("rank {0} is out of world of size {1}")]
    Rank(Rank, usize),
    #[error("rank {0} is not a member of group {1:?}")]
    NotInGroup(Rank, Vec<Rank>),
    #[error("unknown object {0}")]
    UnknownObject(ObjectId),
    #[error("object {0} holds no tile at ordinal {1}")]
    UnknownTile(ObjectId, usize),
    #[error("message {0} delivered twice")]
    Duplicate(MessageKey),
    #[error("payload type mismatch: expected {0}")]
    Payload(&'static str),
    #[error("channel to rank {0} disconnected")]
    Disconnected(Rank),
}

/// Identifier of a distributed object. Ranks allocate them in the same order, so ids agree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, From, Into)]
#[display("#{_0}")]
pub struct ObjectId(usize);

impl ObjectId {
    /// Reserved for messages exchanged by collectives.
    pub const COLLECTIVE: Self = Self(usize::MAX);
}

/// Addresses a point-to-point message: the object it belongs to, a tag and the sending rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[display("{object}:{tag}@{source}")]
pub struct MessageKey {
    pub object: ObjectId,
    pub tag: u64,
    pub source: Rank,
}

impl MessageKey {
    #[inline]
    pub fn new(object: ObjectId, tag: u64, source: Rank) -> Self {
        Self {
            object,
            tag,
            source,
        }
    }
}

/// A distributed object that remote ranks may fetch from.
pub trait RemoteObject: Send + Sync {
    /// Resolves to the value stored at `ordinal` once it is ready.
    fn fetch(&self, ordinal: usize) -> Result<BoxFuture<'static, Payload>, RuntimeError>;
}

pub enum WorldEvent {
    Fetch {
        object: ObjectId,
        ordinal: usize,
        sender: flume::Sender<Result<Payload, RuntimeError>>,
    },
    Deliver {
        key: MessageKey,
        payload: Payload,
    },
    Shutdown,
}

/// Logs a failure the job cannot recover from, then panics.
#[track_caller]
pub(crate) fn fatal(err: impl std::fmt::Display) -> ! {
    log::error!("fatal runtime error: {err}");
    panic!("fatal runtime error: {err}")
}
