use std::sync::Arc;

use derive_more::{Deref, Display};
use itertools::Itertools;

use super::{MessageKey, ObjectId, Rank, World};

/// An explicit, ordered list of ranks.
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash, Deref, Display)]
#[display("[{}]", _0.iter().format(", "))]
pub struct Group(Arc<[Rank]>);

impl Group {
    pub fn new(ranks: impl IntoIterator<Item = Rank>) -> Self {
        Self(ranks.into_iter().sorted_unstable().dedup().collect())
    }

    #[inline]
    pub fn contains(&self, rank: Rank) -> bool {
        self.0.binary_search(&rank).is_ok()
    }
}

impl World {
    /// Blocks until every rank reaches the barrier.
    pub async fn barrier(&self) {
        self.barrier_handle().wait().await;
    }

    /// Waits for global quiescence: every rank has entered the fence and no task or message is
    /// in flight anywhere. Objects deferred before the fence are released afterwards.
    pub async fn fence(&self) {
        log::debug!("rank {} enters fence", self.rank());
        self.barrier().await;
        self.activity().quiescent().await;
        self.barrier().await;
        self.release_deferred();
    }

    /// Combines one value from every rank with `op` and returns the result on all ranks.
    ///
    /// Values are folded in rank order.
    pub async fn all_reduce<V, F>(&self, value: V, op: F) -> V
    where
        V: Clone + Send + Sync + 'static,
        F: Fn(V, V) -> V,
    {
        let tag = self.next_collective_tag();
        let key = |source| MessageKey::new(ObjectId::COLLECTIVE, tag, source);
        log::debug!("rank {} joins all-reduce {tag}", self.rank());

        match self.rank() {
            0 => {
                let mut output = value;
                for source in 1..self.size() {
                    let other = self.recv(key(source)).await;
                    output = op(output, other);
                }
                for dest in 1..self.size() {
                    self.send(dest, key(0), output.clone());
                }
                output
            }
            rank => {
                self.send(0, key(rank), value);
                self.recv(key(0)).await
            }
        }
    }

    /// Element-wise bitwise or of equally sized word vectors across all ranks.
    pub async fn all_reduce_bitwise_or(&self, words: Vec<u64>) -> Vec<u64> {
        self.all_reduce(words, |mut x, y| {
            x.iter_mut().zip_eq(y).for_each(|(x, y)| *x |= y);
            x
        })
        .await
    }

    /// Sends `value` from this rank to every member of `group`, itself included if a member.
    ///
    /// Members pick it up with [`World::recv`] under `MessageKey::new(object, tag, root)`, `root` being
    /// this rank.
    pub fn broadcast<V>(&self, object: ObjectId, tag: u64, group: &Group, value: V)
    where
        V: Clone + Send + Sync + 'static,
    {
        let key = MessageKey::new(object, tag, self.rank());
        for &dest in group.iter() {
            self.send(dest, key, value.clone());
        }
    }
}
