//! Copies a distributed array onto every rank.

use crate::{
    array::{ArrayError, DistArray},
    num::Scalar,
    runtime::{MessageKey, Promise, fatal},
    tile::Tile,
};

/// A one-shot all-to-all broadcast of the tiles of `source` into a replicated `target`.
///
/// Every rank forwards its local source tiles to all other ranks as they become ready and
/// stores its own copy locally. Completion is observed by fencing.
#[derive(Debug)]
pub struct Replicator<T> {
    source: DistArray<T>,
    target: DistArray<T>,
}

impl<T: Scalar> Replicator<T> {
    pub fn new(source: &DistArray<T>, target: &DistArray<T>) -> Result<Self, ArrayError> {
        let compatible = source.trange()? == target.trange()?
            && source.shape()? == target.shape()?
            && target.pmap()?.is_replicated();
        if !compatible {
            return Err(ArrayError::Incompatible(source.id()?, target.id()?));
        }
        Ok(Self {
            source: source.clone(),
            target: target.clone(),
        })
    }

    /// Starts forwarding. Must be called on every rank.
    pub fn run(&self) -> Result<(), ArrayError> {
        let world = self.source.world()?.clone();
        let rank = world.rank();
        let object = self.target.id()?;

        for (ordinal, promise) in self.source.local()? {
            self.target.set_future(ordinal, promise.clone())?;

            let sender = world.clone();
            let key = MessageKey::new(object, ordinal as u64, rank);
            world.spawn(async move {
                let tile = promise.get().await;
                for dest in (0..sender.size()).filter(|&dest| dest != rank) {
                    sender.send(dest, key, tile.clone());
                }
            });
        }

        let shape = self.source.shape()?;
        for ordinal in 0..self.source.size()? {
            if shape.is_zero(ordinal) || self.source.is_local(ordinal)? {
                continue;
            }
            let promise = Promise::new();
            self.target.set_future(ordinal, promise.clone())?;

            let receiver = world.clone();
            let key = MessageKey::new(object, ordinal as u64, self.source.owner(ordinal)?);
            world.spawn(async move {
                let tile = receiver.recv::<Tile<T>>(key).await;
                if let Err(err) = promise.set(tile) {
                    fatal(err)
                }
            });
        }

        log::debug!("rank {rank} replicates array {} into {object}", self.source.id()?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{error::Error, sync::Arc};

    use super::Replicator;
    use crate::{
        array::{ArrayError, DistArray},
        pmap::ReplicatedPmap,
        range::{TiledRange, TiledRange1},
        runtime::ClusterBuilder,
    };

    #[tokio::test]
    async fn test_incompatible() -> Result<(), Box<dyn Error>> {
        let cluster = ClusterBuilder::new(2).build().await?;
        let outputs = cluster
            .run(|world| async move {
                let trange = TiledRange::new([TiledRange1::new([0, 2, 4, 6])?]);
                let source = DistArray::<f32>::builder(&world, trange.clone()).dense()?;
                let blocked = DistArray::<f32>::builder(&world, trange.clone()).dense()?;
                let pmap = Arc::new(ReplicatedPmap::for_world(&world, 3));
                let replicated = DistArray::<f32>::builder(&world, trange).pmap(pmap).dense()?;

                let incompatible = matches!(
                    Replicator::new(&source, &blocked),
                    Err(ArrayError::Incompatible(_, _))
                );
                let compatible = Replicator::new(&source, &replicated).is_ok();
                world.fence().await;
                Ok::<_, Box<dyn Error + Send + Sync>>((incompatible, compatible))
            })
            .await;
        for output in outputs {
            assert_eq!(output.map_err(|err| err.to_string())?, (true, true));
        }
        Ok(())
    }
}
