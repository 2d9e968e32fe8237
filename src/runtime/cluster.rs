use std::{future::Future, panic::AssertUnwindSafe, sync::Arc};

use futures::FutureExt;
use itertools::Itertools;
use tokio::sync::Barrier;

use super::{
    RuntimeError, World, platform,
    world::{Fabric, serve},
};
use crate::grid::GridConfig;

#[derive(Debug, Clone)]
pub struct ClusterBuilder {
    size: usize,
    grid: GridConfig,
}

impl ClusterBuilder {
    /// A cluster of `size` ranks.
    pub fn new(size: usize) -> Self {
        Self {
            size,
            grid: GridConfig::default(),
        }
    }

    /// Configures the process grid solver used by contractions.
    pub fn grid(mut self, grid: GridConfig) -> Self {
        self.grid = grid;
        self
    }

    /// Starts the event loop of every rank. Must be called within a tokio runtime.
    pub async fn build(self) -> Result<Cluster, RuntimeError> {
        if self.size == 0 {
            return Err(RuntimeError::EmptyWorld);
        }

        let (senders, receivers): (Vec<_>, Vec<_>) =
            (0..self.size).map(|_| flume::unbounded()).unzip();
        let fabric = Arc::new(Fabric {
            senders,
            barrier: Barrier::new(self.size),
            activity: Default::default(),
            grid: self.grid,
        });

        let worlds = receivers
            .into_iter()
            .enumerate()
            .map(|(rank, receiver)| {
                let world = World::new(rank, fabric.clone());
                let future = serve(world.clone(), receiver);
                platform::spawn(async move {
                    if AssertUnwindSafe(future).catch_unwind().await.is_err() {
                        log::error!("rank {rank} event loop panicked, aborting the job");
                        std::process::abort();
                    }
                });
                world
            })
            .collect();
        Ok(Cluster { worlds })
    }
}

/// A set of ranks living in this process.
#[derive(Debug)]
pub struct Cluster {
    worlds: Vec<World>,
}

impl Drop for Cluster {
    fn drop(&mut self) {
        self.worlds.iter().for_each(World::shutdown);
    }
}

impl Cluster {
    #[inline]
    pub fn size(&self) -> usize {
        self.worlds.len()
    }

    #[inline]
    pub fn world(&self, rank: usize) -> Option<&World> {
        self.worlds.get(rank)
    }

    /// Runs `f` on every rank concurrently and collects the outputs in rank order.
    ///
    /// A panic on any rank is resumed on the caller.
    pub async fn run<F, Fut, O>(&self, f: F) -> Vec<O>
    where
        F: Fn(World) -> Fut,
        Fut: Future<Output = O> + Send + 'static,
        O: Send + 'static,
    {
        let handles = self
            .worlds
            .iter()
            .cloned()
            .map(|world| platform::spawn(f(world)))
            .collect_vec();

        let mut outputs = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(output) => outputs.push(output),
                Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
                Err(err) => panic!("rank task cancelled: {err}"),
            }
        }
        outputs
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::ClusterBuilder;
    use crate::{
        grid::GridConfig,
        runtime::{MessageKey, RuntimeError},
    };

    #[tokio::test]
    async fn test_build() -> Result<(), Box<dyn Error>> {
        assert!(matches!(
            ClusterBuilder::new(0).build().await,
            Err(RuntimeError::EmptyWorld)
        ));

        let config = GridConfig {
            max_iterations: 5,
            ..Default::default()
        };
        let cluster = ClusterBuilder::new(3).grid(config).build().await?;
        assert_eq!(cluster.size(), 3);
        assert_eq!(cluster.world(2).map(|world| world.rank()), Some(2));
        assert!(cluster.world(3).is_none());

        let ranks = cluster
            .run(|world| async move {
                assert_eq!(world.grid_config().max_iterations, 5);
                (world.rank(), world.size())
            })
            .await;
        assert_eq!(ranks, [(0, 3), (1, 3), (2, 3)]);
        Ok(())
    }

    #[tokio::test]
    async fn test_ring() -> Result<(), Box<dyn Error>> {
        let cluster = ClusterBuilder::new(4).build().await?;
        let outputs = cluster
            .run(|world| async move {
                let object = world.unique_id();
                let next = (world.rank() + 1) % world.size();
                let prev = (world.rank() + world.size() - 1) % world.size();
                world.send(next, MessageKey::new(object, 0, world.rank()), world.rank() * 10);
                world.recv::<usize>(MessageKey::new(object, 0, prev)).await
            })
            .await;
        assert_eq!(outputs, [30, 0, 10, 20]);
        Ok(())
    }
}
