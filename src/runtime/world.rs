use std::{
    any::{Any, type_name},
    fmt,
    future::Future,
    panic::AssertUnwindSafe,
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
};

use futures::FutureExt;
use rustc_hash::{FxHashMap as HashMap, FxHashSet as HashSet};
use tokio::sync::{Barrier, Notify};

use super::{
    MessageKey, ObjectId, Payload, Promise, Rank, RemoteObject, RuntimeError, WorldEvent, fatal,
    platform,
};
use crate::grid::GridConfig;

/// Counts outstanding tasks and undelivered events across all ranks.
#[derive(Debug, Default)]
pub(super) struct Activity {
    pending: AtomicUsize,
    notify: Notify,
}

impl Activity {
    #[inline]
    fn start(&self) {
        self.pending.fetch_add(1, Ordering::SeqCst);
    }

    #[inline]
    fn finish(&self) {
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.notify.notify_waiters();
        }
    }

    /// Waits until nothing is pending.
    pub(super) async fn quiescent(&self) {
        loop {
            let mut notified = std::pin::pin!(self.notify.notified());
            notified.as_mut().enable();
            if self.pending.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// State shared by all ranks of a cluster.
pub(super) struct Fabric {
    pub senders: Vec<flume::Sender<WorldEvent>>,
    pub barrier: Barrier,
    pub activity: Activity,
    pub grid: GridConfig,
}

enum Deferred {
    Object(ObjectId),
    Value(Box<dyn Any + Send + Sync>),
}

/// State owned by one rank.
#[derive(Default)]
struct Local {
    objects: Mutex<HashMap<ObjectId, Promise<Arc<dyn RemoteObject>>>>,
    retired: RwLock<HashSet<ObjectId>>,
    mailbox: Mutex<HashMap<MessageKey, Promise<Payload>>>,
    deferred: Mutex<Vec<Deferred>>,
    next_object: AtomicUsize,
    next_collective: AtomicU64,
}

/// The handle of one rank.
#[derive(Clone)]
pub struct World {
    rank: Rank,
    fabric: Arc<Fabric>,
    local: Arc<Local>,
}

impl fmt::Debug for World {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("World")
            .field("rank", &self.rank)
            .field("size", &self.size())
            .finish()
    }
}

impl PartialEq for World {
    fn eq(&self, other: &Self) -> bool {
        self.rank == other.rank && Arc::ptr_eq(&self.fabric, &other.fabric)
    }
}

impl Eq for World {}

impl World {
    pub(super) fn new(rank: Rank, fabric: Arc<Fabric>) -> Self {
        let local = Default::default();
        Self {
            rank,
            fabric,
            local,
        }
    }

    #[inline]
    pub fn rank(&self) -> Rank {
        self.rank
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.fabric.senders.len()
    }

    #[inline]
    pub fn grid_config(&self) -> &GridConfig {
        &self.fabric.grid
    }

    /// Spawns a task tracked by [`World::fence`]. A panicking task aborts the job.
    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let fabric = self.fabric.clone();
        fabric.activity.start();
        platform::spawn(async move {
            let result = AssertUnwindSafe(future).catch_unwind().await;
            fabric.activity.finish();
            if result.is_err() {
                log::error!("task panicked, aborting the job");
                std::process::abort();
            }
        });
    }

    /// Allocates an object id without registering anything under it.
    #[inline]
    pub fn unique_id(&self) -> ObjectId {
        self.local.next_object.fetch_add(1, Ordering::Relaxed).into()
    }

    /// Registers an object under `id` so that remote ranks can fetch from it.
    pub fn register(
        &self,
        id: ObjectId,
        object: Arc<dyn RemoteObject>,
    ) -> Result<(), RuntimeError> {
        log::debug!("rank {} registers object {id}", self.rank);
        self.object(id)?.set(object)
    }

    /// The object registered under `id`, resolving once it is registered on this rank.
    ///
    /// Fails if the object has already been unregistered.
    pub fn object(&self, id: ObjectId) -> Result<Promise<Arc<dyn RemoteObject>>, RuntimeError> {
        // lock order: `objects` then `retired`
        let mut objects = self.local.objects.lock().expect("failed to lock");
        if self
            .local
            .retired
            .read()
            .expect("failed to lock")
            .contains(&id)
        {
            return Err(RuntimeError::UnknownObject(id));
        }
        Ok(objects.entry(id).or_default().clone())
    }

    /// Unregisters the object at the next fence.
    pub fn defer_unregister(&self, id: ObjectId) {
        self.local
            .deferred
            .lock()
            .expect("failed to lock")
            .push(Deferred::Object(id));
    }

    /// Keeps `value` alive until the next fence.
    pub fn defer_drop(&self, value: impl Any + Send + Sync) {
        self.local
            .deferred
            .lock()
            .expect("failed to lock")
            .push(Deferred::Value(Box::new(value)));
    }

    /// Releases everything deferred so far.
    pub(super) fn release_deferred(&self) {
        let deferred = std::mem::take(&mut *self.local.deferred.lock().expect("failed to lock"));
        log::debug!("rank {} releases {} deferred items", self.rank, deferred.len());
        for item in deferred {
            match item {
                Deferred::Object(id) => {
                    let mut objects = self.local.objects.lock().expect("failed to lock");
                    self.local
                        .retired
                        .write()
                        .expect("failed to lock")
                        .insert(id);
                    objects.remove(&id);
                }
                Deferred::Value(value) => drop(value),
            }
        }
    }

    pub(super) fn next_collective_tag(&self) -> u64 {
        self.local.next_collective.fetch_add(1, Ordering::Relaxed)
    }

    pub(super) fn activity(&self) -> &Activity {
        &self.fabric.activity
    }

    pub(super) fn barrier_handle(&self) -> &Barrier {
        &self.fabric.barrier
    }

    fn post(&self, dest: Rank, event: WorldEvent) {
        let Some(sender) = self.fabric.senders.get(dest) else {
            fatal(RuntimeError::Rank(dest, self.size()))
        };
        self.fabric.activity.start();
        if sender.send(event).is_err() {
            self.fabric.activity.finish();
            fatal(RuntimeError::Disconnected(dest))
        }
    }

    pub(super) fn shutdown(&self) {
        if let Some(sender) = self.fabric.senders.get(self.rank) {
            _ = sender.send(WorldEvent::Shutdown);
        }
    }

    fn mailbox(&self, key: MessageKey) -> Promise<Payload> {
        self.local
            .mailbox
            .lock()
            .expect("failed to lock")
            .entry(key)
            .or_default()
            .clone()
    }

    /// Sends `value` to `dest`, to be picked up by [`World::recv`] with the same key.
    pub fn send<V>(&self, dest: Rank, key: MessageKey, value: V)
    where
        V: Clone + Send + Sync + 'static,
    {
        log::trace!("rank {} sends {key} to {dest}", self.rank);
        let payload: Payload = Arc::new(value);
        self.post(dest, WorldEvent::Deliver { key, payload });
    }

    /// Waits for the message addressed by `key`.
    pub async fn recv<V>(&self, key: MessageKey) -> V
    where
        V: Clone + Send + Sync + 'static,
    {
        let payload = self.mailbox(key).get().await;
        self.local
            .mailbox
            .lock()
            .expect("failed to lock")
            .remove(&key);
        downcast(payload)
    }

    /// One-sided fetch of the value at `ordinal` of `object` on `owner`.
    pub fn fetch<V>(&self, owner: Rank, object: ObjectId, ordinal: usize) -> Promise<V>
    where
        V: Clone + Send + Sync + 'static,
    {
        let promise = Promise::new();
        let (sender, receiver) = flume::bounded(1);
        self.post(
            owner,
            WorldEvent::Fetch {
                object,
                ordinal,
                sender,
            },
        );

        let output = promise.clone();
        self.spawn(async move {
            let payload = match receiver.recv_async().await {
                Ok(Ok(payload)) => payload,
                Ok(Err(err)) => fatal(err),
                Err(_) => fatal(RuntimeError::Disconnected(owner)),
            };
            if let Err(err) = output.set(downcast(payload)) {
                fatal(err)
            }
        });
        promise
    }
}

fn downcast<V: Clone + 'static>(payload: Payload) -> V {
    match payload.downcast_ref::<V>() {
        Some(value) => value.clone(),
        None => fatal(RuntimeError::Payload(type_name::<V>())),
    }
}

/// Serves fetches and deliveries addressed to one rank.
pub(super) async fn serve(world: World, receiver: flume::Receiver<WorldEvent>) {
    while let Ok(event) = receiver.recv_async().await {
        match event {
            WorldEvent::Fetch {
                object,
                ordinal,
                sender,
            } => match world.object(object) {
                Ok(object) => world.spawn(async move {
                    let result = match object.get().await.fetch(ordinal) {
                        Ok(future) => Ok(future.await),
                        Err(err) => Err(err),
                    };
                    _ = sender.send_async(result).await;
                }),
                Err(err) => {
                    _ = sender.send_async(Err(err)).await;
                }
            },
            WorldEvent::Deliver { key, payload } => {
                if world.mailbox(key).set(payload).is_err() {
                    fatal(RuntimeError::Duplicate(key))
                }
            }
            WorldEvent::Shutdown => break,
        }
        world.activity().finish();
    }
}

#[cfg(test)]
mod tests {
    use std::{error::Error, sync::Arc};

    use futures::future::BoxFuture;

    use crate::runtime::{ClusterBuilder, Payload, RemoteObject, RuntimeError};

    struct Empty;

    impl RemoteObject for Empty {
        fn fetch(&self, _ordinal: usize) -> Result<BoxFuture<'static, Payload>, RuntimeError> {
            Err(RuntimeError::EmptyWorld)
        }
    }

    #[tokio::test]
    async fn test_retire_concurrent_lookup() -> Result<(), Box<dyn Error>> {
        let cluster = ClusterBuilder::new(1).build().await?;
        let world = cluster.world(0).ok_or("no rank 0")?.clone();

        for _ in 0..64 {
            let id = world.unique_id();
            world.register(id, Arc::new(Empty))?;
            world.defer_unregister(id);

            let lookups = (0..4)
                .map(|_| {
                    let world = world.clone();
                    std::thread::spawn(move || {
                        (0..16).for_each(|_| _ = world.object(id));
                    })
                })
                .collect::<Vec<_>>();
            world.release_deferred();
            for lookup in lookups {
                lookup.join().map_err(|_| "lookup thread panicked")?;
            }

            let objects = world.local.objects.lock().expect("failed to lock");
            assert!(!objects.contains_key(&id));
            drop(objects);
            assert!(matches!(world.object(id), Err(RuntimeError::UnknownObject(x)) if x == id));
        }
        Ok(())
    }
}
