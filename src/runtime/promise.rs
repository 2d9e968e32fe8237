use std::sync::Arc;

use tokio::sync::watch;

use super::RuntimeError;

/// A set-once cell whose value can be awaited by any number of readers.
///
/// Clones share the same cell.
#[derive(Debug)]
pub struct Promise<T> {
    cell: Arc<watch::Sender<Option<T>>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
        }
    }
}

impl<T: Clone + Send + Sync> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync> Promise<T> {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(None);
        let cell = Arc::new(sender);
        Self { cell }
    }

    /// Creates a promise that is already fulfilled.
    pub fn ready(value: T) -> Self {
        let (sender, _) = watch::channel(Some(value));
        let cell = Arc::new(sender);
        Self { cell }
    }

    /// Fulfills the promise. Fails if a value has been set before.
    pub fn set(&self, value: T) -> Result<(), RuntimeError> {
        let mut value = Some(value);
        let set = self.cell.send_if_modified(|slot| match slot {
            Some(_) => false,
            None => {
                *slot = value.take();
                true
            }
        });
        match set {
            true => Ok(()),
            false => Err(RuntimeError::AlreadySet),
        }
    }

    #[inline]
    pub fn is_ready(&self) -> bool {
        self.cell.borrow().is_some()
    }

    /// Returns the value if it is ready.
    #[inline]
    pub fn try_get(&self) -> Option<T> {
        self.cell.borrow().clone()
    }

    /// Waits for the value.
    pub async fn get(&self) -> T {
        let mut receiver = self.cell.subscribe();
        // the sender lives in `self`, so the channel cannot close while waiting
        let value = match receiver.wait_for(Option::is_some).await {
            Ok(value) => value.clone(),
            Err(_) => unreachable!(),
        };
        match value {
            Some(value) => value,
            None => unreachable!(),
        }
    }

    /// Blocks the current thread until the value is ready.
    ///
    /// Must not be called on an async worker thread unless the promise is ready.
    pub fn wait(&self) -> T {
        futures::executor::block_on(self.get())
    }

    /// Returns `true` if both handles refer to the same cell.
    #[inline]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }
}
