//! Per-key serialization of asynchronous operations.

use std::{
    collections::HashMap,
    fmt::{self, Debug, Formatter},
    future::Future,
    hash::Hash,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use futures::{
    channel::{mpsc, oneshot},
    future::{BoxFuture, FutureExt, Shared},
    stream::{FuturesUnordered, StreamExt},
};
use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::error::{Error, Result};

type Tail = Shared<BoxFuture<'static, ()>>;

struct Entry {
    generation: u64,
    tail: Tail,
}

struct Tails<Key> {
    entries: HashMap<Key, Entry>,
    next_generation: u64,
}

/// Chains operations that share a key, so that each one starts only after
/// the previous one on the same key has finished.
///
/// The order is fixed when [`run`](KeyLocks::run) is called. Operations are
/// executed by the [`LockDriver`], not by their callers: once called, an
/// operation runs to completion even if the returned future is dropped.
/// Operations on different keys are independent.
///
/// An entry lives in the map only while its operation is the newest one for
/// the key; it removes itself as soon as it settles.
pub struct KeyLocks<Key> {
    tails: Arc<Mutex<Tails<Key>>>,
    spawn: mpsc::UnboundedSender<Tail>,
}

impl<Key> KeyLocks<Key>
where
    Key: Hash + Eq + Clone + Send + 'static,
{
    /// Create an empty lock map and the driver that runs its operations.
    pub fn new() -> (Self, LockDriver) {
        let (spawn, incoming) = mpsc::unbounded();

        let locks = Self {
            tails: Arc::new(Mutex::new(Tails {
                entries: HashMap::new(),
                next_generation: 0,
            })),
            spawn,
        };

        let driver = LockDriver {
            incoming,
            incoming_closed: false,
            running: FuturesUnordered::new(),
        };

        (locks, driver)
    }

    /// Queue `operation` behind every earlier operation on `key`. The
    /// returned future only reports the outcome.
    pub fn run<T, Fut>(&self, key: Key, operation: Fut) -> BoxFuture<'static, Result<T>>
    where
        T: Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let (sender, receiver) = oneshot::channel();
        let mut tails = self.tails.lock();

        let generation = tails.next_generation;
        tails.next_generation = tails.next_generation.wrapping_add(1);

        let previous = tails.entries.get(&key).map(|entry| entry.tail.clone());
        let release = Arc::downgrade(&self.tails);
        let release_key = key.clone();

        let tail = async move {
            if let Some(previous) = previous {
                previous.await;
            }

            let _ = sender.send(operation.await);

            if let Some(tails) = release.upgrade() {
                release_entry(&mut tails.lock(), &release_key, generation);
            }
        }
        .boxed()
        .shared();

        if self.spawn.unbounded_send(tail.clone()).is_err() {
            // Without a driver the operation can never run; dropping it
            // cancels the outcome, which the caller sees as an error.
            warn!("lock driver is gone; dropping keyed operation");
        } else {
            tails.entries.insert(key, Entry { generation, tail });
        }
        drop(tails);

        async move {
            match receiver.await {
                Ok(outcome) => outcome,
                Err(oneshot::Canceled) => Err(Error::Protocol(
                    "keyed operation finished without an outcome".into(),
                )),
            }
        }
        .boxed()
    }

    /// Number of keys with an operation still pending.
    pub fn len(&self) -> usize {
        self.tails.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn release_entry<Key: Hash + Eq>(tails: &mut Tails<Key>, key: &Key, generation: u64) {
    if let Some(entry) = tails.entries.get(key) {
        if entry.generation == generation {
            tails.entries.remove(key);
        }
    }
}

impl<Key> Clone for KeyLocks<Key> {
    fn clone(&self) -> Self {
        Self {
            tails: Arc::clone(&self.tails),
            spawn: self.spawn.clone(),
        }
    }
}

impl<Key: Debug> Debug for KeyLocks<Key> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_set()
            .entries(self.tails.lock().entries.keys())
            .finish()
    }
}

/// The future that runs every operation queued on a [`KeyLocks`]. It
/// completes once every handle to the locks has been dropped and every
/// queued operation has settled.
#[must_use = "keyed operations only run while the driver is polled"]
pub struct LockDriver {
    incoming: mpsc::UnboundedReceiver<Tail>,
    incoming_closed: bool,
    running: FuturesUnordered<Tail>,
}

impl Future for LockDriver {
    type Output = ();

    fn poll(self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<()> {
        let unpinned = Pin::into_inner(self);

        while !unpinned.incoming_closed {
            match unpinned.incoming.poll_next_unpin(ctx) {
                Poll::Ready(Some(tail)) => unpinned.running.push(tail),
                Poll::Ready(None) => unpinned.incoming_closed = true,
                Poll::Pending => break,
            }
        }

        while let Poll::Ready(Some(())) = unpinned.running.poll_next_unpin(ctx) {
            trace!(running = unpinned.running.len(), "keyed operation settled");
        }

        if unpinned.incoming_closed && unpinned.running.is_empty() {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }
}

impl Debug for LockDriver {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockDriver")
            .field("running", &self.running.len())
            .field("closed", &self.incoming_closed)
            .finish()
    }
}
