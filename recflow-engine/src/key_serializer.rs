//! Per-key asynchronous mutual exclusion
//!
//! `KeySerializer` guarantees at most one running operation per key while
//! letting operations on different keys proceed in parallel.
//!
//! **Architecture:**
//! - One coarse `std::sync::Mutex` guards a map of key -> FIFO waiter queue.
//!   It is held only for queue bookkeeping, never while an operation runs.
//! - A key present in the map is held. Its queue lists the waiters, each
//!   parked on a oneshot receiver.
//! - Releasing hands the key directly to the next live waiter. When the
//!   queue is empty the map entry is removed, so quiescent keys cost nothing.
//!
//! Release runs from `Drop`, so a key is freed when the operation returns,
//! fails, panics or is cancelled. A waiter cancelled after the key was
//! handed to it passes the key on.

use std::collections::{HashMap, VecDeque};
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;
use tracing::trace;

type WaiterQueue = VecDeque<oneshot::Sender<()>>;

/// Mutual exclusion keyed by an arbitrary identifier
pub struct KeySerializer<K> {
    queues: Mutex<HashMap<K, WaiterQueue>>,
}

impl<K> Default for KeySerializer<K>
where
    K: Eq + Hash + Clone + Debug,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> KeySerializer<K>
where
    K: Eq + Hash + Clone + Debug,
{
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// Run `operation` once every earlier operation on `key` has finished
    ///
    /// The operation's output (including any error it returns) goes to
    /// this caller only; the next queued operation starts regardless.
    pub async fn run_exclusive<F, Fut, T>(&self, key: K, operation: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _guard = self.acquire(key).await;
        operation().await
    }

    /// Wait for exclusive ownership of `key`
    ///
    /// The key stays held until the returned guard is dropped.
    pub async fn acquire(&self, key: K) -> KeyGuard<'_, K> {
        loop {
            let rx = match self.enqueue(&key) {
                None => return KeyGuard { serializer: self, key },
                Some(rx) => rx,
            };

            trace!(key = ?key, "Key busy, queued");
            let mut turn = Turn {
                serializer: self,
                key: &key,
                rx,
                granted: false,
            };
            let granted = turn.wait().await;
            drop(turn);
            if granted {
                return KeyGuard { serializer: self, key };
            }
            // Sender vanished without a handoff; take a fresh place in line
        }
    }

    /// Number of keys currently held
    pub fn active_keys(&self) -> usize {
        self.lock_queues().len()
    }

    /// Number of operations waiting behind the holder of `key`
    pub fn queued(&self, key: &K) -> usize {
        self.lock_queues().get(key).map(VecDeque::len).unwrap_or(0)
    }

    /// True while some operation holds `key`
    pub fn is_held(&self, key: &K) -> bool {
        self.lock_queues().contains_key(key)
    }

    /// Claim the key if free (`None`), otherwise join its queue
    fn enqueue(&self, key: &K) -> Option<oneshot::Receiver<()>> {
        let mut queues = self.lock_queues();
        match queues.get_mut(key) {
            None => {
                queues.insert(key.clone(), VecDeque::new());
                None
            }
            Some(queue) => {
                let (tx, rx) = oneshot::channel();
                queue.push_back(tx);
                Some(rx)
            }
        }
    }

    /// Hand the key to the next live waiter, or drop the entry
    fn release(&self, key: &K) {
        let mut queues = self.lock_queues();
        if let Some(queue) = queues.get_mut(key) {
            while let Some(next) = queue.pop_front() {
                if next.send(()).is_ok() {
                    trace!(key = ?key, "Key handed to next waiter");
                    return;
                }
            }
        }
        queues.remove(key);
    }

    fn lock_queues(&self) -> MutexGuard<'_, HashMap<K, WaiterQueue>> {
        // Bookkeeping never panics mid-update, so a poisoned map is still consistent
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Exclusive ownership of one key; releases on drop
pub struct KeyGuard<'a, K>
where
    K: Eq + Hash + Clone + Debug,
{
    serializer: &'a KeySerializer<K>,
    key: K,
}

impl<K> KeyGuard<'_, K>
where
    K: Eq + Hash + Clone + Debug,
{
    pub fn key(&self) -> &K {
        &self.key
    }
}

impl<K> Drop for KeyGuard<'_, K>
where
    K: Eq + Hash + Clone + Debug,
{
    fn drop(&mut self) {
        self.serializer.release(&self.key);
    }
}

/// A queued waiter
struct Turn<'a, K>
where
    K: Eq + Hash + Clone + Debug,
{
    serializer: &'a KeySerializer<K>,
    key: &'a K,
    rx: oneshot::Receiver<()>,
    granted: bool,
}

impl<K> Turn<'_, K>
where
    K: Eq + Hash + Clone + Debug,
{
    /// True once the key was handed over
    async fn wait(&mut self) -> bool {
        self.granted = (&mut self.rx).await.is_ok();
        self.granted
    }
}

impl<K> Drop for Turn<'_, K>
where
    K: Eq + Hash + Clone + Debug,
{
    fn drop(&mut self) {
        if self.granted {
            return;
        }
        // Closing first makes any later handoff fail, so the releaser moves on.
        // A handoff that already landed must be passed along.
        self.rx.close();
        if self.rx.try_recv().is_ok() {
            self.serializer.release(self.key);
        }
    }
}
