//! The versioned routing registry.

use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use arc_swap::ArcSwap;
use futures::Stream;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

use crate::store::notification::{DispatchNotification, NotificationQueue, Subscription};
use crate::store::snapshot::{IndexedSnapshot, ObjectStore};

/// A concurrent, copy-on-write key/value registry with versioned snapshots.
///
/// Readers load the current snapshot through an [`ArcSwap`] and never block. Writers
/// derive a new map from the snapshot they loaded and publish it with a
/// compare-and-swap, retrying against the newer snapshot if another writer got
/// there first. Every accepted mutation bumps the index by one and is handed to the
/// notification queue.
pub struct RoutingStore<T> {
    current: ArcSwap<IndexedSnapshot<T>>,
    notifications: NotificationQueue<T>,
}

impl<T: Clone + Send + Sync + 'static> RoutingStore<T> {
    /// Create an empty store that dispatches notifications on the current runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn new() -> Self {
        Self::with_executor(Handle::current())
    }

    /// Create an empty store that dispatches notifications on `executor`.
    pub fn with_executor(executor: Handle) -> Self {
        Self {
            current: ArcSwap::from_pointee(IndexedSnapshot::empty()),
            notifications: NotificationQueue::new(executor),
        }
    }

    /// Store `payload` under `key`, returning the value it replaced.
    pub fn insert(&self, key: impl Into<String>, payload: T) -> Option<T> {
        let key = key.into();
        let (snapshot, previous) = self.update(|entries| {
            let mut next = entries.clone();
            let previous = next.insert(key.clone(), payload.clone());
            Some((next, previous))
        })?;
        debug!(key = %key, index = snapshot.index(), "registry entry stored");
        previous
    }

    /// Remove the entry under `key`. Removing an absent key changes nothing.
    pub fn remove(&self, key: &str) -> Option<T> {
        let (snapshot, removed) = self.update(|entries| {
            if !entries.contains_key(key) {
                return None;
            }
            let mut next = entries.clone();
            let removed = next.remove(key);
            Some((next, removed))
        })?;
        debug!(key = %key, index = snapshot.index(), "registry entry removed");
        removed
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> IndexedSnapshot<T> {
        IndexedSnapshot::clone(&self.current.load())
    }

    /// Stream of snapshots, starting with the latest dispatched one.
    ///
    /// Intermediate versions may be skipped but the stream always catches up with the
    /// final state once writes stop. Dropping the stream detaches it.
    pub fn watch(&self) -> Watch<T> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let subscription = self.notifications.subscribe(move |snapshot| {
            let _ = sender.send(snapshot.clone());
        });
        Watch {
            snapshots: UnboundedReceiverStream::new(receiver),
            _subscription: subscription,
        }
    }

    /// Register a callback watcher. Same delivery rules as [`watch`](Self::watch).
    pub fn subscribe<F>(&self, callback: F) -> Subscription<T>
    where
        F: Fn(&IndexedSnapshot<T>) + Send + Sync + 'static,
    {
        self.notifications.subscribe(callback)
    }

    /// Number of attached watchers.
    pub fn watchers(&self) -> usize {
        self.notifications.watchers()
    }

    /// Register a keyed listener told about every dispatch.
    pub fn add_dispatch_listener<F>(&self, key: impl Into<String>, listener: F)
    where
        F: Fn(&DispatchNotification<T>) + Send + Sync + 'static,
    {
        self.notifications.add_dispatch_listener(key, listener);
    }

    /// Remove the keyed listener registered under `key`.
    pub fn remove_dispatch_listener(&self, key: &str) {
        self.notifications.remove_dispatch_listener(key);
    }

    /// Optimistic update loop. `derive` returns `None` to leave the store untouched.
    fn update<R, F>(&self, mut derive: F) -> Option<(IndexedSnapshot<T>, R)>
    where
        F: FnMut(&BTreeMap<String, T>) -> Option<(BTreeMap<String, T>, R)>,
    {
        let mut current = self.current.load_full();
        loop {
            let (entries, result) = derive(current.entries())?;
            let next = Arc::new(current.map(entries));

            let previous = self.current.compare_and_swap(&current, Arc::clone(&next));
            if Arc::ptr_eq(&previous, &current) {
                let snapshot = IndexedSnapshot::clone(&next);
                self.notifications.publish_change(snapshot.clone());
                return Some((snapshot, result));
            }
            current = arc_swap::Guard::into_inner(previous);
        }
    }
}

impl<T: Clone + Send + Sync + 'static> ObjectStore<T> for RoutingStore<T> {
    fn get(&self, key: &str) -> Option<T> {
        self.current.load().entries().get(key).cloned()
    }

    fn entry_set(&self) -> Vec<(String, T)> {
        self.current.load().entry_set()
    }

    fn index(&self) -> u64 {
        self.current.load().index()
    }
}

impl<T> std::fmt::Debug for RoutingStore<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let current = self.current.load();
        f.debug_struct("RoutingStore")
            .field("index", &current.index())
            .field("entries", &current.len())
            .finish()
    }
}

/// A stream of registry snapshots. See [`RoutingStore::watch`].
pub struct Watch<T> {
    snapshots: UnboundedReceiverStream<IndexedSnapshot<T>>,
    _subscription: Subscription<T>,
}

impl<T> Stream for Watch<T> {
    type Item = IndexedSnapshot<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.snapshots).poll_next(cx)
    }
}
