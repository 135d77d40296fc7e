//! Coalescing change notifications for registry watchers.
//!
//! Registry writers publish every new snapshot here. Bursts of publishes collapse
//! into a single dispatch that delivers whatever snapshot is newest at the time it
//! runs, so a slow watcher never has to work through intermediate states. A watcher
//! is only guaranteed to see the final state once mutations stop.
//!
//! Invariants, all maintained under one short lock:
//! - the pending snapshot index only ever grows;
//! - a dispatch is scheduled only while pending is newer than the last issued snapshot;
//! - the scheduling flag is cleared before watchers run, so a publish that races a
//!   running dispatch schedules a fresh one instead of being lost.

use std::cell::Cell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::{Mutex, ReentrantMutex};
use tokio::runtime::Handle;
use tracing::{error, trace};

use crate::store::snapshot::IndexedSnapshot;

/// What a keyed dispatch listener is told after each delivery.
#[derive(Debug, Clone)]
pub enum DispatchNotification<T> {
    /// Watchers were handed a new snapshot.
    Change {
        /// The snapshot that was delivered.
        snapshot: IndexedSnapshot<T>,
        /// Whether another dispatch was already scheduled when this one finished.
        pending_notifications: bool,
    },
    /// A new watcher was handed its initial snapshot.
    InitialWatch {
        /// The snapshot that was delivered.
        snapshot: IndexedSnapshot<T>,
        /// Whether a dispatch was scheduled when the initial snapshot went out.
        pending_notifications: bool,
    },
}

impl<T> DispatchNotification<T> {
    /// The delivered snapshot.
    pub fn snapshot(&self) -> &IndexedSnapshot<T> {
        match self {
            Self::Change { snapshot, .. } | Self::InitialWatch { snapshot, .. } => snapshot,
        }
    }

    /// Whether more notifications are on their way. `false` means settled.
    pub fn pending_notifications(&self) -> bool {
        match self {
            Self::Change {
                pending_notifications,
                ..
            }
            | Self::InitialWatch {
                pending_notifications,
                ..
            } => *pending_notifications,
        }
    }
}

/// Callback registered under a key with [`NotificationQueue::add_dispatch_listener`].
pub type DispatchListener<T> = Arc<dyn Fn(&DispatchNotification<T>) + Send + Sync>;

type WatchCallback<T> = Box<dyn Fn(&IndexedSnapshot<T>) + Send + Sync>;

struct DispatchState<T> {
    pending: IndexedSnapshot<T>,
    issued: IndexedSnapshot<T>,
    scheduled: bool,
}

struct Watcher<T> {
    callback: WatchCallback<T>,
    last_delivered: ReentrantMutex<Cell<Option<u64>>>,
    detached: AtomicBool,
}

impl<T> Watcher<T> {
    /// Hands `snapshot` to the watcher unless it has already seen a newer one.
    ///
    /// Holding the lock across the callback keeps deliveries to one watcher serial
    /// even when dispatches overlap. The lock is reentrant so a callback may drop
    /// its own subscription.
    fn deliver(&self, snapshot: &IndexedSnapshot<T>) {
        let last = self.last_delivered.lock();
        if self.is_detached() || last.get().is_some_and(|index| snapshot.index() <= index) {
            return;
        }
        last.set(Some(snapshot.index()));

        if catch_unwind(AssertUnwindSafe(|| (self.callback)(snapshot))).is_err() {
            error!(index = snapshot.index(), "registry watcher panicked");
        }
    }

    fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }
}

struct QueueInner<T> {
    state: Mutex<DispatchState<T>>,
    watchers: DashMap<u64, Arc<Watcher<T>>>,
    next_watcher: AtomicU64,
    listeners: DashMap<String, DispatchListener<T>>,
}

impl<T> QueueInner<T> {
    fn dispatch(&self) {
        let issued = {
            let mut state = self.state.lock();
            state.scheduled = false;
            state.issued = state.pending.clone();
            state.issued.clone()
        };
        trace!(index = issued.index(), "dispatching registry snapshot");

        for watcher in self.current_watchers() {
            watcher.deliver(&issued);
        }

        let pending_notifications = self.state.lock().scheduled;
        self.notify_listeners(&DispatchNotification::Change {
            snapshot: issued,
            pending_notifications,
        });
    }

    fn initial_watch(&self, watcher: &Watcher<T>) {
        if watcher.is_detached() {
            return;
        }
        let (issued, pending_notifications) = {
            let state = self.state.lock();
            (state.issued.clone(), state.scheduled)
        };

        watcher.deliver(&issued);

        self.notify_listeners(&DispatchNotification::InitialWatch {
            snapshot: issued,
            pending_notifications,
        });
    }

    /// Copies the watcher set so callbacks may subscribe or unsubscribe freely.
    fn current_watchers(&self) -> Vec<Arc<Watcher<T>>> {
        self.watchers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    fn notify_listeners(&self, notification: &DispatchNotification<T>) {
        let listeners: Vec<(String, DispatchListener<T>)> = self
            .listeners
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();

        for (key, listener) in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(notification))).is_err() {
                error!(listener = %key, "dispatch listener panicked");
            }
        }
    }
}

/// Delivers registry snapshots to watchers and keyed listeners.
///
/// Delivery runs on the executor handed to [`NotificationQueue::new`].
pub struct NotificationQueue<T> {
    inner: Arc<QueueInner<T>>,
    executor: Handle,
}

impl<T: Send + Sync + 'static> NotificationQueue<T> {
    /// Create a queue that dispatches on `executor`.
    pub fn new(executor: Handle) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                state: Mutex::new(DispatchState {
                    pending: IndexedSnapshot::empty(),
                    issued: IndexedSnapshot::empty(),
                    scheduled: false,
                }),
                watchers: DashMap::new(),
                next_watcher: AtomicU64::new(0),
                listeners: DashMap::new(),
            }),
            executor,
        }
    }

    /// Offer a new snapshot. Snapshots no newer than the pending one are ignored.
    pub fn publish_change(&self, snapshot: IndexedSnapshot<T>) {
        let already_scheduled = {
            let mut state = self.inner.state.lock();
            if snapshot.index() <= state.pending.index() {
                trace!(
                    index = snapshot.index(),
                    pending = state.pending.index(),
                    "ignoring stale snapshot"
                );
                return;
            }
            state.pending = snapshot;
            std::mem::replace(&mut state.scheduled, true)
        };

        if !already_scheduled {
            let inner = Arc::clone(&self.inner);
            self.executor.spawn(async move { inner.dispatch() });
        }
    }

    /// Register a watcher. It first receives the latest issued snapshot, then every
    /// dispatch, never going backwards in index. Dropping the returned
    /// [`Subscription`] detaches it.
    pub fn subscribe<F>(&self, callback: F) -> Subscription<T>
    where
        F: Fn(&IndexedSnapshot<T>) + Send + Sync + 'static,
    {
        let id = self.inner.next_watcher.fetch_add(1, Ordering::Relaxed);
        let watcher = Arc::new(Watcher {
            callback: Box::new(callback),
            last_delivered: ReentrantMutex::new(Cell::new(None)),
            detached: AtomicBool::new(false),
        });
        self.inner.watchers.insert(id, Arc::clone(&watcher));

        let inner = Arc::clone(&self.inner);
        let initial = Arc::clone(&watcher);
        self.executor
            .spawn(async move { inner.initial_watch(&initial) });

        Subscription {
            id,
            watcher,
            queue: Arc::downgrade(&self.inner),
        }
    }

    /// Register `listener` under `key`, replacing any listener with the same key.
    pub fn add_dispatch_listener<F>(&self, key: impl Into<String>, listener: F)
    where
        F: Fn(&DispatchNotification<T>) + Send + Sync + 'static,
    {
        self.inner.listeners.insert(key.into(), Arc::new(listener));
    }

    /// Remove the listener registered under `key`.
    pub fn remove_dispatch_listener(&self, key: &str) {
        self.inner.listeners.remove(key);
    }

    /// Number of attached watchers.
    pub fn watchers(&self) -> usize {
        self.inner.watchers.len()
    }

    /// Index of the most recently dispatched snapshot.
    pub fn issued_index(&self) -> u64 {
        self.inner.state.lock().issued.index()
    }
}

/// A watcher's attachment to a [`NotificationQueue`].
///
/// Dropping it detaches the watcher; no callback starts after the drop returns.
/// A callback already running when the drop happens runs to completion.
pub struct Subscription<T> {
    id: u64,
    watcher: Arc<Watcher<T>>,
    queue: Weak<QueueInner<T>>,
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.watcher.detached.store(true, Ordering::Release);
        // Waits out a callback running on another thread.
        drop(self.watcher.last_delivered.lock());
        if let Some(queue) = self.queue.upgrade() {
            queue.watchers.remove(&self.id);
        }
    }
}

impl<T> std::fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn snapshot(index: u64) -> IndexedSnapshot<u64> {
        let mut entries = BTreeMap::new();
        entries.insert("key".to_string(), index);
        IndexedSnapshot::new(index, entries)
    }

    async fn eventually<F: Fn() -> bool>(condition: F) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not met in time");
    }

    fn recording_watcher(queue: &NotificationQueue<u64>) -> (Subscription<u64>, Arc<Mutex<Vec<u64>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let subscription = queue.subscribe(move |snapshot| sink.lock().push(snapshot.index()));
        (subscription, seen)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn new_watcher_receives_issued_snapshot() {
        let queue = NotificationQueue::new(Handle::current());
        let (_subscription, seen) = recording_watcher(&queue);

        eventually(|| *seen.lock() == vec![0]).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stale_snapshots_are_dropped() {
        let queue = NotificationQueue::new(Handle::current());
        let (_subscription, seen) = recording_watcher(&queue);
        eventually(|| seen.lock().len() == 1).await;

        queue.publish_change(snapshot(3));
        queue.publish_change(snapshot(2));
        queue.publish_change(snapshot(3));

        eventually(|| seen.lock().last() == Some(&3)).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!seen.lock().contains(&2));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn bursts_converge_monotonically() {
        let queue = NotificationQueue::new(Handle::current());
        let (_first, seen_a) = recording_watcher(&queue);
        let (_second, seen_b) = recording_watcher(&queue);

        for index in 1..=500 {
            queue.publish_change(snapshot(index));
        }

        eventually(|| seen_a.lock().last() == Some(&500) && seen_b.lock().last() == Some(&500)).await;
        for seen in [seen_a, seen_b] {
            let seen = seen.lock();
            assert!(seen.windows(2).all(|w| w[0] < w[1]), "out of order: {seen:?}");
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn panicking_watcher_does_not_block_others() {
        let queue = NotificationQueue::new(Handle::current());
        let _faulty = queue.subscribe(|snapshot: &IndexedSnapshot<u64>| {
            if snapshot.index() > 0 {
                panic!("watcher failure");
            }
        });
        let (_healthy, seen) = recording_watcher(&queue);
        eventually(|| seen.lock().len() == 1).await;

        queue.publish_change(snapshot(1));
        eventually(|| seen.lock().last() == Some(&1)).await;

        queue.publish_change(snapshot(2));
        eventually(|| seen.lock().last() == Some(&2)).await;
        assert_eq!(queue.issued_index(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dropping_subscription_detaches_watcher() {
        let queue = NotificationQueue::new(Handle::current());
        let (subscription, seen) = recording_watcher(&queue);
        eventually(|| seen.lock().len() == 1).await;
        assert_eq!(queue.watchers(), 1);

        drop(subscription);
        assert_eq!(queue.watchers(), 0);

        queue.publish_change(snapshot(1));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(*seen.lock(), vec![0]);
    }

    #[tokio::test]
    async fn subscription_dropped_before_initial_delivery_hears_nothing() {
        let queue = NotificationQueue::new(Handle::current());
        let (subscription, seen) = recording_watcher(&queue);

        drop(subscription);
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        assert!(seen.lock().is_empty());
    }

    #[tokio::test]
    async fn watchers_detached_during_dispatch_are_skipped() {
        let queue = NotificationQueue::new(Handle::current());
        let subscriptions: Arc<Mutex<Vec<Subscription<u64>>>> = Arc::new(Mutex::new(Vec::new()));
        let delivered = Arc::new(AtomicU64::new(0));

        for _ in 0..5 {
            let registry = Arc::clone(&subscriptions);
            let delivered = Arc::clone(&delivered);
            let subscription = queue.subscribe(move |snapshot: &IndexedSnapshot<u64>| {
                if snapshot.index() == 1 {
                    delivered.fetch_add(1, Ordering::SeqCst);
                    let all = std::mem::take(&mut *registry.lock());
                    drop(all);
                }
            });
            subscriptions.lock().push(subscription);
        }
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        queue.publish_change(snapshot(1));
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        assert_eq!(delivered.load(Ordering::SeqCst), 1);
        assert_eq!(queue.watchers(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn listeners_learn_when_dispatch_has_settled() {
        let queue = NotificationQueue::new(Handle::current());
        let settled = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&settled);
        queue.add_dispatch_listener("reload", move |notification: &DispatchNotification<u64>| {
            if let DispatchNotification::Change { .. } = notification {
                if !notification.pending_notifications() {
                    sink.lock().push(notification.snapshot().index());
                }
            }
        });

        for index in 1..=50 {
            queue.publish_change(snapshot(index));
        }
        eventually(|| settled.lock().last() == Some(&50)).await;

        queue.remove_dispatch_listener("reload");
        queue.publish_change(snapshot(51));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(settled.lock().last(), Some(&50));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn listeners_see_initial_watch() {
        let queue = NotificationQueue::new(Handle::current());
        let initial = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&initial);
        queue.add_dispatch_listener("test", move |notification: &DispatchNotification<u64>| {
            if matches!(notification, DispatchNotification::InitialWatch { .. }) {
                *sink.lock() += 1;
            }
        });

        let (_subscription, _seen) = recording_watcher(&queue);

        eventually(|| *initial.lock() == 1).await;
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        /// Whatever order snapshots are offered in, every watcher ends on the newest
        /// one and never sees an index twice or out of order.
        #[test]
        fn any_publish_order_converges_monotonically(
            publishers in proptest::collection::vec(proptest::collection::vec(1u64..64, 0..30), 1..4)
        ) {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(2)
                .enable_all()
                .build()
                .unwrap();
            let queue = NotificationQueue::new(runtime.handle().clone());
            let (_first, seen_a) = recording_watcher(&queue);
            let (_second, seen_b) = recording_watcher(&queue);

            std::thread::scope(|scope| {
                for indices in &publishers {
                    let queue = &queue;
                    scope.spawn(move || {
                        for index in indices {
                            queue.publish_change(snapshot(*index));
                        }
                    });
                }
            });

            let newest = publishers.iter().flatten().copied().max().unwrap_or(0);
            runtime.block_on(async {
                for _ in 0..400 {
                    if seen_a.lock().last() == Some(&newest) && seen_b.lock().last() == Some(&newest) {
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
            });

            prop_assert_eq!(queue.issued_index(), newest);
            for seen in [&seen_a, &seen_b] {
                let seen = seen.lock().clone();
                prop_assert_eq!(seen.last().copied(), Some(newest));
                prop_assert!(seen.windows(2).all(|w| w[0] < w[1]), "out of order: {:?}", seen);
                prop_assert!(seen.iter().all(|index| *index == 0 || publishers.iter().flatten().any(|p| p == index)));
            }
        }
    }
}
