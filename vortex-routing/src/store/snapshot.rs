//! Immutable, indexed views of the routing registry.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Read access to a set of keyed routing entries.
pub trait ObjectStore<T> {
    /// The entry stored under `key`.
    fn get(&self, key: &str) -> Option<T>;

    /// All entries, ordered by key.
    fn entry_set(&self) -> Vec<(String, T)>;

    /// Version of the view. Grows by one with every accepted mutation.
    fn index(&self) -> u64;
}

/// One version of the registry contents.
///
/// Never mutated once built: a new version is derived with [`map`](Self::map).
pub struct IndexedSnapshot<T> {
    index: u64,
    entries: Arc<BTreeMap<String, T>>,
}

impl<T> IndexedSnapshot<T> {
    /// The empty snapshot at index 0.
    pub fn empty() -> Self {
        Self::new(0, BTreeMap::new())
    }

    /// A snapshot of `entries` at `index`.
    pub fn new(index: u64, entries: BTreeMap<String, T>) -> Self {
        Self {
            index,
            entries: Arc::new(entries),
        }
    }

    /// The version of this snapshot.
    pub fn index(&self) -> u64 {
        self.index
    }

    /// The entries of this snapshot.
    pub fn entries(&self) -> &BTreeMap<String, T> {
        &self.entries
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the snapshot holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The next version, holding `entries`.
    pub fn map(&self, entries: BTreeMap<String, T>) -> Self {
        Self::new(self.index + 1, entries)
    }
}

impl<T> Clone for IndexedSnapshot<T> {
    fn clone(&self) -> Self {
        Self {
            index: self.index,
            entries: Arc::clone(&self.entries),
        }
    }
}

impl<T: Clone> ObjectStore<T> for IndexedSnapshot<T> {
    fn get(&self, key: &str) -> Option<T> {
        self.entries.get(key).cloned()
    }

    fn entry_set(&self) -> Vec<(String, T)> {
        self.entries
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    fn index(&self) -> u64 {
        self.index
    }
}

impl<T: fmt::Debug> fmt::Debug for IndexedSnapshot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexedSnapshot")
            .field("index", &self.index)
            .field("entries", &self.entries)
            .finish()
    }
}
