use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::data::filter::Selection;
use crate::data::model::DatasetBundle;
use crate::error::{ScopeError, ScopeResult};

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

macro_rules! opaque_key {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// A fresh random key. Keys are never reused.
            fn generate() -> Self {
                $name(Uuid::new_v4().simple().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(raw: &str) -> Self {
                $name(raw.to_string())
            }
        }
    };
}

opaque_key!(
    /// Handle for a bundle held by a [`DatasetRegistry`].
    DatasetKey
);
opaque_key!(
    /// Handle for a selection held by a [`SelectionRegistry`].
    SelectionKey
);

// ---------------------------------------------------------------------------
// Bounded map with least-recently-used eviction
// ---------------------------------------------------------------------------

struct Slot<T> {
    value: T,
    last_used: u64,
}

struct LruMap<K, T> {
    capacity: Option<NonZeroUsize>,
    entries: HashMap<K, Slot<T>>,
    tick: u64,
}

impl<K: Eq + Hash + Clone, T> LruMap<K, T> {
    fn new(capacity: Option<NonZeroUsize>) -> Self {
        LruMap {
            capacity,
            entries: HashMap::new(),
            tick: 0,
        }
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// Insert, evicting least-recently-used entries first so the map stays
    /// within capacity. Returns the evicted keys.
    fn insert(&mut self, key: K, value: T) -> Vec<K> {
        let mut evicted = Vec::new();
        if let Some(capacity) = self.capacity {
            while self.entries.len() >= capacity.get() {
                let Some(victim) = self
                    .entries
                    .iter()
                    .min_by_key(|(_, slot)| slot.last_used)
                    .map(|(k, _)| k.clone())
                else {
                    break;
                };
                self.entries.remove(&victim);
                evicted.push(victim);
            }
        }
        let last_used = self.next_tick();
        self.entries.insert(key, Slot { value, last_used });
        evicted
    }

    fn get(&mut self, key: &K) -> Option<&T> {
        let tick = self.next_tick();
        let slot = self.entries.get_mut(key)?;
        slot.last_used = tick;
        Some(&slot.value)
    }

    fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    fn retain(&mut self, mut keep: impl FnMut(&T) -> bool) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, slot| keep(&slot.value));
        before - self.entries.len()
    }

    fn clear(&mut self) {
        self.entries.clear();
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

// ---------------------------------------------------------------------------
// Dataset registry
// ---------------------------------------------------------------------------

/// Loaded bundles under opaque keys.
///
/// With the default capacity of one, every `put` evicts whatever was there
/// before: the expression matrix dominates memory, so only one dataset is
/// kept alive.
pub struct DatasetRegistry {
    bundles: LruMap<DatasetKey, Arc<DatasetBundle>>,
}

impl Default for DatasetRegistry {
    fn default() -> Self {
        DatasetRegistry::new(NonZeroUsize::MIN)
    }
}

impl DatasetRegistry {
    pub fn new(capacity: NonZeroUsize) -> Self {
        DatasetRegistry {
            bundles: LruMap::new(Some(capacity)),
        }
    }

    pub fn put(&mut self, bundle: DatasetBundle) -> DatasetKey {
        self.insert(bundle).0
    }

    /// Store a bundle and report which keys had to make room for it.
    pub fn insert(&mut self, bundle: DatasetBundle) -> (DatasetKey, Vec<DatasetKey>) {
        let key = DatasetKey::generate();
        let evicted = self.bundles.insert(key.clone(), Arc::new(bundle));
        for old in &evicted {
            log::info!("evicted dataset {old}");
        }
        (key, evicted)
    }

    pub fn get(&mut self, key: &DatasetKey) -> ScopeResult<Arc<DatasetBundle>> {
        self.bundles
            .get(key)
            .cloned()
            .ok_or_else(|| ScopeError::dataset_not_found(key))
    }

    pub fn contains(&self, key: &DatasetKey) -> bool {
        self.bundles.contains(key)
    }

    pub fn clear(&mut self) {
        self.bundles.clear();
    }

    pub fn len(&self) -> usize {
        self.bundles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// Selection registry
// ---------------------------------------------------------------------------

/// A stored selection and the dataset it was computed against.
#[derive(Debug, Clone)]
pub struct SelectionEntry {
    pub dataset: DatasetKey,
    pub selection: Arc<Selection>,
}

/// Computed selections under opaque keys.
///
/// `put` never evicts other entries unless a size cap is set; callers bound
/// growth by purging the selections of evicted datasets.
pub struct SelectionRegistry {
    selections: LruMap<SelectionKey, SelectionEntry>,
}

impl Default for SelectionRegistry {
    fn default() -> Self {
        SelectionRegistry::new(None)
    }
}

impl SelectionRegistry {
    pub fn new(capacity: Option<NonZeroUsize>) -> Self {
        SelectionRegistry {
            selections: LruMap::new(capacity),
        }
    }

    pub fn put(&mut self, dataset: DatasetKey, selection: Selection) -> SelectionKey {
        let key = SelectionKey::generate();
        let evicted = self.selections.insert(
            key.clone(),
            SelectionEntry {
                dataset,
                selection: Arc::new(selection),
            },
        );
        if !evicted.is_empty() {
            log::debug!("selection cap reached, dropped {} entries", evicted.len());
        }
        key
    }

    pub fn get(&mut self, key: &SelectionKey) -> ScopeResult<SelectionEntry> {
        self.selections
            .get(key)
            .cloned()
            .ok_or_else(|| ScopeError::selection_not_found(key))
    }

    /// Drop every selection computed against `dataset`.
    pub fn purge_dataset(&mut self, dataset: &DatasetKey) -> usize {
        self.selections.retain(|entry| &entry.dataset != dataset)
    }

    pub fn clear(&mut self) {
        self.selections.clear();
    }

    pub fn len(&self) -> usize {
        self.selections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
