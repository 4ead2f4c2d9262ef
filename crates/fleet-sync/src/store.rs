//! Versioned store -- a keyed, revisioned domain that syncs itself.

use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::{SyncDataHandler, SyncError};

/// An entry with a stable key and a revision that grows on every change.
pub trait Versioned {
    fn key(&self) -> String;
    fn revision(&self) -> u64;
}

struct StoreInner<V> {
    entries: BTreeMap<String, V>,
    /// Bumped on every change.
    generation: u64,
    /// Generation last prepared for each receiver.
    prepared: HashMap<String, u64>,
}

/// A domain of versioned entries registered with the sync registry.
pub struct VersionedStore<V> {
    key: String,
    priority: i32,
    inner: RwLock<StoreInner<V>>,
}

impl<V> VersionedStore<V>
where
    V: Versioned + Clone + Serialize + DeserializeOwned + Send + Sync,
{
    pub fn new(key: impl Into<String>, priority: i32) -> Self {
        Self {
            key: key.into(),
            priority,
            inner: RwLock::new(StoreInner {
                entries: BTreeMap::new(),
                generation: 0,
                prepared: HashMap::new(),
            }),
        }
    }

    /// Insert or replace an entry. Local writes always win.
    pub fn upsert(&self, value: V) {
        let mut inner = self.inner.write();
        inner.entries.insert(value.key(), value);
        inner.generation += 1;
    }

    pub fn remove(&self, key: &str) -> Option<V> {
        let mut inner = self.inner.write();
        let removed = inner.entries.remove(key);
        if removed.is_some() {
            inner.generation += 1;
        }
        removed
    }

    /// Replace the whole domain with `values`. Entries not among them are
    /// dropped.
    pub fn replace_all(&self, values: Vec<V>) {
        let mut inner = self.inner.write();
        inner.entries = values.into_iter().map(|v| (v.key(), v)).collect();
        inner.generation += 1;
    }

    pub fn get(&self, key: &str) -> Option<V> {
        self.inner.read().entries.get(key).cloned()
    }

    pub fn values(&self) -> Vec<V> {
        self.inner.read().entries.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().entries.is_empty()
    }

    pub fn generation(&self) -> u64 {
        self.inner.read().generation
    }

    /// Merge remote entries. With `force` every entry overwrites; otherwise
    /// an entry is kept only when it is new or its revision is higher.
    /// Returns the number of entries that changed.
    pub fn merge(&self, incoming: Vec<V>, force: bool) -> usize {
        let mut inner = self.inner.write();
        let mut changed = 0;
        for value in incoming {
            let key = value.key();
            let newer = match inner.entries.get(&key) {
                Some(existing) => force || value.revision() > existing.revision(),
                None => true,
            };
            if newer {
                inner.entries.insert(key, value);
                changed += 1;
            }
        }
        if changed > 0 {
            inner.generation += 1;
        }
        changed
    }
}

impl<V> SyncDataHandler for VersionedStore<V>
where
    V: Versioned + Clone + Serialize + DeserializeOwned + Send + Sync,
{
    fn key(&self) -> &str {
        &self.key
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn prepare(&self, receiver: &str, force: bool) -> Result<Option<Vec<u8>>, SyncError> {
        let mut inner = self.inner.write();
        let generation = inner.generation;
        if !force && inner.prepared.get(receiver) == Some(&generation) {
            return Ok(None);
        }
        inner.prepared.insert(receiver.to_string(), generation);
        let values: Vec<&V> = inner.entries.values().collect();
        Ok(Some(serde_json::to_vec(&values)?))
    }

    fn apply(&self, data: &[u8], force: bool) -> Result<(), SyncError> {
        let incoming: Vec<V> = serde_json::from_slice(data)?;
        let changed = self.merge(incoming, force);
        tracing::debug!(key = %self.key, force, changed, "merged sync data");
        Ok(())
    }
}
