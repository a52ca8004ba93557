//! State storage for stateful processing logic.
//!
//! [`KeyValueStore`] is the contract user logic programs against; the engine
//! itself never touches it. [`InMemoryKeyValueStore`] keeps everything in a
//! map and is enough for tests and single-process topologies.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;

use crate::error::Result;

/// One key with its value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry<V> {
    pub key: String,
    pub value: V,
}

impl<V> Entry<V> {
    pub fn new(key: impl Into<String>, value: V) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }
}

#[async_trait]
pub trait KeyValueStore<V>: Send + Sync
where
    V: Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> Result<Option<V>>;

    /// Entries for the keys that exist, in the order the keys were given.
    async fn get_all(&self, keys: &[String]) -> Result<Vec<Entry<V>>>;

    async fn put(&self, key: &str, value: V) -> Result<()>;

    async fn put_all(&self, entries: Vec<Entry<V>>) -> Result<()>;

    /// Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Make every preceding write durable.
    async fn flush(&self) -> Result<()>;
}

pub fn to_map<V>(entries: Vec<Entry<V>>) -> HashMap<String, V> {
    entries
        .into_iter()
        .map(|entry| (entry.key, entry.value))
        .collect()
}

/// Entries of `map`, in no particular order.
pub fn from_map<V>(map: HashMap<String, V>) -> Vec<Entry<V>> {
    map.into_iter()
        .map(|(key, value)| Entry { key, value })
        .collect()
}

/// Writes are buffered until [`flush`](KeyValueStore::flush); reads see
/// buffered writes.
#[derive(Debug, Default)]
pub struct InMemoryKeyValueStore<V> {
    state: Mutex<StoreState<V>>,
}

#[derive(Debug)]
struct StoreState<V> {
    flushed: BTreeMap<String, V>,
    /// `None` marks a pending delete.
    pending: BTreeMap<String, Option<V>>,
}

impl<V> Default for StoreState<V> {
    fn default() -> Self {
        Self {
            flushed: BTreeMap::new(),
            pending: BTreeMap::new(),
        }
    }
}

impl<V: Clone> StoreState<V> {
    fn get(&self, key: &str) -> Option<V> {
        match self.pending.get(key) {
            Some(pending) => pending.clone(),
            None => self.flushed.get(key).cloned(),
        }
    }
}

impl<V: Clone> InMemoryKeyValueStore<V> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
        }
    }

    /// Durable contents only, ignoring unflushed writes.
    pub fn flushed(&self) -> BTreeMap<String, V> {
        self.state().flushed.clone()
    }

    pub fn pending_writes(&self) -> usize {
        self.state().pending.len()
    }

    fn state(&self) -> MutexGuard<'_, StoreState<V>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl<V> KeyValueStore<V> for InMemoryKeyValueStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> Result<Option<V>> {
        Ok(self.state().get(key))
    }

    async fn get_all(&self, keys: &[String]) -> Result<Vec<Entry<V>>> {
        let state = self.state();
        Ok(keys
            .iter()
            .filter_map(|key| state.get(key).map(|value| Entry::new(key.as_str(), value)))
            .collect())
    }

    async fn put(&self, key: &str, value: V) -> Result<()> {
        self.state().pending.insert(key.to_owned(), Some(value));
        Ok(())
    }

    async fn put_all(&self, entries: Vec<Entry<V>>) -> Result<()> {
        let mut state = self.state();
        for entry in entries {
            state.pending.insert(entry.key, Some(entry.value));
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.state().pending.insert(key.to_owned(), None);
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        let mut state = self.state();
        let pending = std::mem::take(&mut state.pending);
        tracing::trace!("Flushing {} key-value writes", pending.len());
        for (key, value) in pending {
            match value {
                Some(value) => state.flushed.insert(key, value),
                None => state.flushed.remove(&key),
            };
        }
        Ok(())
    }
}
