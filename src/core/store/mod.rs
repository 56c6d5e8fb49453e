//! Keyed blob storage with a fixed capacity ceiling.

pub mod sqlite;

use std::collections::HashMap;
use std::sync::Mutex;

pub use sqlite::SqliteStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store capacity exceeded: {needed} bytes needed, {capacity} available")]
    CapacityExceeded { needed: usize, capacity: usize },
    #[error("store backend error: {0}")]
    Backend(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

/// Synchronous key/value store. `put` rejects a write that would push the
/// total stored size over `capacity()`, leaving the previous value in place.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn put(&self, key: &str, value: &str) -> Result<(), StoreError>;
    fn remove(&self, key: &str) -> Result<(), StoreError>;
    fn capacity(&self) -> usize;
}

/// Size an entry counts against the capacity.
pub(crate) fn entry_size(key: &str, value: &str) -> usize {
    key.len() + value.len()
}

pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
    capacity: usize,
}

impl MemoryStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, String>>, StoreError> {
        self.entries
            .lock()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".into()))
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut entries = self.lock()?;
        let used: usize = entries
            .iter()
            .filter(|(k, _)| k.as_str() != key)
            .map(|(k, v)| entry_size(k, v))
            .sum();
        let needed = used + entry_size(key, value);
        if needed > self.capacity {
            return Err(StoreError::CapacityExceeded {
                needed,
                capacity: self.capacity,
            });
        }
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.lock()?.remove(key);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_writes_over_capacity_and_keeps_old_value() {
        let store = MemoryStore::new(10);
        store.put("k", "12345").unwrap();
        let err = store.put("k", "123456789012").unwrap_err();
        assert!(matches!(err, StoreError::CapacityExceeded { needed: 13, capacity: 10 }));
        assert_eq!(store.get("k").unwrap().as_deref(), Some("12345"));
    }

    #[test]
    fn replacing_a_key_frees_its_old_size() {
        let store = MemoryStore::new(10);
        store.put("k", "123456789").unwrap();
        store.put("k", "987654321").unwrap();
        store.remove("k").unwrap();
        assert!(store.get("k").unwrap().is_none());
    }
}
