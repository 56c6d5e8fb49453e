use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::Mutex;
use tracing::info;

use super::{KeyValueStore, StoreError, entry_size};
use crate::platform::{NativePlatform, Platform};

/// File-backed store: one `kv` table, capacity counted over stored entries.
pub struct SqliteStore {
    db: Mutex<Connection>,
    capacity: usize,
}

impl SqliteStore {
    pub fn open(path: &Path, capacity: usize) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Backend(e.to_string()))?;
            NativePlatform::restrict_dir_permissions(parent);
        }
        let conn = Connection::open(path)?;
        NativePlatform::restrict_file_permissions(path);
        info!("Opened job store at {}", path.display());
        Self::with_connection(conn, capacity)
    }

    #[cfg(test)]
    pub fn open_in_memory(capacity: usize) -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?, capacity)
    }

    fn with_connection(conn: Connection, capacity: usize) -> Result<Self, StoreError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
            [],
        )?;
        Ok(Self {
            db: Mutex::new(conn),
            capacity,
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
        self.db
            .lock()
            .map_err(|_| StoreError::Backend("store connection lock poisoned".into()))
    }
}

impl KeyValueStore for SqliteStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let db = self.lock()?;
        let value = db
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| row.get(0))
            .optional()?;
        Ok(value)
    }

    fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let db = self.lock()?;
        let used: i64 = db.query_row(
            "SELECT COALESCE(SUM(LENGTH(CAST(key AS BLOB)) + LENGTH(CAST(value AS BLOB))), 0)
             FROM kv WHERE key != ?1",
            params![key],
            |row| row.get(0),
        )?;
        let needed = used.max(0) as usize + entry_size(key, value);
        if needed > self.capacity {
            return Err(StoreError::CapacityExceeded {
                needed,
                capacity: self.capacity,
            });
        }
        db.execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value=excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let db = self.lock()?;
        db.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
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
    fn round_trips_through_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("jobs.db");
        {
            let store = SqliteStore::open(&path, 1024).unwrap();
            store.put("jobs", "[1,2,3]").unwrap();
        }
        let reopened = SqliteStore::open(&path, 1024).unwrap();
        assert_eq!(reopened.get("jobs").unwrap().as_deref(), Some("[1,2,3]"));
        assert!(reopened.get("missing").unwrap().is_none());
    }

    #[test]
    fn capacity_counts_utf8_bytes_of_other_entries() {
        let store = SqliteStore::open_in_memory(20).unwrap();
        store.put("a", "中文").unwrap(); // 1 + 6 bytes
        store.put("b", "0123456789").unwrap(); // 1 + 10 bytes
        let err = store.put("c", "xx").unwrap_err();
        assert!(matches!(err, StoreError::CapacityExceeded { needed: 21, capacity: 20 }));
        store.put("b", "01234567890").unwrap();
        assert_eq!(store.get("b").unwrap().as_deref(), Some("01234567890"));
    }

    #[test]
    fn remove_deletes_entry() {
        let store = SqliteStore::open_in_memory(100).unwrap();
        store.put("k", "v").unwrap();
        store.remove("k").unwrap();
        assert!(store.get("k").unwrap().is_none());
    }
}
