//! Key-value persistence for calibration state
//!
//! The core only needs `get`/`set` over a handful of logical keys (see
//! [`keys`]). Values are JSON so any backend that can hold strings works.
//! [`MemoryStore`] backs tests; [`SqliteStore`] is the reference production
//! adapter.

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

use crate::error::StoreError;

/// Logical keys of the persisted calibration record
pub mod keys {
    pub const TRAINING_ACTIVE: &str = "trainingActive";
    pub const TRAINING_START_DATE: &str = "trainingStartDate";
    pub const STRESSED_READINGS: &str = "stressedReadings";
    pub const CALM_READINGS: &str = "calmReadings";
    pub const CUSTOM_THRESHOLD: &str = "customThreshold";
    pub const USER_AGE: &str = "userAge";
    pub const USER_GENDER: &str = "userGender";
    pub const SENSITIVITY_STRESSED_COUNT: &str = "sensitivityStressedCount";
    pub const SENSITIVITY_WINDOW_SIZE: &str = "sensitivityWindowSize";
    pub const ACTIVE_MODE: &str = "activeMode";

    pub const ALL: [&str; 10] = [
        TRAINING_ACTIVE,
        TRAINING_START_DATE,
        STRESSED_READINGS,
        CALM_READINGS,
        CUSTOM_THRESHOLD,
        USER_AGE,
        USER_GENDER,
        SENSITIVITY_STRESSED_COUNT,
        SENSITIVITY_WINDOW_SIZE,
        ACTIVE_MODE,
    ];
}

/// Injected key-value persistence
pub trait KeyValueStore {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;

    fn set(&mut self, key: &str, value: Value) -> Result<(), StoreError>;

    /// Remove a key; storing JSON `null` is equivalent
    fn remove(&mut self, key: &str) -> Result<(), StoreError> {
        self.set(key, Value::Null)
    }
}

/// In-memory store
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    values: HashMap<String, Value>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.values.get(key).filter(|v| !v.is_null()).cloned())
    }

    fn set(&mut self, key: &str, value: Value) -> Result<(), StoreError> {
        if value.is_null() {
            self.values.remove(key);
        } else {
            self.values.insert(key.to_string(), value);
        }
        Ok(())
    }
}

/// SQLite-backed store with a single `kv` table
#[derive(Debug)]
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open (or create) a store at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| StoreError::Backend {
                    reason: format!("cannot create {}: {}", parent.display(), e),
                })?;
            }
        }
        let conn = Connection::open(path.as_ref())?;
        let store = Self { conn };
        store.initialize()?;
        debug!(path = %path.as_ref().display(), "opened calibration store");
        Ok(store)
    }

    /// Open a throwaway in-memory database
    pub fn in_memory() -> Result<Self, StoreError> {
        let store = Self {
            conn: Connection::open_in_memory()?,
        };
        store.initialize()?;
        Ok(store)
    }

    fn initialize(&self) -> Result<(), StoreError> {
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;
        Ok(())
    }
}

impl KeyValueStore for SqliteStore {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let raw: Option<String> = self
            .conn
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| row.get(0))
            .optional()?;

        match raw {
            Some(text) => serde_json::from_str(&text)
                .map(|v: Value| if v.is_null() { None } else { Some(v) })
                .map_err(|e| StoreError::Serialization {
                    key: key.to_string(),
                    reason: e.to_string(),
                }),
            None => Ok(None),
        }
    }

    fn set(&mut self, key: &str, value: Value) -> Result<(), StoreError> {
        if value.is_null() {
            self.conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
            return Ok(());
        }
        let text = serde_json::to_string(&value).map_err(|e| StoreError::Serialization {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        self.conn.execute(
            "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, CURRENT_TIMESTAMP)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, text],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn test_memory_store_roundtrip() {
        let mut store = MemoryStore::new();
        store.set(keys::CALM_READINGS, json!([70.0, 65.5])).unwrap();
        assert_eq!(store.get(keys::CALM_READINGS).unwrap(), Some(json!([70.0, 65.5])));
        assert_eq!(store.get(keys::USER_AGE).unwrap(), None);

        store.remove(keys::CALM_READINGS).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_sqlite_store_overwrites() {
        let mut store = SqliteStore::in_memory().unwrap();
        store.set(keys::CUSTOM_THRESHOLD, json!(55.0)).unwrap();
        store.set(keys::CUSTOM_THRESHOLD, json!(48.5)).unwrap();
        assert_eq!(store.get(keys::CUSTOM_THRESHOLD).unwrap(), Some(json!(48.5)));

        store.remove(keys::CUSTOM_THRESHOLD).unwrap();
        assert_eq!(store.get(keys::CUSTOM_THRESHOLD).unwrap(), None);
    }

    #[test]
    fn test_sqlite_store_persists_across_connections() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("calibration.db");

        {
            let mut store = SqliteStore::open(&path).unwrap();
            store.set(keys::TRAINING_ACTIVE, json!(true)).unwrap();
            store.set(keys::ACTIVE_MODE, json!("training")).unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.get(keys::TRAINING_ACTIVE).unwrap(), Some(json!(true)));
        assert_eq!(store.get(keys::ACTIVE_MODE).unwrap(), Some(json!("training")));
    }
}
