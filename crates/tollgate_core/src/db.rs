use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::LicenseError;
use crate::store::KeyValueStore;

/// SQLite-backed `KeyValueStore`. Several processes may open the same
/// database file; each write is a single statement.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LicenseError> {
        let conn = Connection::open(path)
            .map_err(|e| LicenseError::Store(format!("DB open: {}", e)))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_tables()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, LicenseError> {
        Self::open(":memory:")
    }

    fn init_tables(&self) -> Result<(), LicenseError> {
        self.conn
            .lock()
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS kv_hash (
                key TEXT NOT NULL,
                field TEXT NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY (key, field)
            );",
            )
            .map_err(|e| LicenseError::Store(format!("DB init: {}", e)))?;
        Ok(())
    }
}

impl KeyValueStore for SqliteStore {
    fn get(&self, key: &str) -> Result<Option<String>, LicenseError> {
        self.conn
            .lock()
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()
            .map_err(|e| LicenseError::Store(format!("DB get: {}", e)))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), LicenseError> {
        self.conn
            .lock()
            .execute(
                "INSERT INTO kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )
            .map_err(|e| LicenseError::Store(format!("DB set: {}", e)))?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), LicenseError> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM kv WHERE key = ?1", params![key])
            .map_err(|e| LicenseError::Store(format!("DB delete: {}", e)))?;
        conn.execute("DELETE FROM kv_hash WHERE key = ?1", params![key])
            .map_err(|e| LicenseError::Store(format!("DB delete: {}", e)))?;
        Ok(())
    }

    fn hget(&self, key: &str, field: &str) -> Result<Option<String>, LicenseError> {
        self.conn
            .lock()
            .query_row(
                "SELECT value FROM kv_hash WHERE key = ?1 AND field = ?2",
                params![key, field],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| LicenseError::Store(format!("DB hget: {}", e)))
    }

    fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), LicenseError> {
        self.conn
            .lock()
            .execute(
                "INSERT INTO kv_hash (key, field, value) VALUES (?1, ?2, ?3)
             ON CONFLICT(key, field) DO UPDATE SET value = excluded.value",
                params![key, field, value],
            )
            .map_err(|e| LicenseError::Store(format!("DB hset: {}", e)))?;
        Ok(())
    }
}
