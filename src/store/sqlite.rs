//! SQLite key/value backend.
//!
//! One `kv` table shared by every session; keys are already namespaced by
//! [`CredentialStore`](super::CredentialStore), so the table knows nothing
//! about sessions.

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{Connection, params};
use std::path::Path;
use std::sync::Arc;

use super::{KvBackend, StoreError};

/// Convert rusqlite errors to [`StoreError`].
/// For execute statements that return usize, maps to ()
macro_rules! to_store_err {
    (execute: $expr:expr) => {
        $expr
            .map(|_| ())
            .map_err(|e| StoreError::Database(e.to_string()))
    };
    ($expr:expr) => {
        $expr.map_err(|e| StoreError::Database(e.to_string()))
    };
}

#[derive(Clone)]
pub struct SqliteBackend {
    /// Database file path, `:memory:` for in-memory databases
    db_path: String,
    /// SQLite connection (thread-safe via Mutex)
    conn: Arc<Mutex<Connection>>,
}

impl SqliteBackend {
    /// Open (or create) the database at `db_path`, creating parent
    /// directories as needed.
    pub fn open<P: AsRef<Path>>(db_path: P) -> anyhow::Result<Self> {
        let db_path = db_path.as_ref().to_string_lossy().to_string();

        if let Some(parent) = Path::new(&db_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(&db_path)?;

        // WAL lets readers proceed while another session writes
        to_store_err!(conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        ))?;

        let backend = Self {
            db_path,
            conn: Arc::new(Mutex::new(conn)),
        };
        backend.init_schema()?;
        Ok(backend)
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let backend = Self {
            db_path: ":memory:".to_string(),
            conn: Arc::new(Mutex::new(Connection::open_in_memory()?)),
        };
        backend.init_schema()?;
        Ok(backend)
    }

    pub fn path(&self) -> &str {
        &self.db_path
    }

    fn init_schema(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock();
        to_store_err!(conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY NOT NULL,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );",
        ))?;
        Ok(())
    }
}

#[async_trait]
impl KvBackend for SqliteBackend {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let conn = self.conn.lock();
        let result = conn.query_row(
            "SELECT value FROM kv WHERE key = ?1",
            params![key],
            |row| row.get::<_, String>(0),
        );

        match result {
            Ok(value) => Ok(Some(value)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StoreError::Database(e.to_string())),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        to_store_err!(execute: conn.execute(
            "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, chrono::Utc::now().timestamp_millis()],
        ))
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        to_store_err!(execute: conn.execute("DELETE FROM kv WHERE key = ?1", params![key]))
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let conn = self.conn.lock();
        // substr avoids LIKE wildcards hidden in session ids
        let mut stmt = to_store_err!(conn.prepare(
            "SELECT key FROM kv WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key",
        ))?;
        let rows = to_store_err!(stmt.query_map(params![prefix], |row| row.get::<_, String>(0)))?;
        let mut keys = Vec::new();
        for row in rows {
            keys.push(to_store_err!(row)?);
        }
        Ok(keys)
    }
}
