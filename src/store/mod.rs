//! Persistent key-value store for the sync core
//!
//! Durable, process-independent storage backing the cache layer, the offline
//! queue, and sync metadata. One SQLite database with two tables:
//! - `kv`: plain JSON values, one row per logical key
//! - `secrets`: the encrypted channel for tokens and other sensitive values
//!
//! Uses r2d2 connection pooling; a `Store` clone is cheap and safe to share
//! across tasks. Each call is atomic for its single key.

mod secrets;

use rusqlite::params;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;

use secrets::SecretCipher;

/// Escape LIKE wildcards so a key prefix matches literally.
fn escape_like(prefix: &str) -> String {
    prefix
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

/// Store error types
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Thread-safe handle to the on-device store
#[derive(Clone)]
pub struct Store {
    pool: Arc<Pool<SqliteConnectionManager>>,
    cipher: Arc<SecretCipher>,
}

impl Store {
    /// Open (or create) the store at `db_path`. The parent directory is
    /// created if missing and also holds the secrets key material.
    pub fn open(db_path: &Path) -> StoreResult<Self> {
        let data_dir = match db_path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&data_dir)?;

        let manager = SqliteConnectionManager::file(db_path);
        let pool = Pool::builder()
            .max_size(8)
            .min_idle(Some(2))
            .connection_timeout(std::time::Duration::from_secs(10))
            .build(manager)?;

        let conn = pool.get()?;

        // Performance PRAGMAs
        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
        "#,
        )?;

        let schema = include_str!("schema.sql");
        conn.execute_batch(schema)?;

        Self::run_migrations(&conn)?;
        drop(conn);

        let cipher = SecretCipher::load(&data_dir).map_err(StoreError::Crypto)?;

        Ok(Self {
            pool: Arc::new(pool),
            cipher: Arc::new(cipher),
        })
    }

    /// Create an in-memory store (for testing).
    ///
    /// Pools a single connection: every `:memory:` connection is its own
    /// database, so a wider pool would hand out handles to empty ghosts.
    pub fn in_memory() -> StoreResult<Self> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder().max_size(1).build(manager)?;

        let conn = pool.get()?;
        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;
            PRAGMA temp_store = MEMORY;
        "#,
        )?;

        let schema = include_str!("schema.sql");
        conn.execute_batch(schema)?;

        Self::run_migrations(&conn)?;
        drop(conn);

        let cipher = SecretCipher::ephemeral().map_err(StoreError::Crypto)?;

        Ok(Self {
            pool: Arc::new(pool),
            cipher: Arc::new(cipher),
        })
    }

    /// Get a connection from the pool
    #[inline]
    fn get_conn(&self) -> StoreResult<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    // =========================================================================
    // MIGRATIONS
    // =========================================================================

    /// Run migrations for stores created by earlier builds
    fn run_migrations(conn: &rusqlite::Connection) -> StoreResult<()> {
        // Migration 1: early builds shipped kv without updated_at
        let has_updated_at: bool = conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM pragma_table_info('kv') WHERE name = 'updated_at'",
                [],
                |row| row.get(0),
            )
            .unwrap_or(false);

        if !has_updated_at {
            log::info!("Running migration: Adding updated_at column to kv");
            conn.execute("ALTER TABLE kv ADD COLUMN updated_at TEXT NOT NULL DEFAULT ''", [])?;
        }

        Ok(())
    }

    // =========================================================================
    // KEY-VALUE
    // =========================================================================

    /// Read the JSON value stored under `key`.
    pub fn get<T: serde::de::DeserializeOwned>(&self, key: &str) -> StoreResult<Option<T>> {
        let conn = self.get_conn()?;
        let result: Result<String, _> =
            conn.query_row("SELECT value FROM kv WHERE key = ?1", [key], |row| {
                row.get(0)
            });

        match result {
            Ok(json) => {
                let value: T = serde_json::from_str(&json)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?;
                Ok(Some(value))
            }
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write `value` under `key`, replacing any previous value.
    pub fn set<T: Serialize>(&self, key: &str, value: &T) -> StoreResult<()> {
        let conn = self.get_conn()?;
        let json = serde_json::to_string(value)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        conn.execute(
            "INSERT OR REPLACE INTO kv (key, value) VALUES (?1, ?2)",
            params![key, json],
        )?;

        Ok(())
    }

    /// Delete `key`. Deleting an absent key is a no-op.
    pub fn remove(&self, key: &str) -> StoreResult<()> {
        let conn = self.get_conn()?;
        conn.execute("DELETE FROM kv WHERE key = ?1", [key])?;
        Ok(())
    }

    /// Delete every key starting with `prefix` (e.g. all cache entries on
    /// logout). Returns the number of removed rows.
    pub fn remove_prefix(&self, prefix: &str) -> StoreResult<usize> {
        let conn = self.get_conn()?;
        let pattern = format!("{}%", escape_like(prefix));
        let removed = conn.execute("DELETE FROM kv WHERE key LIKE ?1 ESCAPE '\\'", [pattern])?;
        Ok(removed)
    }

    // =========================================================================
    // SECRETS
    // =========================================================================

    /// Store a secret through the encrypted channel.
    pub fn set_secret(&self, key: &str, value: &str) -> StoreResult<()> {
        let sealed = self.cipher.seal(value).map_err(StoreError::Crypto)?;
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO secrets (key, value) VALUES (?1, ?2)",
            params![key, sealed],
        )?;
        Ok(())
    }

    /// Read a secret. Unlike `get`, decryption failures propagate: a secret
    /// that no longer opens means the caller must re-acquire it.
    pub fn get_secret(&self, key: &str) -> StoreResult<Option<String>> {
        let conn = self.get_conn()?;
        let result: Result<String, _> =
            conn.query_row("SELECT value FROM secrets WHERE key = ?1", [key], |row| {
                row.get(0)
            });

        match result {
            Ok(sealed) => {
                let value = self
                    .cipher
                    .open_sealed(&sealed)
                    .map_err(StoreError::Crypto)?;
                Ok(Some(value))
            }
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete a secret. Deleting an absent secret is a no-op.
    pub fn remove_secret(&self, key: &str) -> StoreResult<()> {
        let conn = self.get_conn()?;
        conn.execute("DELETE FROM secrets WHERE key = ?1", [key])?;
        Ok(())
    }
}
