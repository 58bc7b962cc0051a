//! Key-value cache for model responses and page fetches.
//!
//! The [`KeyValueCache`] trait is the only thing the engine depends on.
//! Two implementations ship here:
//! - [`Storage`]: libSQL database on disk, shared across runs
//! - [`MemoryCache`]: process-local map, for tests and `--no-cache` runs
//!
//! Keys are derived deterministically from the full request (see [`cache_key`]),
//! so a hit is indistinguishable from a fresh response downstream.

mod migrations;

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use libsql::{Connection, Database, params};
use rowforge_shared::{Result, RowForgeError};
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, RwLock};

/// Namespace for chat-completion responses.
pub const MODEL_NAMESPACE: &str = "model";

/// Namespace for fetched pages.
pub const FETCH_NAMESPACE: &str = "fetch";

/// Derive a stable cache key from a serialized request.
pub fn cache_key(payload: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Asynchronous namespaced key-value store.
#[async_trait]
pub trait KeyValueCache: Send + Sync {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<String>>;
    async fn put(&self, namespace: &str, key: &str, value: &str) -> Result<()>;
}

// ---------------------------------------------------------------------------
// libSQL storage
// ---------------------------------------------------------------------------

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    /// Owns the database `conn` was opened from.
    _db: Database,
    conn: Mutex<Connection>,
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| RowForgeError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| RowForgeError::Storage(e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| RowForgeError::Storage(e.to_string()))?;

        let storage = Self {
            _db: db,
            conn: Mutex::new(conn),
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;
        let conn = self.conn.lock().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                conn.execute_batch(migration.sql).await.map_err(|e| {
                    RowForgeError::Storage(format!(
                        "migration v{} failed: {e}",
                        migration.version
                    ))
                })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let conn = self.conn.lock().await;
        let result = conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Drop every entry in a namespace; returns how many were removed.
    pub async fn invalidate(&self, namespace: &str) -> Result<u64> {
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM cache_entries WHERE namespace = ?1",
            params![namespace],
        )
        .await
        .map_err(|e| RowForgeError::Storage(e.to_string()))
    }

    /// Number of entries in a namespace.
    pub async fn entry_count(&self, namespace: &str) -> Result<u64> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                "SELECT COUNT(*) FROM cache_entries WHERE namespace = ?1",
                params![namespace],
            )
            .await
            .map_err(|e| RowForgeError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => row
                .get::<u64>(0)
                .map_err(|e| RowForgeError::Storage(e.to_string())),
            Ok(None) => Ok(0),
            Err(e) => Err(RowForgeError::Storage(e.to_string())),
        }
    }
}

#[async_trait]
impl KeyValueCache for Storage {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                "SELECT value FROM cache_entries WHERE namespace = ?1 AND key = ?2",
                params![namespace, key],
            )
            .await
            .map_err(|e| RowForgeError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let value: String = row
                    .get(0)
                    .map_err(|e| RowForgeError::Storage(e.to_string()))?;
                Ok(Some(value))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(RowForgeError::Storage(e.to_string())),
        }
    }

    /// Store a value (upserts).
    async fn put(&self, namespace: &str, key: &str, value: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO cache_entries (namespace, key, value, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(namespace, key) DO UPDATE SET
               value = excluded.value,
               created_at = excluded.created_at",
            params![namespace, key, value, now.as_str()],
        )
        .await
        .map_err(|e| RowForgeError::Storage(e.to_string()))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory cache
// ---------------------------------------------------------------------------

/// Process-local cache; contents vanish with the process.
#[derive(Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<(String, String), String>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl KeyValueCache for MemoryCache {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<String>> {
        Ok(self
            .entries
            .read()
            .await
            .get(&(namespace.to_string(), key.to_string()))
            .cloned())
    }

    async fn put(&self, namespace: &str, key: &str, value: &str) -> Result<()> {
        self.entries
            .write()
            .await
            .insert((namespace.to_string(), key.to_string()), value.to_string());
        Ok(())
    }
}
