// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable key/value storage.
//!
//! The offline queue and fallback store persist through [`KeyValueStore`].
//! Two implementations ship with the crate:
//!
//! - [`SqliteStore`]: a single `kv` table in SQLite (WAL mode), surviving
//!   process restarts.
//! - [`MemoryStore`]: a process-local map with an optional byte quota and
//!   failure injection, for tests and hosts without a disk.
//!
//! Every error is reported as [`SyncError::Storage`]; callers absorb them.
//!
//! # SQLite Busy Handling
//!
//! SQLite can return SQLITE_BUSY/SQLITE_LOCKED when the database is
//! contended. Writes and reads retry with exponential backoff (max 5 attempts)
//! before surfacing the error.

use crate::error::{BoxFuture, Result, SyncError};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Async key/value persistence used by the queue and fallback store.
pub trait KeyValueStore: Send + Sync + 'static {
    /// Read the value stored under `key`, `None` if absent.
    fn get_item(&self, key: &str) -> BoxFuture<'_, Option<String>>;

    /// Store `value` under `key`, replacing any previous value.
    fn set_item(&self, key: &str, value: String) -> BoxFuture<'_, ()>;

    /// Delete `key`. Deleting a missing key is not an error.
    fn remove_item(&self, key: &str) -> BoxFuture<'_, ()>;
}

// =============================================================================
// In-memory store
// =============================================================================

/// In-memory store with optional quota.
///
/// The quota counts key and value bytes; a write that would exceed it fails
/// with a storage error, like a browser-style storage quota.
#[derive(Default)]
pub struct MemoryStore {
    items: Mutex<HashMap<String, String>>,
    quota_bytes: Option<usize>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(quota_bytes: usize) -> Self {
        Self {
            quota_bytes: Some(quota_bytes),
            ..Self::default()
        }
    }

    /// Make every subsequent read fail.
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent write or delete fail.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    /// Bytes currently used (keys plus values).
    pub fn used_bytes(&self) -> usize {
        self.lock().iter().map(|(k, v)| k.len() + v.len()).sum()
    }

    /// Write a value directly, bypassing quota and failure injection.
    pub fn insert_raw(&self, key: &str, value: &str) {
        self.lock().insert(key.to_string(), value.to_string());
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.items.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn get_sync(&self, key: &str) -> Result<Option<String>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(SyncError::storage("get_item", "injected read failure"));
        }
        Ok(self.lock().get(key).cloned())
    }

    fn set_sync(&self, key: &str, value: String) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(SyncError::storage("set_item", "injected write failure"));
        }
        let mut items = self.lock();
        if let Some(quota) = self.quota_bytes {
            let current: usize = items
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .map(|(k, v)| k.len() + v.len())
                .sum();
            if current + key.len() + value.len() > quota {
                return Err(SyncError::storage(
                    "set_item",
                    format!("quota exceeded ({} bytes)", quota),
                ));
            }
        }
        items.insert(key.to_string(), value);
        Ok(())
    }

    fn remove_sync(&self, key: &str) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(SyncError::storage("remove_item", "injected write failure"));
        }
        self.lock().remove(key);
        Ok(())
    }
}

impl KeyValueStore for MemoryStore {
    fn get_item(&self, key: &str) -> BoxFuture<'_, Option<String>> {
        let result = self.get_sync(key);
        Box::pin(async move { result })
    }

    fn set_item(&self, key: &str, value: String) -> BoxFuture<'_, ()> {
        let result = self.set_sync(key, value);
        Box::pin(async move { result })
    }

    fn remove_item(&self, key: &str) -> BoxFuture<'_, ()> {
        let result = self.remove_sync(key);
        Box::pin(async move { result })
    }
}

// =============================================================================
// SQLite store
// =============================================================================

const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

/// Check if an error is a retryable SQLite busy/locked error
fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
async fn execute_with_busy_retry<F, Fut, T>(
    operation_name: &str,
    mut f: F,
) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(operation = operation_name, attempts, "SQLite operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::storage_retries_total(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => return Err(e),
        }
    }
}

fn storage_err(operation: &str, e: sqlx::Error) -> SyncError {
    SyncError::storage(operation, e.to_string())
}

/// Key/value store backed by SQLite.
pub struct SqliteStore {
    pool: SqlitePool,
    path: String,
}

impl SqliteStore {
    /// Open (or create) the database at `path`. `":memory:"` opens a private
    /// in-memory database.
    pub async fn open(path: &str, wal_mode: bool) -> Result<Self> {
        info!(path = %path, wal_mode, "Initializing key/value store");

        let in_memory = path == ":memory:";
        let url = if in_memory {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite://{}?mode=rwc", path)
        };

        let mut options = SqliteConnectOptions::from_str(&url)
            .map_err(|e| SyncError::storage("open", format!("invalid SQLite path: {}", e)))?
            .create_if_missing(true);
        if wal_mode && !in_memory {
            options = options
                .journal_mode(SqliteJournalMode::Wal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);
        }

        // A second connection to :memory: would see a different database.
        let max_connections = if in_memory { 1 } else { 2 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(|e| storage_err("open", e))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await
        .map_err(|e| storage_err("create_table", e))?;

        Ok(Self {
            pool,
            path: path.to_string(),
        })
    }

    /// Open using a [`StorageConfig`](crate::config::StorageConfig).
    pub async fn from_config(config: &crate::config::StorageConfig) -> Result<Self> {
        Self::open(&config.sqlite_path, config.wal_mode).await
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Number of stored keys.
    pub async fn count(&self) -> Result<usize> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM kv")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| storage_err("count", e))?;
        Ok(count.max(0) as usize)
    }

    pub async fn close(&self) {
        self.pool.close().await;
        info!(path = %self.path, "Key/value store closed");
    }
}

impl KeyValueStore for SqliteStore {
    fn get_item(&self, key: &str) -> BoxFuture<'_, Option<String>> {
        let key = key.to_string();
        Box::pin(async move {
            let pool = &self.pool;
            let row: Option<(String,)> = execute_with_busy_retry("get_item", || async {
                sqlx::query_as("SELECT value FROM kv WHERE key = ?")
                    .bind(&key)
                    .fetch_optional(pool)
                    .await
            })
            .await
            .map_err(|e| storage_err("get_item", e))?;
            Ok(row.map(|(value,)| value))
        })
    }

    fn set_item(&self, key: &str, value: String) -> BoxFuture<'_, ()> {
        let key = key.to_string();
        Box::pin(async move {
            let pool = &self.pool;
            let now = chrono::Utc::now().timestamp_millis();
            execute_with_busy_retry("set_item", || async {
                sqlx::query(
                    r#"
                    INSERT INTO kv (key, value, updated_at)
                    VALUES (?, ?, ?)
                    ON CONFLICT(key) DO UPDATE SET
                        value = excluded.value,
                        updated_at = excluded.updated_at
                    "#,
                )
                .bind(&key)
                .bind(&value)
                .bind(now)
                .execute(pool)
                .await
            })
            .await
            .map_err(|e| storage_err("set_item", e))?;
            debug!(key = %key, bytes = value.len(), "Stored item");
            Ok(())
        })
    }

    fn remove_item(&self, key: &str) -> BoxFuture<'_, ()> {
        let key = key.to_string();
        Box::pin(async move {
            let pool = &self.pool;
            execute_with_busy_retry("remove_item", || async {
                sqlx::query("DELETE FROM kv WHERE key = ?")
                    .bind(&key)
                    .execute(pool)
                    .await
            })
            .await
            .map_err(|e| storage_err("remove_item", e))?;
            Ok(())
        })
    }
}
