//! Short-TTL key-value cache plus the coordination primitives the sync
//! families share: a mutex with TTL and atomic counters. All of it lives in
//! the shared SQLite file so every worker process observes the same state.

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::sync::Arc;
use tracing::debug;

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA busy_timeout = 5000;

CREATE TABLE IF NOT EXISTS kv_cache (
    cache_key TEXT PRIMARY KEY,
    cache_json TEXT NOT NULL,
    expires_at INTEGER NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_kv_cache_expires ON kv_cache(expires_at);

CREATE TABLE IF NOT EXISTS sync_locks (
    lock_key TEXT PRIMARY KEY,
    holder TEXT NOT NULL,
    expires_at INTEGER NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS sync_counters (
    counter_key TEXT PRIMARY KEY,
    value INTEGER NOT NULL DEFAULT 0
) WITHOUT ROWID;
"#;

/// Cache, lock, and counter provider. Cheap to clone.
#[derive(Clone)]
pub struct CacheStore {
    conn: Arc<Mutex<Connection>>,
}

impl CacheStore {
    pub fn new(db_path: &str) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("Failed to open cache database at {}", db_path))?;
        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize cache schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn get(&self, key: &str) -> Result<Option<String>> {
        let now = Utc::now().timestamp();
        let conn = self.conn.lock();
        let value: Option<String> = conn
            .query_row(
                "SELECT cache_json FROM kv_cache WHERE cache_key = ?1 AND expires_at > ?2",
                params![key, now],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn put(&self, key: &str, value: &str, ttl_secs: i64) -> Result<()> {
        let expires_at = Utc::now().timestamp() + ttl_secs;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO kv_cache (cache_key, cache_json, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(cache_key) DO UPDATE SET
                cache_json = excluded.cache_json,
                expires_at = excluded.expires_at",
            params![key, value, expires_at],
        )?;
        Ok(())
    }

    /// Drop expired cache rows. Returns rows removed.
    pub fn evict_expired(&self) -> Result<usize> {
        let now = Utc::now().timestamp();
        let conn = self.conn.lock();
        let n = conn.execute("DELETE FROM kv_cache WHERE expires_at <= ?1", params![now])?;
        Ok(n)
    }

    /// Compare-and-set lock acquisition. Succeeds when no unexpired row
    /// exists for `key`; an expired row is taken over. Returns false when the
    /// lock is held by someone else.
    pub fn try_acquire_lock(&self, key: &str, holder: &str, ttl_secs: i64) -> Result<bool> {
        let now = Utc::now().timestamp();
        let expires_at = now + ttl_secs;
        let conn = self.conn.lock();
        let changed = conn.execute(
            "INSERT INTO sync_locks (lock_key, holder, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(lock_key) DO UPDATE SET
                holder = excluded.holder,
                expires_at = excluded.expires_at
             WHERE sync_locks.expires_at <= ?4",
            params![key, holder, expires_at, now],
        )?;
        if changed > 0 {
            debug!(key, holder, "lock acquired");
        }
        Ok(changed > 0)
    }

    /// Release only when still held by `holder`; a TTL takeover by another
    /// worker must not be clobbered.
    pub fn release_lock(&self, key: &str, holder: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "DELETE FROM sync_locks WHERE lock_key = ?1 AND holder = ?2",
            params![key, holder],
        )?;
        Ok(changed > 0)
    }

    /// Unconditional release, used when the family drains: the worker that
    /// completes the last pending job may not be the process that acquired
    /// the lock.
    pub fn force_release_lock(&self, key: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute("DELETE FROM sync_locks WHERE lock_key = ?1", params![key])?;
        Ok(changed > 0)
    }

    /// Whether an unexpired lock row exists for `key`.
    pub fn lock_held(&self, key: &str) -> Result<bool> {
        let now = Utc::now().timestamp();
        let conn = self.conn.lock();
        let held: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM sync_locks WHERE lock_key = ?1 AND expires_at > ?2",
                params![key, now],
                |row| row.get(0),
            )
            .optional()?;
        Ok(held.is_some())
    }

    /// Atomic increment; returns the new value.
    pub fn incr(&self, key: &str, delta: i64) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO sync_counters (counter_key, value) VALUES (?1, ?2)
             ON CONFLICT(counter_key) DO UPDATE SET value = value + ?2",
            params![key, delta],
        )?;
        let value: i64 = conn.query_row(
            "SELECT value FROM sync_counters WHERE counter_key = ?1",
            params![key],
            |row| row.get(0),
        )?;
        Ok(value)
    }

    pub fn counter(&self, key: &str) -> Result<i64> {
        let conn = self.conn.lock();
        let value: Option<i64> = conn
            .query_row(
                "SELECT value FROM sync_counters WHERE counter_key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value.unwrap_or(0))
    }

    pub fn reset_counter(&self, key: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO sync_counters (counter_key, value) VALUES (?1, 0)
             ON CONFLICT(counter_key) DO UPDATE SET value = 0",
            params![key],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn temp_cache() -> (CacheStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.db");
        (CacheStore::new(path.to_str().unwrap()).unwrap(), dir)
    }

    #[test]
    fn kv_respects_ttl() {
        let (cache, _dir) = temp_cache();
        cache.put("k", "v", 60).unwrap();
        assert_eq!(cache.get("k").unwrap(), Some("v".to_string()));

        cache.put("k2", "v2", -1).unwrap();
        assert_eq!(cache.get("k2").unwrap(), None);
    }

    #[test]
    fn lock_is_exclusive_until_released() {
        let (cache, _dir) = temp_cache();
        assert!(cache.try_acquire_lock("sync:lock", "a", 60).unwrap());
        assert!(!cache.try_acquire_lock("sync:lock", "b", 60).unwrap());
        assert!(cache.lock_held("sync:lock").unwrap());

        // Wrong holder cannot release.
        assert!(!cache.release_lock("sync:lock", "b").unwrap());
        assert!(cache.release_lock("sync:lock", "a").unwrap());
        assert!(cache.try_acquire_lock("sync:lock", "b", 60).unwrap());
    }

    #[test]
    fn expired_lock_is_taken_over() {
        let (cache, _dir) = temp_cache();
        assert!(cache.try_acquire_lock("sync:lock", "dead", -5).unwrap());
        assert!(cache.try_acquire_lock("sync:lock", "alive", 60).unwrap());
    }

    #[test]
    fn counters_are_atomic_and_signed() {
        let (cache, _dir) = temp_cache();
        assert_eq!(cache.incr("c", 1).unwrap(), 1);
        assert_eq!(cache.incr("c", 1).unwrap(), 2);
        assert_eq!(cache.incr("c", -1).unwrap(), 1);
        assert_eq!(cache.counter("c").unwrap(), 1);
        cache.reset_counter("c").unwrap();
        assert_eq!(cache.counter("c").unwrap(), 0);
    }
}
