//! Durable per-job-kind queues over SQLite.
//!
//! Delivery is at-least-once: a reserved message that is never acked becomes
//! visible again once its lock expires. Failed deliveries are retried with
//! exponential backoff up to a bounded attempt count, then moved to the
//! dead-letter table with the original payload preserved.

pub mod worker;

use anyhow::Context;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use rusqlite::{params, Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info};

use crate::error::ServiceError;

pub use worker::{spawn_worker, JobHandler, WorkerOptions};

/// The nine logical job kinds, one durable queue each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobKind {
    SyncMarketSnapshots,
    SyncMarketCategories,
    SyncSeries,
    SyncEvents,
    SyncEventDetail,
    SyncOrderbook,
    SyncCandlesticks,
    ProcessAnalytics,
    CleanupMarket,
}

impl JobKind {
    pub const ALL: [JobKind; 9] = [
        JobKind::SyncMarketSnapshots,
        JobKind::SyncMarketCategories,
        JobKind::SyncSeries,
        JobKind::SyncEvents,
        JobKind::SyncEventDetail,
        JobKind::SyncOrderbook,
        JobKind::SyncCandlesticks,
        JobKind::ProcessAnalytics,
        JobKind::CleanupMarket,
    ];

    pub fn queue_name(&self) -> &'static str {
        match self {
            JobKind::SyncMarketSnapshots => "sync-market-snapshots",
            JobKind::SyncMarketCategories => "sync-market-categories",
            JobKind::SyncSeries => "sync-series",
            JobKind::SyncEvents => "sync-events",
            JobKind::SyncEventDetail => "sync-event-detail",
            JobKind::SyncOrderbook => "sync-orderbook",
            JobKind::SyncCandlesticks => "sync-candlesticks",
            JobKind::ProcessAnalytics => "process-analytics",
            JobKind::CleanupMarket => "cleanup-market",
        }
    }
}

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA busy_timeout = 5000;

CREATE TABLE IF NOT EXISTS bus_messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    queue TEXT NOT NULL,
    payload TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    visible_at INTEGER NOT NULL,
    locked_until INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_bus_messages_queue_visible
    ON bus_messages(queue, visible_at, locked_until);

CREATE TABLE IF NOT EXISTS bus_dead_letters (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    queue TEXT NOT NULL,
    payload TEXT NOT NULL,
    attempts INTEGER NOT NULL,
    reason TEXT NOT NULL,
    dead_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_bus_dead_letters_queue
    ON bus_dead_letters(queue, dead_at DESC);
"#;

/// Retry shape shared by every queue.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    /// How long a reservation holds before the message is redelivered, ms.
    pub visibility_timeout_ms: i64,
}

impl RetryPolicy {
    /// Exponential backoff with jitter for the given (1-based) attempt.
    pub fn backoff_ms(&self, attempt: u32) -> i64 {
        let exp = self
            .backoff_base_ms
            .saturating_mul(1u64 << attempt.saturating_sub(1).min(20));
        let capped = exp.min(self.backoff_cap_ms);
        let jitter = rand::thread_rng().gen_range(0..=self.backoff_base_ms.max(1) / 2);
        (capped + jitter) as i64
    }
}

/// One reserved delivery.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub id: i64,
    pub queue: String,
    pub payload: serde_json::Value,
    /// Deliveries so far, including this one.
    pub attempts: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub name: String,
    pub exists: bool,
    pub messages: i64,
    pub messages_ready: i64,
    pub messages_unacknowledged: i64,
    pub consumers: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Durable bus handle. Cheap to clone; all clones share one connection and
/// the consumer registry.
#[derive(Clone)]
pub struct SqliteBus {
    conn: Arc<Mutex<Connection>>,
    consumers: Arc<RwLock<HashMap<String, usize>>>,
    pub retry: RetryPolicy,
}

impl SqliteBus {
    pub fn new(db_path: &str, retry: RetryPolicy) -> anyhow::Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("Failed to open bus database at {}", db_path))?;
        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize bus schema")?;
        info!("Message bus initialized at: {}", db_path);
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            consumers: Arc::new(RwLock::new(HashMap::new())),
            retry,
        })
    }

    /// Publish one message, immediately visible.
    pub fn publish(&self, kind: JobKind, payload: &serde_json::Value) -> Result<i64, ServiceError> {
        let now = Utc::now().timestamp_millis();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO bus_messages (queue, payload, attempts, visible_at, locked_until, created_at)
             VALUES (?1, ?2, 0, ?3, 0, ?3)",
            params![kind.queue_name(), payload.to_string(), now],
        )
        .map_err(|e| ServiceError::BusUnavailable(format!("publish {}: {e}", kind.queue_name())))?;
        Ok(conn.last_insert_rowid())
    }

    /// Atomically claim up to `max` ready messages from a queue. Claimed
    /// messages stay invisible until acked, nacked, or the visibility
    /// timeout lapses.
    pub fn reserve(&self, queue: &str, max: usize) -> Result<Vec<BusMessage>, ServiceError> {
        let now = Utc::now().timestamp_millis();
        let locked_until = now + self.retry.visibility_timeout_ms;
        let conn = self.conn.lock();

        let mut stmt = conn
            .prepare_cached(
                "UPDATE bus_messages
                 SET locked_until = ?1, attempts = attempts + 1
                 WHERE id IN (
                     SELECT id FROM bus_messages
                     WHERE queue = ?2 AND visible_at <= ?3 AND locked_until <= ?3
                     ORDER BY id ASC LIMIT ?4
                 )
                 RETURNING id, queue, payload, attempts",
            )
            .map_err(ServiceError::from)?;

        let rows = stmt
            .query_map(params![locked_until, queue, now, max as i64], |row| {
                let payload: String = row.get(2)?;
                Ok(BusMessage {
                    id: row.get(0)?,
                    queue: row.get(1)?,
                    payload: serde_json::from_str(&payload)
                        .unwrap_or(serde_json::Value::String(payload)),
                    attempts: row.get::<_, i64>(3)? as u32,
                })
            })
            .map_err(ServiceError::from)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(ServiceError::from)?;
        Ok(rows)
    }

    pub fn ack(&self, id: i64) -> Result<(), ServiceError> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM bus_messages WHERE id = ?1", params![id])
            .map_err(ServiceError::from)?;
        Ok(())
    }

    /// Schedule a redelivery with backoff, or dead-letter once the attempt
    /// budget is spent. Returns true when the message was dead-lettered.
    pub fn nack(&self, msg: &BusMessage, reason: &str) -> Result<bool, ServiceError> {
        if msg.attempts >= self.retry.max_attempts {
            self.dead_letter(msg, reason)?;
            return Ok(true);
        }
        let delay = self.retry.backoff_ms(msg.attempts);
        let visible_at = Utc::now().timestamp_millis() + delay;
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE bus_messages SET visible_at = ?1, locked_until = 0 WHERE id = ?2",
            params![visible_at, msg.id],
        )
        .map_err(ServiceError::from)?;
        Ok(false)
    }

    /// Make a reserved message immediately redeliverable without burning an
    /// attempt (worker shutdown path).
    pub fn release(&self, id: i64) -> Result<(), ServiceError> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE bus_messages
             SET locked_until = 0, attempts = CASE WHEN attempts > 0 THEN attempts - 1 ELSE 0 END
             WHERE id = ?1",
            params![id],
        )
        .map_err(ServiceError::from)?;
        Ok(())
    }

    pub fn dead_letter(&self, msg: &BusMessage, reason: &str) -> Result<(), ServiceError> {
        error!(
            queue = msg.queue,
            id = msg.id,
            attempts = msg.attempts,
            reason,
            "message moved to dead-letter"
        );
        let now = Utc::now().timestamp_millis();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO bus_dead_letters (queue, payload, attempts, reason, dead_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![msg.queue, msg.payload.to_string(), msg.attempts, reason, now],
        )
        .map_err(ServiceError::from)?;
        conn.execute("DELETE FROM bus_messages WHERE id = ?1", params![msg.id])
            .map_err(ServiceError::from)?;
        Ok(())
    }

    pub fn purge(&self, queue: &str) -> Result<usize, ServiceError> {
        let conn = self.conn.lock();
        let n = conn
            .execute("DELETE FROM bus_messages WHERE queue = ?1", params![queue])
            .map_err(ServiceError::from)?;
        Ok(n)
    }

    pub fn stats(&self, queue: &str) -> Result<QueueStats, ServiceError> {
        let now = Utc::now().timestamp_millis();
        let conn = self.conn.lock();
        let (messages, ready, unacked): (i64, i64, i64) = conn
            .query_row(
                "SELECT COUNT(*),
                        COALESCE(SUM(visible_at <= ?2 AND locked_until <= ?2), 0),
                        COALESCE(SUM(locked_until > ?2), 0)
                 FROM bus_messages WHERE queue = ?1",
                params![queue, now],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .map_err(ServiceError::from)?;
        let consumers = self.consumers.read().get(queue).copied().unwrap_or(0);
        Ok(QueueStats {
            name: queue.to_string(),
            exists: true,
            messages,
            messages_ready: ready,
            messages_unacknowledged: unacked,
            consumers,
            error: None,
        })
    }

    pub fn dead_letter_count(&self, queue: &str) -> Result<i64, ServiceError> {
        let conn = self.conn.lock();
        let n = conn
            .query_row(
                "SELECT COUNT(*) FROM bus_dead_letters WHERE queue = ?1",
                params![queue],
                |row| row.get(0),
            )
            .map_err(ServiceError::from)?;
        Ok(n)
    }

    pub(crate) fn register_consumer(&self, queue: &str) {
        *self.consumers.write().entry(queue.to_string()).or_insert(0) += 1;
    }

    pub(crate) fn unregister_consumer(&self, queue: &str) {
        if let Some(n) = self.consumers.write().get_mut(queue) {
            *n = n.saturating_sub(1);
        }
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::{RetryPolicy, SqliteBus};
    use tempfile::TempDir;

    pub fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            backoff_base_ms: 2,
            backoff_cap_ms: 10,
            visibility_timeout_ms: 60_000,
        }
    }

    pub fn temp_bus() -> (SqliteBus, TempDir) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bus.db");
        (
            SqliteBus::new(path.to_str().unwrap(), fast_retry()).unwrap(),
            dir,
        )
    }
}
