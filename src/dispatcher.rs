//! Enqueue side of the pipeline.
//!
//! One `enqueue_*` per job kind, each publishing a single message and leaving
//! a sync_log row. The market-snapshot family runs under a single-flight
//! guard: a TTL'd lock plus a pending-job counter shared through the cache
//! store, so multiple replicas agree on whether a sweep is running.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::bus::{JobKind, SqliteBus};
use crate::cache::CacheStore;
use crate::error::ServiceError;
use crate::store::MarketStore;
use crate::upstream::MarketsFilter;

pub const SNAPSHOT_LOCK_KEY: &str = "sync:market-snapshots:lock";
pub const SNAPSHOT_COUNTER_KEY: &str = "sync:market-snapshots:pending";

/// Payload for `sync-market-snapshots`: the filters, or a resume cursor from
/// a continuation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotSyncJob {
    #[serde(flatten)]
    pub filter: MarketsFilter,
    #[serde(default)]
    pub cursor: Option<String>,
}

/// Payload for `sync-series` / `sync-events` continuations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CursorJob {
    #[serde(default)]
    pub cursor: Option<String>,
}

/// Payload for `sync-event-detail`: one event per message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventDetailJob {
    pub event_ticker: String,
}

/// Payload for per-ticker jobs (`process-analytics`, `cleanup-market`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickerJob {
    pub ticker: String,
}

/// Family status as reported by the control surface.
#[derive(Debug, Clone, Serialize)]
pub struct FamilyStatus {
    pub is_running: bool,
    pub pending_jobs: i64,
    pub message: String,
}

/// Lock + counter pair coordinating one paginated sync family.
#[derive(Clone)]
pub struct SyncFamilyGuard {
    cache: CacheStore,
    lock_key: &'static str,
    counter_key: &'static str,
    holder: String,
    ttl_secs: i64,
}

impl SyncFamilyGuard {
    pub fn new(
        cache: CacheStore,
        lock_key: &'static str,
        counter_key: &'static str,
        ttl_secs: i64,
    ) -> Self {
        Self {
            cache,
            lock_key,
            counter_key,
            holder: Uuid::new_v4().to_string(),
            ttl_secs,
        }
    }

    /// First enqueue of a sweep: acquire the lock and seed the counter at 1.
    /// Fails with `AlreadyInProgress` while a sweep is running.
    pub fn begin(&self) -> Result<(), ServiceError> {
        let acquired = self
            .cache
            .try_acquire_lock(self.lock_key, &self.holder, self.ttl_secs)
            .map_err(ServiceError::internal)?;
        if !acquired {
            return Err(ServiceError::AlreadyInProgress(
                "market snapshot sync".into(),
            ));
        }
        // Stale counter from an expired holder must not leak into this sweep.
        self.cache
            .reset_counter(self.counter_key)
            .map_err(ServiceError::internal)?;
        self.cache
            .incr(self.counter_key, 1)
            .map_err(ServiceError::internal)?;
        Ok(())
    }

    /// A continuation was published; one more message is pending.
    pub fn job_added(&self) -> Result<i64, ServiceError> {
        self.cache
            .incr(self.counter_key, 1)
            .map_err(ServiceError::internal)
    }

    /// A message finished. When the counter drains to zero the family goes
    /// back to idle and the lock is released, whichever worker got here last.
    pub fn job_done(&self) -> Result<i64, ServiceError> {
        let remaining = self
            .cache
            .incr(self.counter_key, -1)
            .map_err(ServiceError::internal)?;
        if remaining <= 0 {
            self.cache
                .reset_counter(self.counter_key)
                .map_err(ServiceError::internal)?;
            self.cache
                .force_release_lock(self.lock_key)
                .map_err(ServiceError::internal)?;
            info!(lock = self.lock_key, "sync family drained, lock released");
        }
        Ok(remaining.max(0))
    }

    /// The sweep failed before any work could complete; roll the guard back.
    pub fn abort(&self) {
        let _ = self.cache.reset_counter(self.counter_key);
        let _ = self.cache.force_release_lock(self.lock_key);
    }

    pub fn status(&self) -> Result<FamilyStatus, ServiceError> {
        let is_running = self
            .cache
            .lock_held(self.lock_key)
            .map_err(ServiceError::internal)?;
        let pending = self
            .cache
            .counter(self.counter_key)
            .map_err(ServiceError::internal)?;
        let message = if is_running {
            format!("sync in progress, {} job(s) pending", pending)
        } else {
            "idle".to_string()
        };
        Ok(FamilyStatus {
            is_running,
            pending_jobs: pending,
            message,
        })
    }
}

/// Publishes jobs and keeps the operational log. Cheap to clone.
#[derive(Clone)]
pub struct JobDispatcher {
    bus: SqliteBus,
    store: MarketStore,
    pub snapshot_guard: SyncFamilyGuard,
    cleanup_retention_days: i64,
}

impl JobDispatcher {
    pub fn new(
        bus: SqliteBus,
        store: MarketStore,
        cache: CacheStore,
        lock_ttl_secs: i64,
        cleanup_retention_days: i64,
    ) -> Self {
        Self {
            bus,
            store,
            snapshot_guard: SyncFamilyGuard::new(
                cache,
                SNAPSHOT_LOCK_KEY,
                SNAPSHOT_COUNTER_KEY,
                lock_ttl_secs,
            ),
            cleanup_retention_days,
        }
    }

    fn log(&self, family: &str, detail: &str) {
        if let Err(e) = self.store.log_enqueue(family, detail, Utc::now().timestamp()) {
            warn!(family, error = %e, "sync_log write failed");
        }
    }

    /// Operator-facing start of a snapshot sweep. Exactly one sweep runs at a
    /// time cluster-wide.
    pub fn enqueue_market_snapshots(
        &self,
        filter: MarketsFilter,
        cursor: Option<String>,
    ) -> Result<(), ServiceError> {
        self.snapshot_guard.begin()?;

        let job = SnapshotSyncJob { filter, cursor };
        let payload = serde_json::to_value(&job).map_err(ServiceError::internal)?;
        if let Err(e) = self.bus.publish(JobKind::SyncMarketSnapshots, &payload) {
            // Nothing was ever pending; do not leave the family wedged.
            self.snapshot_guard.abort();
            return Err(e);
        }
        self.log("market-snapshots", &payload.to_string());
        Ok(())
    }

    pub fn snapshot_status(&self) -> Result<FamilyStatus, ServiceError> {
        self.snapshot_guard.status()
    }

    pub fn enqueue_categories(&self) -> Result<(), ServiceError> {
        self.bus.publish(JobKind::SyncMarketCategories, &json!({}))?;
        self.log("categories", "{}");
        Ok(())
    }

    pub fn enqueue_series(&self, cursor: Option<String>) -> Result<(), ServiceError> {
        let payload =
            serde_json::to_value(CursorJob { cursor }).map_err(ServiceError::internal)?;
        self.bus.publish(JobKind::SyncSeries, &payload)?;
        self.log("series", &payload.to_string());
        Ok(())
    }

    pub fn enqueue_events(&self, cursor: Option<String>) -> Result<(), ServiceError> {
        let payload =
            serde_json::to_value(CursorJob { cursor }).map_err(ServiceError::internal)?;
        self.bus.publish(JobKind::SyncEvents, &payload)?;
        self.log("events", &payload.to_string());
        Ok(())
    }

    pub fn enqueue_event_detail(&self, event_ticker: &str) -> Result<(), ServiceError> {
        if event_ticker.trim().is_empty() {
            return Err(ServiceError::InvalidRequest("empty event ticker".into()));
        }
        let payload = serde_json::to_value(EventDetailJob {
            event_ticker: event_ticker.to_string(),
        })
        .map_err(ServiceError::internal)?;
        self.bus.publish(JobKind::SyncEventDetail, &payload)?;
        self.log("event-detail", event_ticker);
        Ok(())
    }

    pub fn enqueue_orderbook(&self) -> Result<(), ServiceError> {
        self.bus.publish(JobKind::SyncOrderbook, &json!({}))?;
        self.log("orderbook", "{}");
        Ok(())
    }

    pub fn enqueue_candlesticks(&self) -> Result<(), ServiceError> {
        self.bus.publish(JobKind::SyncCandlesticks, &json!({}))?;
        self.log("candlesticks", "{}");
        Ok(())
    }

    /// Fan out one analytics job per watchlisted ticker with any feature
    /// level enabled. Returns the number queued.
    pub fn enqueue_analytics(&self) -> Result<usize, ServiceError> {
        let watchlist = self.store.watchlist().map_err(ServiceError::store)?;
        let mut queued = 0usize;
        for entry in watchlist {
            if !(entry.enable_l1 || entry.enable_l2 || entry.enable_l3) {
                continue;
            }
            let payload = serde_json::to_value(TickerJob {
                ticker: entry.ticker_id.clone(),
            })
            .map_err(ServiceError::internal)?;
            self.bus.publish(JobKind::ProcessAnalytics, &payload)?;
            queued += 1;
        }
        self.log("analytics", &format!("queued {}", queued));
        Ok(queued)
    }

    /// Enumerate settled markets past retention and queue a cascade delete
    /// for each. Returns the number queued.
    pub fn enqueue_cleanup_scan(&self) -> Result<usize, ServiceError> {
        let cutoff = Utc::now().timestamp() - self.cleanup_retention_days * 86_400;
        let tickers = self
            .store
            .settled_tickers_older_than(cutoff)
            .map_err(ServiceError::store)?;
        for ticker in &tickers {
            let payload = serde_json::to_value(TickerJob {
                ticker: ticker.clone(),
            })
            .map_err(ServiceError::internal)?;
            self.bus.publish(JobKind::CleanupMarket, &payload)?;
        }
        self.log("cleanup", &format!("queued {}", tickers.len()));
        Ok(tickers.len())
    }

    pub fn enqueue_cleanup_ticker(&self, ticker: &str) -> Result<(), ServiceError> {
        if ticker.trim().is_empty() {
            return Err(ServiceError::InvalidRequest("empty ticker".into()));
        }
        let payload = serde_json::to_value(TickerJob {
            ticker: ticker.to_string(),
        })
        .map_err(ServiceError::internal)?;
        self.bus.publish(JobKind::CleanupMarket, &payload)?;
        self.log("cleanup", ticker);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::test_util::temp_bus;
    use crate::store::test_util::temp_store;
    use tempfile::TempDir;

    fn fixture() -> (JobDispatcher, Vec<TempDir>) {
        let (bus, d1) = temp_bus();
        let (store, d2) = temp_store();
        let d3 = TempDir::new().unwrap();
        let cache = CacheStore::new(d3.path().join("cache.db").to_str().unwrap()).unwrap();
        (
            JobDispatcher::new(bus, store, cache, 1800, 30),
            vec![d1, d2, d3],
        )
    }

    #[test]
    fn second_snapshot_enqueue_conflicts() {
        let (dispatcher, _dirs) = fixture();
        dispatcher
            .enqueue_market_snapshots(MarketsFilter::default(), None)
            .unwrap();

        let err = dispatcher
            .enqueue_market_snapshots(MarketsFilter::default(), None)
            .unwrap_err();
        assert!(matches!(err, ServiceError::AlreadyInProgress(_)));

        let status = dispatcher.snapshot_status().unwrap();
        assert!(status.is_running);
        assert_eq!(status.pending_jobs, 1);
    }

    #[test]
    fn drained_family_accepts_new_sweep() {
        let (dispatcher, _dirs) = fixture();
        dispatcher
            .enqueue_market_snapshots(MarketsFilter::default(), None)
            .unwrap();

        // Continuation published, then both messages complete.
        dispatcher.snapshot_guard.job_added().unwrap();
        dispatcher.snapshot_guard.job_done().unwrap();
        dispatcher.snapshot_guard.job_done().unwrap();

        let status = dispatcher.snapshot_status().unwrap();
        assert!(!status.is_running);
        assert_eq!(status.pending_jobs, 0);

        dispatcher
            .enqueue_market_snapshots(MarketsFilter::default(), None)
            .unwrap();
    }

    #[test]
    fn duplicate_begin_leaves_counter_untouched() {
        let (dispatcher, _dirs) = fixture();
        dispatcher.snapshot_guard.begin().unwrap();
        let before = dispatcher.snapshot_status().unwrap().pending_jobs;
        assert!(dispatcher.snapshot_guard.begin().is_err());
        let after = dispatcher.snapshot_status().unwrap().pending_jobs;
        assert_eq!(before, after);
    }

    #[test]
    fn analytics_fan_out_respects_flags() {
        let (dispatcher, _dirs) = fixture();
        for (ticker, l1) in [("A", true), ("B", false)] {
            dispatcher
                .store
                .upsert_watchlist(&crate::models::HighPriorityMarket {
                    ticker_id: ticker.into(),
                    priority: 1,
                    enable_l1: l1,
                    enable_l2: false,
                    enable_l3: false,
                    fetch_candlesticks: false,
                    fetch_orderbook: false,
                })
                .unwrap();
        }
        assert_eq!(dispatcher.enqueue_analytics().unwrap(), 1);
    }
}
