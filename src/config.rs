//! Runtime configuration, loaded from the environment with per-tunable
//! defaults. A `.env` file in the crate directory (or its parent) is honored.

use std::env;
use std::path::PathBuf;

fn env_string(key: &str, default: &str) -> String {
    env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

/// Resolve a data file path: absolute values pass through, relative values are
/// anchored to the crate directory so running from elsewhere does not create a
/// stray database.
pub fn resolve_data_path(env_value: Option<String>, default_filename: &str) -> String {
    let base = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    let Some(raw) = env_value.filter(|v| !v.trim().is_empty()) else {
        return base.join(default_filename).to_string_lossy().to_string();
    };

    let p = PathBuf::from(raw);
    if p.is_absolute() {
        return p.to_string_lossy().to_string();
    }
    base.join(p).to_string_lossy().to_string()
}

#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite file backing the analytical store, bus, cache, and locks.
    pub database_path: String,
    pub bind_addr: String,

    pub upstream_base_url: String,
    pub upstream_api_key: Option<String>,
    /// Per-call deadline for upstream requests, seconds.
    pub upstream_timeout_secs: u64,

    /// Page size for list-markets pulls.
    pub market_page_limit: u32,

    /// In-flight message bound per queue worker.
    pub queue_prefetch: usize,
    /// Batch size for the event-detail consumer.
    pub event_detail_batch: usize,
    /// Idle poll interval for queue workers, milliseconds.
    pub queue_poll_ms: u64,
    /// Retry attempts before a message is dead-lettered.
    pub max_attempts: u32,
    /// Base delay for exponential retry backoff, milliseconds.
    pub backoff_base_ms: u64,
    /// Backoff ceiling, milliseconds.
    pub backoff_cap_ms: u64,
    /// Redelivery window for reserved-but-unacked messages, seconds.
    pub visibility_timeout_secs: i64,

    /// Single-flight lock TTL, seconds.
    pub sync_lock_ttl_secs: i64,
    /// Cleanup retention threshold, days.
    pub cleanup_retention_days: i64,
    /// Stored daily candles younger than this are served without refetching,
    /// seconds.
    pub candle_freshness_secs: i64,
    /// Window fetched when a ticker has no stored candles, days.
    pub candle_bootstrap_days: i64,
}

impl Config {
    pub fn from_env() -> Config {
        let database_path = resolve_data_path(
            env::var("DB_PATH").or_else(|_| env::var("DATABASE_PATH")).ok(),
            "marketsync.db",
        );

        Config {
            database_path,
            bind_addr: env_string("BIND_ADDR", "0.0.0.0:3000"),
            upstream_base_url: env_string(
                "EXCHANGE_BASE_URL",
                "https://api.elections.kalshi.com/trade-api/v2",
            ),
            upstream_api_key: env::var("EXCHANGE_API_KEY")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            upstream_timeout_secs: env_parse("EXCHANGE_TIMEOUT_SECS", 30),
            market_page_limit: env_parse("MARKET_PAGE_LIMIT", 250),
            queue_prefetch: env_parse("QUEUE_PREFETCH", 4),
            event_detail_batch: env_parse("EVENT_DETAIL_BATCH", 10),
            queue_poll_ms: env_parse("QUEUE_POLL_MS", 250),
            max_attempts: env_parse("QUEUE_MAX_ATTEMPTS", 5),
            backoff_base_ms: env_parse("QUEUE_BACKOFF_BASE_MS", 500),
            backoff_cap_ms: env_parse("QUEUE_BACKOFF_CAP_MS", 60_000),
            visibility_timeout_secs: env_parse("QUEUE_VISIBILITY_TIMEOUT_SECS", 300),
            sync_lock_ttl_secs: env_parse("SYNC_LOCK_TTL_SECS", 1800),
            cleanup_retention_days: env_parse("CLEANUP_RETENTION_DAYS", 30),
            candle_freshness_secs: env_parse("CANDLE_FRESHNESS_SECS", 86_400),
            candle_bootstrap_days: env_parse("CANDLE_BOOTSTRAP_DAYS", 30),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            database_path: ":memory:".to_string(),
            bind_addr: "127.0.0.1:0".to_string(),
            upstream_base_url: "http://localhost:0".to_string(),
            upstream_api_key: None,
            upstream_timeout_secs: 30,
            market_page_limit: 250,
            queue_prefetch: 4,
            event_detail_batch: 10,
            queue_poll_ms: 25,
            max_attempts: 5,
            backoff_base_ms: 10,
            backoff_cap_ms: 100,
            visibility_timeout_secs: 300,
            sync_lock_ttl_secs: 1800,
            cleanup_retention_days: 30,
            candle_freshness_secs: 86_400,
            candle_bootstrap_days: 30,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default();
        assert_eq!(cfg.market_page_limit, 250);
        assert_eq!(cfg.event_detail_batch, 10);
        assert!(cfg.backoff_cap_ms >= cfg.backoff_base_ms);
    }
}
