//! MarketSync - prediction-market data curation service.
//!
//! Wires the store, bus, cache, upstream client, queue consumers, optional
//! schedulers, and the HTTP control surface, then serves until shutdown.

use anyhow::{Context, Result};
use clap::Parser;
use dotenv::dotenv;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use marketsync_backend::{
    api::{self, AppState},
    bus::{RetryPolicy, SqliteBus},
    cache::CacheStore,
    charts::ChartService,
    config::Config,
    dispatcher::JobDispatcher,
    error::ServiceError,
    store::MarketStore,
    sync::spawn_consumers,
    upstream::{ExchangeApi, ExchangeRestClient, MarketsFilter},
};

#[derive(Parser, Debug)]
#[command(name = "marketsync", about = "Prediction-market data curation service")]
struct Args {
    /// Listen address override (BIND_ADDR otherwise).
    #[arg(long)]
    bind: Option<String>,
    /// Database path override (DB_PATH otherwise).
    #[arg(long)]
    db: Option<String>,
}

fn load_env() {
    // Standard dotenv search (cwd + parents), then the crate directory for
    // runs started with --manifest-path from elsewhere.
    let _ = dotenv();
    let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
    let candidates = [manifest_dir.join(".env"), manifest_dir.join("../.env")];
    for p in candidates {
        if p.exists() {
            let _ = dotenv::from_path(&p);
        }
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "marketsync_backend=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn env_interval(key: &str, default_secs: u64) -> Option<Duration> {
    let secs = std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default_secs);
    (secs > 0).then(|| Duration::from_secs(secs))
}

/// Periodic enqueues so the pipeline runs without an operator in the loop.
/// Every interval is env-tunable; 0 disables that family.
fn spawn_schedulers(dispatcher: JobDispatcher, shutdown: watch::Receiver<bool>) {
    struct Schedule {
        name: &'static str,
        interval: Option<Duration>,
        run: Box<dyn Fn(&JobDispatcher) -> Result<(), ServiceError> + Send + Sync>,
    }

    let schedules = vec![
        Schedule {
            name: "market-snapshots",
            interval: env_interval("SNAPSHOT_SYNC_INTERVAL_SECS", 900),
            run: Box::new(|d| {
                match d.enqueue_market_snapshots(MarketsFilter::default(), None) {
                    // A sweep still draining is not an error for the scheduler.
                    Err(ServiceError::AlreadyInProgress(_)) => Ok(()),
                    other => other,
                }
            }),
        },
        Schedule {
            name: "categories",
            interval: env_interval("CATEGORIES_SYNC_INTERVAL_SECS", 21_600),
            run: Box::new(|d| d.enqueue_categories()),
        },
        Schedule {
            name: "series",
            interval: env_interval("SERIES_SYNC_INTERVAL_SECS", 21_600),
            run: Box::new(|d| d.enqueue_series(None)),
        },
        Schedule {
            name: "events",
            interval: env_interval("EVENTS_SYNC_INTERVAL_SECS", 21_600),
            run: Box::new(|d| d.enqueue_events(None)),
        },
        Schedule {
            name: "orderbook",
            interval: env_interval("ORDERBOOK_SYNC_INTERVAL_SECS", 300),
            run: Box::new(|d| d.enqueue_orderbook()),
        },
        Schedule {
            name: "candlesticks",
            interval: env_interval("CANDLES_SYNC_INTERVAL_SECS", 3_600),
            run: Box::new(|d| d.enqueue_candlesticks()),
        },
        Schedule {
            name: "analytics",
            interval: env_interval("ANALYTICS_INTERVAL_SECS", 600),
            run: Box::new(|d| d.enqueue_analytics().map(|_| ())),
        },
        Schedule {
            name: "cleanup",
            interval: env_interval("CLEANUP_INTERVAL_SECS", 86_400),
            run: Box::new(|d| d.enqueue_cleanup_scan().map(|_| ())),
        },
    ];

    for schedule in schedules {
        let Some(interval) = schedule.interval else {
            info!(family = schedule.name, "scheduler disabled");
            continue;
        };
        let dispatcher = dispatcher.clone();
        let mut shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The immediate first tick would race startup; skip it.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = (schedule.run)(&dispatcher) {
                            warn!(family = schedule.name, error = %e, "scheduled enqueue failed");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        });
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    init_tracing();

    let args = Args::parse();
    if let Some(db) = &args.db {
        std::env::set_var("DB_PATH", db);
    }
    let cfg = Config::from_env();
    let bind_addr = args.bind.clone().unwrap_or_else(|| cfg.bind_addr.clone());

    info!("MarketSync starting");
    info!(db = cfg.database_path, "store path resolved");

    let store = MarketStore::new(&cfg.database_path)?;
    let cache = CacheStore::new(&cfg.database_path)?;
    let bus = SqliteBus::new(
        &cfg.database_path,
        RetryPolicy {
            max_attempts: cfg.max_attempts,
            backoff_base_ms: cfg.backoff_base_ms,
            backoff_cap_ms: cfg.backoff_cap_ms,
            visibility_timeout_ms: cfg.visibility_timeout_secs * 1000,
        },
    )?;

    if cfg.upstream_api_key.is_none() {
        warn!("EXCHANGE_API_KEY not set - running against public endpoints only");
    }
    let api_client: Arc<dyn ExchangeApi> =
        Arc::new(ExchangeRestClient::new(&cfg).context("exchange client")?);

    let dispatcher = JobDispatcher::new(
        bus.clone(),
        store.clone(),
        cache.clone(),
        cfg.sync_lock_ttl_secs,
        cfg.cleanup_retention_days,
    );
    let chart_service = Arc::new(ChartService::new(
        store.clone(),
        api_client.clone(),
        cfg.candle_freshness_secs,
        cfg.candle_bootstrap_days,
    ));

    // Shutdown fan-out: consumers and schedulers watch this channel.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let workers = spawn_consumers(
        &cfg,
        store.clone(),
        bus.clone(),
        api_client,
        dispatcher.clone(),
        chart_service.clone(),
        shutdown_rx.clone(),
    );
    info!(workers = workers.len(), "queue consumers running");

    spawn_schedulers(dispatcher.clone(), shutdown_rx.clone());

    // Cache hygiene: evict expired KV rows periodically.
    {
        let cache = cache.clone();
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(300));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Ok(evicted) = cache.evict_expired() {
                            if evicted > 0 {
                                info!(evicted, "expired cache entries removed");
                            }
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        });
    }

    let app_state = AppState {
        dispatcher,
        bus,
        store,
        charts: chart_service,
    };
    let app = api::router(app_state)
        .layer(CorsLayer::permissive())
        .layer(axum::middleware::from_fn(
            marketsync_backend::middleware::logging::request_logging,
        ));

    let listener = TcpListener::bind(&bind_addr).await?;
    info!(addr = bind_addr, "control surface listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received, draining consumers");
            let _ = shutdown_tx.send(true);
        })
        .await
        .context("Server error")?;

    for worker in workers {
        let _ = worker.await;
    }
    info!("MarketSync stopped");
    Ok(())
}
