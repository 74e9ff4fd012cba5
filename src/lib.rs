//! MarketSync backend library.
//!
//! Ingests prediction-market data from the exchange REST API and curates it
//! into a queryable analytical store: point-in-time snapshots, OHLC history,
//! orderbook depth and diff events, and tiered features for watchlisted
//! markets. Work moves through durable per-kind queues; operators drive and
//! observe the pipeline over HTTP.

pub mod analytics;
pub mod api;
pub mod bus;
pub mod cache;
pub mod charts;
pub mod cleanup;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod middleware;
pub mod models;
pub mod orderbook;
pub mod store;
pub mod sync;
pub mod testing;
pub mod upstream;
