#[macro_use]
extern crate diesel;

pub mod analytics;
pub mod api;
pub mod config;
pub mod connection_pool;
pub mod context;
pub mod error;
pub mod ingest;
pub mod kv;
pub mod library;
pub mod models;
pub mod on_demand;
pub mod queue;
pub mod rate_limit;
pub mod safe_url;
pub mod scheduler;
pub mod schema;
pub mod scrapers;
pub mod search;
pub mod telemetry;
pub mod workers;
