//! Shortly — a URL-shortener redirect/analytics service.
//!
//! The crate is split along the service's seams:
//! - `db` + `cache`: durable mapping store with an in-memory hot-path cache
//! - `codegen`: collision-safe short-code generation and reservation
//! - `analytics`: bounded-queue visit aggregation, decoupled from redirects
//! - `handlers`: the JSON API and the redirect hot path
//!
//! This library target exists so integration tests can drive the service
//! layers directly; the `shortly` binary is a thin composition in `main.rs`.

pub mod analytics;
pub mod cache;
pub mod codegen;
pub mod config;
pub mod db;
pub mod error;
pub mod geo;
pub mod handlers;
pub mod models;
pub mod validate;

pub use error::{Error, Result};

use std::sync::Arc;

use analytics::Aggregator;
use cache::LinkCache;
use config::AppConfig;

// ── Shared application state ───────────────────────────────────────────────

pub struct AppState {
    pub db: sqlx::SqlitePool,
    pub config: AppConfig,
    pub cache: LinkCache,
    /// Visit-event intake and per-code aggregates. Handlers only ever push
    /// events or read snapshots; the background worker owns everything else.
    pub analytics: Arc<Aggregator>,
}
