use chrono::NaiveDateTime;
use dashmap::DashMap;
use std::sync::Arc;

use crate::models::Link;

/// What the redirect hot path needs to serve a code without a DB hit.
#[derive(Debug, Clone)]
pub struct CachedLink {
    pub target_url: String,
    pub expires_at: Option<NaiveDateTime>,
}

impl CachedLink {
    pub fn is_expired(&self, now: NaiveDateTime) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }
}

/// Thread-safe in-memory cache mapping short_code -> CachedLink.
///
/// Backed by a DashMap so reads are concurrent and lock-free for most cases.
/// The cache is warmed on startup by loading all links from the database,
/// then kept in sync via explicit insert/remove calls from the handlers
/// after every write operation. Expiry is cached too, so expired links 404
/// without ever reaching the database.
#[derive(Clone, Debug, Default)]
pub struct LinkCache {
    inner: Arc<DashMap<String, CachedLink>>,
}

impl LinkCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or update a mapping from a full link row.
    pub fn set(&self, link: &Link) {
        self.inner.insert(
            link.short_code.clone(),
            CachedLink {
                target_url: link.target_url.clone(),
                expires_at: link.expires_at,
            },
        );
    }

    /// Look up a short code. Returns a clone of the cached entry if present.
    pub fn get(&self, short_code: &str) -> Option<CachedLink> {
        self.inner.get(short_code).map(|v| v.clone())
    }

    /// Remove a mapping (e.g. when a link is deleted or found expired).
    pub fn remove(&self, short_code: &str) {
        self.inner.remove(short_code);
    }

    /// Number of entries currently cached.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
