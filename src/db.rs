use sqlx::SqlitePool;

use crate::{
    analytics::{VisitEvent, VisitSink},
    cache::LinkCache,
    error::Error,
    models::{Link, LinkWithStats, NewLink, Visit},
};

// ── Warm-up ────────────────────────────────────────────────────────────────

/// Load every link into the in-memory cache at startup. Already-expired
/// links are skipped; they 404 via the database path if ever requested.
pub async fn warm_cache(pool: &SqlitePool, cache: &LinkCache) -> anyhow::Result<()> {
    let links: Vec<Link> = sqlx::query_as(
        "SELECT id, short_code, target_url, title, creator, created_at, expires_at
         FROM links",
    )
    .fetch_all(pool)
    .await?;

    let now = chrono::Utc::now().naive_utc();
    let mut count = 0;
    for link in &links {
        if !link.is_expired(now) {
            cache.set(link);
            count += 1;
        }
    }

    tracing::info!("Cache warmed with {} active link(s)", count);
    Ok(())
}

// ── Links ──────────────────────────────────────────────────────────────────

/// Insert a new link under `code` and return the created row.
///
/// The UNIQUE constraint on short_code is the reservation mechanism: of any
/// number of concurrent inserts for the same code, exactly one succeeds and
/// the rest surface `CodeConflict`. A failed insert leaves nothing behind,
/// so the code is immediately reusable.
pub async fn create_link(pool: &SqlitePool, code: &str, new: &NewLink) -> Result<Link, Error> {
    let result = sqlx::query(
        "INSERT INTO links (short_code, target_url, title, creator, expires_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
    )
    .bind(code)
    .bind(&new.target_url)
    .bind(&new.title)
    .bind(&new.creator)
    .bind(new.expires_at)
    .execute(pool)
    .await;

    let id = match result {
        Ok(done) => done.last_insert_rowid(),
        Err(e) => {
            if let sqlx::Error::Database(ref db_err) = e {
                if db_err.is_unique_violation() {
                    return Err(Error::CodeConflict(code.to_owned()));
                }
            }
            return Err(e.into());
        }
    };

    let link: Link = sqlx::query_as(
        "SELECT id, short_code, target_url, title, creator, created_at, expires_at
         FROM links WHERE id = ?1",
    )
    .bind(id)
    .fetch_one(pool)
    .await?;

    Ok(link)
}

/// Fetch a single link by its short code.
pub async fn get_link_by_code(
    pool: &SqlitePool,
    short_code: &str,
) -> Result<Option<Link>, sqlx::Error> {
    sqlx::query_as(
        "SELECT id, short_code, target_url, title, creator, created_at, expires_at
         FROM links WHERE short_code = ?1",
    )
    .bind(short_code)
    .fetch_optional(pool)
    .await
}

/// Update a link's title, the only mutable field. Returns the updated row,
/// or None if the code is unknown.
pub async fn update_title(
    pool: &SqlitePool,
    short_code: &str,
    title: Option<&str>,
) -> Result<Option<Link>, sqlx::Error> {
    let affected = sqlx::query("UPDATE links SET title = ?1 WHERE short_code = ?2")
        .bind(title)
        .bind(short_code)
        .execute(pool)
        .await?
        .rows_affected();

    if affected == 0 {
        return Ok(None);
    }
    get_link_by_code(pool, short_code).await
}

/// Permanently delete a link. The visit log is retained.
pub async fn delete_link(pool: &SqlitePool, short_code: &str) -> Result<bool, sqlx::Error> {
    let affected = sqlx::query("DELETE FROM links WHERE short_code = ?1")
        .bind(short_code)
        .execute(pool)
        .await?
        .rows_affected();

    Ok(affected > 0)
}

/// Return all links joined with their total visit counts, newest first.
pub async fn list_links_with_stats(
    pool: &SqlitePool,
) -> Result<Vec<LinkWithStats>, sqlx::Error> {
    sqlx::query_as(
        "SELECT l.short_code,
                l.target_url,
                l.title,
                l.created_at,
                l.expires_at,
                COUNT(v.id) AS click_count
         FROM links l
         LEFT JOIN visits v ON v.short_code = l.short_code
         GROUP BY l.id
         ORDER BY l.created_at DESC, l.id DESC",
    )
    .fetch_all(pool)
    .await
}

pub async fn count_links(pool: &SqlitePool) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar("SELECT COUNT(*) FROM links")
        .fetch_one(pool)
        .await
}

// ── Visits ─────────────────────────────────────────────────────────────────

/// Append a batch of visit events inside one transaction. Called from the
/// aggregator worker only, never from a request handler.
pub async fn insert_visits(pool: &SqlitePool, events: &[VisitEvent]) -> Result<(), sqlx::Error> {
    if events.is_empty() {
        return Ok(());
    }

    let mut tx = pool.begin().await?;
    for event in events {
        sqlx::query(
            "INSERT INTO visits (short_code, visited_at, country, device, referrer, fingerprint)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(&event.code)
        .bind(event.visited_at)
        .bind(&event.country)
        .bind(event.device.as_str())
        .bind(&event.referrer)
        .bind(event.fingerprint as i64)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await
}

/// Load the full visit log in event order, for rebuilding aggregates at
/// startup.
pub async fn all_visits(pool: &SqlitePool) -> Result<Vec<Visit>, sqlx::Error> {
    sqlx::query_as(
        "SELECT short_code, visited_at, country, device, referrer, fingerprint
         FROM visits
         ORDER BY visited_at ASC, id ASC",
    )
    .fetch_all(pool)
    .await
}

// ── Durable sink for the aggregator worker ─────────────────────────────────

/// VisitSink backed by the visits table.
pub struct SqliteVisitSink {
    pool: SqlitePool,
}

impl SqliteVisitSink {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl VisitSink for SqliteVisitSink {
    async fn append(&self, events: &[VisitEvent]) -> anyhow::Result<()> {
        insert_visits(&self.pool, events).await?;
        Ok(())
    }
}
