use crate::{
    codegen, db,
    error::Error,
    models::{AnalyticsSnapshot, Link, LinkWithStats, NewLink},
    validate, AppState, Result,
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Redirect},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// ── Request / response types ───────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateLinkRequest {
    pub target_url: String,
    pub custom_code: Option<String>,
    pub title: Option<String>,
    pub creator: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateLinkRequest {
    pub title: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkResponse {
    pub code: String,
    pub short_url: String,
    pub target_url: String,
    pub title: Option<String>,
    pub creator: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl LinkResponse {
    fn new(link: Link, short_url: String) -> Self {
        Self {
            code: link.short_code,
            short_url,
            target_url: link.target_url,
            title: link.title,
            creator: link.creator,
            created_at: DateTime::from_naive_utc_and_offset(link.created_at, Utc),
            expires_at: link
                .expires_at
                .map(|at| DateTime::from_naive_utc_and_offset(at, Utc)),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkSummary {
    pub code: String,
    pub short_url: String,
    pub target_url: String,
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
    pub click_count: i64,
}

impl LinkSummary {
    fn new(row: LinkWithStats, short_url: String) -> Self {
        Self {
            code: row.short_code,
            short_url,
            target_url: row.target_url,
            title: row.title,
            created_at: DateTime::from_naive_utc_and_offset(row.created_at, Utc),
            click_count: row.click_count,
        }
    }
}

// ── Handlers ───────────────────────────────────────────────────────────────

/// GET /
/// Redirect root visitors to the configured fallback URL.
pub async fn index(State(state): State<Arc<AppState>>) -> Redirect {
    Redirect::to(&state.config.root_redirect_url)
}

/// POST /links
///
/// The target URL is validated before anything touches the store, so an
/// invalid request cannot leave a partial mutation behind. Code choice and
/// reservation happen as one unit inside `codegen::create_short_link`.
pub async fn create_link(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateLinkRequest>,
) -> Result<impl IntoResponse> {
    let target_url = validate::target_url(&body.target_url)?;

    let new = NewLink {
        target_url,
        custom_code: trimmed(body.custom_code),
        title: trimmed(body.title),
        creator: trimmed(body.creator),
        expires_at: body.expires_at.map(|at| at.naive_utc()),
    };

    let link = codegen::create_short_link(&state.db, new, state.config.code_length).await?;

    // Make the new link resolvable without waiting for a cache miss.
    state.cache.set(&link);

    tracing::info!("created short link '{}' -> {}", link.short_code, link.target_url);

    let short_url = state.config.short_url(&link.short_code);
    Ok((
        StatusCode::CREATED,
        Json(LinkResponse::new(link, short_url)),
    ))
}

/// GET /links
/// All links with their total click counts, newest first.
pub async fn list_links(State(state): State<Arc<AppState>>) -> Result<Json<Vec<LinkSummary>>> {
    let rows = db::list_links_with_stats(&state.db).await?;
    let links = rows
        .into_iter()
        .map(|row| {
            let short_url = state.config.short_url(&row.short_code);
            LinkSummary::new(row, short_url)
        })
        .collect();
    Ok(Json(links))
}

/// GET /links/:code/analytics
///
/// The mapping store answers "does this code exist"; the aggregator answers
/// everything else. A live link with no visits yet gets a zeroed snapshot.
pub async fn link_analytics(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
) -> Result<Json<AnalyticsSnapshot>> {
    if db::get_link_by_code(&state.db, &code).await?.is_none() {
        return Err(Error::not_found(code));
    }
    Ok(Json(state.analytics.snapshot(&code)))
}

/// PATCH /links/:code
/// Title is the only mutable field of a link.
pub async fn update_link(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
    Json(body): Json<UpdateLinkRequest>,
) -> Result<Json<LinkResponse>> {
    let title = trimmed(body.title);
    match db::update_title(&state.db, &code, title.as_deref()).await? {
        Some(link) => {
            let short_url = state.config.short_url(&link.short_code);
            Ok(Json(LinkResponse::new(link, short_url)))
        }
        None => Err(Error::not_found(code)),
    }
}

/// DELETE /links/:code
/// Removes the mapping; the visit log is kept.
pub async fn delete_link(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
) -> Result<StatusCode> {
    if !db::delete_link(&state.db, &code).await? {
        return Err(Error::not_found(code));
    }

    state.cache.remove(&code);
    state.analytics.remove_code(&code);
    tracing::info!("deleted short link '{}'", code);

    Ok(StatusCode::NO_CONTENT)
}

// ── Private helpers ────────────────────────────────────────────────────────

/// Collapse optional user input down to trimmed, non-empty strings.
fn trimmed(value: Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
}
