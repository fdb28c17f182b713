use crate::{
    analytics::{fingerprint, VisitEvent},
    codegen, db,
    models::Device,
    AppState,
};
use axum::{
    extract::{ConnectInfo, Path, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use std::{net::SocketAddr, sync::Arc};

/// GET /:code
///
/// 1. Reject implausible codes outright so junk paths never touch the
///    cache or the database.
/// 2. Resolve from the in-memory cache (fast path); fall back to the
///    database on a miss and backfill the cache.
/// 3. Enqueue a visit event for the aggregator. The push is a non-blocking
///    queue write; a full queue or broken analytics path can never delay
///    or fail the redirect.
/// 4. Return a 302 redirect to the target URL.
pub async fn redirect(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    if !codegen::is_plausible_code(&code) {
        return not_found();
    }

    let now = chrono::Utc::now().naive_utc();

    // ── 1. Resolve target ──────────────────────────────────────────────────
    let target_url = match state.cache.get(&code) {
        Some(entry) if entry.is_expired(now) => {
            tracing::debug!("expired link '{}' served 404", code);
            state.cache.remove(&code);
            return not_found();
        }
        Some(entry) => entry.target_url,
        None => {
            // Cache miss — check the database
            match db::get_link_by_code(&state.db, &code).await {
                Ok(Some(link)) if link.is_expired(now) => {
                    tracing::debug!("expired link '{}' served 404", code);
                    return not_found();
                }
                Ok(Some(link)) => {
                    // Backfill the cache for next time
                    state.cache.set(&link);
                    link.target_url
                }
                Ok(None) => return not_found(),
                Err(e) => {
                    tracing::error!("DB error looking up short code '{}': {:?}", code, e);
                    return (StatusCode::INTERNAL_SERVER_ERROR, "Internal error").into_response();
                }
            }
        }
    };

    // ── 2. Extract request metadata ────────────────────────────────────────
    let ip = extract_ip(&headers, addr);

    let user_agent = headers
        .get("user-agent")
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);

    let referer = headers
        .get("referer")
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);

    // ── 3. Fire-and-forget visit event ─────────────────────────────────────
    state.analytics.record(VisitEvent {
        code,
        visited_at: now,
        country: None, // resolved by the worker, off the hot path
        device: Device::from_user_agent(user_agent.as_deref()),
        referrer: referrer_host(referer.as_deref()),
        fingerprint: fingerprint(ip.as_deref(), user_agent.as_deref()),
        client_ip: ip,
    });

    // ── 4. Redirect ────────────────────────────────────────────────────────
    found(&target_url)
}

// ── Helpers ────────────────────────────────────────────────────────────────

fn not_found() -> Response {
    (StatusCode::NOT_FOUND, "Short link not found").into_response()
}

/// Build the `302 Found` response. The explicit status matters: clients and
/// crawlers treat 302 as "ask me again next time", which is what keeps every
/// visit flowing through the resolver.
fn found(target_url: &str) -> Response {
    match HeaderValue::try_from(target_url) {
        Ok(location) => (StatusCode::FOUND, [(header::LOCATION, location)]).into_response(),
        Err(_) => {
            tracing::error!("stored target URL is not a valid Location header");
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal error").into_response()
        }
    }
}

/// Determine the real client IP, preferring common proxy headers.
fn extract_ip(headers: &HeaderMap, addr: SocketAddr) -> Option<String> {
    // X-Forwarded-For can be a comma-separated list; take the first entry.
    if let Some(xff) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(ip) = xff.split(',').next().map(str::trim) {
            if !ip.is_empty() {
                return Some(ip.to_owned());
            }
        }
    }

    if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        if !real_ip.is_empty() {
            return Some(real_ip.to_owned());
        }
    }

    Some(addr.ip().to_string())
}

/// Bucket a Referer header down to its host. Anything absent or
/// unparseable counts as a direct visit.
fn referrer_host(referer: Option<&str>) -> Option<String> {
    let raw = referer?.trim();
    if raw.is_empty() {
        return None;
    }
    url::Url::parse(raw)
        .ok()
        .and_then(|u| u.host_str().map(str::to_owned))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "198.51.100.7:443".parse().unwrap()
    }

    #[test]
    fn forwarded_header_wins_over_peer_address() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.9, 10.0.0.1".parse().unwrap());
        headers.insert("x-real-ip", "203.0.113.50".parse().unwrap());

        assert_eq!(extract_ip(&headers, addr()).as_deref(), Some("203.0.113.9"));
    }

    #[test]
    fn real_ip_then_peer_address_fallback() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", "203.0.113.50".parse().unwrap());
        assert_eq!(
            extract_ip(&headers, addr()).as_deref(),
            Some("203.0.113.50")
        );

        let empty = HeaderMap::new();
        assert_eq!(extract_ip(&empty, addr()).as_deref(), Some("198.51.100.7"));
    }

    #[test]
    fn found_is_a_302_with_location() {
        let resp = found("https://example.com/a");
        assert_eq!(resp.status(), StatusCode::FOUND);
        assert_eq!(
            resp.headers().get(header::LOCATION).unwrap(),
            "https://example.com/a"
        );

        assert_eq!(not_found().status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn referrer_buckets_to_host() {
        assert_eq!(
            referrer_host(Some("https://github.com/some/repo")).as_deref(),
            Some("github.com")
        );
        assert_eq!(referrer_host(Some("not a url")), None);
        assert_eq!(referrer_host(Some("")), None);
        assert_eq!(referrer_host(None), None);
    }
}
