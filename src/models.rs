use std::collections::BTreeMap;

use chrono::NaiveDateTime;
use serde::Serialize;
use woothee::parser::Parser;

/// A shortened link record from the `links` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Link {
    pub id: i64,
    pub short_code: String,
    pub target_url: String,
    pub title: Option<String>,
    pub creator: Option<String>,
    pub created_at: NaiveDateTime,
    pub expires_at: Option<NaiveDateTime>,
}

impl Link {
    pub fn is_expired(&self, now: NaiveDateTime) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }
}

/// Validated input for creating a link. The short code is chosen separately
/// by the code generator.
#[derive(Debug, Clone)]
pub struct NewLink {
    pub target_url: String,
    pub custom_code: Option<String>,
    pub title: Option<String>,
    pub creator: Option<String>,
    pub expires_at: Option<NaiveDateTime>,
}

/// A link row joined with its total visit count, used for listings.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct LinkWithStats {
    pub short_code: String,
    pub target_url: String,
    pub title: Option<String>,
    pub created_at: NaiveDateTime,
    pub expires_at: Option<NaiveDateTime>,
    pub click_count: i64,
}

/// A persisted visit event from the `visits` table. Append-only; raw client
/// IP and user agent never reach this table, only the derived fields.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Visit {
    pub short_code: String,
    pub visited_at: NaiveDateTime,
    pub country: Option<String>,
    pub device: String,
    pub referrer: Option<String>,
    pub fingerprint: i64,
}

// ── Device classification ──────────────────────────────────────────────────

/// Coarse device category derived from the User-Agent header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Device {
    Mobile,
    Desktop,
    Tablet,
    Unknown,
}

impl Device {
    pub fn as_str(&self) -> &'static str {
        match self {
            Device::Mobile => "mobile",
            Device::Desktop => "desktop",
            Device::Tablet => "tablet",
            Device::Unknown => "unknown",
        }
    }

    /// Classify a User-Agent string.
    ///
    /// woothee has no tablet category, so tablets are detected by substring
    /// before falling back to its classifier.
    pub fn from_user_agent(ua: Option<&str>) -> Self {
        let ua = match ua {
            Some(s) if !s.is_empty() => s,
            _ => return Device::Unknown,
        };

        if ua.contains("iPad") || ua.contains("Tablet") {
            return Device::Tablet;
        }

        match Parser::new().parse(ua) {
            Some(result) => match result.category {
                "pc" => Device::Desktop,
                "smartphone" | "mobilephone" => Device::Mobile,
                _ => Device::Unknown,
            },
            None => Device::Unknown,
        }
    }
}

impl std::str::FromStr for Device {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "mobile" => Device::Mobile,
            "desktop" => Device::Desktop,
            "tablet" => Device::Tablet,
            _ => Device::Unknown,
        })
    }
}

// ── Analytics snapshot ─────────────────────────────────────────────────────

/// Per-code analytics aggregate. Derived state: recomputable at any time by
/// replaying the visit log for the code.
///
/// BTreeMaps keep the JSON output and snapshot comparisons deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsSnapshot {
    pub code: String,
    pub total_clicks: u64,
    pub unique_visitors: u64,
    pub countries: BTreeMap<String, u64>,
    pub referrers: BTreeMap<String, u64>,
    pub devices: BTreeMap<String, u64>,
}
