use anyhow::{Context, Result};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// SQLite connection string, e.g. "sqlite:./shortly.db"
    pub database_url: String,

    /// Host to bind the HTTP server to, e.g. "0.0.0.0"
    pub host: String,

    /// Port to listen on
    pub port: u16,

    /// Public base URL used when rendering short links, e.g. "https://short.ly"
    /// Must NOT have a trailing slash.
    pub base_url: String,

    /// URL to redirect visitors to when they hit the root path ("/").
    pub root_redirect_url: String,

    /// Length of generated short codes. Collision retries may grow
    /// individual codes beyond this.
    pub code_length: usize,

    /// Per-request deadline applied by the timeout middleware.
    pub request_timeout_secs: u64,

    /// Whether the aggregator worker may call the external geolocation API
    /// to resolve countries for visit events.
    pub geo_lookup_enabled: bool,

    pub analytics: AnalyticsSettings,
}

/// Tunables for the analytics aggregator. These trade memory for exactness
/// and latency for durability; the defaults suit a single instance.
#[derive(Debug, Clone)]
pub struct AnalyticsSettings {
    /// Bounded intake queue size. When full, the OLDEST queued event is
    /// dropped (and counted) so producers never block.
    pub queue_capacity: usize,

    /// How often buffered visit events are appended to the database.
    pub flush_interval_secs: u64,

    /// Maximum fingerprints remembered per code per day window. Beyond
    /// this, further visitors are no longer counted as unique (an
    /// undercount, never an overcount).
    pub unique_window_capacity: usize,

    /// How many recent day windows of fingerprints to retain per code.
    pub unique_window_keep: usize,
}

impl AnalyticsSettings {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }
}

impl AppConfig {
    /// Load configuration from environment variables (populated by dotenvy before this is called).
    pub fn from_env() -> Result<Self> {
        let port = std::env::var("PORT")
            .unwrap_or_else(|_| "3000".into())
            .parse::<u16>()
            .context("PORT must be a valid port number (1–65535)")?;

        let base_url = std::env::var("BASE_URL")
            .unwrap_or_else(|_| format!("http://localhost:{port}"))
            .trim_end_matches('/')
            .to_owned();

        let root_redirect_url = std::env::var("ROOT_REDIRECT_URL")
            .unwrap_or_else(|_| base_url.clone())
            .trim_end_matches('/')
            .to_owned();

        let code_length = parse_env("CODE_LENGTH", 6)?;
        if !(3..=32).contains(&code_length) {
            anyhow::bail!("CODE_LENGTH must be between 3 and 32");
        }

        let analytics = AnalyticsSettings {
            queue_capacity: parse_env("EVENT_QUEUE_CAPACITY", 8192)?,
            flush_interval_secs: parse_env("FLUSH_INTERVAL_SECS", 5)?,
            unique_window_capacity: parse_env("UNIQUE_WINDOW_CAPACITY", 100_000)?,
            unique_window_keep: parse_env("UNIQUE_WINDOW_KEEP", 7)?,
        };
        if analytics.queue_capacity == 0 {
            anyhow::bail!("EVENT_QUEUE_CAPACITY must be at least 1");
        }

        Ok(Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:./shortly.db".into()),
            host: std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port,
            base_url,
            root_redirect_url,
            code_length,
            request_timeout_secs: parse_env("REQUEST_TIMEOUT_SECS", 15)?,
            geo_lookup_enabled: std::env::var("GEO_LOOKUP_ENABLED")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            analytics,
        })
    }

    /// Short URL for a code, e.g. "https://short.ly/demo123".
    pub fn short_url(&self, code: &str) -> String {
        format!("{}/{}", self.base_url, code)
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .parse::<T>()
            .with_context(|| format!("{name} must be a valid number")),
        Err(_) => Ok(default),
    }
}
