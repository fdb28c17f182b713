use dashmap::DashMap;
use serde::Deserialize;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

// ── ip-api.com response shape ──────────────────────────────────────────────

#[derive(Deserialize)]
struct IpApiResponse {
    status: String,
    #[serde(rename = "countryCode")]
    country_code: Option<String>,
}

// ── Service ────────────────────────────────────────────────────────────────

/// IP → ISO country code resolution for visit events.
///
/// Only ever called from the aggregator worker, never on the redirect hot
/// path. Results (including failures) are cached so one IP costs at most
/// one network request per process lifetime, and every request carries a
/// strict timeout so a slow upstream can only delay analytics, not stall
/// the worker for long.
pub struct GeoService {
    client: reqwest::Client,
    cache: DashMap<String, Option<String>>,
}

impl GeoService {
    pub fn new() -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(3))
            .build()?;
        Ok(Self {
            client,
            cache: DashMap::new(),
        })
    }

    /// Resolve the country code for `ip`, or None for private addresses,
    /// upstream failures, and addresses that previously yielded nothing.
    pub async fn lookup_country(&self, ip: &str) -> Option<String> {
        if is_private(ip) {
            return None;
        }

        if let Some(entry) = self.cache.get(ip) {
            return entry.clone();
        }

        let result = self.fetch_country(ip).await;

        // Cache misses too, so failed IPs are not retried endlessly.
        self.cache.insert(ip.to_owned(), result.clone());
        result
    }

    async fn fetch_country(&self, ip: &str) -> Option<String> {
        let url = format!("http://ip-api.com/json/{}?fields=status,countryCode", ip);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| tracing::debug!("geo lookup network error for {}: {}", ip, e))
            .ok()?;

        let body: IpApiResponse = resp
            .json()
            .await
            .map_err(|e| tracing::debug!("geo lookup parse error for {}: {}", ip, e))
            .ok()?;

        if body.status != "success" {
            tracing::debug!("geo lookup returned non-success status for {}", ip);
            return None;
        }

        body.country_code.filter(|c| !c.is_empty())
    }
}

// ── Internal helpers ───────────────────────────────────────────────────────

/// Return `true` for addresses that should never be sent to a public
/// geolocation API: loopback, link-local, private ranges, and IPv6 special
/// addresses.
fn is_private(ip_str: &str) -> bool {
    // Strip IPv6-mapped IPv4 prefix: "::ffff:1.2.3.4" → "1.2.3.4"
    let ip_str = ip_str.strip_prefix("::ffff:").unwrap_or(ip_str);

    match IpAddr::from_str(ip_str) {
        Ok(IpAddr::V4(addr)) => {
            let octets = addr.octets();
            addr.is_loopback()
            || addr.is_link_local()
            || addr.is_unspecified()
            || addr.is_broadcast()
            // 10.x.x.x
            || octets[0] == 10
            // 172.16.x.x – 172.31.x.x
            || (octets[0] == 172 && (16..=31).contains(&octets[1]))
            // 192.168.x.x
            || (octets[0] == 192 && octets[1] == 168)
        }
        Ok(IpAddr::V6(addr)) => {
            addr.is_loopback()
            || addr.is_unspecified()
            // fe80::/10  link-local
            || (addr.segments()[0] & 0xffc0) == 0xfe80
            // fc00::/7   unique-local
            || (addr.segments()[0] & 0xfe00) == 0xfc00
        }
        Err(_) => true, // unparseable → treat as private / skip
    }
}
