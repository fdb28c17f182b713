use url::Url;

use crate::error::Error;

/// Schemes that must never be stored as redirect targets.
const BLOCKED_SCHEMES: &[&str] = &["javascript", "data", "file", "vbscript", "about", "blob"];

/// Validate a redirect target before anything touches the store.
///
/// Accepts absolute http/https URLs with a host. Returns the trimmed
/// original string so that what the caller sent is exactly what redirects
/// will later serve.
pub fn target_url(raw: &str) -> Result<String, Error> {
    let trimmed = raw.trim();

    if trimmed.is_empty() {
        return Err(Error::InvalidUrl("URL must not be empty".into()));
    }

    let parsed =
        Url::parse(trimmed).map_err(|e| Error::InvalidUrl(format!("{trimmed}: {e}")))?;

    let scheme = parsed.scheme();
    if BLOCKED_SCHEMES.contains(&scheme) {
        return Err(Error::InvalidUrl(format!("scheme '{scheme}:' is not allowed")));
    }
    if scheme != "http" && scheme != "https" {
        return Err(Error::InvalidUrl(format!(
            "scheme '{scheme}:' is not allowed, use http or https"
        )));
    }
    if parsed.host_str().is_none() {
        return Err(Error::InvalidUrl(format!("{trimmed}: missing host")));
    }

    Ok(trimmed.to_owned())
}
