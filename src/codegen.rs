use rand::Rng;
use sqlx::SqlitePool;

use crate::{
    db,
    error::Error,
    models::{Link, NewLink},
};

/// 62-character alphanumeric alphabet for generated codes.
const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Custom codes must be 3–32 alphanumeric characters.
const CUSTOM_CODE_MIN: usize = 3;
const CUSTOM_CODE_MAX: usize = 32;

/// Total insert attempts for a generated code before giving up. At 62^6
/// combinations a single collision is already rare; exhausting the budget
/// means the code space is effectively full.
const RETRY_BUDGET: u32 = 16;

/// After this many consecutive collisions the code length is extended by
/// one, growing the random space so retry cost stays bounded as the store
/// fills.
const GROW_AFTER: u32 = 4;

// ── Validation ─────────────────────────────────────────────────────────────

/// Validate a caller-supplied custom code.
pub fn validate_custom_code(code: &str) -> Result<(), Error> {
    if code.len() < CUSTOM_CODE_MIN || code.len() > CUSTOM_CODE_MAX {
        return Err(Error::InvalidCode(format!(
            "'{code}' must be {CUSTOM_CODE_MIN}–{CUSTOM_CODE_MAX} characters"
        )));
    }
    if !code.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(Error::InvalidCode(format!(
            "'{code}' may only contain letters and digits"
        )));
    }
    Ok(())
}

/// Cheap shape check used by the redirect path to reject junk before it
/// reaches the cache or the database.
pub fn is_plausible_code(code: &str) -> bool {
    !code.is_empty()
        && code.len() <= CUSTOM_CODE_MAX
        && code.chars().all(|c| c.is_ascii_alphanumeric())
}

// ── Generation ─────────────────────────────────────────────────────────────

/// Generate a random alphanumeric string of the given length.
pub fn random_code(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

/// Pick a short code for `new` and commit it to the store as one unit.
///
/// There is no separate "is this code free?" check: the link INSERT itself
/// is the reservation, so no window exists in which two callers can both
/// observe the same code as available.
///
/// Custom codes get a single attempt; a collision is the caller's error.
/// Generated codes retry on collision with a fresh draw, extending the
/// length after repeated collisions, until the retry budget runs out.
pub async fn create_short_link(
    pool: &SqlitePool,
    new: NewLink,
    code_length: usize,
) -> Result<Link, Error> {
    if let Some(ref custom) = new.custom_code {
        validate_custom_code(custom)?;
        return db::create_link(pool, custom, &new).await;
    }

    let mut len = code_length;
    for attempt in 1..=RETRY_BUDGET {
        let code = random_code(len);
        match db::create_link(pool, &code, &new).await {
            Ok(link) => return Ok(link),
            Err(Error::CodeConflict(_)) => {
                tracing::debug!(
                    "generated code collision (attempt {}/{}, length {})",
                    attempt,
                    RETRY_BUDGET,
                    len
                );
                if attempt % GROW_AFTER == 0 {
                    len += 1;
                }
            }
            Err(e) => return Err(e),
        }
    }

    tracing::error!(
        "short code generation exhausted its retry budget of {}",
        RETRY_BUDGET
    );
    Err(Error::GenerationExhausted(RETRY_BUDGET))
}
