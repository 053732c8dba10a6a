//! Access token expiry inspection
//!
//! Access tokens are opaque to the session layer with one exception: when
//! they are JWT-shaped the `exp` claim is read so the background task can
//! refresh ahead of expiry. Signatures are not verified.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;

/// Unix timestamp (seconds) at which `access_token` expires, if it is a
/// JWT carrying a numeric `exp` claim.
pub fn token_expiry(access_token: &str) -> Option<u64> {
    let mut parts = access_token.split('.');
    let (_header, payload, _signature) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() {
        return None;
    }

    // Some issuers pad anyway
    let decoded = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&decoded).ok()?;
    match claims.get("exp")? {
        serde_json::Value::Number(n) => n.as_u64().or_else(|| n.as_f64().map(|f| f as u64)),
        _ => None,
    }
}

/// Seconds until expiry relative to `now`, saturating at zero.
pub fn seconds_until_expiry(access_token: &str, now: u64) -> Option<u64> {
    token_expiry(access_token).map(|exp| exp.saturating_sub(now))
}
