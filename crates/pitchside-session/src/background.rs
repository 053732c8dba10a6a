//! Proactive background token refresh
//!
//! Periodically checks the access token's `exp` claim and refreshes ahead
//! of expiry, so most requests never pay for a 401 round trip. Goes through
//! the same coordinator as request-time refresh, so the two never race.
//! Opaque (non-JWT) tokens are left to request-time refresh.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use pitchside_auth::seconds_until_expiry;
use tracing::{debug, info, warn};

use crate::manager::SessionManager;
use crate::refresh::RefreshOutcome;

/// Spawn a task that refreshes the access token when it is within
/// `threshold` of expiry, checking every `interval`.
pub fn spawn_refresh_task(
    manager: Arc<SessionManager>,
    interval: Duration,
    threshold: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // First tick completes immediately; the session was just restored
        ticker.tick().await;

        loop {
            ticker.tick().await;
            refresh_cycle(&manager, threshold, unix_now()).await;
        }
    })
}

/// Run one check. Returns the refresh outcome if a refresh was attempted.
pub(crate) async fn refresh_cycle(
    manager: &SessionManager,
    threshold: Duration,
    now: u64,
) -> Option<RefreshOutcome> {
    let token = manager.credentials().access_token()?.to_string();
    let Some(expires_in) = seconds_until_expiry(&token, now) else {
        debug!("access token carries no expiry, skipping proactive refresh");
        return None;
    };

    if expires_in > threshold.as_secs() {
        return None;
    }

    debug!(
        expires_in,
        "access token expiring within threshold, refreshing"
    );
    let outcome = manager.coordinator().refresh_after(Some(&token)).await;
    match &outcome {
        RefreshOutcome::Refreshed => info!("background token refresh succeeded"),
        RefreshOutcome::Failed(failure) if failure.expires_session() => {
            warn!(?failure, "background refresh ended the session");
        }
        RefreshOutcome::Failed(failure) => {
            warn!(?failure, "background refresh failed, will retry next cycle");
        }
    }
    Some(outcome)
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
