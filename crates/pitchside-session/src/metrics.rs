//! Session metrics
//!
//! - `session_refresh_total` (counter): label `outcome`
//! - `session_forced_logout_total` (counter)
//! - `session_transitions_total` (counter): label `state`
//!
//! Calls are no-ops until a recorder is installed.

/// Record a settled refresh attempt.
pub fn record_refresh(outcome: &'static str) {
    metrics::counter!("session_refresh_total", "outcome" => outcome).increment(1);
}

/// Record a session forcibly ended by a failed refresh.
pub fn record_forced_logout() {
    metrics::counter!("session_forced_logout_total").increment(1);
}

/// Record a published state transition.
pub fn record_transition(state: &'static str) {
    metrics::counter!("session_transitions_total", "state" => state).increment(1);
}
