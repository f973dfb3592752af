//! Metric helpers for `hubwire`.
//!
//! This module defines metric names and simple helper functions
//! wrapping the [`metrics`](https://docs.rs/metrics) crate. With the
//! `metrics` feature disabled every helper compiles to a no-op.

#[cfg(feature = "metrics")]
use metrics::{counter, gauge};

/// Name of the gauge tracking whether the transport is connected.
pub const CONNECTED: &str = "hubwire_connected";
/// Name of the counter tracking completed operations.
pub const OPERATIONS_COMPLETED: &str = "hubwire_operations_completed_total";
/// Name of the counter tracking reconnection attempts.
pub const RECONNECT_ATTEMPTS: &str = "hubwire_reconnect_attempts_total";
/// Name of the counter tracking operations re-issued after a transient failure.
pub const RETRIES: &str = "hubwire_retries_total";
/// Name of the counter tracking SAS token renewals.
pub const TOKEN_RENEWALS: &str = "hubwire_token_renewals_total";
/// Name of the counter tracking background errors.
pub const BACKGROUND_ERRORS: &str = "hubwire_background_errors_total";
/// Name of the counter tracking timers that fired after their pipeline stopped.
pub const LEAKED_TIMERS: &str = "hubwire_leaked_timers_total";

/// Outcome of a completed operation.
#[derive(Clone, Copy, Debug)]
pub enum Outcome {
    /// The operation succeeded.
    Success,
    /// The operation failed with a transient error.
    Transient,
    /// The operation failed with a fatal error.
    Fatal,
}

impl Outcome {
    #[cfg(feature = "metrics")]
    fn as_str(self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Transient => "transient",
            Outcome::Fatal => "fatal",
        }
    }
}

/// Record the transport's connection state.
pub fn set_connected(connected: bool) {
    #[cfg(feature = "metrics")]
    gauge!(CONNECTED).set(if connected { 1.0 } else { 0.0 });
    #[cfg(not(feature = "metrics"))]
    let _ = connected;
}

/// Record a completed operation.
pub fn inc_completed(outcome: Outcome) {
    #[cfg(feature = "metrics")]
    counter!(OPERATIONS_COMPLETED, "outcome" => outcome.as_str()).increment(1);
    #[cfg(not(feature = "metrics"))]
    let _ = outcome;
}

/// Record a reconnection attempt.
pub fn inc_reconnect_attempts() {
    #[cfg(feature = "metrics")]
    counter!(RECONNECT_ATTEMPTS).increment(1);
}

/// Record an operation being retried.
pub fn inc_retries() {
    #[cfg(feature = "metrics")]
    counter!(RETRIES).increment(1);
}

/// Record a SAS token renewal.
pub fn inc_token_renewals() {
    #[cfg(feature = "metrics")]
    counter!(TOKEN_RENEWALS).increment(1);
}

/// Record a background error.
pub fn inc_background_errors() {
    #[cfg(feature = "metrics")]
    counter!(BACKGROUND_ERRORS).increment(1);
}

/// Record a timer that fired after its pipeline was torn down.
pub fn inc_leaked_timers() {
    #[cfg(feature = "metrics")]
    counter!(LEAKED_TIMERS).increment(1);
}
