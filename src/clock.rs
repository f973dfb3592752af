//! Wall-clock abstraction used for credential expiry.
//!
//! Token expiry is expressed in seconds since the Unix epoch, so it cannot be
//! derived from tokio's paused monotonic clock. Tests swap in a
//! [`ManualClock`] to make renewal deterministic.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

/// Source of wall-clock time.
pub trait Clock: Send + Sync {
    /// Seconds elapsed since the Unix epoch.
    fn now_epoch_secs(&self) -> u64;
}

/// [`Clock`] backed by [`SystemTime`].
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_epoch_secs(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |elapsed| elapsed.as_secs())
    }
}

/// Manually advanced [`Clock`].
///
/// ```
/// use hubwire::clock::{Clock, ManualClock};
///
/// let clock = ManualClock::new(1_000);
/// clock.advance(30);
/// assert_eq!(clock.now_epoch_secs(), 1_030);
/// ```
#[derive(Debug, Default)]
pub struct ManualClock(AtomicU64);

impl ManualClock {
    /// Start the clock at `epoch_secs`.
    #[must_use]
    pub fn new(epoch_secs: u64) -> Self { Self(AtomicU64::new(epoch_secs)) }

    /// Move the clock forward by `secs`.
    pub fn advance(&self, secs: u64) { self.0.fetch_add(secs, Ordering::SeqCst); }

    /// Set the clock to an absolute value.
    pub fn set(&self, epoch_secs: u64) { self.0.store(epoch_secs, Ordering::SeqCst); }
}

impl Clock for ManualClock {
    fn now_epoch_secs(&self) -> u64 { self.0.load(Ordering::SeqCst) }
}
