//! Owned, cancellable one-shot timers.
//!
//! A [`Timer`] belongs to exactly one owner (a stage or an authentication
//! provider). Dropping or cancelling it guarantees the callback never runs, so
//! cancellation on disposal is visible at the type level.

use std::time::Duration;

use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// One-shot timer firing a callback after a delay unless cancelled first.
#[derive(Debug)]
#[must_use = "dropping a Timer cancels it"]
pub struct Timer {
    cancel: CancellationToken,
    delay: Duration,
}

impl Timer {
    /// Spawn a timer on the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime, like [`tokio::spawn`].
    pub fn start<F>(delay: Duration, fire: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self::start_on(&Handle::current(), delay, fire)
    }

    /// Spawn a timer on `handle`.
    pub fn start_on<F>(handle: &Handle, delay: Duration, fire: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        handle.spawn(async move {
            tokio::select! {
                biased;
                () = token.cancelled() => debug!(?delay, "timer cancelled"),
                () = tokio::time::sleep(delay) => {
                    if !token.is_cancelled() {
                        fire();
                    }
                }
            }
        });
        Self { cancel, delay }
    }

    /// Cancel the timer. Idempotent.
    pub fn cancel(&self) { self.cancel.cancel(); }

    /// Delay the timer was started with.
    #[must_use]
    pub fn delay(&self) -> Duration { self.delay }

    /// Whether the timer has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool { self.cancel.is_cancelled() }
}

impl Drop for Timer {
    fn drop(&mut self) { self.cancel.cancel(); }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn fires_after_delay() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let _timer = Timer::start(Duration::from_secs(5), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_timer_never_fires() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let timer = Timer::start(Duration::from_secs(1), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        drop(timer);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
