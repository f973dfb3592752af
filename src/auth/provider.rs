//! Scheduled renewal of a shared SAS token.

use std::{fmt, time::Duration};

use tracing::{debug, info};

use super::{SasTokenError, SharedSasToken};
use crate::{clock::Clock, timer::Timer};

/// Default number of seconds before expiry at which a token is renewed.
pub const DEFAULT_RENEWAL_MARGIN: u64 = 120;

type TokenUpdated = Box<dyn Fn(&str) + Send>;

/// Keeps a [`SharedSasToken`] fresh.
///
/// The provider owns a single renewal [`Timer`]. Scheduling replaces any
/// pending timer and dropping the provider cancels it, so a renewal can never
/// fire against a disposed provider.
pub struct AuthenticationProvider {
    token: SharedSasToken,
    margin: Duration,
    timer: Option<Timer>,
    on_token_updated: Option<TokenUpdated>,
}

impl AuthenticationProvider {
    /// Manage `token`, renewing it `margin` before it expires.
    #[must_use]
    pub fn new(token: SharedSasToken, margin: Duration) -> Self {
        Self {
            token,
            margin,
            timer: None,
            on_token_updated: None,
        }
    }

    /// The managed token.
    #[must_use]
    pub fn token(&self) -> &SharedSasToken { &self.token }

    /// Register the callback invoked with the new token after each renewal.
    pub fn on_token_updated(&mut self, callback: impl Fn(&str) + Send + 'static) {
        self.on_token_updated = Some(Box::new(callback));
    }

    /// Time from now until the token should be renewed.
    ///
    /// # Errors
    ///
    /// Returns [`SasTokenError::MarginTooLarge`] when the margin is not
    /// shorter than the token's remaining lifetime at issue.
    pub fn renewal_delay(&self, clock: &dyn Clock) -> Result<Duration, SasTokenError> {
        let now = clock.now_epoch_secs();
        let expiry = self.token.expiry_time();
        let margin = self.margin.as_secs();
        let lifetime = expiry.saturating_sub(now);
        if lifetime <= margin {
            return Err(SasTokenError::MarginTooLarge {
                ttl: lifetime,
                margin,
            });
        }
        Ok(Duration::from_secs(lifetime - margin))
    }

    /// Arm the renewal timer, replacing any pending one.
    ///
    /// `fire` runs once when the renewal is due. Inside a pipeline it posts a
    /// message to the pipeline context rather than renewing directly.
    ///
    /// # Errors
    ///
    /// Propagates [`AuthenticationProvider::renewal_delay`] failures; no timer
    /// is armed in that case.
    pub fn schedule<F>(&mut self, clock: &dyn Clock, fire: F) -> Result<Duration, SasTokenError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.cancel();
        let delay = self.renewal_delay(clock)?;
        debug!(delay_secs = delay.as_secs(), "sas token renewal scheduled");
        self.timer = Some(Timer::start(delay, fire));
        Ok(delay)
    }

    /// Regenerate the token now and notify the update callback once.
    ///
    /// # Errors
    ///
    /// Returns [`SasTokenError::NotRenewable`] for application-supplied tokens
    /// and [`SasTokenError::Signing`] when signing fails; the previous token
    /// stays in place.
    pub fn renew(&mut self) -> Result<String, SasTokenError> {
        self.timer = None;
        let expiry = self.token.refresh()?;
        let token = self.token.current();
        info!(expiry, "sas token renewed");
        if let Some(callback) = &self.on_token_updated {
            callback(&token);
        }
        Ok(token)
    }

    /// Cancel any pending renewal.
    pub fn cancel(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
    }

    /// Whether a renewal timer is armed.
    #[must_use]
    pub fn is_scheduled(&self) -> bool { self.timer.as_ref().is_some_and(|timer| !timer.is_cancelled()) }
}

impl fmt::Debug for AuthenticationProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthenticationProvider")
            .field("margin", &self.margin)
            .field("scheduled", &self.is_scheduled())
            .finish_non_exhaustive()
    }
}

impl Drop for AuthenticationProvider {
    fn drop(&mut self) { self.cancel(); }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        Mutex,
        atomic::{AtomicUsize, Ordering},
    };

    use rstest::rstest;

    use super::*;
    use crate::{
        auth::{RenewableSasToken, SymmetricKeySigner},
        clock::ManualClock,
    };

    const NOW: u64 = 1_700_000_000;

    fn shared(clock: &Arc<ManualClock>, ttl: u64) -> SharedSasToken {
        let signer = Arc::new(SymmetricKeySigner::new("Zm9vYmFy").expect("valid key"));
        SharedSasToken::new(
            RenewableSasToken::with_clock("my.host.name", signer, None, ttl, clock.clone())
                .expect("token"),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn renewal_fires_at_ttl_minus_margin() {
        let clock = Arc::new(ManualClock::new(NOW));
        let mut provider =
            AuthenticationProvider::new(shared(&clock, 3600), Duration::from_secs(300));
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);

        let delay = provider
            .schedule(clock.as_ref(), move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .expect("schedule");
        assert_eq!(delay, Duration::from_secs(3300));

        tokio::time::sleep(Duration::from_secs(3299)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn renew_updates_token_and_notifies_once() {
        let clock = Arc::new(ManualClock::new(NOW));
        let token = shared(&clock, 3600);
        let mut provider = AuthenticationProvider::new(token.clone(), Duration::from_secs(300));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        provider.on_token_updated(move |token| sink.lock().expect("lock").push(token.to_owned()));
        let before = token.current();
        let old_expiry = token.expiry_time();

        clock.advance(3300);
        let renewed = provider.renew().expect("renew");

        assert!(token.expiry_time() > old_expiry);
        assert_ne!(renewed, before);
        assert_eq!(*seen.lock().expect("lock"), vec![renewed]);
    }

    #[rstest]
    #[case::equal(300, 300)]
    #[case::larger(300, 600)]
    fn margin_not_shorter_than_ttl_is_rejected(#[case] ttl: u64, #[case] margin: u64) {
        let clock = Arc::new(ManualClock::new(NOW));
        let provider = AuthenticationProvider::new(shared(&clock, ttl), Duration::from_secs(margin));
        assert!(matches!(
            provider.renewal_delay(clock.as_ref()),
            Err(SasTokenError::MarginTooLarge { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_provider_cancels_pending_renewal() {
        let clock = Arc::new(ManualClock::new(NOW));
        let mut provider = AuthenticationProvider::new(shared(&clock, 60), Duration::from_secs(10));
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        provider
            .schedule(clock.as_ref(), move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .expect("schedule");
        assert!(provider.is_scheduled());

        drop(provider);
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
