//! FIFO hand-off queues between the pipeline and application code.
//!
//! An [`Inbox`] is filled by the pipeline context with [`Inbox::put`], which
//! never blocks, and drained either by blocking threads
//! ([`Inbox::get_blocking`]) or by async tasks ([`Inbox::get`]). Both
//! disciplines pop from the same queue, so FIFO order holds regardless of
//! which one the application uses.

mod manager;

use std::{
    collections::VecDeque,
    fmt,
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

pub use manager::InboxManager;
use tokio::sync::Notify;

/// Error returned when no item arrives before the timeout.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("inbox is empty")]
pub struct InboxEmpty;

struct Shared<T> {
    items: Mutex<VecDeque<T>>,
    available: Condvar,
    notify: Notify,
}

/// Cloneable multi-consumer FIFO queue.
pub struct Inbox<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Inbox<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Default for Inbox<T> {
    fn default() -> Self { Self::new() }
}

impl<T> fmt::Debug for Inbox<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inbox").field("len", &self.len()).finish()
    }
}

impl<T> Inbox<T> {
    /// Create an empty inbox.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                items: Mutex::new(VecDeque::new()),
                available: Condvar::new(),
                notify: Notify::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.shared.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append `item` and wake one waiting consumer.
    pub fn put(&self, item: T) {
        self.lock().push_back(item);
        self.shared.available.notify_one();
        self.shared.notify.notify_one();
    }

    /// Pop the oldest item without waiting.
    #[must_use]
    pub fn try_get(&self) -> Option<T> { self.lock().pop_front() }

    /// Pop the oldest item, blocking the current thread until one arrives.
    ///
    /// With `timeout` set the wait is bounded.
    ///
    /// # Errors
    ///
    /// Returns [`InboxEmpty`] if the timeout elapses first.
    pub fn get_blocking(&self, timeout: Option<Duration>) -> Result<T, InboxEmpty> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut items = self.lock();
        loop {
            if let Some(item) = items.pop_front() {
                return Ok(item);
            }
            match deadline {
                None => {
                    items = self
                        .shared
                        .available
                        .wait(items)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(InboxEmpty);
                    }
                    items = self
                        .shared
                        .available
                        .wait_timeout(items, remaining)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
            }
        }
    }

    /// Pop the oldest item, suspending the current task until one arrives.
    ///
    /// # Errors
    ///
    /// Returns [`InboxEmpty`] if `timeout` elapses first.
    pub async fn get(&self, timeout: Option<Duration>) -> Result<T, InboxEmpty> {
        match timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.next())
                .await
                .map_err(|_| InboxEmpty),
            None => Ok(self.next().await),
        }
    }

    async fn next(&self) -> T {
        loop {
            let notified = self.shared.notify.notified();
            if let Some(item) = self.try_get() {
                return item;
            }
            notified.await;
        }
    }

    /// Whether the inbox currently holds no items.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.lock().is_empty() }

    /// Number of queued items.
    #[must_use]
    pub fn len(&self) -> usize { self.lock().len() }

    /// Discard every queued item.
    pub fn clear(&self) { self.lock().clear(); }
}

#[cfg(test)]
mod tests;
