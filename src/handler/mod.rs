//! Application handlers fed from the inboxes.
//!
//! Instead of polling an inbox, an application can register a handler. The
//! [`HandlerManager`] starts one delivery task per [`HandlerKind`] when the
//! first handler of that kind is set and stops it when the handler is cleared,
//! so at most one task drains each inbox.
//!
//! Handlers come in two flavours. Blocking handlers run on tokio's blocking
//! pool and may call back into a blocking client; async handlers are awaited
//! on the delivery task. Either way items of one kind are handled one at a
//! time, in arrival order, and a panicking handler is reported as a
//! background error instead of killing the task.

mod manager;

use std::{fmt, future::Future, panic::AssertUnwindSafe, sync::Arc};

use futures::{FutureExt, future::BoxFuture};

pub use manager::HandlerManager;

use crate::{
    error::PipelineError,
    panic::{format_panic, run_callback},
};

/// Inbox a delivery task drains.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HandlerKind {
    /// Cloud-to-device and input messages.
    Message,
    /// Direct method requests.
    MethodRequest,
    /// Desired-property patches.
    TwinPatch,
    /// Connection-state changes, token requests and background errors.
    ClientEvent,
}

impl fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Message => "message",
            Self::MethodRequest => "method request",
            Self::TwinPatch => "twin patch",
            Self::ClientEvent => "client event",
        })
    }
}

/// Errors raised when handlers and direct receives are mixed up.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    /// A handler already drains this inbox.
    #[error("cannot receive {0} items directly while a {0} handler is set")]
    HandlerSet(HandlerKind),
    /// The manager has shut down and starts no more tasks.
    #[error("handler manager has shut down")]
    ShutDown,
}

type BlockingFn<T> = Arc<dyn Fn(T) + Send + Sync>;
type AsyncFn<T> = Arc<dyn Fn(T) -> BoxFuture<'static, ()> + Send + Sync>;

/// A registered application handler.
pub(crate) enum Callback<T> {
    Blocking(BlockingFn<T>),
    Async(AsyncFn<T>),
}

impl<T> Clone for Callback<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Blocking(f) => Self::Blocking(Arc::clone(f)),
            Self::Async(f) => Self::Async(Arc::clone(f)),
        }
    }
}

impl<T: Send + 'static> Callback<T> {
    pub(crate) fn blocking(f: impl Fn(T) + Send + Sync + 'static) -> Self { Self::Blocking(Arc::new(f)) }

    pub(crate) fn future<F, Fut>(f: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::Async(Arc::new(move |item| f(item).boxed()))
    }

    /// Run the handler on `item`, containing any panic.
    pub(crate) async fn invoke(&self, item: T) -> Result<(), PipelineError> {
        match self {
            Self::Blocking(f) => {
                let f = Arc::clone(f);
                tokio::task::spawn_blocking(move || run_callback(|| f(item)))
                    .await
                    .unwrap_or_else(|err| Err(PipelineError::CallbackPanicked(err.to_string().into())))
            }
            Self::Async(f) => {
                let f = Arc::clone(f);
                AssertUnwindSafe(async move { f(item).await })
                    .catch_unwind()
                    .await
                    .map_err(|payload| {
                        PipelineError::CallbackPanicked(format_panic(payload).to_string().into())
                    })
            }
        }
    }
}

#[cfg(test)]
mod tests;
