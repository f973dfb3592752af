//! Lifecycle of the per-kind delivery tasks.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError, RwLock},
};

use tokio::runtime::Handle;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, warn};

use super::{Callback, HandlerError, HandlerKind};
use crate::{
    error::PipelineError,
    inbox::{Inbox, InboxManager},
    metrics,
    models::{Message, MethodRequest, TwinPatch},
    pipeline::{ClientEvent, ConnectionState},
};

type Slot<T> = Arc<RwLock<Option<Callback<T>>>>;

fn current<T>(slot: &Slot<T>) -> Option<Callback<T>> {
    slot.read().unwrap_or_else(PoisonError::into_inner).clone()
}

fn replace<T>(slot: &Slot<T>, handler: Option<Callback<T>>) {
    *slot.write().unwrap_or_else(PoisonError::into_inner) = handler;
}

#[derive(Default)]
struct Handlers {
    message: Slot<Message>,
    method_request: Slot<MethodRequest>,
    twin_patch: Slot<TwinPatch>,
    connection_state_change: Slot<ConnectionState>,
    new_sastoken_required: Slot<()>,
    background_error: Slot<PipelineError>,
}

impl Handlers {
    fn wants(&self, kind: HandlerKind) -> bool {
        match kind {
            HandlerKind::Message => current(&self.message).is_some(),
            HandlerKind::MethodRequest => current(&self.method_request).is_some(),
            HandlerKind::TwinPatch => current(&self.twin_patch).is_some(),
            HandlerKind::ClientEvent => {
                current(&self.connection_state_change).is_some()
                    || current(&self.new_sastoken_required).is_some()
                    || current(&self.background_error).is_some()
            }
        }
    }
}

/// Runs application handlers against the inboxes of one client.
///
/// Delivery tasks run on the runtime handle given at construction. Setting a
/// handler while its task runs only swaps the handler; the next item goes to
/// the new one.
pub struct HandlerManager {
    inboxes: Arc<InboxManager>,
    runtime: Handle,
    handlers: Arc<Handlers>,
    tasks: Mutex<HashMap<HandlerKind, CancellationToken>>,
    tracker: TaskTracker,
}

impl HandlerManager {
    /// Create a manager delivering from `inboxes` on `runtime`.
    #[must_use]
    pub fn new(inboxes: Arc<InboxManager>, runtime: Handle) -> Self {
        Self {
            inboxes,
            runtime,
            handlers: Arc::new(Handlers::default()),
            tasks: Mutex::new(HashMap::new()),
            tracker: TaskTracker::new(),
        }
    }

    pub(crate) fn set_message_handler(&self, handler: Option<Callback<Message>>) -> Result<(), HandlerError> {
        replace(&self.handlers.message, handler);
        self.reconcile(HandlerKind::Message)
    }

    pub(crate) fn set_method_request_handler(
        &self,
        handler: Option<Callback<MethodRequest>>,
    ) -> Result<(), HandlerError> {
        replace(&self.handlers.method_request, handler);
        self.reconcile(HandlerKind::MethodRequest)
    }

    pub(crate) fn set_twin_patch_handler(&self, handler: Option<Callback<TwinPatch>>) -> Result<(), HandlerError> {
        replace(&self.handlers.twin_patch, handler);
        self.reconcile(HandlerKind::TwinPatch)
    }

    pub(crate) fn set_connection_state_change_handler(
        &self,
        handler: Option<Callback<ConnectionState>>,
    ) -> Result<(), HandlerError> {
        replace(&self.handlers.connection_state_change, handler);
        self.reconcile(HandlerKind::ClientEvent)
    }

    pub(crate) fn set_new_sastoken_required_handler(
        &self,
        handler: Option<Callback<()>>,
    ) -> Result<(), HandlerError> {
        replace(&self.handlers.new_sastoken_required, handler);
        self.reconcile(HandlerKind::ClientEvent)
    }

    pub(crate) fn set_background_error_handler(
        &self,
        handler: Option<Callback<PipelineError>>,
    ) -> Result<(), HandlerError> {
        replace(&self.handlers.background_error, handler);
        self.reconcile(HandlerKind::ClientEvent)
    }

    /// Whether a delivery task currently drains the `kind` inbox.
    #[must_use]
    pub fn is_running(&self, kind: HandlerKind) -> bool {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&kind)
    }

    /// Fail when a handler owns the `kind` inbox, so a direct receive would
    /// compete with it.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError::HandlerSet`] while a handler of that kind is set.
    pub fn ensure_receivable(&self, kind: HandlerKind) -> Result<(), HandlerError> {
        if self.handlers.wants(kind) {
            return Err(HandlerError::HandlerSet(kind));
        }
        Ok(())
    }

    /// Stop every delivery task and wait for handlers in progress to return.
    pub async fn shutdown(&self) {
        self.stop();
        self.tracker.wait().await;
    }

    /// Stop every delivery task without waiting.
    pub fn stop(&self) {
        self.tracker.close();
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        for (kind, cancel) in tasks.drain() {
            debug!(%kind, "stopping handler task");
            cancel.cancel();
        }
    }

    fn reconcile(&self, kind: HandlerKind) -> Result<(), HandlerError> {
        let wanted = self.handlers.wants(kind);
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        match (wanted, tasks.contains_key(&kind)) {
            (true, false) => {
                if self.tracker.is_closed() {
                    return Err(HandlerError::ShutDown);
                }
                let cancel = CancellationToken::new();
                self.spawn(kind, cancel.clone());
                tasks.insert(kind, cancel);
                info!(%kind, "handler task started");
            }
            (false, true) => {
                if let Some(cancel) = tasks.remove(&kind) {
                    cancel.cancel();
                }
                info!(%kind, "handler task stopped");
            }
            _ => {}
        }
        Ok(())
    }

    fn spawn(&self, kind: HandlerKind, cancel: CancellationToken) {
        let errors = self.inboxes.client_event_inbox();
        let handlers = Arc::clone(&self.handlers);
        match kind {
            HandlerKind::Message => self.tracker.spawn_on(
                deliver(kind, self.inboxes.message_inbox(), handlers.message.clone(), errors, cancel),
                &self.runtime,
            ),
            HandlerKind::MethodRequest => self.tracker.spawn_on(
                deliver(
                    kind,
                    self.inboxes.method_request_inbox(None),
                    handlers.method_request.clone(),
                    errors,
                    cancel,
                ),
                &self.runtime,
            ),
            HandlerKind::TwinPatch => self.tracker.spawn_on(
                deliver(kind, self.inboxes.twin_patch_inbox(), handlers.twin_patch.clone(), errors, cancel),
                &self.runtime,
            ),
            HandlerKind::ClientEvent => {
                self.tracker
                    .spawn_on(deliver_client_events(errors, handlers, cancel), &self.runtime)
            }
        };
    }
}

impl Drop for HandlerManager {
    fn drop(&mut self) { self.stop(); }
}

async fn next<T>(inbox: &Inbox<T>, cancel: &CancellationToken) -> Option<T> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => None,
        item = inbox.get(None) => item.ok(),
    }
}

fn report(kind: HandlerKind, err: PipelineError, errors: &Inbox<ClientEvent>) {
    metrics::inc_background_errors();
    log::error!("handler panicked: kind={kind}, error={err}");
    errors.put(ClientEvent::BackgroundError(err));
}

async fn deliver<T: Send + 'static>(
    kind: HandlerKind,
    inbox: Inbox<T>,
    slot: Slot<T>,
    errors: Inbox<ClientEvent>,
    cancel: CancellationToken,
) {
    while let Some(item) = next(&inbox, &cancel).await {
        let Some(handler) = current(&slot) else {
            warn!(%kind, "handler cleared while delivering; item dropped");
            continue;
        };
        if let Err(err) = handler.invoke(item).await {
            report(kind, err, &errors);
        }
    }
    debug!(%kind, "handler task finished");
}

async fn deliver_client_events(
    inbox: Inbox<ClientEvent>,
    handlers: Arc<Handlers>,
    cancel: CancellationToken,
) {
    while let Some(event) = next(&inbox, &cancel).await {
        let outcome = match event {
            ClientEvent::ConnectionStateChanged(state) => match current(&handlers.connection_state_change) {
                Some(handler) => handler.invoke(state).await,
                None => Ok(()),
            },
            ClientEvent::NewSasTokenRequired => match current(&handlers.new_sastoken_required) {
                Some(handler) => handler.invoke(()).await,
                None => {
                    warn!("sas token expiring and no handler supplies a new one");
                    Ok(())
                }
            },
            ClientEvent::BackgroundError(err) => match current(&handlers.background_error) {
                Some(handler) => handler.invoke(err).await,
                None => {
                    warn!(error = %err, "background error with no handler");
                    Ok(())
                }
            },
        };
        // A failing client-event handler is logged only; requeueing its panic
        // would feed it back to the same task.
        if let Err(err) = outcome {
            metrics::inc_background_errors();
            error!(error = %err, "client event handler panicked");
        }
    }
    debug!(kind = %HandlerKind::ClientEvent, "handler task finished");
}
