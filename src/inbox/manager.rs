//! Routing of inbound items into per-kind inboxes.

use dashmap::DashMap;
use tracing::debug;

use super::Inbox;
use crate::{
    models::{Message, MethodRequest, TwinPatch},
    pipeline::{ClientEvent, EventSink, Inbound},
};

/// Owns every inbox a device or module client exposes.
///
/// Cloud-to-device and input messages share the message inbox. Method
/// requests go to a per-name inbox when one has been requested, otherwise to
/// the generic method inbox.
#[derive(Debug, Default)]
pub struct InboxManager {
    messages: Inbox<Message>,
    generic_method_requests: Inbox<MethodRequest>,
    named_method_requests: DashMap<String, Inbox<MethodRequest>>,
    twin_patches: Inbox<TwinPatch>,
    client_events: Inbox<ClientEvent>,
}

impl InboxManager {
    /// Create a manager with empty inboxes.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Inbox receiving cloud-to-device and input messages.
    #[must_use]
    pub fn message_inbox(&self) -> Inbox<Message> { self.messages.clone() }

    /// Inbox for requests to `method_name`, or the generic inbox for `None`.
    ///
    /// Named inboxes are created on first use.
    #[must_use]
    pub fn method_request_inbox(&self, method_name: Option<&str>) -> Inbox<MethodRequest> {
        match method_name {
            Some(name) => self
                .named_method_requests
                .entry(name.to_owned())
                .or_default()
                .clone(),
            None => self.generic_method_requests.clone(),
        }
    }

    /// Inbox receiving desired-property patches.
    #[must_use]
    pub fn twin_patch_inbox(&self) -> Inbox<TwinPatch> { self.twin_patches.clone() }

    /// Inbox receiving connection-state changes and background errors.
    #[must_use]
    pub fn client_event_inbox(&self) -> Inbox<ClientEvent> { self.client_events.clone() }

    /// Route a cloud-to-device or input message.
    pub fn route_message(&self, message: Message) { self.messages.put(message); }

    /// Route a method request to its named inbox, falling back to the generic
    /// inbox.
    pub fn route_method_request(&self, request: MethodRequest) {
        if let Some(inbox) = self.named_method_requests.get(&request.name) {
            inbox.put(request);
            return;
        }
        debug!(method = %request.name, "routing method request to generic inbox");
        self.generic_method_requests.put(request);
    }

    /// Route a desired-property patch.
    pub fn route_twin_patch(&self, patch: TwinPatch) { self.twin_patches.put(patch); }

    /// Route a client event.
    pub fn route_client_event(&self, event: ClientEvent) { self.client_events.put(event); }

    /// Route any inbound item to its inbox.
    pub fn route(&self, inbound: Inbound) {
        match inbound {
            Inbound::Message(message) => self.route_message(message),
            Inbound::MethodRequest(request) => self.route_method_request(request),
            Inbound::TwinPatch(patch) => self.route_twin_patch(patch),
            Inbound::Client(event) => self.route_client_event(event),
        }
    }

    /// Drop every queued method request.
    pub fn clear_all_method_requests(&self) {
        self.generic_method_requests.clear();
        for inbox in &self.named_method_requests {
            inbox.value().clear();
        }
    }
}

impl EventSink for InboxManager {
    fn deliver(&self, inbound: Inbound) { self.route(inbound); }
}
