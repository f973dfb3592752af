//! Events travel up the pipeline toward the application.

use bytes::Bytes;

use super::{operation::Response, state::ConnectionState};
use crate::{
    error::PipelineError,
    models::{Message, MethodRequest, TwinPatch},
};

/// Something a stage reports to the stages above it.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Event {
    /// The transport connected.
    Connected,
    /// The transport disconnected.
    Disconnected,
    /// The logical connection state changed.
    StateChanged(ConnectionState),
    /// Raw message from the transport, before translation.
    IncomingMessage { topic: String, payload: Bytes },
    /// Response to a correlated request.
    Response { request_id: String, response: Response },
    /// Cloud-to-device or input message.
    Message(Message),
    /// Direct method invocation.
    MethodRequest(MethodRequest),
    /// Desired-property patch.
    TwinPatch(TwinPatch),
    /// An application-supplied token is about to expire.
    NewSasTokenRequired,
}

impl Event {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::StateChanged(_) => "state_changed",
            Self::IncomingMessage { .. } => "incoming_message",
            Self::Response { .. } => "response",
            Self::Message(_) => "message",
            Self::MethodRequest(_) => "method_request",
            Self::TwinPatch(_) => "twin_patch",
            Self::NewSasTokenRequired => "new_sas_token_required",
        }
    }
}

/// Notification about the client itself, as opposed to data from the service.
#[derive(Clone, Debug)]
pub enum ClientEvent {
    /// The connection state changed.
    ConnectionStateChanged(ConnectionState),
    /// The application must supply a fresh SAS token.
    NewSasTokenRequired,
    /// A failure not attributable to any caller's operation.
    BackgroundError(PipelineError),
}

/// Anything the pipeline hands to the application.
#[derive(Clone, Debug)]
pub enum Inbound {
    /// Cloud-to-device or input message.
    Message(Message),
    /// Direct method invocation.
    MethodRequest(MethodRequest),
    /// Desired-property patch.
    TwinPatch(TwinPatch),
    /// Client event.
    Client(ClientEvent),
}

/// Receiver of everything the pipeline delivers upward.
///
/// `deliver` runs on the pipeline context and must not block.
pub trait EventSink: Send + Sync {
    /// Accept one inbound item.
    fn deliver(&self, inbound: Inbound);
}
