//! Boundary between the pipeline and an MQTT client.
//!
//! The pipeline never talks to a socket directly. The transport stage owns a
//! [`Transport`] built by a [`TransportFactory`] and receives everything the
//! client reports through a [`TransportEventSink`], which posts the event to
//! the pipeline context. Transport callbacks therefore never run stage code
//! on a foreign thread.

use std::{fmt, time::Duration};

use bytes::Bytes;

use crate::{
    config::{ProxyOptions, X509},
    error::TransportError,
    pipeline::Dispatcher,
};

#[cfg(feature = "mqtt")]
pub mod mqtt;
#[cfg(test)]
pub(crate) mod test_support;

/// Identifier the transport assigns to a publish, subscribe or unsubscribe.
pub type MessageId = u64;

/// Everything a transport needs to reach the broker.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionArgs {
    /// MQTT client id.
    pub client_id: String,
    /// Broker hostname.
    pub hostname: String,
    /// MQTT username.
    pub username: String,
    /// Trusted root certificate in PEM form.
    pub server_verification_cert: Option<String>,
    /// Client certificate, when authenticating with X.509.
    pub client_certificate: Option<X509>,
    /// Tunnel MQTT over websockets on port 443.
    pub websockets: bool,
    /// OpenSSL-style cipher list; empty for the library default.
    pub cipher: String,
    /// Proxy to tunnel through.
    pub proxy_options: Option<ProxyOptions>,
    /// MQTT keep-alive.
    pub keep_alive: Duration,
}

impl fmt::Debug for ConnectionArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionArgs")
            .field("client_id", &self.client_id)
            .field("hostname", &self.hostname)
            .field("username", &self.username)
            .field("websockets", &self.websockets)
            .field("keep_alive", &self.keep_alive)
            .finish_non_exhaustive()
    }
}

/// Something the transport reports back to the pipeline.
#[derive(Clone, Debug, PartialEq)]
pub enum TransportEvent {
    /// The broker accepted the connection.
    Connected,
    /// A connection attempt failed.
    ConnectionFailed(TransportError),
    /// The connection closed. `None` means the close was requested.
    Disconnected(Option<TransportError>),
    /// A message arrived on a subscribed topic.
    MessageReceived {
        /// Topic the message arrived on.
        topic: String,
        /// Raw payload.
        payload: Bytes,
    },
    /// The broker acknowledged a publish.
    Published(MessageId),
    /// The broker acknowledged a subscribe.
    Subscribed(MessageId),
    /// The broker acknowledged an unsubscribe.
    Unsubscribed(MessageId),
}

impl TransportEvent {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::ConnectionFailed(_) => "connection_failed",
            Self::Disconnected(_) => "disconnected",
            Self::MessageReceived { .. } => "message_received",
            Self::Published(_) => "published",
            Self::Subscribed(_) => "subscribed",
            Self::Unsubscribed(_) => "unsubscribed",
        }
    }
}

/// Channel through which a transport reports [`TransportEvent`]s.
///
/// Emitting never blocks. Events emitted after the pipeline has stopped are
/// dropped.
#[derive(Clone)]
pub struct TransportEventSink {
    dispatcher: Dispatcher,
}

impl TransportEventSink {
    pub(crate) fn new(dispatcher: Dispatcher) -> Self { Self { dispatcher } }

    /// Report `event` to the pipeline. Returns `false` when the pipeline has
    /// stopped.
    pub fn emit(&self, event: TransportEvent) -> bool { self.dispatcher.transport_event(event) }
}

impl fmt::Debug for TransportEventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportEventSink").finish_non_exhaustive()
    }
}

/// A non-blocking MQTT client.
///
/// Every method only initiates the request; its outcome arrives later as a
/// [`TransportEvent`]. Publish, subscribe and unsubscribe return the
/// [`MessageId`] the matching acknowledgement will carry.
pub trait Transport: Send {
    /// Start connecting, authenticating with `password` when given.
    ///
    /// # Errors
    ///
    /// Returns an error when the attempt cannot be started at all.
    fn connect(&mut self, password: Option<&str>) -> Result<(), TransportError>;

    /// Start disconnecting.
    ///
    /// # Errors
    ///
    /// Returns an error when the request cannot be issued.
    fn disconnect(&mut self) -> Result<(), TransportError>;

    /// Publish `payload` to `topic` at QoS 1.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::NotConnected`] without a connection.
    fn publish(&mut self, topic: &str, payload: Bytes) -> Result<MessageId, TransportError>;

    /// Subscribe to `topic` at QoS 1.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::NotConnected`] without a connection.
    fn subscribe(&mut self, topic: &str) -> Result<MessageId, TransportError>;

    /// Unsubscribe from `topic`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::NotConnected`] without a connection.
    fn unsubscribe(&mut self, topic: &str) -> Result<MessageId, TransportError>;
}

/// Builds the [`Transport`] once connection arguments are known.
pub trait TransportFactory: Send + Sync {
    /// Create a transport for `args` that reports through `events`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Unsupported`] for options the transport
    /// cannot honour.
    fn create(
        &self,
        args: &ConnectionArgs,
        events: TransportEventSink,
    ) -> Result<Box<dyn Transport>, TransportError>;
}

impl<F> TransportFactory for F
where
    F: Fn(&ConnectionArgs, TransportEventSink) -> Result<Box<dyn Transport>, TransportError>
        + Send
        + Sync,
{
    fn create(
        &self,
        args: &ConnectionArgs,
        events: TransportEventSink,
    ) -> Result<Box<dyn Transport>, TransportError> {
        self(args, events)
    }
}
