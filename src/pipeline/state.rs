//! Connection state and the data shared by every stage.

use std::{fmt, sync::Arc};

use tokio::sync::watch;

use super::event::{ClientEvent, EventSink, Inbound};
use crate::config::PipelineConfig;

/// Logical connection state as seen by the application.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Not connected and not trying to be.
    #[default]
    Disconnected,
    /// A connection attempt is in flight.
    Connecting,
    /// Connected.
    Connected,
    /// A disconnect is in flight.
    Disconnecting,
    /// The connection dropped and a reconnect is scheduled.
    ReconnectPending,
}

impl ConnectionState {
    /// Stable lower-case name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnecting => "disconnecting",
            Self::ReconnectPending => "reconnect_pending",
        }
    }

    /// Whether the state is [`ConnectionState::Connected`].
    #[must_use]
    pub fn is_connected(self) -> bool { self == Self::Connected }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// State owned by the pipeline context and visible to every stage.
///
/// Only code running on the pipeline context can reach a `Nucleus`, so plain
/// fields suffice; the connection state is mirrored into a watch channel for
/// readers elsewhere.
pub(crate) struct Nucleus {
    pub(crate) config: Arc<PipelineConfig>,
    /// The transport reports a live connection.
    pub(crate) connected: bool,
    /// The application wants to be connected.
    pub(crate) desired_connection: bool,
    state: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,
    sink: Arc<dyn EventSink>,
    next_timer: u64,
}

impl Nucleus {
    pub(crate) fn new(config: Arc<PipelineConfig>, sink: Arc<dyn EventSink>) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            config,
            connected: false,
            desired_connection: false,
            state: ConnectionState::Disconnected,
            state_tx,
            sink,
            next_timer: 0,
        }
    }

    pub(crate) fn state(&self) -> ConnectionState { self.state }

    pub(crate) fn subscribe_state(&self) -> watch::Receiver<ConnectionState> { self.state_tx.subscribe() }

    /// Record `state`, notifying watchers and the application when it changed.
    pub(crate) fn publish_state(&mut self, state: ConnectionState) {
        if self.state == state {
            return;
        }
        self.state = state;
        self.state_tx.send_replace(state);
        self.sink
            .deliver(Inbound::Client(ClientEvent::ConnectionStateChanged(state)));
    }

    pub(crate) fn deliver(&self, inbound: Inbound) { self.sink.deliver(inbound); }

    pub(crate) fn next_timer_id(&mut self) -> u64 {
        self.next_timer += 1;
        self.next_timer
    }
}
