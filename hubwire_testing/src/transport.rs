//! Scriptable in-memory transport.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use bytes::Bytes;
use hubwire::{
    TransportError,
    transport::{ConnectionArgs, MessageId, Transport, TransportEvent, TransportEventSink, TransportFactory},
};

/// A call the pipeline made on the transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    /// `connect`, with the password when SAS authentication is used.
    Connect {
        /// SAS token presented as the password.
        password: Option<String>,
    },
    /// `disconnect`.
    Disconnect,
    /// `publish`.
    Publish {
        /// Destination topic.
        topic: String,
        /// Message body.
        payload: Bytes,
    },
    /// `subscribe`.
    Subscribe(String),
    /// `unsubscribe`.
    Unsubscribe(String),
}

type Responder = Box<dyn FnMut(&str, &Bytes) -> Vec<TransportEvent> + Send>;

struct State {
    calls: Vec<Call>,
    args: Option<ConnectionArgs>,
    sink: Option<TransportEventSink>,
    next_mid: MessageId,
    auto_ack: bool,
    connect_failures: VecDeque<TransportError>,
    responders: Vec<(String, Responder)>,
}

/// In-memory stand-in for an MQTT connection.
///
/// Clones share state, so a test keeps one handle while the pipeline owns the
/// transports built by [`MockTransport::factory`]. With auto-acknowledgement
/// on, every call is answered as a broker would answer it; events are posted
/// to the pipeline and handled after the current call returns.
#[derive(Clone)]
pub struct MockTransport(Arc<Mutex<State>>);

impl Default for MockTransport {
    fn default() -> Self { Self::new() }
}

impl MockTransport {
    /// A transport that acknowledges everything.
    #[must_use]
    pub fn new() -> Self { Self::with_auto_ack(true) }

    /// A transport that answers nothing until the test emits events.
    #[must_use]
    pub fn manual() -> Self { Self::with_auto_ack(false) }

    fn with_auto_ack(auto_ack: bool) -> Self {
        Self(Arc::new(Mutex::new(State {
            calls: Vec::new(),
            args: None,
            sink: None,
            next_mid: 0,
            auto_ack,
            connect_failures: VecDeque::new(),
            responders: Vec::new(),
        })))
    }

    fn lock(&self) -> MutexGuard<'_, State> { self.0.lock().unwrap_or_else(PoisonError::into_inner) }

    /// Factory to hand to `ClientOptions::transport`.
    #[must_use]
    pub fn factory(&self) -> Arc<dyn TransportFactory> {
        let mock = self.clone();
        Arc::new(move |args: &ConnectionArgs, sink: TransportEventSink| {
            let mut state = mock.lock();
            state.args = Some(args.clone());
            state.sink = Some(sink);
            Ok::<_, TransportError>(Box::new(Connection(mock.clone())) as Box<dyn Transport>)
        })
    }

    /// Answer the next connect with `ConnectionFailed(err)` instead of
    /// `Connected`. Failures queue up; manual transports ignore them.
    pub fn fail_next_connect(&self, err: TransportError) { self.lock().connect_failures.push_back(err); }

    /// Answer publishes whose topic starts with `prefix` with the events
    /// `respond` returns, after the publish acknowledgement. `respond` runs
    /// under the transport lock and must not call back into it.
    pub fn on_publish(
        &self,
        prefix: impl Into<String>,
        respond: impl FnMut(&str, &Bytes) -> Vec<TransportEvent> + Send + 'static,
    ) {
        self.lock().responders.push((prefix.into(), Box::new(respond)));
    }

    /// Every call so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<Call> { self.lock().calls.clone() }

    /// Topics subscribed to so far.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<String> {
        self.lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                Call::Subscribe(topic) => Some(topic.clone()),
                _ => None,
            })
            .collect()
    }

    /// Publishes so far.
    #[must_use]
    pub fn publishes(&self) -> Vec<(String, Bytes)> {
        self.lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                Call::Publish { topic, payload } => Some((topic.clone(), payload.clone())),
                _ => None,
            })
            .collect()
    }

    /// Number of connect calls so far.
    #[must_use]
    pub fn connects(&self) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|call| matches!(call, Call::Connect { .. }))
            .count()
    }

    /// Arguments of the most recently built transport.
    #[must_use]
    pub fn args(&self) -> Option<ConnectionArgs> { self.lock().args.clone() }

    /// Post `event` to the pipeline. Returns `false` if no transport exists
    /// yet or the pipeline has stopped.
    pub fn emit(&self, event: TransportEvent) -> bool {
        let sink = self.lock().sink.clone();
        sink.is_some_and(|sink| sink.emit(event))
    }

    /// Simulate the broker dropping the connection.
    pub fn drop_connection(&self, err: TransportError) -> bool {
        self.emit(TransportEvent::Disconnected(Some(err)))
    }

    fn record(&self, call: Call) -> MessageId {
        let mut state = self.lock();
        state.calls.push(call);
        state.next_mid += 1;
        state.next_mid
    }

    fn answer(&self, events: impl IntoIterator<Item = TransportEvent>) {
        let state = self.lock();
        if !state.auto_ack {
            return;
        }
        if let Some(sink) = &state.sink {
            for event in events {
                sink.emit(event);
            }
        }
    }

    fn responses(&self, topic: &str, payload: &Bytes) -> Vec<TransportEvent> {
        let mut state = self.lock();
        if !state.auto_ack {
            return Vec::new();
        }
        state
            .responders
            .iter_mut()
            .filter(|(prefix, _)| topic.starts_with(prefix.as_str()))
            .flat_map(|(_, respond)| respond(topic, payload))
            .collect()
    }
}

/// Request id carried in a `$rid=` query parameter.
///
/// # Panics
///
/// Panics if `topic` carries no request id.
#[must_use]
pub fn request_id(topic: &str) -> String {
    let query = topic
        .split_once("$rid=")
        .map(|(_, query)| query)
        .unwrap_or_else(|| panic!("topic '{topic}' carries no request id"));
    query.split('&').next().unwrap_or_default().to_owned()
}

struct Connection(MockTransport);

impl Transport for Connection {
    fn connect(&mut self, password: Option<&str>) -> Result<(), TransportError> {
        self.0.record(Call::Connect {
            password: password.map(str::to_owned),
        });
        let failure = self.0.lock().connect_failures.pop_front();
        self.0.answer([match failure {
            Some(err) => TransportEvent::ConnectionFailed(err),
            None => TransportEvent::Connected,
        }]);
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), TransportError> {
        self.0.record(Call::Disconnect);
        self.0.answer([TransportEvent::Disconnected(None)]);
        Ok(())
    }

    fn publish(&mut self, topic: &str, payload: Bytes) -> Result<MessageId, TransportError> {
        let mid = self.0.record(Call::Publish {
            topic: topic.to_owned(),
            payload: payload.clone(),
        });
        let mut events = vec![TransportEvent::Published(mid)];
        events.extend(self.0.responses(topic, &payload));
        self.0.answer(events);
        Ok(mid)
    }

    fn subscribe(&mut self, topic: &str) -> Result<MessageId, TransportError> {
        let mid = self.0.record(Call::Subscribe(topic.to_owned()));
        self.0.answer([TransportEvent::Subscribed(mid)]);
        Ok(mid)
    }

    fn unsubscribe(&mut self, topic: &str) -> Result<MessageId, TransportError> {
        let mid = self.0.record(Call::Unsubscribe(topic.to_owned()));
        self.0.answer([TransportEvent::Unsubscribed(mid)]);
        Ok(mid)
    }
}
