//! Recording transport for unit tests inside the crate.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;

use super::{ConnectionArgs, MessageId, Transport, TransportEvent, TransportEventSink, TransportFactory};
use crate::error::TransportError;

/// A call the pipeline made on the transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Call {
    Connect(Option<String>),
    Disconnect,
    Publish { topic: String, payload: Bytes },
    Subscribe(String),
    Unsubscribe(String),
}

#[derive(Default)]
struct State {
    calls: Vec<Call>,
    args: Option<ConnectionArgs>,
    sink: Option<TransportEventSink>,
    next_mid: MessageId,
}

/// Shared view of every transport the factory built.
#[derive(Clone, Default)]
pub(crate) struct Recorder(Arc<Mutex<State>>);

impl Recorder {
    fn lock(&self) -> MutexGuard<'_, State> { self.0.lock().unwrap_or_else(PoisonError::into_inner) }

    pub(crate) fn factory(&self) -> Arc<dyn TransportFactory> {
        let recorder = self.clone();
        Arc::new(move |args: &ConnectionArgs, sink: TransportEventSink| {
            let mut state = recorder.lock();
            state.args = Some(args.clone());
            state.sink = Some(sink);
            Ok::<_, TransportError>(Box::new(RecordingTransport(recorder.clone())) as Box<dyn Transport>)
        })
    }

    pub(crate) fn calls(&self) -> Vec<Call> { self.lock().calls.clone() }

    pub(crate) fn args(&self) -> Option<ConnectionArgs> { self.lock().args.clone() }

    /// Message id of the most recent publish, subscribe or unsubscribe.
    pub(crate) fn last_mid(&self) -> MessageId { self.lock().next_mid }

    /// Topic of the most recent publish.
    pub(crate) fn last_publish(&self) -> Option<(String, Bytes)> {
        self.lock().calls.iter().rev().find_map(|call| match call {
            Call::Publish { topic, payload } => Some((topic.clone(), payload.clone())),
            _ => None,
        })
    }

    pub(crate) fn emit(&self, event: TransportEvent) {
        let sink = self.lock().sink.clone();
        let sink = sink.expect("transport has not been created");
        assert!(sink.emit(event), "pipeline has stopped");
    }

    fn record(&self, call: Call) -> MessageId {
        let mut state = self.lock();
        state.calls.push(call);
        state.next_mid += 1;
        state.next_mid
    }
}

struct RecordingTransport(Recorder);

impl Transport for RecordingTransport {
    fn connect(&mut self, password: Option<&str>) -> Result<(), TransportError> {
        self.0.record(Call::Connect(password.map(str::to_owned)));
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), TransportError> {
        self.0.record(Call::Disconnect);
        Ok(())
    }

    fn publish(&mut self, topic: &str, payload: Bytes) -> Result<MessageId, TransportError> {
        Ok(self.0.record(Call::Publish {
            topic: topic.to_owned(),
            payload,
        }))
    }

    fn subscribe(&mut self, topic: &str) -> Result<MessageId, TransportError> {
        Ok(self.0.record(Call::Subscribe(topic.to_owned())))
    }

    fn unsubscribe(&mut self, topic: &str) -> Result<MessageId, TransportError> {
        Ok(self.0.record(Call::Unsubscribe(topic.to_owned())))
    }
}
