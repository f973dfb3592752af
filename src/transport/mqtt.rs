//! [`Transport`] backed by `rumqttc`.
//!
//! Each connect builds a fresh `rumqttc` client and spawns a task that polls
//! its event loop, translating packets into [`TransportEvent`]s. The task
//! stops at the first connection error; reconnecting is the pipeline's
//! decision, not the client's.
//!
//! `rumqttc` does not return packet ids from its request methods. Requests
//! are queued in order, and the event loop reports each outgoing packet id in
//! the same order, so local ids are paired with packet ids first-in
//! first-out.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use bytes::Bytes;
use rumqttc::{
    AsyncClient,
    ClientError,
    ConnectReturnCode,
    ConnectionError,
    Event,
    EventLoop,
    MqttOptions,
    Outgoing,
    Packet,
    QoS,
    TlsConfiguration,
};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ConnectionArgs, MessageId, Transport, TransportEvent, TransportEventSink, TransportFactory};
use crate::error::TransportError;

const MQTT_TLS_PORT: u16 = 8883;
const WEBSOCKET_PORT: u16 = 443;
const WEBSOCKET_PATH: &str = "/$iothub/websocket";
const REQUEST_CAPACITY: usize = 64;

/// Builds [`MqttTransport`]s on the runtime the pipeline runs on.
#[derive(Clone, Copy, Debug, Default)]
pub struct MqttTransportFactory;

impl TransportFactory for MqttTransportFactory {
    fn create(
        &self,
        args: &ConnectionArgs,
        events: TransportEventSink,
    ) -> Result<Box<dyn Transport>, TransportError> {
        let runtime = Handle::try_current()
            .map_err(|err| TransportError::Other(format!("no tokio runtime: {err}")))?;
        if let Some(proxy) = &args.proxy_options {
            warn!(proxy = %proxy.address, "proxy ignored; the mqtt transport connects directly");
        }
        if !args.cipher.is_empty() {
            warn!(cipher = %args.cipher, "cipher list ignored; tls uses the library cipher suites");
        }
        tls_configuration(args)?;
        Ok(Box::new(MqttTransport {
            args: args.clone(),
            events,
            runtime,
            inflight: Arc::new(Mutex::new(Inflight::default())),
            session: None,
            next_mid: 0,
        }))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum Request {
    Publish,
    Subscribe,
    Unsubscribe,
}

/// Pairs local message ids with broker packet ids.
#[derive(Debug, Default)]
struct Inflight {
    awaiting_pkid: HashMap<Request, VecDeque<MessageId>>,
    by_pkid: HashMap<(Request, u16), MessageId>,
}

impl Inflight {
    fn queued(&mut self, request: Request, mid: MessageId) {
        self.awaiting_pkid.entry(request).or_default().push_back(mid);
    }

    /// The event loop sent `request` with packet id `pkid`.
    fn sent(&mut self, request: Request, pkid: u16) {
        match self.awaiting_pkid.get_mut(&request).and_then(VecDeque::pop_front) {
            Some(mid) => {
                self.by_pkid.insert((request, pkid), mid);
            }
            None => debug!(?request, pkid, "outgoing packet without a local request"),
        }
    }

    fn acked(&mut self, request: Request, pkid: u16) -> Option<MessageId> {
        self.by_pkid.remove(&(request, pkid))
    }

    fn clear(&mut self) {
        self.awaiting_pkid.clear();
        self.by_pkid.clear();
    }
}

struct Session {
    client: AsyncClient,
    cancel: CancellationToken,
}

impl Drop for Session {
    fn drop(&mut self) { self.cancel.cancel(); }
}

/// MQTT 3.1.1 over TLS or secure websockets.
pub struct MqttTransport {
    args: ConnectionArgs,
    events: TransportEventSink,
    runtime: Handle,
    inflight: Arc<Mutex<Inflight>>,
    session: Option<Session>,
    next_mid: MessageId,
}

impl MqttTransport {
    fn inflight(&self) -> MutexGuard<'_, Inflight> { lock(&self.inflight) }

    fn request(
        &mut self,
        request: Request,
        send: impl FnOnce(&AsyncClient) -> Result<(), ClientError>,
    ) -> Result<MessageId, TransportError> {
        let session = self.session.as_ref().ok_or(TransportError::NotConnected)?;
        let mid = self.next_mid + 1;
        // Queue before sending so the event loop cannot report the packet id
        // first.
        self.inflight().queued(request, mid);
        let sent = send(&session.client);
        self.next_mid = mid;
        if let Err(err) = sent {
            if let Some(queue) = self.inflight().awaiting_pkid.get_mut(&request) {
                queue.pop_back();
            }
            return Err(TransportError::Other(err.to_string()));
        }
        Ok(mid)
    }
}

impl Transport for MqttTransport {
    fn connect(&mut self, password: Option<&str>) -> Result<(), TransportError> {
        self.session = None;
        self.inflight().clear();
        let options = mqtt_options(&self.args, password)?;
        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let cancel = CancellationToken::new();
        info!(host = %self.args.hostname, client_id = %self.args.client_id, "mqtt connecting");
        self.runtime.spawn(drive(
            eventloop,
            self.events.clone(),
            self.inflight.clone(),
            cancel.clone(),
        ));
        self.session = Some(Session { client, cancel });
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), TransportError> {
        let Some(session) = self.session.as_ref() else {
            self.events.emit(TransportEvent::Disconnected(None));
            return Ok(());
        };
        if let Err(err) = session.client.try_disconnect() {
            debug!(error = %err, "disconnect request failed; closing the event loop");
            self.session = None;
            self.events.emit(TransportEvent::Disconnected(None));
        }
        Ok(())
    }

    fn publish(&mut self, topic: &str, payload: Bytes) -> Result<MessageId, TransportError> {
        self.request(Request::Publish, |client| {
            client.try_publish(topic, QoS::AtLeastOnce, false, payload)
        })
    }

    fn subscribe(&mut self, topic: &str) -> Result<MessageId, TransportError> {
        self.request(Request::Subscribe, |client| client.try_subscribe(topic, QoS::AtLeastOnce))
    }

    fn unsubscribe(&mut self, topic: &str) -> Result<MessageId, TransportError> {
        self.request(Request::Unsubscribe, |client| client.try_unsubscribe(topic))
    }
}

fn lock(inflight: &Mutex<Inflight>) -> MutexGuard<'_, Inflight> {
    inflight.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn drive(
    mut eventloop: EventLoop,
    events: TransportEventSink,
    inflight: Arc<Mutex<Inflight>>,
    cancel: CancellationToken,
) {
    let mut connected = false;
    loop {
        let polled = tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            polled = eventloop.poll() => polled,
        };
        let event = match polled {
            Ok(Event::Incoming(packet)) => match incoming(packet, &inflight) {
                Some(TransportEvent::Connected) => {
                    connected = true;
                    TransportEvent::Connected
                }
                Some(event) => event,
                None => continue,
            },
            Ok(Event::Outgoing(outgoing)) => {
                match outgoing {
                    Outgoing::Publish(pkid) => lock(&inflight).sent(Request::Publish, pkid),
                    Outgoing::Subscribe(pkid) => lock(&inflight).sent(Request::Subscribe, pkid),
                    Outgoing::Unsubscribe(pkid) => lock(&inflight).sent(Request::Unsubscribe, pkid),
                    Outgoing::Disconnect => {
                        info!("mqtt disconnected");
                        events.emit(TransportEvent::Disconnected(None));
                        return;
                    }
                    _ => {}
                }
                continue;
            }
            Err(err) => {
                let err = map_connection_error(err);
                lock(&inflight).clear();
                if connected {
                    warn!(error = %err, "mqtt connection lost");
                    events.emit(TransportEvent::Disconnected(Some(err)));
                } else {
                    warn!(error = %err, "mqtt connection attempt failed");
                    events.emit(TransportEvent::ConnectionFailed(err));
                }
                return;
            }
        };
        if !events.emit(event) {
            debug!("pipeline stopped; closing mqtt event loop");
            return;
        }
    }
}

fn incoming(packet: Packet, inflight: &Mutex<Inflight>) -> Option<TransportEvent> {
    match packet {
        Packet::ConnAck(ack) if ack.code == ConnectReturnCode::Success => Some(TransportEvent::Connected),
        Packet::ConnAck(ack) => Some(TransportEvent::ConnectionFailed(refused(ack.code))),
        Packet::Publish(publish) => Some(TransportEvent::MessageReceived {
            topic: publish.topic,
            payload: publish.payload,
        }),
        Packet::PubAck(ack) => lock(inflight)
            .acked(Request::Publish, ack.pkid)
            .map(TransportEvent::Published),
        Packet::SubAck(ack) => lock(inflight)
            .acked(Request::Subscribe, ack.pkid)
            .map(TransportEvent::Subscribed),
        Packet::UnsubAck(ack) => lock(inflight)
            .acked(Request::Unsubscribe, ack.pkid)
            .map(TransportEvent::Unsubscribed),
        _ => None,
    }
}

fn refused(code: ConnectReturnCode) -> TransportError {
    match code {
        ConnectReturnCode::NotAuthorized | ConnectReturnCode::BadUserNamePassword => {
            TransportError::NotAuthorized
        }
        other => TransportError::Refused(format!("{other:?}")),
    }
}

fn map_connection_error(err: ConnectionError) -> TransportError {
    match err {
        ConnectionError::ConnectionRefused(code) => refused(code),
        ConnectionError::NetworkTimeout | ConnectionError::FlushTimeout => {
            TransportError::Timeout(err.to_string())
        }
        ConnectionError::Io(err) => TransportError::Io(err.to_string()),
        ConnectionError::Tls(err) => TransportError::Tls(err.to_string()),
        other => TransportError::Other(other.to_string()),
    }
}

fn tls_configuration(args: &ConnectionArgs) -> Result<TlsConfiguration, TransportError> {
    let client_auth = match &args.client_certificate {
        Some(cert) if cert.pass_phrase.is_some() => {
            return Err(TransportError::Unsupported(
                "encrypted client keys are not supported by the mqtt transport".into(),
            ));
        }
        Some(cert) => Some((cert.cert_pem.clone(), cert.key_pem.clone())),
        None => None,
    };
    match (&args.server_verification_cert, client_auth) {
        (Some(ca), client_auth) => Ok(TlsConfiguration::Simple {
            ca: ca.as_bytes().to_vec(),
            alpn: None,
            client_auth,
        }),
        (None, None) => Ok(TlsConfiguration::default()),
        (None, Some(_)) => Err(TransportError::Unsupported(
            "client certificates need an explicit server verification certificate".into(),
        )),
    }
}

fn mqtt_options(args: &ConnectionArgs, password: Option<&str>) -> Result<MqttOptions, TransportError> {
    let tls = tls_configuration(args)?;
    let mut options = if args.websockets {
        let url = format!("wss://{}:{WEBSOCKET_PORT}{WEBSOCKET_PATH}", args.hostname);
        let mut options = MqttOptions::new(&args.client_id, url, WEBSOCKET_PORT);
        options.set_transport(rumqttc::Transport::Wss(tls));
        options
    } else {
        let mut options = MqttOptions::new(&args.client_id, &args.hostname, MQTT_TLS_PORT);
        options.set_transport(rumqttc::Transport::Tls(tls));
        options
    };
    options
        .set_keep_alive(args.keep_alive)
        .set_clean_session(false)
        .set_credentials(&args.username, password.unwrap_or_default());
    Ok(options)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rstest::{fixture, rstest};

    use super::*;
    use crate::config::{ProxyOptions, ProxyType, X509};

    #[fixture]
    fn args() -> ConnectionArgs {
        ConnectionArgs {
            client_id: "dev".into(),
            hostname: "hub.example.net".into(),
            username: "hub.example.net/dev/?api-version=2019-10-01".into(),
            server_verification_cert: None,
            client_certificate: None,
            websockets: false,
            cipher: String::new(),
            proxy_options: None,
            keep_alive: Duration::from_secs(30),
        }
    }

    #[test]
    fn packet_ids_pair_with_requests_in_order() {
        let mut inflight = Inflight::default();
        inflight.queued(Request::Publish, 1);
        inflight.queued(Request::Subscribe, 2);
        inflight.queued(Request::Publish, 3);

        inflight.sent(Request::Publish, 10);
        inflight.sent(Request::Subscribe, 10);
        inflight.sent(Request::Publish, 11);

        assert_eq!(inflight.acked(Request::Publish, 11), Some(3));
        assert_eq!(inflight.acked(Request::Subscribe, 10), Some(2));
        assert_eq!(inflight.acked(Request::Publish, 10), Some(1));
        assert_eq!(inflight.acked(Request::Publish, 10), None);
    }

    #[rstest]
    #[case::not_authorized(ConnectReturnCode::NotAuthorized, TransportError::NotAuthorized)]
    #[case::bad_credentials(ConnectReturnCode::BadUserNamePassword, TransportError::NotAuthorized)]
    #[case::unavailable(
        ConnectReturnCode::ServiceUnavailable,
        TransportError::Refused("ServiceUnavailable".into())
    )]
    fn refusals_are_classified(#[case] code: ConnectReturnCode, #[case] expected: TransportError) {
        assert_eq!(map_connection_error(ConnectionError::ConnectionRefused(code)), expected);
    }

    #[test]
    fn network_timeout_is_a_timeout() {
        assert!(matches!(
            map_connection_error(ConnectionError::NetworkTimeout),
            TransportError::Timeout(_)
        ));
    }

    #[rstest]
    fn tls_options_target_the_mqtt_port(args: ConnectionArgs) {
        let options = mqtt_options(&args, Some("token")).expect("options");
        assert_eq!(options.broker_address(), ("hub.example.net".to_owned(), MQTT_TLS_PORT));
        assert_eq!(options.keep_alive(), Duration::from_secs(30));
        assert_eq!(
            options.credentials(),
            Some((args.username.clone(), "token".to_owned()))
        );
    }

    #[rstest]
    fn websocket_options_use_the_hub_path(mut args: ConnectionArgs) {
        args.websockets = true;
        let options = mqtt_options(&args, None).expect("options");
        assert_eq!(
            options.broker_address(),
            ("wss://hub.example.net:443/$iothub/websocket".to_owned(), WEBSOCKET_PORT)
        );
    }

    #[rstest]
    fn client_certificate_without_trust_root_is_rejected(mut args: ConnectionArgs) {
        args.client_certificate = Some(X509 {
            cert_pem: b"cert".to_vec(),
            key_pem: b"key".to_vec(),
            pass_phrase: None,
        });
        assert!(matches!(
            tls_configuration(&args),
            Err(TransportError::Unsupported(_))
        ));
        args.server_verification_cert = Some("ca".into());
        assert!(matches!(
            tls_configuration(&args),
            Ok(TlsConfiguration::Simple {
                client_auth: Some(_),
                ..
            })
        ));
    }

    #[rstest]
    #[tokio::test]
    async fn proxies_are_ignored(mut args: ConnectionArgs) {
        args.proxy_options = Some(ProxyOptions {
            proxy_type: ProxyType::Socks5,
            address: "proxy".into(),
            port: 1080,
            username: None,
            password: None,
        });
        let (dispatcher, _commands) = crate::pipeline::Dispatcher::channel();
        let result = MqttTransportFactory.create(&args, TransportEventSink::new(dispatcher));
        assert!(result.is_ok());
    }
}
