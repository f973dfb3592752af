//! Blocking device client driven from plain threads.

use std::{
    sync::{Arc, mpsc},
    thread,
    time::{Duration, Instant},
};

use bytes::Bytes;
use hubwire::{
    ClientOptions,
    MethodResponse,
    SyncDeviceClient,
    TransportError,
    clock::ManualClock,
    transport::TransportEvent,
};
use hubwire_testing::{MockTransport, request_id};
use rstest::{fixture, rstest};
use serde_json::json;

const CONNECTION_STRING: &str = "HostName=hub.example.net;DeviceId=dev;SharedAccessKey=Zm9vYmFy";
const WAIT: Duration = Duration::from_secs(5);

#[fixture]
fn transport() -> MockTransport { MockTransport::new() }

fn client(transport: &MockTransport) -> SyncDeviceClient {
    let options = ClientOptions::default()
        .clock(Arc::new(ManualClock::new(1_700_000_000)))
        .connection_retry_interval(Duration::from_millis(20))
        .transport(transport.factory());
    SyncDeviceClient::create_from_connection_string(CONNECTION_STRING, options).expect("client")
}

/// Emit `event` from another thread once `topic` has been subscribed.
fn emit_after_subscribe(transport: &MockTransport, topic: &'static str, event: TransportEvent) -> thread::JoinHandle<()> {
    let transport = transport.clone();
    thread::spawn(move || {
        let deadline = Instant::now() + WAIT;
        while !transport.subscriptions().iter().any(|subscribed| subscribed == topic) {
            assert!(Instant::now() < deadline, "never subscribed to {topic}");
            thread::sleep(Duration::from_millis(2));
        }
        assert!(transport.emit(event));
    })
}

#[rstest]
fn method_requests_are_received_and_answered(transport: MockTransport) {
    let client = client(&transport);
    let emitter = emit_after_subscribe(
        &transport,
        "$iothub/methods/POST/#",
        TransportEvent::MessageReceived {
            topic: "$iothub/methods/POST/setInterval/?$rid=42".into(),
            payload: Bytes::from_static(b"{\"seconds\":30}"),
        },
    );

    let request = client
        .receive_method_request(Some("setInterval"), Some(WAIT))
        .expect("method request");
    emitter.join().expect("emitter thread");
    assert_eq!(request.request_id, "42");
    assert_eq!(request.payload, Some(json!({ "seconds": 30 })));

    client
        .send_method_response(MethodResponse::for_request(&request, 200, None))
        .expect("send response");
    let (topic, _) = transport.publishes().pop().expect("response published");
    assert_eq!(topic, "$iothub/methods/res/200/?$rid=42");

    client.shutdown();
}

#[rstest]
fn method_handlers_run_off_the_pipeline_thread(transport: MockTransport) {
    let client = client(&transport);
    let (tx, rx) = mpsc::channel();
    client
        .set_method_request_handler(Some(move |request: hubwire::MethodRequest| {
            tx.send(request.name).expect("test still listening");
        }))
        .expect("set handler");

    assert!(transport.emit(TransportEvent::MessageReceived {
        topic: "$iothub/methods/POST/reboot/?$rid=1".into(),
        payload: Bytes::new(),
    }));

    assert_eq!(rx.recv_timeout(WAIT).expect("handler ran"), "reboot");
    client.shutdown();
}

#[rstest]
fn desired_properties_missed_while_disconnected_are_fetched_on_reconnect(transport: MockTransport) {
    transport.on_publish("$iothub/twin/GET/", |topic, _| {
        vec![TransportEvent::MessageReceived {
            topic: format!("$iothub/twin/res/200/?$rid={}", request_id(topic)),
            payload: Bytes::from_static(b"{\"desired\":{\"$version\":4,\"interval\":60},\"reported\":{}}"),
        }]
    });
    let client = client(&transport);
    let emitter = emit_after_subscribe(
        &transport,
        "$iothub/twin/PATCH/properties/desired/#",
        TransportEvent::MessageReceived {
            topic: "$iothub/twin/PATCH/properties/desired/?$version=3".into(),
            payload: Bytes::from_static(b"{\"$version\":3,\"interval\":30}"),
        },
    );

    let first = client
        .receive_twin_desired_properties_patch(Some(WAIT))
        .expect("live patch");
    emitter.join().expect("emitter thread");
    assert_eq!(first["interval"], 30);

    assert!(transport.drop_connection(TransportError::Io("connection reset".into())));

    let missed = client
        .receive_twin_desired_properties_patch(Some(WAIT))
        .expect("patch rebuilt from the twin");
    assert_eq!(missed, json!({ "$version": 4, "interval": 60 }));
    assert_eq!(transport.connects(), 2);

    client.shutdown();
}
