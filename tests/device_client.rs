//! Async device client against a scripted transport.

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use hubwire::{
    ClientError,
    ClientOptions,
    ConnectionState,
    DeviceClient,
    Message,
    MethodResponse,
    PipelineError,
    TransportError,
    clock::ManualClock,
    transport::TransportEvent,
};
use hubwire_testing::{Call, MockTransport, request_id};
use rstest::{fixture, rstest};
use serde_json::json;
use tokio::{sync::mpsc, time::timeout};

const CONNECTION_STRING: &str = "HostName=hub.example.net;DeviceId=dev;SharedAccessKey=Zm9vYmFy";
const WAIT: Duration = Duration::from_secs(5);

fn options(transport: &MockTransport) -> ClientOptions {
    ClientOptions::default()
        .clock(Arc::new(ManualClock::new(1_700_000_000)))
        .connection_retry_interval(Duration::from_millis(50))
        .transport(transport.factory())
}

#[fixture]
fn transport() -> MockTransport { MockTransport::new() }

fn client(transport: &MockTransport) -> DeviceClient {
    DeviceClient::create_from_connection_string(CONNECTION_STRING, options(transport)).expect("client")
}

#[rstest]
#[tokio::test]
async fn method_requests_are_answered_from_a_handler(transport: MockTransport) {
    let client = Arc::new(client(&transport));
    let responder = Arc::downgrade(&client);
    client
        .set_method_request_handler(Some(move |request| {
            let responder = responder.clone();
            async move {
                let Some(client) = responder.upgrade() else { return };
                let response = MethodResponse::for_request(&request, 200, Some(json!({ "rebooting": true })));
                client.send_method_response(response).await.expect("respond");
            }
        }))
        .await
        .expect("set handler");

    assert!(transport.emit(TransportEvent::MessageReceived {
        topic: "$iothub/methods/POST/reboot/?$rid=7".into(),
        payload: Bytes::from_static(b"{\"delay\":5}"),
    }));

    let response = timeout(WAIT, async {
        loop {
            if let Some(found) = transport
                .publishes()
                .into_iter()
                .find(|(topic, _)| topic.starts_with("$iothub/methods/res/"))
            {
                return found;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("method response published");
    assert_eq!(response.0, "$iothub/methods/res/200/?$rid=7");
    let body: serde_json::Value = serde_json::from_slice(&response.1).expect("json body");
    assert_eq!(body["rebooting"], true);

    client.shutdown().await;
}

#[rstest]
#[tokio::test]
async fn reported_properties_are_patched_through_the_twin_channel(transport: MockTransport) {
    transport.on_publish("$iothub/twin/PATCH/properties/reported/", |topic, _| {
        vec![TransportEvent::MessageReceived {
            topic: format!("$iothub/twin/res/204/?$rid={}&$version=5", request_id(topic)),
            payload: Bytes::new(),
        }]
    });
    let client = client(&transport);

    client
        .patch_twin_reported_properties(json!({ "firmware": "1.2.0" }))
        .await
        .expect("patch accepted");

    let (_, payload) = transport
        .publishes()
        .into_iter()
        .find(|(topic, _)| topic.starts_with("$iothub/twin/PATCH/properties/reported/"))
        .expect("patch published");
    let body: serde_json::Value = serde_json::from_slice(&payload).expect("json body");
    assert_eq!(body["firmware"], "1.2.0");
    assert!(transport.subscriptions().contains(&"$iothub/twin/res/#".to_owned()));

    client.shutdown().await;
}

#[rstest]
#[tokio::test]
async fn rejected_twin_request_surfaces_the_service_status(transport: MockTransport) {
    transport.on_publish("$iothub/twin/GET/", |topic, _| {
        vec![TransportEvent::MessageReceived {
            topic: format!("$iothub/twin/res/404/?$rid={}", request_id(topic)),
            payload: Bytes::from_static(b"{\"message\":\"twin not found\"}"),
        }]
    });
    let client = client(&transport);

    let err = client.get_twin().await.expect_err("service rejected the request");
    assert!(matches!(
        err,
        ClientError::Pipeline(PipelineError::Service { status: Some(404), .. })
    ));

    client.shutdown().await;
}

#[rstest]
#[tokio::test]
async fn refused_credentials_fail_connect(transport: MockTransport) {
    transport.fail_next_connect(TransportError::NotAuthorized);
    let client = client(&transport);

    let err = client.connect().await.expect_err("broker refused the token");
    assert!(matches!(err, ClientError::Pipeline(PipelineError::Unauthorized(_))));
    assert_eq!(client.connection_state(), ConnectionState::Disconnected);

    client.shutdown().await;
}

#[rstest]
#[tokio::test]
async fn dropped_connection_is_restored_and_reported(transport: MockTransport) {
    let client = client(&transport);
    let (tx, mut states) = mpsc::unbounded_channel();
    client
        .set_connection_state_change_handler(Some(move |state| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(state);
            }
        }))
        .expect("set handler");

    client.connect().await.expect("connect");
    assert!(transport.drop_connection(TransportError::Io("connection reset".into())));

    let mut seen = Vec::new();
    while !seen.contains(&ConnectionState::ReconnectPending) || !seen.ends_with(&[ConnectionState::Connected]) {
        let state = timeout(WAIT, states.recv())
            .await
            .expect("state change reported")
            .expect("handler channel open");
        seen.push(state);
    }
    assert_eq!(
        seen,
        [
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::ReconnectPending,
            ConnectionState::Connecting,
            ConnectionState::Connected,
        ]
    );
    assert_eq!(transport.connects(), 2);
    assert!(client.connected());

    client.shutdown().await;
}

#[rstest]
#[tokio::test]
async fn module_clients_send_to_outputs_and_receive_inputs(transport: MockTransport) {
    let client = DeviceClient::create_from_connection_string(
        "HostName=hub.example.net;DeviceId=dev;ModuleId=filter;SharedAccessKey=Zm9vYmFy",
        options(&transport),
    )
    .expect("module client");

    client
        .send_message_to_output(Message::new("{\"t\":21}"), "alerts")
        .await
        .expect("send to output");
    let (topic, _) = transport.publishes().pop().expect("published");
    assert!(topic.starts_with("devices/dev/modules/filter/messages/events/"));
    assert!(topic.contains("%24.on=alerts"));

    let (received, ()) = tokio::join!(client.receive_message(Some(WAIT)), async {
        while !transport
            .subscriptions()
            .contains(&"devices/dev/modules/filter/inputs/#".to_owned())
        {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        transport.emit(TransportEvent::MessageReceived {
            topic: "devices/dev/modules/filter/inputs/telemetry/%24.ct=application%2Fjson".into(),
            payload: Bytes::from_static(b"{}"),
        });
    });

    let message = received.expect("input message");
    assert_eq!(message.input_name.as_deref(), Some("telemetry"));
    assert_eq!(message.content_type.as_deref(), Some("application/json"));

    client.shutdown().await;
}

#[rstest]
#[tokio::test]
async fn sas_token_clients_connect_with_the_supplied_token(transport: MockTransport) {
    let token = "SharedAccessSignature sr=hub.example.net%2Fdevices%2Fdev&sig=c2lnbmF0dXJl&se=4102444800";
    let client = DeviceClient::create_from_sastoken(token, options(&transport)).expect("client");

    client.connect().await.expect("connect");

    assert_eq!(
        transport.calls().first(),
        Some(&Call::Connect {
            password: Some(token.to_owned()),
        })
    );

    let fresh = "SharedAccessSignature sr=hub.example.net%2Fdevices%2Fdev&sig=bmV3&se=4102448400";
    client.update_sastoken(fresh).await.expect("token replaced");
    assert_eq!(
        transport.calls().last(),
        Some(&Call::Connect {
            password: Some(fresh.to_owned()),
        })
    );
    assert!(client.connected());

    client.shutdown().await;
}
