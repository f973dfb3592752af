//! Log output for failures nobody is waiting on.

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use hubwire::{
    ClientOptions,
    DeviceClient,
    Message,
    PipelineError,
    clock::ManualClock,
    transport::TransportEvent,
};
use hubwire_testing::{LoggerHandle, MockTransport, logger};
use log::Level;
use rstest::rstest;
use serial_test::serial;
use tokio::sync::mpsc;

const WAIT: Duration = Duration::from_secs(5);

fn client(transport: &MockTransport) -> DeviceClient {
    let options = ClientOptions::default()
        .clock(Arc::new(ManualClock::new(1_700_000_000)))
        .transport(transport.factory());
    DeviceClient::create_from_connection_string(
        "HostName=hub.example.net;DeviceId=dev;SharedAccessKey=Zm9vYmFy",
        options,
    )
    .expect("client")
}

async fn wait_for_log(logger: &mut LoggerHandle, level: Level, needle: &str) {
    tokio::time::timeout(WAIT, async {
        while !logger.find(level, needle) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("no {level} record containing '{needle}'"));
}

#[rstest]
#[tokio::test]
#[serial]
async fn panicking_handler_is_logged_and_reported(mut logger: LoggerHandle) {
    let transport = MockTransport::new();
    let client = client(&transport);
    let (tx, mut errors) = mpsc::unbounded_channel();
    client
        .set_background_error_handler(Some(move |err: PipelineError| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(err);
            }
        }))
        .expect("set error handler");
    client
        .set_message_handler(Some(|message: Message| async move {
            assert!(message.data.iter().all(u8::is_ascii_digit), "unparseable reading");
        }))
        .await
        .expect("set message handler");

    assert!(transport.emit(TransportEvent::MessageReceived {
        topic: "devices/dev/messages/devicebound/".into(),
        payload: Bytes::from_static(b"??"),
    }));

    let err = tokio::time::timeout(WAIT, errors.recv())
        .await
        .expect("background error delivered")
        .expect("handler channel open");
    assert!(matches!(err, PipelineError::CallbackPanicked(message) if message.contains("unparseable reading")));
    wait_for_log(&mut logger, Level::Error, "handler panicked").await;

    client.shutdown().await;
}

#[rstest]
#[tokio::test]
#[serial]
async fn unhandled_background_errors_are_logged(mut logger: LoggerHandle) {
    let transport = MockTransport::new();
    let client = client(&transport);
    client
        .set_connection_state_change_handler(Some(|_state| async {}))
        .expect("set state handler");

    client.connect().await.expect("connect");
    assert!(transport.drop_connection(hubwire::TransportError::Io("peer reset".into())));

    wait_for_log(&mut logger, Level::Warn, "background error with no handler").await;

    client.shutdown().await;
}
