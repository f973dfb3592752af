#![cfg(feature = "metrics")]
//! Tests for `hubwire` metrics.
//!
//! Counters and gauges are checked with
//! `metrics_util::debugging::DebuggingRecorder`, both through the helpers
//! directly and through a client running on the test's own thread.

use std::{sync::Arc, time::Duration};

use hubwire::{
    ClientOptions,
    DeviceClient,
    Message,
    TransportError,
    clock::ManualClock,
    metrics::{self as hub_metrics, Outcome},
};
use hubwire_testing::MockTransport;
use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use rstest::rstest;

fn debugging_recorder_setup() -> (Snapshotter, DebuggingRecorder) {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    (snapshotter, recorder)
}

fn counter(snapshotter: &Snapshotter, name: &str, label: Option<(&str, &str)>) -> u64 {
    snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .filter(|(key, _, _, _)| key.key().name() == name)
        .filter(|(key, _, _, _)| {
            label.is_none_or(|(k, v)| key.key().labels().any(|l| l.key() == k && l.value() == v))
        })
        .map(|(_, _, _, value)| match value {
            DebugValue::Counter(count) => count,
            _ => 0,
        })
        .sum()
}

fn gauge(snapshotter: &Snapshotter, name: &str) -> Option<f64> {
    snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .find(|(key, _, _, _)| key.key().name() == name)
        .and_then(|(_, _, _, value)| match value {
            DebugValue::Gauge(value) => Some(value.into_inner()),
            _ => None,
        })
}

#[rstest]
#[case::success(Outcome::Success, "success")]
#[case::transient(Outcome::Transient, "transient")]
#[case::fatal(Outcome::Fatal, "fatal")]
fn completions_are_labelled_by_outcome(#[case] outcome: Outcome, #[case] label: &str) {
    let (snapshotter, recorder) = debugging_recorder_setup();
    metrics::with_local_recorder(&recorder, || hub_metrics::inc_completed(outcome));

    assert_eq!(
        counter(&snapshotter, hub_metrics::OPERATIONS_COMPLETED, Some(("outcome", label))),
        1
    );
}

#[rstest]
#[case(1)]
#[case(3)]
fn background_errors_are_counted(#[case] expected: u64) {
    let (snapshotter, recorder) = debugging_recorder_setup();
    metrics::with_local_recorder(&recorder, || {
        (0..expected).for_each(|_| hub_metrics::inc_background_errors());
    });

    assert_eq!(counter(&snapshotter, hub_metrics::BACKGROUND_ERRORS, None), expected);
}

#[test]
fn connection_gauge_follows_the_last_state() {
    let (snapshotter, recorder) = debugging_recorder_setup();
    metrics::with_local_recorder(&recorder, || {
        hub_metrics::set_connected(true);
        hub_metrics::set_connected(false);
    });

    assert_eq!(gauge(&snapshotter, hub_metrics::CONNECTED), Some(0.0));
}

fn client(transport: &MockTransport) -> DeviceClient {
    let options = ClientOptions::default()
        .clock(Arc::new(ManualClock::new(1_700_000_000)))
        .connection_retry_interval(Duration::from_millis(10))
        .transport(transport.factory());
    DeviceClient::create_from_connection_string(
        "HostName=hub.example.net;DeviceId=dev;SharedAccessKey=Zm9vYmFy",
        options,
    )
    .expect("client")
}

#[tokio::test]
async fn client_operations_are_recorded() {
    let (snapshotter, recorder) = debugging_recorder_setup();
    let _guard = metrics::set_default_local_recorder(&recorder);
    let transport = MockTransport::new();
    let client = client(&transport);

    client.send_message(Message::new("21.5")).await.expect("send");

    assert!(counter(&snapshotter, hub_metrics::OPERATIONS_COMPLETED, Some(("outcome", "success"))) >= 2);
    assert_eq!(gauge(&snapshotter, hub_metrics::CONNECTED), Some(1.0));

    client.shutdown().await;
    assert_eq!(gauge(&snapshotter, hub_metrics::CONNECTED), Some(0.0));
}

#[tokio::test]
async fn reconnect_attempts_are_counted() {
    let (snapshotter, recorder) = debugging_recorder_setup();
    let _guard = metrics::set_default_local_recorder(&recorder);
    let transport = MockTransport::new();
    let client = client(&transport);
    let mut states = client.watch_connection_state();

    client.connect().await.expect("connect");
    assert!(transport.drop_connection(TransportError::Io("reset".into())));
    tokio::time::timeout(Duration::from_secs(5), async {
        while transport.connects() < 2 || !states.borrow().is_connected() {
            states.changed().await.expect("pipeline running");
        }
    })
    .await
    .expect("reconnected");

    assert!(counter(&snapshotter, hub_metrics::RECONNECT_ATTEMPTS, None) >= 1);
    client.shutdown().await;
}
