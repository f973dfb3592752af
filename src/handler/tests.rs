//! Delivery task lifecycle and handler invocation.

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use rstest::{fixture, rstest};
use tokio::{runtime::Handle, sync::mpsc, time::timeout};

use super::*;
use crate::{
    inbox::InboxManager,
    models::{Message, MethodRequest},
    pipeline::{ClientEvent, ConnectionState},
};

const WAIT: Duration = Duration::from_secs(5);

struct Fixture {
    inboxes: Arc<InboxManager>,
    manager: HandlerManager,
}

#[fixture]
fn setup() -> Fixture {
    let inboxes = Arc::new(InboxManager::new());
    let manager = HandlerManager::new(inboxes.clone(), Handle::current());
    Fixture { inboxes, manager }
}

fn forwarding<T: Send + 'static>() -> (Callback<T>, mpsc::UnboundedReceiver<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Callback::blocking(move |item| {
        let _ = tx.send(item);
    }), rx)
}

async fn received<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    timeout(WAIT, rx.recv())
        .await
        .expect("handler should run")
        .expect("handler channel open")
}

#[rstest]
#[tokio::test]
async fn one_task_per_kind_for_the_handler_lifetime(setup: Fixture) {
    let Fixture { manager, .. } = setup;
    assert!(!manager.is_running(HandlerKind::Message));

    let (first, _rx1) = forwarding::<Message>();
    manager.set_message_handler(Some(first)).expect("set handler");
    let (second, _rx2) = forwarding::<Message>();
    manager.set_message_handler(Some(second)).expect("replace handler");
    assert!(manager.is_running(HandlerKind::Message));
    assert!(!manager.is_running(HandlerKind::TwinPatch));

    manager.set_message_handler(None).expect("clear handler");
    assert!(!manager.is_running(HandlerKind::Message));
}

#[rstest]
#[tokio::test]
async fn messages_reach_the_handler_in_order(setup: Fixture) {
    let (handler, mut rx) = forwarding::<Message>();
    setup.manager.set_message_handler(Some(handler)).expect("set handler");

    for body in ["a", "b", "c"] {
        setup.inboxes.route_message(Message::new(body));
    }

    let mut bodies = Vec::new();
    for _ in 0..3 {
        bodies.push(received(&mut rx).await.data);
    }
    assert_eq!(bodies, ["a", "b", "c"].map(Bytes::from));
}

#[rstest]
#[tokio::test]
async fn async_handlers_are_awaited(setup: Fixture) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handler = Callback::future(move |request: MethodRequest| {
        let tx = tx.clone();
        async move {
            tokio::task::yield_now().await;
            let _ = tx.send(request.name);
        }
    });
    setup
        .manager
        .set_method_request_handler(Some(handler))
        .expect("set handler");

    setup.inboxes.route_method_request(MethodRequest {
        request_id: "1".into(),
        name: "reboot".into(),
        payload: None,
    });

    assert_eq!(received(&mut rx).await, "reboot");
}

#[rstest]
#[tokio::test]
async fn panicking_handler_reports_a_background_error(setup: Fixture) {
    let (errors, mut rx) = forwarding::<PipelineError>();
    setup
        .manager
        .set_background_error_handler(Some(errors))
        .expect("set error handler");
    setup
        .manager
        .set_twin_patch_handler(Some(Callback::blocking(|_| panic!("bad patch"))))
        .expect("set patch handler");

    setup.inboxes.route_twin_patch(serde_json::json!({ "$version": 2 }));

    let err = received(&mut rx).await;
    assert!(matches!(err, PipelineError::CallbackPanicked(message) if message.contains("bad patch")));
    assert!(setup.manager.is_running(HandlerKind::TwinPatch));
}

#[rstest]
#[tokio::test]
async fn client_events_go_to_their_own_handlers(setup: Fixture) {
    let (states, mut state_rx) = forwarding::<ConnectionState>();
    let (tokens, mut token_rx) = forwarding::<()>();
    setup
        .manager
        .set_connection_state_change_handler(Some(states))
        .expect("set state handler");
    setup
        .manager
        .set_new_sastoken_required_handler(Some(tokens))
        .expect("set token handler");

    setup
        .inboxes
        .route_client_event(ClientEvent::ConnectionStateChanged(ConnectionState::Connected));
    setup.inboxes.route_client_event(ClientEvent::NewSasTokenRequired);

    assert_eq!(received(&mut state_rx).await, ConnectionState::Connected);
    received(&mut token_rx).await;

    setup
        .manager
        .set_connection_state_change_handler(None)
        .expect("clear state handler");
    assert!(setup.manager.is_running(HandlerKind::ClientEvent));
    setup
        .manager
        .set_new_sastoken_required_handler(None)
        .expect("clear token handler");
    assert!(!setup.manager.is_running(HandlerKind::ClientEvent));
}

#[rstest]
#[tokio::test]
async fn direct_receive_is_refused_while_a_handler_is_set(setup: Fixture) {
    assert!(setup.manager.ensure_receivable(HandlerKind::Message).is_ok());
    let (handler, _rx) = forwarding::<Message>();
    setup.manager.set_message_handler(Some(handler)).expect("set handler");

    assert_eq!(
        setup.manager.ensure_receivable(HandlerKind::Message),
        Err(HandlerError::HandlerSet(HandlerKind::Message))
    );
}

#[rstest]
#[tokio::test]
async fn no_tasks_start_after_shutdown(setup: Fixture) {
    setup.manager.shutdown().await;
    let (handler, _rx) = forwarding::<Message>();

    assert_eq!(
        setup.manager.set_message_handler(Some(handler)),
        Err(HandlerError::ShutDown)
    );
}
