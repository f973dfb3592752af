//! Unit tests for [`Inbox`] and [`InboxManager`].

use std::{thread, time::Duration};

use rstest::rstest;

use super::*;
use crate::models::MethodRequest;

#[test]
fn blocking_get_is_fifo() {
    let inbox = Inbox::new();
    inbox.put('a');
    inbox.put('b');
    inbox.put('c');
    let drained: Vec<char> = (0..3)
        .map(|_| inbox.get_blocking(Some(Duration::from_millis(10))).expect("item"))
        .collect();
    assert_eq!(drained, ['a', 'b', 'c']);
}

#[tokio::test]
async fn async_get_is_fifo() {
    let inbox = Inbox::new();
    inbox.put('a');
    inbox.put('b');
    inbox.put('c');
    let mut drained = Vec::new();
    for _ in 0..3 {
        drained.push(inbox.get(None).await.expect("item"));
    }
    assert_eq!(drained, ['a', 'b', 'c']);
}

#[test]
fn blocking_get_times_out_when_empty() {
    let inbox: Inbox<u8> = Inbox::new();
    assert_eq!(
        inbox.get_blocking(Some(Duration::from_millis(20))),
        Err(InboxEmpty)
    );
}

#[tokio::test(start_paused = true)]
async fn async_get_times_out_when_empty() {
    let inbox: Inbox<u8> = Inbox::new();
    assert_eq!(inbox.get(Some(Duration::from_secs(1))).await, Err(InboxEmpty));
}

#[test]
fn blocked_consumer_wakes_on_put() {
    let inbox = Inbox::new();
    let consumer = {
        let inbox = inbox.clone();
        thread::spawn(move || inbox.get_blocking(None))
    };
    thread::sleep(Duration::from_millis(20));
    inbox.put(42_u32);
    assert_eq!(consumer.join().expect("consumer thread"), Ok(42));
}

#[tokio::test]
async fn suspended_consumer_wakes_on_put() {
    let inbox = Inbox::new();
    let consumer = {
        let inbox = inbox.clone();
        tokio::spawn(async move { inbox.get(None).await })
    };
    tokio::task::yield_now().await;
    inbox.put(7_u32);
    assert_eq!(consumer.await.expect("consumer task"), Ok(7));
}

#[rstest]
#[case::two_consumers(2)]
#[case::four_consumers(4)]
fn concurrent_consumers_see_each_item_once(#[case] consumers: usize) {
    const ITEMS: usize = 400;
    let inbox = Inbox::new();
    let handles: Vec<_> = (0..consumers)
        .map(|_| {
            let inbox = inbox.clone();
            thread::spawn(move || {
                let mut seen = Vec::new();
                while let Ok(item) = inbox.get_blocking(Some(Duration::from_millis(200))) {
                    seen.push(item);
                }
                seen
            })
        })
        .collect();
    for item in 0..ITEMS {
        inbox.put(item);
    }
    let mut all: Vec<usize> = Vec::new();
    for handle in handles {
        let seen = handle.join().expect("consumer thread");
        assert!(seen.windows(2).all(|pair| pair[0] < pair[1]), "per-consumer order");
        all.extend(seen);
    }
    all.sort_unstable();
    assert_eq!(all, (0..ITEMS).collect::<Vec<_>>());
}

#[test]
fn clear_discards_items() {
    let inbox = Inbox::new();
    inbox.put(1);
    inbox.put(2);
    inbox.clear();
    assert!(inbox.is_empty());
    assert_eq!(inbox.try_get(), None);
}

fn request(name: &str) -> MethodRequest {
    MethodRequest {
        request_id: "1".into(),
        name: name.into(),
        payload: None,
    }
}

#[test]
fn method_requests_prefer_named_inbox() {
    let manager = InboxManager::new();
    let reboot = manager.method_request_inbox(Some("reboot"));
    let generic = manager.method_request_inbox(None);

    manager.route_method_request(request("reboot"));
    manager.route_method_request(request("firmware"));

    assert_eq!(reboot.try_get().map(|r| r.name), Some("reboot".into()));
    assert_eq!(generic.try_get().map(|r| r.name), Some("firmware".into()));
}

#[test]
fn clearing_method_requests_empties_every_inbox() {
    let manager = InboxManager::new();
    let reboot = manager.method_request_inbox(Some("reboot"));
    manager.route_method_request(request("reboot"));
    manager.route_method_request(request("other"));

    manager.clear_all_method_requests();

    assert!(reboot.is_empty());
    assert!(manager.method_request_inbox(None).is_empty());
}
