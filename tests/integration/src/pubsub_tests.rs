//! Pub/Sub Tests - topic notifications between middleware instances

use std::sync::mpsc::{self, Receiver};
use std::time::Duration;

use scopes_mw::pubsub::{PublisherState, SubscriberState, MAX_FRAME_SIZE};
use scopes_mw::{Middleware, MwError, Subscriber};

use integration_tests::*;

fn subscribe(mw: &Middleware, publisher_id: &str, topic: &str) -> (Subscriber, Receiver<String>) {
    let (tx, rx) = mpsc::channel();
    let subscriber = mw
        .create_subscriber(publisher_id, topic, move |message: &str| {
            let _ = tx.send(message.to_string());
        })
        .unwrap();
    (subscriber, rx)
}

#[test]
fn test_messages_arrive_in_order() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let server = start(dir.path(), "server");
    let client = start(dir.path(), "client");

    let publisher = server.create_publisher("events").unwrap();
    assert_eq!(publisher.endpoint().path(), dir.path().join("pub").join("events-p"));
    let (subscriber, rx) = subscribe(&client, "events", "tick");
    assert!(subscriber.wait_until_connected(WAIT));

    for i in 0..100 {
        publisher.send_message(&format!("m{}", i), "tick").unwrap();
        publisher.send_message("noise", "tock").unwrap();
    }
    for i in 0..100 {
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), format!("m{}", i));
    }
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
}

#[test]
fn test_topic_matching_is_exact() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let server = start(dir.path(), "server");
    let publisher = server.create_publisher("events").unwrap();

    let (news, news_rx) = subscribe(&server, "events", "news");
    let (all, all_rx) = subscribe(&server, "events", "");
    assert!(news.wait_until_connected(WAIT));
    assert!(all.wait_until_connected(WAIT));

    publisher.send_message("a", "newsy").unwrap();
    publisher.send_message("b", "news/x").unwrap();
    publisher.send_message("c:with:colons", "news").unwrap();

    assert_eq!(news_rx.recv_timeout(WAIT).unwrap(), "c:with:colons");
    assert!(news_rx.recv_timeout(Duration::from_millis(100)).is_err());

    let everything: Vec<String> = (0..3).map(|_| all_rx.recv_timeout(WAIT).unwrap()).collect();
    assert_eq!(everything, vec!["a", "b", "c:with:colons"]);
}

#[test]
fn test_publisher_endpoint_in_use() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let first = start(dir.path(), "first");
    let second = start(dir.path(), "second");

    let mut publisher = first.create_publisher("events").unwrap();
    match second.create_publisher("events") {
        Err(MwError::Resource(msg)) => assert!(msg.contains("in use"), "{}", msg),
        other => panic!("expected endpoint-in-use error, got {:?}", other.err()),
    }

    // Once the first publisher is gone the id is free again.
    publisher.stop().unwrap();
    assert_ne!(publisher.state(), PublisherState::Running);
    assert!(publisher.send_message("late", "t").is_err());
    second.create_publisher("events").unwrap();
}

#[test]
fn test_no_replay_for_late_subscribers() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let mw = start(dir.path(), "server");
    let publisher = mw.create_publisher("events").unwrap();
    publisher.send_message("early", "t").unwrap();

    let (subscriber, rx) = subscribe(&mw, "events", "t");
    assert!(subscriber.wait_until_connected(WAIT));
    publisher.send_message("late", "t").unwrap();
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), "late");
}

#[test]
fn test_subscriber_follows_publisher_restart() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let server = start(dir.path(), "server");
    let client = start(dir.path(), "client");

    // Subscribing before the publisher exists is fine.
    let (mut subscriber, rx) = subscribe(&client, "events", "t");
    assert!(!subscriber.is_connected());

    let publisher = server.create_publisher("events").unwrap();
    assert!(subscriber.wait_until_connected(WAIT));
    publisher.send_message("one", "t").unwrap();
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), "one");

    drop(publisher);
    assert!(wait_until(WAIT, || !subscriber.is_connected()));

    let publisher = server.create_publisher("events").unwrap();
    assert!(subscriber.wait_until_connected(WAIT));
    publisher.send_message("two", "t").unwrap();
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), "two");

    subscriber.stop().unwrap();
    assert_eq!(subscriber.state(), SubscriberState::Stopped);
    publisher.send_message("three", "t").unwrap();
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
}

#[test]
fn test_invalid_publisher_id() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let mw = start(dir.path(), "server");
    assert!(matches!(mw.create_publisher(""), Err(MwError::InvalidArgument(_))));
    assert!(matches!(mw.create_publisher("a/b"), Err(MwError::InvalidArgument(_))));
}

#[test]
fn test_oversized_message_keeps_subscription() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let server = start(dir.path(), "server");
    let client = start(dir.path(), "client");
    let publisher = server.create_publisher("events").unwrap();
    let (mut subscriber, rx) = subscribe(&client, "events", "t");
    assert!(subscriber.wait_until_connected(WAIT));

    let huge = "x".repeat(MAX_FRAME_SIZE + 4096);
    assert!(matches!(publisher.send_message(&huge, "t"), Err(MwError::InvalidArgument(_))));
    publisher.send_message("after", "t").unwrap();

    assert_eq!(rx.recv_timeout(WAIT).unwrap(), "after");
    assert!(subscriber.is_connected());
    assert_eq!(subscriber.state(), SubscriberState::Running);
    subscriber.stop().unwrap();
}

#[test]
fn test_topics_cannot_contain_colon() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let mw = start(dir.path(), "server");
    let publisher = mw.create_publisher("events").unwrap();
    let (all, rx) = subscribe(&mw, "events", "");
    assert!(all.wait_until_connected(WAIT));

    assert!(matches!(publisher.send_message("m", "a:b"), Err(MwError::InvalidArgument(_))));
    assert!(matches!(
        mw.create_subscriber("events", "a:b", |_: &str| {}),
        Err(MwError::InvalidArgument(_))
    ));

    // Colons in the message itself are fine.
    publisher.send_message("b:c", "a").unwrap();
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), "b:c");
}
