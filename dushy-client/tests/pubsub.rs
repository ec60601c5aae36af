mod common;

use std::sync::mpsc::{self, Receiver};
use std::sync::Mutex;
use std::time::Duration;

use serde_json::json;

use dushy_client::{Client, ClientConfig, ClientError, Command, Message, Payload, Protocol};

use common::{client_for, spawn_store_server, wait_until};

const RECV_TIMEOUT: Duration = Duration::from_secs(2);
const QUIET: Duration = Duration::from_millis(150);

/// Subscribes with a callback that forwards every message to the returned receiver.
fn forward(client: &Client, channel: &str) -> Receiver<Message> {
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    assert!(client.subscribe(channel, move |message| {
        let _ = tx.lock().unwrap().send(message);
    }));
    rx
}

fn resp3_client(host: &str, port: u16) -> Client {
    let mut config = ClientConfig::new(host, port);
    config.protocol = Protocol::Resp3;
    config.request_timeout = Some(Duration::from_secs(5));
    Client::with_config(config).expect("client")
}

#[test]
fn messages_arrive_in_publish_order_without_duplicates() {
    const MESSAGES: usize = 100;

    let (host, port) = spawn_store_server();
    let subscriber = client_for(&host, port);
    let publisher = client_for(&host, port);
    let rx = forward(&subscriber, "news");
    assert!(subscriber.is_subscribed());
    assert_eq!(subscriber.subscriptions(), vec!["news".to_string()]);

    for idx in 0..MESSAGES {
        assert!(publisher.publish("news", &format!("m{}", idx)));
    }

    for idx in 0..MESSAGES {
        let message = rx.recv_timeout(RECV_TIMEOUT).expect("message");
        assert_eq!(message.channel, "news");
        assert_eq!(message.pattern, None);
        assert_eq!(message.payload, Payload::Text(format!("m{}", idx)));
    }
    assert!(rx.recv_timeout(QUIET).is_err());
}

#[test]
fn resp2_subscribed_connection_refuses_other_commands() {
    let (host, port) = spawn_store_server();
    let client = client_for(&host, port);
    let rx = forward(&client, "events");

    match client.try_get("k") {
        Err(ClientError::SubscribedMode(command)) => assert_eq!(command, "GET"),
        other => panic!("expected subscribed-mode refusal, got {:?}", other),
    }
    assert!(!client.publish("events", "from inside"));
    assert_eq!(client.try_ping().expect("ping"), "PONG");
    assert_eq!(client.in_flight(), 0);
    assert!(rx.recv_timeout(QUIET).is_err());

    assert!(client.unsubscribe("events"));
    assert!(client.set("k", "v"));
    assert_eq!(client.get("k"), Some("v".to_string()));
}

#[test]
fn resp3_connection_keeps_serving_commands_while_subscribed() {
    let (host, port) = spawn_store_server();
    let client = resp3_client(&host, port);
    let rx = forward(&client, "events");

    assert!(client.publish("events", "first"));
    assert!(client.set("k", "v"));
    assert_eq!(client.get("k"), Some("v".to_string()));
    assert!(client.publish("events", "second"));

    let first = rx.recv_timeout(RECV_TIMEOUT).expect("first");
    let second = rx.recv_timeout(RECV_TIMEOUT).expect("second");
    assert_eq!(first.payload.as_text(), Some("first"));
    assert_eq!(second.payload.as_text(), Some("second"));
}

#[test]
fn every_payload_kind_round_trips() {
    let (host, port) = spawn_store_server();
    let subscriber = client_for(&host, port);
    let publisher = client_for(&host, port);
    let rx = forward(&subscriber, "kinds");

    assert!(publisher.publish("kinds", "plain"));
    assert!(publisher.publish_json("kinds", &json!({"a": 1})));
    assert!(publisher.publish_binary("kinds", &[0, 1, 254, 255]));
    assert!(publisher.publish_int("kinds", -42));
    assert!(publisher.publish_array("kinds", &[1, 2, 3]));

    let received: Vec<Payload> = (0..5)
        .map(|_| rx.recv_timeout(RECV_TIMEOUT).expect("payload").payload)
        .collect();
    assert_eq!(
        received,
        vec![
            Payload::Text("plain".to_string()),
            Payload::Json(json!({"a": 1})),
            Payload::Binary(vec![0, 1, 254, 255]),
            Payload::Int(-42),
            Payload::Array(vec![json!(1), json!(2), json!(3)]),
        ]
    );
}

#[test]
fn foreign_payloads_fall_back_to_text_or_binary() {
    let (host, port) = spawn_store_server();
    let subscriber = client_for(&host, port);
    let publisher = client_for(&host, port);
    let rx = forward(&subscriber, "raw");

    publisher
        .execute(Command::new("PUBLISH").arg("raw").arg("not an envelope"))
        .expect("publish text");
    publisher
        .execute(Command::new("PUBLISH").arg("raw").arg(&[0xffu8, 0xfe]))
        .expect("publish bytes");

    let text = rx.recv_timeout(RECV_TIMEOUT).expect("text");
    let bytes = rx.recv_timeout(RECV_TIMEOUT).expect("bytes");
    assert_eq!(text.payload, Payload::Text("not an envelope".to_string()));
    assert_eq!(bytes.payload, Payload::Binary(vec![0xff, 0xfe]));
}

#[test]
fn resubscribing_replaces_the_callback() {
    let (host, port) = spawn_store_server();
    let subscriber = client_for(&host, port);
    let publisher = client_for(&host, port);
    let old_rx = forward(&subscriber, "topic");
    let new_rx = forward(&subscriber, "topic");

    assert!(publisher.publish("topic", "hello"));
    let message = new_rx.recv_timeout(RECV_TIMEOUT).expect("message");
    assert_eq!(message.payload.as_text(), Some("hello"));
    // The replaced callback was dropped, which closes its channel.
    assert!(old_rx.recv_timeout(QUIET).is_err());
    assert!(new_rx.recv_timeout(QUIET).is_err());
}

#[test]
fn unsubscribe_stops_delivery() {
    let (host, port) = spawn_store_server();
    let client = client_for(&host, port);
    let rx = forward(&client, "temp");

    assert!(client.unsubscribe("temp"));
    assert!(!client.is_subscribed());
    assert!(client.subscriptions().is_empty());

    assert!(client.publish("temp", "ignored"));
    assert!(rx.recv_timeout(QUIET).is_err());
    assert_eq!(client.get("nothing"), None);
}

#[test]
fn panicking_callback_does_not_break_the_connection() {
    let (host, port) = spawn_store_server();
    let subscriber = client_for(&host, port);
    let publisher = client_for(&host, port);
    assert!(subscriber.subscribe("boom", |_| panic!("callback failure")));
    let rx = forward(&subscriber, "calm");

    assert!(publisher.publish("boom", "trigger"));
    assert!(subscriber.ping());

    assert!(publisher.publish("calm", "still here"));
    let message = rx.recv_timeout(RECV_TIMEOUT).expect("message");
    assert_eq!(message.payload.as_text(), Some("still here"));
    assert!(subscriber.unsubscribe("boom"));
    assert!(subscriber.is_connected());
}

#[test]
fn blocking_calls_from_a_callback_are_rejected() {
    let (host, port) = spawn_store_server();
    let client = client_for(&host, port);
    let publisher = client_for(&host, port);
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    let inner = client.clone();
    assert!(client.subscribe("loop", move |_| {
        let result = inner.try_get("anything");
        let _ = tx.lock().unwrap().send(matches!(result, Err(ClientError::Reentrant)));
    }));

    assert!(publisher.publish("loop", "go"));
    assert!(rx.recv_timeout(RECV_TIMEOUT).expect("result"));
    assert!(client.ping());

    // The callback owns a clone; closing breaks the cycle.
    client.close();
    assert!(client.subscriptions().is_empty());
}

#[test]
fn resp3_push_messages_are_delivered() {
    let (host, port) = spawn_store_server();
    let client = resp3_client(&host, port);
    let rx = forward(&client, "push");

    assert!(client.publish_int("push", 7));
    assert!(client.set("k", "v"));
    let message = rx.recv_timeout(RECV_TIMEOUT).expect("message");
    assert_eq!(message.payload, Payload::Int(7));

    assert!(client.unsubscribe("push"));
    assert!(client.publish_int("push", 8));
    assert!(rx.recv_timeout(QUIET).is_err());
    assert_eq!(client.get("k"), Some("v".to_string()));
}

#[test]
fn closing_drops_every_subscription() {
    let (host, port) = spawn_store_server();
    let client = client_for(&host, port);
    let rx = forward(&client, "a");
    let _other = forward(&client, "b");
    assert_eq!(client.subscriptions().len(), 2);

    client.close();
    assert!(wait_until(|| client.subscriptions().is_empty()));
    assert!(!client.publish("a", "late"));
    assert!(rx.recv_timeout(QUIET).is_err());
}
