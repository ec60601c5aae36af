//! # Client Walk-Through
//!
//! Purpose: Exercise every client operation against a live server: strings,
//! lists, sets, hashes, then one subscription and one publish per payload
//! kind.
//!
//! Connection settings come from `DUSHY_HOST` / `DUSHY_PORT`; the optional
//! first argument is how many seconds to keep listening for messages.

use std::env;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use dushy_client::{Client, ClientConfig, Message, Payload};

const DEFAULT_LISTEN_SECS: u64 = 3;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let listen_secs = env::args()
        .nth(1)
        .and_then(|value| value.parse().ok())
        .unwrap_or(DEFAULT_LISTEN_SECS);

    let config = ClientConfig::from_env();
    let addr = config.addr();
    let client =
        Client::with_config(config.clone()).with_context(|| format!("connect to {addr}"))?;
    // A subscribed RESP2 connection only takes subscription commands.
    let publisher = Client::with_config(config).with_context(|| format!("connect to {addr}"))?;
    info!(peer = %client.peer_addr(), "connected");

    strings(&client)?;
    lists(&client)?;
    sets(&client)?;
    hashes(&client)?;
    pubsub(&client, &publisher)?;

    info!(seconds = listen_secs, "listening for messages");
    thread::sleep(Duration::from_secs(listen_secs));

    info!("shutting down");
    publisher.close();
    client.close();
    Ok(())
}

fn strings(client: &Client) -> Result<()> {
    info!("=== string operations ===");
    client.try_set("greeting", "Hello, Redis!")?;
    client.try_set("number", &42)?;
    client.try_set_json("json_str", &json!({"hdshb": "value"}))?;

    info!(value = ?client.try_get("greeting")?, "greeting");
    info!(value = ?client.try_get("number")?, "number");
    info!(value = ?client.try_get("json_str")?, "json_str");
    Ok(())
}

fn lists(client: &Client) -> Result<()> {
    info!("=== list operations ===");
    client.try_lpush("my_list", &["first", "second"])?;
    let len = client.try_rpush("my_list", &["third", "fourth"])?;
    info!(len, "list filled");

    info!(value = ?client.try_lpop("my_list")?, "left pop");
    info!(value = ?client.try_rpop("my_list")?, "right pop");
    Ok(())
}

fn sets(client: &Client) -> Result<()> {
    info!("=== set operations ===");
    let added = client.try_sadd("my_set", &["apple", "banana", "apple", "cherry"])?;
    let mut members: Vec<String> = client.try_smembers("my_set")?.into_iter().collect();
    members.sort();
    info!(added, ?members, "set members");
    Ok(())
}

fn hashes(client: &Client) -> Result<()> {
    info!("=== hash operations ===");
    client.try_hset("user:1", "name", "John Doe")?;
    client.try_hset("user:1", "email", "john@example.com")?;
    client.try_hset("user:1", "age", &30)?;

    for field in ["name", "email", "age"] {
        info!(field, value = ?client.try_hget("user:1", field)?, "user:1");
    }
    Ok(())
}

fn pubsub(client: &Client, publisher: &Client) -> Result<()> {
    info!("=== pub/sub operations ===");
    client.try_subscribe("string_channel", on_string)?;
    client.try_subscribe("json_channel", on_json)?;
    client.try_subscribe("binary_channel", on_binary)?;
    client.try_subscribe("int_channel", on_int)?;
    client.try_subscribe("array_channel", on_array)?;

    info!("publishing messages");
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or_default();
    let published = [
        publisher.publish("string_channel", "Hello, subscribers!"),
        publisher.publish_json(
            "json_channel",
            &json!({
                "name": "JSON Message",
                "timestamp": timestamp,
                "nested": {"value": 42}
            }),
        ),
        publisher.publish_binary("binary_channel", "Binary Data 🚀".as_bytes()),
        publisher.publish_int("int_channel", 42),
        publisher.publish_array(
            "array_channel",
            &[json!(1), json!("two"), json!({"three": 3}), json!([4, 5])],
        ),
    ];
    let failed = published.iter().filter(|ok| !**ok).count();
    if failed > 0 {
        warn!(failed, "some publishes failed");
    }
    Ok(())
}

fn on_string(message: Message) {
    info!(channel = %message.channel, payload = ?message.payload, "string message");
}

fn on_json(message: Message) {
    let nested = message
        .payload
        .as_json()
        .and_then(|value| value.pointer("/nested/value"))
        .cloned();
    info!(channel = %message.channel, ?nested, "json message");
}

fn on_binary(message: Message) {
    match message.payload {
        Payload::Binary(data) => {
            info!(len = data.len(), text = %String::from_utf8_lossy(&data), "binary message")
        }
        other => warn!(kind = other.kind(), "expected binary payload"),
    }
}

fn on_int(message: Message) {
    match message.payload.as_int() {
        Some(number) => info!(number, incremented = number + 1, "int message"),
        None => warn!(kind = message.payload.kind(), "expected int payload"),
    }
}

fn on_array(message: Message) {
    match message.payload.as_array() {
        Some(items) => info!(len = items.len(), ?items, "array message"),
        None => warn!(kind = message.payload.kind(), "expected array payload"),
    }
}
