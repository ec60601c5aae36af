//! # Client Facade
//!
//! Purpose: Expose a compact, blocking API for strings, lists, sets, hashes
//! and pub/sub over one persistent connection.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: `Client` hides the session, router and reader
//!    thread behind typed calls.
//! 2. **Two Surfaces**: Each `try_*` call returns `ClientResult` so callers
//!    can tell "key absent" from "server unreachable"; its lenient twin maps
//!    failures to `None`/`false`/`0` and logs them.
//! 3. **Blocking Waits**: A call enqueues its request, writes the command and
//!    parks on its reply handle; it never polls.
//! 4. **Shared Handle**: Clones share one connection; dropping the last one
//!    closes it.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::config::{ClientConfig, Protocol};
use crate::error::{ClientError, ClientResult};
use crate::payload::{Message, Payload};
use crate::reader::{self, ReaderContext};
use crate::registry::SubscriptionRegistry;
use crate::resp::{Command, Reply, ToArg};
use crate::router::{ReplyRouter, RequestKind};
use crate::state::{ConnectionState, SharedState};
use crate::transport::Session;

struct Shared {
    config: ClientConfig,
    session: Session,
    router: Arc<ReplyRouter>,
    registry: Arc<SubscriptionRegistry>,
    state: Arc<SharedState>,
    reader: Mutex<Option<JoinHandle<()>>>,
    reader_id: ThreadId,
}

impl Shared {
    fn close(&self) {
        let previous = self.state.advance(ConnectionState::Closing);
        if previous < ConnectionState::Closing {
            debug!(peer = %self.session.peer_addr(), "closing connection");
        }
        self.session.shutdown();

        // A callback closing its own client runs on the reader thread.
        if thread::current().id() != self.reader_id {
            let handle = self.reader.lock().expect("reader mutex poisoned").take();
            if let Some(handle) = handle {
                if handle.join().is_err() {
                    error!("reader thread panicked");
                }
            }
        }

        self.router.fail_all(|| ClientError::ConnectionLost);
        self.registry.clear();
        self.state.advance(ConnectionState::Closed);
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.close();
    }
}

/// Blocking client over one persistent connection.
///
/// Subscriber callbacks run on the connection's reader thread. They must not
/// issue blocking calls on the same client (those fail with
/// `ClientError::Reentrant`), and a callback that owns a clone of the client
/// keeps the connection alive until it is unsubscribed or closed.
#[derive(Clone)]
pub struct Client {
    shared: Arc<Shared>,
}

impl Client {
    /// Connects to `host:port` with default settings.
    pub fn connect(host: &str, port: u16) -> ClientResult<Self> {
        Self::with_config(ClientConfig::new(host, port))
    }

    /// Connects with a custom configuration.
    pub fn with_config(config: ClientConfig) -> ClientResult<Self> {
        let state = Arc::new(SharedState::new());
        state.advance(ConnectionState::Connecting);

        let (session, reader_stream) = match Session::connect(&config) {
            Ok(parts) => parts,
            Err(err) => {
                state.advance(ConnectionState::Closed);
                return Err(err);
            }
        };

        let registry = Arc::new(SubscriptionRegistry::new());
        let router = Arc::new(ReplyRouter::new(config.protocol, registry.clone()));
        let handle = match reader::spawn(ReaderContext {
            stream: reader_stream,
            router: router.clone(),
            registry: registry.clone(),
            state: state.clone(),
            read_buffer_size: config.read_buffer_size,
        }) {
            Ok(handle) => handle,
            Err(err) => {
                session.shutdown();
                state.advance(ConnectionState::Closed);
                return Err(err);
            }
        };
        let reader_id = handle.thread().id();
        state.advance(ConnectionState::Ready);

        let client = Client {
            shared: Arc::new(Shared {
                config,
                session,
                router,
                registry,
                state,
                reader: Mutex::new(Some(handle)),
                reader_id,
            }),
        };

        if client.shared.config.protocol == Protocol::Resp3 {
            client.hello()?;
        }
        debug!(peer = %client.shared.session.peer_addr(), "client connected");
        Ok(client)
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.shared.state.get()
    }

    /// Returns true while commands are accepted.
    pub fn is_connected(&self) -> bool {
        self.shared.state.is_ready()
    }

    /// Remote address of the connection.
    pub fn peer_addr(&self) -> SocketAddr {
        self.shared.session.peer_addr()
    }

    /// Channels with an active subscriber callback.
    pub fn subscriptions(&self) -> Vec<String> {
        self.shared.registry.channels()
    }

    /// Returns true while the server holds at least one subscription for
    /// this connection.
    pub fn is_subscribed(&self) -> bool {
        self.shared.router.is_subscribed()
    }

    /// Requests queued on the connection, abandoned placeholders included.
    pub fn in_flight(&self) -> usize {
        self.shared.router.pending_len()
    }

    /// Closes the connection. Idempotent and callable from any thread.
    ///
    /// Requests still waiting fail with `ClientError::ConnectionLost`.
    pub fn close(&self) {
        self.shared.close();
    }

    /// Sends a raw command and returns the reply as-is, error replies
    /// included, using the configured request timeout.
    pub fn execute(&self, command: Command) -> ClientResult<Reply> {
        self.call(command, RequestKind::Plain, None)
    }

    /// Like [`Client::execute`] with an explicit deadline.
    pub fn execute_timeout(&self, command: Command, timeout: Duration) -> ClientResult<Reply> {
        self.call(command, RequestKind::Plain, Some(timeout))
    }

    fn call(
        &self,
        command: Command,
        kind: RequestKind,
        timeout: Option<Duration>,
    ) -> ClientResult<Reply> {
        let shared = &self.shared;
        if thread::current().id() == shared.reader_id {
            return Err(ClientError::Reentrant);
        }
        if !shared.state.is_ready() {
            return Err(ClientError::NotConnected);
        }

        let pending = {
            let mut writer = shared.session.writer();
            if !shared.router.admits(command.name()) {
                let name = String::from_utf8_lossy(command.name()).into_owned();
                return Err(ClientError::SubscribedMode(name));
            }
            let pending = shared.router.enqueue(kind)?;
            if let Err(err) = writer.send(&command) {
                drop(writer);
                warn!(error = %err, "write failed; closing session");
                shared.state.advance(ConnectionState::Closing);
                shared.session.shutdown();
                return Err(err);
            }
            pending
        };
        pending.wait(timeout.or(shared.config.request_timeout))
    }

    fn hello(&self) -> ClientResult<()> {
        match self.execute(Command::new("HELLO").arg("3"))? {
            Reply::Map(_) | Reply::Array(_) => Ok(()),
            Reply::Error(message) => Err(ClientError::Server(message)),
            _ => Err(ClientError::UnexpectedReply),
        }
    }

    /// Pings the server. Returns the reply text.
    pub fn try_ping(&self) -> ClientResult<String> {
        match self.execute(Command::new("PING"))? {
            // RESP2 servers answer ["pong", ""] in subscribed mode.
            Reply::Array(items) if is_pong(&items) => Ok("PONG".to_string()),
            other => into_text(expect_value(other)?.unwrap_or_default()),
        }
    }

    /// Returns true when the server answers a PING.
    pub fn ping(&self) -> bool {
        lenient("ping", self.try_ping()).is_some()
    }

    // ---- strings ----

    /// Stores `value` under `key`.
    pub fn try_set<V: ToArg + ?Sized>(&self, key: &str, value: &V) -> ClientResult<()> {
        expect_ok(self.execute(Command::new("SET").arg(key).arg(value))?)
    }

    pub fn set<V: ToArg + ?Sized>(&self, key: &str, value: &V) -> bool {
        lenient("set", self.try_set(key, value)).is_some()
    }

    /// Stores `value` serialized as JSON.
    pub fn try_set_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> ClientResult<()> {
        let encoded = serde_json::to_vec(value)?;
        self.try_set(key, &encoded)
    }

    pub fn set_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> bool {
        lenient("set_json", self.try_set_json(key, value)).is_some()
    }

    /// Fetches a value as raw bytes. `Ok(None)` when the key is missing.
    pub fn try_get_bytes(&self, key: &str) -> ClientResult<Option<Vec<u8>>> {
        expect_value(self.execute(Command::new("GET").arg(key))?)
    }

    pub fn get_bytes(&self, key: &str) -> Option<Vec<u8>> {
        lenient("get", self.try_get_bytes(key)).flatten()
    }

    /// Fetches a value as UTF-8 text. `Ok(None)` when the key is missing.
    pub fn try_get(&self, key: &str) -> ClientResult<Option<String>> {
        self.try_get_bytes(key)?.map(into_text).transpose()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        lenient("get", self.try_get(key)).flatten()
    }

    /// Fetches a value and decodes it from JSON.
    pub fn try_get_json<T: DeserializeOwned>(&self, key: &str) -> ClientResult<Option<T>> {
        match self.try_get_bytes(key)? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        lenient("get_json", self.try_get_json(key)).flatten()
    }

    // ---- lists ----

    /// Prepends `values`; returns the new list length.
    pub fn try_lpush<V: ToArg>(&self, key: &str, values: &[V]) -> ClientResult<i64> {
        expect_int(self.execute(Command::new("LPUSH").arg(key).args(values))?)
    }

    pub fn lpush<V: ToArg>(&self, key: &str, values: &[V]) -> i64 {
        lenient("lpush", self.try_lpush(key, values)).unwrap_or(0)
    }

    /// Appends `values`; returns the new list length.
    pub fn try_rpush<V: ToArg>(&self, key: &str, values: &[V]) -> ClientResult<i64> {
        expect_int(self.execute(Command::new("RPUSH").arg(key).args(values))?)
    }

    pub fn rpush<V: ToArg>(&self, key: &str, values: &[V]) -> i64 {
        lenient("rpush", self.try_rpush(key, values)).unwrap_or(0)
    }

    /// Removes and returns the first element. `Ok(None)` on an empty list.
    pub fn try_lpop(&self, key: &str) -> ClientResult<Option<String>> {
        expect_value(self.execute(Command::new("LPOP").arg(key))?)?
            .map(into_text)
            .transpose()
    }

    pub fn lpop(&self, key: &str) -> Option<String> {
        lenient("lpop", self.try_lpop(key)).flatten()
    }

    /// Removes and returns the last element. `Ok(None)` on an empty list.
    pub fn try_rpop(&self, key: &str) -> ClientResult<Option<String>> {
        expect_value(self.execute(Command::new("RPOP").arg(key))?)?
            .map(into_text)
            .transpose()
    }

    pub fn rpop(&self, key: &str) -> Option<String> {
        lenient("rpop", self.try_rpop(key)).flatten()
    }

    // ---- sets ----

    /// Adds `members`; returns how many were not already present.
    pub fn try_sadd<V: ToArg>(&self, key: &str, members: &[V]) -> ClientResult<i64> {
        expect_int(self.execute(Command::new("SADD").arg(key).args(members))?)
    }

    pub fn sadd<V: ToArg>(&self, key: &str, members: &[V]) -> i64 {
        lenient("sadd", self.try_sadd(key, members)).unwrap_or(0)
    }

    /// Returns every member. A missing key is an empty set.
    pub fn try_smembers(&self, key: &str) -> ClientResult<HashSet<String>> {
        match self.execute(Command::new("SMEMBERS").arg(key))? {
            Reply::Array(items) => items
                .into_iter()
                .map(|item| match item {
                    Reply::Bulk(data) => into_text(data),
                    Reply::Simple(text) => Ok(text),
                    _ => Err(ClientError::UnexpectedReply),
                })
                .collect(),
            Reply::Nil => Ok(HashSet::new()),
            Reply::Error(message) => Err(ClientError::Server(message)),
            _ => Err(ClientError::UnexpectedReply),
        }
    }

    pub fn smembers(&self, key: &str) -> Option<HashSet<String>> {
        lenient("smembers", self.try_smembers(key))
    }

    // ---- hashes ----

    /// Sets `field` in the hash stored at `key`.
    pub fn try_hset<V: ToArg + ?Sized>(&self, key: &str, field: &str, value: &V) -> ClientResult<()> {
        match self.execute(Command::new("HSET").arg(key).arg(field).arg(value))? {
            Reply::Integer(_) | Reply::Simple(_) => Ok(()),
            Reply::Error(message) => Err(ClientError::Server(message)),
            _ => Err(ClientError::UnexpectedReply),
        }
    }

    pub fn hset<V: ToArg + ?Sized>(&self, key: &str, field: &str, value: &V) -> bool {
        lenient("hset", self.try_hset(key, field, value)).is_some()
    }

    /// Reads `field` from the hash stored at `key`.
    pub fn try_hget(&self, key: &str, field: &str) -> ClientResult<Option<String>> {
        expect_value(self.execute(Command::new("HGET").arg(key).arg(field))?)?
            .map(into_text)
            .transpose()
    }

    pub fn hget(&self, key: &str, field: &str) -> Option<String> {
        lenient("hget", self.try_hget(key, field)).flatten()
    }

    // ---- pub/sub ----

    /// Subscribes `callback` to `channel`, replacing any earlier callback.
    ///
    /// The callback runs on the reader thread once per published message.
    /// On failure the previous callback, if any, is put back.
    ///
    /// Over RESP2 the connection is then in subscribed mode: until every
    /// channel is unsubscribed only subscription commands and PING are sent,
    /// and other calls fail with `ClientError::SubscribedMode`. Publish and
    /// query from a second client, or connect with `Protocol::Resp3`.
    pub fn try_subscribe<F>(&self, channel: &str, callback: F) -> ClientResult<()>
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        let previous = self.shared.registry.register(channel, Arc::new(callback));
        let result = self
            .call(
                Command::new("SUBSCRIBE").arg(channel),
                RequestKind::Subscribe(channel.to_string()),
                None,
            )
            .and_then(expect_subscribed);
        if result.is_err() {
            self.shared.registry.restore(channel, previous);
        }
        result
    }

    pub fn subscribe<F>(&self, channel: &str, callback: F) -> bool
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        lenient("subscribe", self.try_subscribe(channel, callback)).is_some()
    }

    /// Unsubscribes from `channel`. Messages still in flight are dropped.
    pub fn try_unsubscribe(&self, channel: &str) -> ClientResult<()> {
        self.shared.registry.unregister(channel);
        let reply = self.call(
            Command::new("UNSUBSCRIBE").arg(channel),
            RequestKind::Unsubscribe(channel.to_string()),
            None,
        )?;
        expect_subscribed(reply)
    }

    pub fn unsubscribe(&self, channel: &str) -> bool {
        lenient("unsubscribe", self.try_unsubscribe(channel)).is_some()
    }

    /// Publishes a payload of any kind.
    pub fn try_publish(&self, channel: &str, payload: &Payload) -> ClientResult<()> {
        let body = payload.encode()?;
        match self.execute(Command::new("PUBLISH").arg(channel).arg(&body))? {
            Reply::Integer(_) | Reply::Simple(_) => Ok(()),
            Reply::Error(message) => Err(ClientError::Server(message)),
            _ => Err(ClientError::UnexpectedReply),
        }
    }

    /// Publishes a text message.
    pub fn publish(&self, channel: &str, message: &str) -> bool {
        let payload = Payload::Text(message.to_string());
        lenient("publish", self.try_publish(channel, &payload)).is_some()
    }

    /// Publishes any serializable value as a JSON document.
    pub fn publish_json<T: Serialize + ?Sized>(&self, channel: &str, data: &T) -> bool {
        let result = serde_json::to_value(data)
            .map_err(ClientError::from)
            .and_then(|value| self.try_publish(channel, &Payload::Json(value)));
        lenient("publish_json", result).is_some()
    }

    /// Publishes raw bytes.
    pub fn publish_binary(&self, channel: &str, data: &[u8]) -> bool {
        let payload = Payload::Binary(data.to_vec());
        lenient("publish_binary", self.try_publish(channel, &payload)).is_some()
    }

    /// Publishes an integer.
    pub fn publish_int(&self, channel: &str, number: i64) -> bool {
        lenient("publish_int", self.try_publish(channel, &Payload::Int(number))).is_some()
    }

    /// Publishes a sequence of serializable values as a JSON array.
    pub fn publish_array<T: Serialize>(&self, channel: &str, items: &[T]) -> bool {
        let result = items
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<Value>, _>>()
            .map_err(ClientError::from)
            .and_then(|values| self.try_publish(channel, &Payload::Array(values)));
        lenient("publish_array", result).is_some()
    }
}

fn lenient<T>(operation: &'static str, result: ClientResult<T>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(err) if err.is_connection_failure() => {
            warn!(operation, error = %err, "connection unavailable");
            None
        }
        Err(err) => {
            debug!(operation, error = %err, "operation failed");
            None
        }
    }
}

fn expect_ok(reply: Reply) -> ClientResult<()> {
    match reply {
        Reply::Simple(_) => Ok(()),
        Reply::Error(message) => Err(ClientError::Server(message)),
        _ => Err(ClientError::UnexpectedReply),
    }
}

fn expect_int(reply: Reply) -> ClientResult<i64> {
    match reply {
        Reply::Integer(value) => Ok(value),
        // Some servers answer counts as plain text.
        Reply::Simple(text) => text.trim().parse().map_err(|_| ClientError::UnexpectedReply),
        Reply::Error(message) => Err(ClientError::Server(message)),
        _ => Err(ClientError::UnexpectedReply),
    }
}

fn expect_value(reply: Reply) -> ClientResult<Option<Vec<u8>>> {
    match reply {
        Reply::Bulk(data) => Ok(Some(data)),
        Reply::Simple(text) => Ok(Some(text.into_bytes())),
        Reply::Nil => Ok(None),
        Reply::Error(message) => Err(ClientError::Server(message)),
        _ => Err(ClientError::UnexpectedReply),
    }
}

fn expect_subscribed(reply: Reply) -> ClientResult<()> {
    match reply {
        Reply::Simple(_) | Reply::Integer(_) => Ok(()),
        Reply::Array(ref items) | Reply::Push(ref items) if !items.is_empty() => Ok(()),
        Reply::Error(message) => Err(ClientError::Server(message)),
        _ => Err(ClientError::UnexpectedReply),
    }
}

fn is_pong(items: &[Reply]) -> bool {
    items
        .first()
        .and_then(Reply::as_bytes)
        .map_or(false, |tag| tag.eq_ignore_ascii_case(b"pong"))
}

fn into_text(data: Vec<u8>) -> ClientResult<String> {
    String::from_utf8(data).map_err(|_| ClientError::UnexpectedReply)
}
