//! # Reply Router
//!
//! Purpose: Correlate replies with the requests that produced them over a
//! single connection, and divert published messages to the subscription
//! registry.
//!
//! ## Design Principles
//! 1. **FIFO Correlation**: Requests are queued in wire order; every
//!    ordinary reply settles the oldest one.
//! 2. **Tagged Pushes**: Published messages are recognized by their frame tag
//!    (RESP3 `>`), or on RESP2 by a `message` tagged array arriving while the
//!    server is in subscribed mode. In that mode only the commands in
//!    `SUBSCRIBED_MODE_COMMANDS` are admitted, none of which can answer with
//!    such an array, so a reply is never mistaken for a message.
//! 3. **Placeholders**: A caller that gives up leaves its slot queued; the
//!    late reply lands in the abandoned slot and is discarded.
//! 4. **Lock Discipline**: Callbacks run after the queue lock is released.
//!
//! ## Subscription Acknowledgements
//!
//! `subscribe`/`unsubscribe` confirmations answer the SUBSCRIBE/UNSUBSCRIBE
//! request at the head of the queue, including when a RESP3 server sends them
//! as push frames. An acknowledgement without such a request is dropped.

use std::collections::{HashSet, VecDeque};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::Protocol;
use crate::error::{ClientError, ClientResult};
use crate::payload::{Message, Payload};
use crate::registry::SubscriptionRegistry;
use crate::resp::Reply;

/// What a queued request expects back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestKind {
    /// Any ordinary command.
    Plain,
    /// SUBSCRIBE for one channel.
    Subscribe(String),
    /// UNSUBSCRIBE for one channel.
    Unsubscribe(String),
}

struct PendingRequest {
    id: u64,
    kind: RequestKind,
    // Set when the SUBSCRIBE added the channel to the subscribed set.
    fresh: bool,
    // Written while RESP2 subscriptions were active.
    subscribed_mode: bool,
    reply_tx: SyncSender<ClientResult<Reply>>,
}

/// Handle a caller blocks on until its reply is routed.
pub struct PendingReply {
    id: u64,
    rx: Receiver<ClientResult<Reply>>,
}

impl PendingReply {
    /// Blocks until the reply arrives, the connection fails, or `timeout`
    /// expires.
    ///
    /// On timeout the queue slot stays behind as a placeholder.
    pub fn wait(self, timeout: Option<Duration>) -> ClientResult<Reply> {
        match timeout {
            Some(timeout) => match self.rx.recv_timeout(timeout) {
                Ok(result) => result,
                Err(RecvTimeoutError::Timeout) => {
                    debug!(id = self.id, "request timed out");
                    Err(ClientError::Timeout)
                }
                Err(RecvTimeoutError::Disconnected) => Err(ClientError::ConnectionLost),
            },
            None => self.rx.recv().unwrap_or(Err(ClientError::ConnectionLost)),
        }
    }
}

#[derive(Default)]
struct RouterState {
    pending: VecDeque<PendingRequest>,
    // Channels the server considers subscribed, in wire order.
    subscribed: HashSet<String>,
    next_id: u64,
    closed: bool,
}

impl RouterState {
    fn settle(&mut self, reply: Reply) {
        let request = match self.pending.pop_front() {
            Some(request) => request,
            None => {
                warn!(?reply, "reply with no pending request dropped");
                return;
            }
        };

        match &request.kind {
            RequestKind::Plain => {}
            RequestKind::Subscribe(channel) => {
                if reply.is_error() && request.fresh {
                    self.subscribed.remove(channel);
                }
            }
            RequestKind::Unsubscribe(channel) => {
                if !reply.is_error() {
                    self.subscribed.remove(channel);
                }
            }
        }

        if request.reply_tx.send(Ok(reply)).is_err() {
            debug!(id = request.id, "reply for abandoned request skipped");
        }
    }

    fn head_expects_ack(&self) -> bool {
        matches!(
            self.pending.front().map(|request| &request.kind),
            Some(RequestKind::Subscribe(_)) | Some(RequestKind::Unsubscribe(_))
        )
    }
}

enum Inbound {
    Message(Message),
    Ack(Reply),
    Reply(Reply),
    Unsolicited(Reply),
}

/// Correlation table shared by callers and the reader thread.
pub struct ReplyRouter {
    state: Mutex<RouterState>,
    registry: Arc<SubscriptionRegistry>,
    protocol: Protocol,
}

impl ReplyRouter {
    pub fn new(protocol: Protocol, registry: Arc<SubscriptionRegistry>) -> Self {
        ReplyRouter {
            state: Mutex::new(RouterState::default()),
            registry,
            protocol,
        }
    }

    /// Queues a request. Call while holding the session writer lock so the
    /// queue order matches the wire order.
    pub fn enqueue(&self, kind: RequestKind) -> ClientResult<PendingReply> {
        let mut state = self.state.lock().expect("router mutex poisoned");
        if state.closed {
            return Err(ClientError::NotConnected);
        }

        let subscribed_mode = !state.subscribed.is_empty();
        let fresh = match &kind {
            RequestKind::Subscribe(channel) => state.subscribed.insert(channel.clone()),
            _ => false,
        };
        let id = state.next_id;
        state.next_id += 1;

        // Capacity 1: exactly one result is ever sent per request.
        let (reply_tx, rx) = mpsc::sync_channel(1);
        state.pending.push_back(PendingRequest {
            id,
            kind,
            fresh,
            subscribed_mode,
            reply_tx,
        });
        Ok(PendingReply { id, rx })
    }

    /// Routes one decoded frame. Runs on the reader thread.
    pub fn route(&self, reply: Reply) {
        let message = {
            let mut state = self.state.lock().expect("router mutex poisoned");
            // Replies to requests written before subscribing come from a
            // server that was not yet in subscribed mode.
            let subscribed = match state.pending.front() {
                Some(head) => head.subscribed_mode,
                None => !state.subscribed.is_empty(),
            };
            match classify(reply, self.protocol, subscribed) {
                Inbound::Message(message) => message,
                Inbound::Ack(ack) => {
                    if state.head_expects_ack() {
                        state.settle(ack);
                    } else {
                        debug!(?ack, "subscription acknowledgement without request dropped");
                    }
                    return;
                }
                Inbound::Reply(reply) => {
                    state.settle(reply);
                    return;
                }
                Inbound::Unsolicited(push) => {
                    warn!(?push, "unsolicited push frame dropped");
                    return;
                }
            }
        };
        self.registry.dispatch(message);
    }

    /// Fails every pending request and refuses new ones.
    ///
    /// `make_err` builds a fresh error per waiter. Returns how many requests
    /// were failed.
    pub fn fail_all(&self, make_err: impl Fn() -> ClientError) -> usize {
        let drained: Vec<PendingRequest> = {
            let mut state = self.state.lock().expect("router mutex poisoned");
            state.closed = true;
            state.subscribed.clear();
            state.pending.drain(..).collect()
        };
        let failed = drained.len();
        for request in drained {
            let _ = request.reply_tx.send(Err(make_err()));
        }
        failed
    }

    /// Returns false when `command` may not be sent because the RESP2
    /// connection is in subscribed mode.
    pub fn admits(&self, command: &[u8]) -> bool {
        if self.protocol != Protocol::Resp2 {
            return true;
        }
        let state = self.state.lock().expect("router mutex poisoned");
        state.subscribed.is_empty()
            || SUBSCRIBED_MODE_COMMANDS
                .iter()
                .any(|allowed| command.eq_ignore_ascii_case(allowed))
    }

    /// Number of queued requests, placeholders included.
    pub fn pending_len(&self) -> usize {
        self.state.lock().expect("router mutex poisoned").pending.len()
    }

    /// Returns true while the server holds at least one subscription.
    pub fn is_subscribed(&self) -> bool {
        !self.state.lock().expect("router mutex poisoned").subscribed.is_empty()
    }
}

/// Commands a RESP2 server accepts while the connection is subscribed.
const SUBSCRIBED_MODE_COMMANDS: [&[u8]; 9] = [
    b"SUBSCRIBE",
    b"UNSUBSCRIBE",
    b"PSUBSCRIBE",
    b"PUNSUBSCRIBE",
    b"SSUBSCRIBE",
    b"SUNSUBSCRIBE",
    b"PING",
    b"QUIT",
    b"RESET",
];

fn classify(reply: Reply, protocol: Protocol, subscribed: bool) -> Inbound {
    match reply {
        Reply::Push(items) => {
            if let Some(message) = parse_message(&items) {
                Inbound::Message(message)
            } else if is_ack(&items) {
                Inbound::Ack(Reply::Push(items))
            } else {
                Inbound::Unsolicited(Reply::Push(items))
            }
        }
        Reply::Array(items) if protocol == Protocol::Resp2 && subscribed => {
            match parse_message(&items) {
                Some(message) => Inbound::Message(message),
                None => Inbound::Reply(Reply::Array(items)),
            }
        }
        other => Inbound::Reply(other),
    }
}

fn parse_message(items: &[Reply]) -> Option<Message> {
    let tag = items.first()?.as_bytes()?;
    let text = |reply: &Reply| -> Option<String> {
        reply
            .as_bytes()
            .map(|data| String::from_utf8_lossy(data).into_owned())
    };

    if (tag.eq_ignore_ascii_case(b"message") || tag.eq_ignore_ascii_case(b"smessage"))
        && items.len() == 3
    {
        return Some(Message {
            channel: text(&items[1])?,
            pattern: None,
            payload: Payload::decode(items[2].as_bytes()?),
        });
    }
    if tag.eq_ignore_ascii_case(b"pmessage") && items.len() == 4 {
        return Some(Message {
            pattern: Some(text(&items[1])?),
            channel: text(&items[2])?,
            payload: Payload::decode(items[3].as_bytes()?),
        });
    }
    None
}

fn is_ack(items: &[Reply]) -> bool {
    const ACKS: [&[u8]; 6] = [
        b"subscribe",
        b"unsubscribe",
        b"psubscribe",
        b"punsubscribe",
        b"ssubscribe",
        b"sunsubscribe",
    ];
    match items.first().and_then(Reply::as_bytes) {
        Some(tag) => ACKS.iter().any(|ack| tag.eq_ignore_ascii_case(ack)),
        None => false,
    }
}
