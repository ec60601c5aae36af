//! # Dushy Client
//!
//! Purpose: Provide a blocking client for a Redis-compatible key-value server
//! with typed string/list/set/hash operations and publish/subscribe, all over
//! one persistent connection.
//!
//! ## Design Principles
//! 1. **Single Reader**: One background thread owns the read half of the
//!    socket and decodes every frame, so published messages are delivered
//!    while callers wait for their own replies.
//! 2. **FIFO Correlation**: Commands are written and queued under one lock;
//!    replies settle requests in exactly that order.
//! 3. **Protocol Clarity**: RESP is encoded and decoded explicitly, and push
//!    frames are told apart from replies by their tag.
//! 4. **Fail Fast**: A broken connection fails every waiter and every later
//!    call; there is no automatic reconnect.
//!
//! ## Data Flow
//!
//! ```text
//! caller -> Command::encode -> Session (writer lock) -> socket
//! socket -> reader thread -> Decoder -> ReplyRouter -> waiting caller
//!                                                   \-> SubscriptionRegistry -> callback
//! ```

mod client;
mod config;
mod error;
mod payload;
mod reader;
mod registry;
mod resp;
mod router;
mod state;
mod transport;

pub use client::Client;
pub use config::{ClientConfig, Protocol, DEFAULT_HOST, DEFAULT_PORT};
pub use error::{ClientError, ClientResult};
pub use payload::{Message, Payload};
pub use resp::{decode, Command, Decoder, Reply, ToArg};
pub use state::ConnectionState;
