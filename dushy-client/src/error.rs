//! # Client Errors
//!
//! Purpose: One error taxonomy for the whole engine, from socket failures to
//! reply conversion problems.
//!
//! ## Design Principles
//! 1. **Distinguishable Failures**: "key absent" is never an error; "server
//!    unreachable" always is.
//! 2. **Fresh Per Waiter**: Reader-side failures are rebuilt for every pending
//!    request instead of requiring `Clone`.

use thiserror::Error;

/// Result type for the client.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors surfaced by the client engine.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Transport could not be established or broke while writing.
    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),
    /// Host/port pair did not resolve to a socket address.
    #[error("invalid address")]
    InvalidAddress,
    /// Malformed frame received from the server.
    ///
    /// `position` is the byte offset from the start of the inbound stream.
    #[error("protocol error at byte {position}: {reason}")]
    Protocol { position: u64, reason: &'static str },
    /// Call made on a client that is not ready (closing or closed).
    #[error("client is not connected")]
    NotConnected,
    /// In-flight request orphaned by a failed or closed connection.
    #[error("connection lost before the reply arrived")]
    ConnectionLost,
    /// Caller deadline expired before the reply arrived.
    #[error("request timed out")]
    Timeout,
    /// Server answered with an error reply.
    #[error("server error: {0}")]
    Server(String),
    /// Reply kind did not match the command.
    #[error("unexpected reply")]
    UnexpectedReply,
    /// JSON encoding or decoding of a value failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    /// Blocking call issued from a subscriber callback.
    ///
    /// Callbacks run on the reader thread, which is the only thread able to
    /// deliver the reply the call would wait for.
    #[error("blocking call from inside a subscriber callback")]
    Reentrant,
    /// Command refused locally because the RESP2 connection is in
    /// subscribed mode, where the server only accepts subscription commands
    /// and PING.
    #[error("{0} is not allowed while subscribed over RESP2")]
    SubscribedMode(String),
}

impl ClientError {
    /// Returns true when the error means the connection is unusable.
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            ClientError::Connection(_)
                | ClientError::NotConnected
                | ClientError::ConnectionLost
                | ClientError::Protocol { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_failures_are_classified() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        assert!(ClientError::from(io).is_connection_failure());
        assert!(ClientError::ConnectionLost.is_connection_failure());
        assert!(ClientError::Protocol { position: 3, reason: "bad" }.is_connection_failure());

        assert!(!ClientError::Timeout.is_connection_failure());
        assert!(!ClientError::Server("ERR x".to_string()).is_connection_failure());
        assert!(!ClientError::SubscribedMode("GET".to_string()).is_connection_failure());
    }
}
