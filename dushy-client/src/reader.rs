//! # Reader Loop
//!
//! Purpose: The single thread allowed to read the socket. It decodes frames
//! as they arrive and hands each one to the reply router, so published
//! messages are delivered while callers wait on their own replies.
//!
//! On end-of-stream, a read error or a malformed frame the loop marks the
//! connection closed, fails every pending request and exits.

use std::io::{ErrorKind, Read};
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, error, warn};

use crate::error::{ClientError, ClientResult};
use crate::registry::SubscriptionRegistry;
use crate::resp::Decoder;
use crate::router::ReplyRouter;
use crate::state::{ConnectionState, SharedState};

/// Everything the reader thread owns or shares.
pub struct ReaderContext {
    pub stream: TcpStream,
    pub router: Arc<ReplyRouter>,
    pub registry: Arc<SubscriptionRegistry>,
    pub state: Arc<SharedState>,
    pub read_buffer_size: usize,
}

enum Exit {
    Eof,
    Io(std::io::Error),
    Protocol { position: u64, reason: &'static str },
}

/// Starts the reader thread.
pub fn spawn(ctx: ReaderContext) -> ClientResult<JoinHandle<()>> {
    thread::Builder::new()
        .name("dushy-reader".to_string())
        .spawn(move || run(ctx))
        .map_err(ClientError::Connection)
}

fn run(mut ctx: ReaderContext) {
    let mut decoder = Decoder::with_capacity(ctx.read_buffer_size);
    let mut chunk = vec![0u8; ctx.read_buffer_size.max(64)];

    let exit = 'read: loop {
        let read = match ctx.stream.read(&mut chunk) {
            Ok(0) => break Exit::Eof,
            Ok(read) => read,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => break Exit::Io(err),
        };
        decoder.feed(&chunk[..read]);

        loop {
            match decoder.next_reply() {
                Ok(Some(reply)) => ctx.router.route(reply),
                Ok(None) => break,
                Err(ClientError::Protocol { position, reason }) => {
                    break 'read Exit::Protocol { position, reason };
                }
                Err(other) => {
                    // The decoder only reports protocol errors.
                    error!(error = %other, "unexpected decoder failure");
                    break 'read Exit::Protocol {
                        position: 0,
                        reason: "decoder failure",
                    };
                }
            }
        }
    };

    ctx.state.advance(ConnectionState::Closed);
    let failed = match exit {
        Exit::Eof => {
            debug!("connection closed by peer");
            ctx.router.fail_all(|| ClientError::ConnectionLost)
        }
        Exit::Io(err) => {
            warn!(error = %err, "connection read failed");
            ctx.router.fail_all(|| ClientError::ConnectionLost)
        }
        Exit::Protocol { position, reason } => {
            error!(position, reason, "malformed frame from server");
            // The stream cannot be resynchronized; make writers fail too.
            let _ = ctx.stream.shutdown(Shutdown::Both);
            ctx.router
                .fail_all(|| ClientError::Protocol { position, reason })
        }
    };
    if decoder.buffered() > 0 {
        debug!(bytes = decoder.buffered(), "discarding undecoded bytes");
    }
    ctx.registry.clear();
    debug!(failed, "reader thread stopped");
}
