//! # Transport Session
//!
//! Purpose: Own the TCP socket of one client: connect, serialize writes, and
//! shut the socket down so every blocked reader or writer observes failure.
//!
//! ## Design Principles
//! 1. **Exclusive Writer**: One mutex guards the write half and its buffer;
//!    holding it is what keeps wire order equal to queue order.
//! 2. **Buffer Reuse**: The encode buffer lives on the writer.
//! 3. **No Reconnect**: A broken session stays broken; the client fails fast.

use std::io::Write;
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::{Mutex, MutexGuard};

use tracing::debug;

use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use crate::resp::Command;

/// Write half of the connection with its reusable encode buffer.
pub struct Writer {
    stream: TcpStream,
    write_buf: Vec<u8>,
}

impl Writer {
    /// Encodes `command` and writes the whole frame.
    ///
    /// `write_all` retries short writes and interrupted calls until the frame
    /// is out or the socket errors.
    pub fn send(&mut self, command: &Command) -> ClientResult<()> {
        self.write_buf.clear();
        command.encode(&mut self.write_buf);
        self.stream.write_all(&self.write_buf)?;
        self.stream.flush()?;
        Ok(())
    }
}

/// Live TCP session to the server.
pub struct Session {
    writer: Mutex<Writer>,
    // Separate handle so shutdown never waits on the writer lock.
    control: TcpStream,
    peer: SocketAddr,
}

impl Session {
    /// Connects to the configured endpoint.
    ///
    /// Returns the session plus a cloned stream for the reader thread, which
    /// is the only place allowed to read from the socket.
    pub fn connect(config: &ClientConfig) -> ClientResult<(Session, TcpStream)> {
        let stream = connect_stream(config)?;
        if let Some(timeout) = config.write_timeout {
            stream.set_write_timeout(Some(timeout))?;
        }
        // Disable Nagle to keep request latency low for small payloads.
        stream.set_nodelay(true)?;

        let peer = stream.peer_addr()?;
        let reader = stream.try_clone()?;
        let control = stream.try_clone()?;
        debug!(%peer, "session established");

        let session = Session {
            writer: Mutex::new(Writer {
                stream,
                write_buf: Vec::with_capacity(256),
            }),
            control,
            peer,
        };
        Ok((session, reader))
    }

    /// Locks the write half. Hold the guard across enqueue and send.
    pub fn writer(&self) -> MutexGuard<'_, Writer> {
        self.writer.lock().expect("writer mutex poisoned")
    }

    /// Shuts the socket down in both directions. Idempotent.
    ///
    /// The blocked reader thread wakes up with end-of-stream, and later
    /// writes fail instead of hanging.
    pub fn shutdown(&self) {
        match self.control.shutdown(Shutdown::Both) {
            Ok(()) => debug!(peer = %self.peer, "session shut down"),
            // Already shut down or reset by the peer.
            Err(err) => debug!(peer = %self.peer, error = %err, "session shutdown ignored"),
        }
    }

    /// Remote address of the session.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

fn connect_stream(config: &ClientConfig) -> ClientResult<TcpStream> {
    let addrs: Vec<SocketAddr> = (config.host.as_str(), config.port)
        .to_socket_addrs()
        .map_err(|_| ClientError::InvalidAddress)?
        .collect();
    if addrs.is_empty() {
        return Err(ClientError::InvalidAddress);
    }

    let mut last_err = None;
    for addr in addrs {
        let attempt = match config.connect_timeout {
            Some(timeout) => TcpStream::connect_timeout(&addr, timeout),
            None => TcpStream::connect(addr),
        };
        match attempt {
            Ok(stream) => return Ok(stream),
            Err(err) => {
                debug!(%addr, error = %err, "connect attempt failed");
                last_err = Some(err);
            }
        }
    }
    match last_err {
        Some(err) => Err(ClientError::Connection(err)),
        None => Err(ClientError::InvalidAddress),
    }
}
