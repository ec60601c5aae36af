//! # Connection State
//!
//! Purpose: Track the lifecycle of one connection in a lock-free cell shared
//! by callers, the transport and the reader thread.
//!
//! ## Design Principles
//! 1. **Monotonic**: States only move forward, so racing transitions
//!    resolve to the most advanced one.
//! 2. **Cheap Reads**: Callers check readiness with a single atomic load.

use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle of a client connection.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    /// No socket yet.
    Disconnected = 0,
    /// Socket being established.
    Connecting = 1,
    /// Accepting commands.
    Ready = 2,
    /// Close requested; in-flight requests are being failed.
    Closing = 3,
    /// Terminal state.
    Closed = 4,
}

impl ConnectionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ConnectionState::Disconnected,
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Ready,
            3 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

/// Atomic, forward-only holder of a `ConnectionState`.
#[derive(Debug)]
pub struct SharedState {
    raw: AtomicU8,
}

impl SharedState {
    /// Creates a cell in the `Disconnected` state.
    pub fn new() -> Self {
        SharedState {
            raw: AtomicU8::new(ConnectionState::Disconnected as u8),
        }
    }

    /// Current state.
    pub fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.raw.load(Ordering::Acquire))
    }

    /// Moves to `next` unless a later state was already reached.
    ///
    /// Returns the state observed before the call.
    pub fn advance(&self, next: ConnectionState) -> ConnectionState {
        ConnectionState::from_u8(self.raw.fetch_max(next as u8, Ordering::AcqRel))
    }

    /// Returns true while commands are accepted.
    pub fn is_ready(&self) -> bool {
        self.get() == ConnectionState::Ready
    }
}

impl Default for SharedState {
    fn default() -> Self {
        SharedState::new()
    }
}
