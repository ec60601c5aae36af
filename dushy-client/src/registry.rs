//! # Subscription Registry
//!
//! Purpose: Map channel names to subscriber callbacks and invoke them for
//! published messages on the reader thread.
//!
//! ## Design Principles
//! 1. **Last Write Wins**: Registering a channel again replaces its callback.
//! 2. **Short Critical Sections**: The lock is held only to clone the
//!    callback handle, never while the callback runs.
//! 3. **Fault Isolation**: A panicking callback is caught and logged; the
//!    reader thread keeps delivering.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use tracing::{debug, error};

use crate::payload::Message;

/// Shared subscriber callback.
pub type Callback = Arc<dyn Fn(Message) + Send + Sync + 'static>;

/// Channel-to-callback table owned by one connection.
#[derive(Default)]
pub struct SubscriptionRegistry {
    callbacks: Mutex<HashMap<String, Callback>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        SubscriptionRegistry::default()
    }

    /// Installs `callback` for `channel`, returning the one it replaced.
    pub fn register(&self, channel: &str, callback: Callback) -> Option<Callback> {
        let mut callbacks = self.callbacks.lock().expect("registry mutex poisoned");
        callbacks.insert(channel.to_string(), callback)
    }

    /// Puts back the callback that was active before a failed registration.
    pub fn restore(&self, channel: &str, previous: Option<Callback>) {
        let _replaced = {
            let mut callbacks = self.callbacks.lock().expect("registry mutex poisoned");
            match previous {
                Some(callback) => callbacks.insert(channel.to_string(), callback),
                None => callbacks.remove(channel),
            }
        };
    }

    /// Removes the callback for `channel`. Returns true when one existed.
    pub fn unregister(&self, channel: &str) -> bool {
        let removed = {
            let mut callbacks = self.callbacks.lock().expect("registry mutex poisoned");
            callbacks.remove(channel)
        };
        removed.is_some()
    }

    /// Channels with an active callback.
    pub fn channels(&self) -> Vec<String> {
        let callbacks = self.callbacks.lock().expect("registry mutex poisoned");
        callbacks.keys().cloned().collect()
    }

    /// Drops every callback. Called when the connection closes.
    ///
    /// Callbacks are dropped after the lock is released; one may own the
    /// last client handle, whose drop closes the connection again.
    pub fn clear(&self) {
        let drained = {
            let mut callbacks = self.callbacks.lock().expect("registry mutex poisoned");
            std::mem::take(&mut *callbacks)
        };
        drop(drained);
    }

    /// Invokes the callback registered for the message's channel.
    ///
    /// Pattern messages are looked up by pattern. Returns false when no
    /// callback exists and the message was dropped.
    pub fn dispatch(&self, message: Message) -> bool {
        let key = message.pattern.as_deref().unwrap_or(&message.channel);
        let callback = {
            let callbacks = self.callbacks.lock().expect("registry mutex poisoned");
            callbacks.get(key).cloned()
        };

        let callback = match callback {
            Some(callback) => callback,
            None => {
                debug!(channel = %message.channel, "dropping message for unsubscribed channel");
                return false;
            }
        };

        let channel = message.channel.clone();
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback(message))) {
            error!(%channel, reason = panic_reason(&*panic), "subscriber callback panicked");
        }
        true
    }
}

fn panic_reason(panic: &(dyn Any + Send)) -> &str {
    if let Some(text) = panic.downcast_ref::<&str>() {
        *text
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text.as_str()
    } else {
        "unknown panic"
    }
}
