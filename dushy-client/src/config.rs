//! # Client Configuration
//!
//! Purpose: Describe where to connect and how long to wait, with defaults
//! matching a local server.

use std::time::Duration;

/// Default server host.
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default server port.
pub const DEFAULT_PORT: u16 = 6379;

/// Wire protocol spoken on the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Protocol {
    /// RESP2; published messages arrive as tagged arrays.
    #[default]
    Resp2,
    /// RESP3 negotiated with `HELLO 3`; published messages arrive as push frames.
    Resp3,
}

/// Configuration for one client connection.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server host name or IP address.
    pub host: String,
    /// Server TCP port.
    pub port: u16,
    /// Optional TCP connect timeout.
    pub connect_timeout: Option<Duration>,
    /// Optional TCP write timeout.
    pub write_timeout: Option<Duration>,
    /// Optional deadline applied to every request that does not set its own.
    pub request_timeout: Option<Duration>,
    /// Wire protocol version.
    pub protocol: Protocol,
    /// Size of each socket read performed by the reader thread.
    pub read_buffer_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            connect_timeout: None,
            write_timeout: None,
            request_timeout: None,
            protocol: Protocol::Resp2,
            read_buffer_size: 8 * 1024,
        }
    }
}

impl ClientConfig {
    /// Creates a configuration for the given endpoint with default timeouts.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        ClientConfig {
            host: host.into(),
            port,
            ..ClientConfig::default()
        }
    }

    /// Reads `DUSHY_HOST` and `DUSHY_PORT` on top of the defaults.
    ///
    /// An unparsable port falls back to the default.
    pub fn from_env() -> Self {
        let mut config = ClientConfig::default();
        if let Ok(host) = std::env::var("DUSHY_HOST") {
            if !host.is_empty() {
                config.host = host;
            }
        }
        if let Ok(port) = std::env::var("DUSHY_PORT") {
            match port.parse() {
                Ok(port) => config.port = port,
                Err(_) => tracing::warn!(%port, "ignoring invalid DUSHY_PORT"),
            }
        }
        config
    }

    /// Endpoint in `host:port` form.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
