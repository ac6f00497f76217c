//! Immutable runtime settings derived from configuration.

use std::time::Duration;

use crate::config::ServerConfig;
use crate::net::ConnectionTimeouts;

pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Address and timeouts the server core runs with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    pub address: String,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub handshake_timeout: Duration,
    pub shutdown_timeout: Duration,
}

impl ServerSettings {
    /// Derive settings from configuration.
    ///
    /// A zero timeout selects the built-in default; nothing waits forever.
    pub fn from_config(config: &ServerConfig) -> Self {
        let t = &config.timeouts;
        Self {
            address: config.listener.bind_address.clone(),
            read_timeout: secs_or(t.read_secs, DEFAULT_READ_TIMEOUT),
            write_timeout: secs_or(t.write_secs, DEFAULT_WRITE_TIMEOUT),
            handshake_timeout: secs_or(t.handshake_secs, DEFAULT_HANDSHAKE_TIMEOUT),
            shutdown_timeout: secs_or(t.graceful_shutdown_secs, DEFAULT_SHUTDOWN_TIMEOUT),
        }
    }

    /// Per-connection deadlines handed to every handler.
    pub fn connection_timeouts(&self) -> ConnectionTimeouts {
        ConnectionTimeouts {
            read: self.read_timeout,
            write: self.write_timeout,
            handshake: self.handshake_timeout,
        }
    }

    /// Settings with the given address and default timeouts.
    pub fn with_address(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            read_timeout: DEFAULT_READ_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

fn secs_or(secs: u64, default: Duration) -> Duration {
    if secs == 0 {
        default
    } else {
        Duration::from_secs(secs)
    }
}
