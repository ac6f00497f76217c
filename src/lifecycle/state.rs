//! Server lifecycle states.
//!
//! # State Transitions
//! ```text
//! Created → Serving   : accept loop starts
//! Created → Draining  : shutdown before serving
//! Serving → Draining  : shutdown triggered
//! Draining → Stopped  : connections drained or shutdown timeout elapsed
//! ```
//!
//! `Stopped` is terminal.

use std::fmt;

/// Where the server is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerState {
    /// Configuration applied; accept loop not started.
    Created,
    /// Accept loop running.
    Serving,
    /// Listener closed; waiting for in-flight connections.
    Draining,
    /// Terminal.
    Stopped,
}

impl ServerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerState::Created => "created",
            ServerState::Serving => "serving",
            ServerState::Draining => "draining",
            ServerState::Stopped => "stopped",
        }
    }

    /// Whether shutdown has been triggered.
    pub fn is_shutting_down(&self) -> bool {
        matches!(self, ServerState::Draining | ServerState::Stopped)
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
