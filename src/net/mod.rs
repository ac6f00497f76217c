//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept, close from another task)
//!     → connection.rs (tracking guard, ID, per-connection timeouts)
//!     → Hand off to the connection handler
//! ```
//!
//! # Design Decisions
//! - Each connection tracked for graceful shutdown
//! - Closing the listener is an ordinary event, not an I/O failure

pub mod connection;
pub mod listener;

pub use connection::{
    Connection, ConnectionError, ConnectionGuard, ConnectionId, ConnectionTimeouts,
    ConnectionTracker, TrackerError,
};
pub use listener::{Listener, ListenerError};
