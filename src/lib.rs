//! Lifecycle and graceful-shutdown core for a long-running TCP server.
//!
//! The server binds a listener, hands each accepted connection to an opaque
//! [`ConnectionHandler`](server::ConnectionHandler), and on shutdown drains
//! in-flight connections for at most the configured timeout.

// Core subsystems
pub mod config;
pub mod net;
pub mod server;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;
pub mod resilience;

pub use config::ServerConfig;
pub use lifecycle::{DrainGate, ServerState, ShutdownOutcome};
pub use net::{Connection, ConnectionTracker, Listener};
pub use server::{ConnectionHandler, ServerCore, ServerError};
