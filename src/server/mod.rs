//! Server core subsystem.
//!
//! # Data Flow
//! ```text
//! ServerCore::serve()
//!     → Listener::accept()
//!     → ConnectionTracker::track() (guard released on every exit path)
//!     → spawn handler with Connection (stream + timeouts + drain gate)
//!
//! ServerCore::shutdown()
//!     → DrainGate::signal()
//!     → Listener::close() (unblocks accept loop)
//!     → race ConnectionTracker::wait() vs shutdown timeout
//!     → Stopped
//! ```

pub mod core;
pub mod handler;
pub mod settings;

pub use self::core::{ServerCore, ServerError};
pub use handler::{ConnectionHandler, EchoHandler};
pub use settings::ServerSettings;
