//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Accept loop:
//!     → transient accept error → backoff.rs (exponential delay, reset on success)
//!
//! Connection handler:
//!     → timeouts.rs (bound handshake / read / write)
//! ```
//!
//! # Design Decisions
//! - Timeouts are non-negotiable; every client operation has a deadline
//! - Transient failures never tear down the accept loop

pub mod backoff;
pub mod timeouts;

pub use backoff::Backoff;
pub use timeouts::{with_timeout, TimeoutError};
