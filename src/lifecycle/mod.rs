//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Validated config → Init metrics → Construct core → Bind listener
//!
//! Shutdown (shutdown.rs):
//!     Trigger → Drain gate (drain.rs) → Close listener → Race drain vs timeout → Exit
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown (repeats are no-ops)
//! ```
//!
//! # Design Decisions
//! - Ordered startup: config first, then metrics, then listener
//! - Ordered shutdown: signal drain, stop accept, wait, exit
//! - Shutdown has timeout: forced exit after deadline, still a success exit

pub mod drain;
pub mod shutdown;
pub mod signals;
pub mod startup;
pub mod state;

pub use drain::DrainGate;
pub use shutdown::ShutdownOutcome;
pub use state::ServerState;
