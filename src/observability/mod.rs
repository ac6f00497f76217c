//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Lifecycle and accept loop produce:
//!     → logging.rs (structured log events per phase transition)
//!     → metrics.rs (connection counters, accept errors, shutdown outcome)
//!
//! Consumers:
//!     → stdout (text or JSON)
//!     → Metrics endpoint (Prometheus scrape)
//! ```

pub mod logging;
pub mod metrics;
