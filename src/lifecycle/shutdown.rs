//! Shutdown coordination for the server.
//!
//! Races "all connections finished" against the shutdown timeout, then
//! finalizes the process.

use std::io::Write;
use std::time::Duration;

use crate::net::ConnectionTracker;

/// How a drain ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Every in-flight connection finished before the deadline.
    Graceful,
    /// The deadline elapsed first; `remaining` handlers were abandoned.
    TimedOut { remaining: u64 },
}

impl ShutdownOutcome {
    pub fn is_graceful(&self) -> bool {
        matches!(self, ShutdownOutcome::Graceful)
    }

    /// Label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            ShutdownOutcome::Graceful => "graceful",
            ShutdownOutcome::TimedOut { .. } => "timeout",
        }
    }
}

/// Wait for `tracker` to reach zero, giving up after `timeout`.
///
/// The losing branch is dropped; handlers that are still running are left
/// alone.
pub async fn drain_connections(tracker: &ConnectionTracker, timeout: Duration) -> ShutdownOutcome {
    tokio::select! {
        _ = tracker.wait() => ShutdownOutcome::Graceful,
        _ = tokio::time::sleep(timeout) => ShutdownOutcome::TimedOut {
            remaining: tracker.active_count(),
        },
    }
}

/// Flush output sinks and terminate the process.
///
/// Graceful and timed-out drains both exit with status 0; `code` is nonzero
/// only when serving itself failed. Outstanding handlers are abandoned with
/// the process.
pub fn exit_process(code: i32, outcome: Option<ShutdownOutcome>, version: &str) -> ! {
    tracing::info!(
        version = %version,
        exit_code = code,
        outcome = outcome.map(|o| o.as_str()).unwrap_or("none"),
        "Process exiting"
    );

    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();
    std::process::exit(code);
}
