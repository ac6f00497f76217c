//! OS signal handling.
//!
//! # Responsibilities
//! - Register signal handlers (SIGTERM, SIGINT)
//! - Translate every received signal into a shutdown trigger on the server
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)
//! - Repeated signals are forwarded too; the server ignores all but the first

use std::fmt;
use std::io;
use std::sync::Arc;

use crate::server::ServerCore;

/// A signal that requests shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Interrupt,
    Terminate,
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownSignal::Interrupt => f.write_str("SIGINT"),
            ShutdownSignal::Terminate => f.write_str("SIGTERM"),
        }
    }
}

/// Source of shutdown signals, registered once.
pub struct SignalListener {
    #[cfg(unix)]
    sigterm: tokio::signal::unix::Signal,
    #[cfg(unix)]
    sigint: tokio::signal::unix::Signal,
}

impl SignalListener {
    /// Register the process signal handlers.
    pub fn register() -> io::Result<Self> {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            Ok(Self {
                sigterm: signal(SignalKind::terminate())?,
                sigint: signal(SignalKind::interrupt())?,
            })
        }

        #[cfg(not(unix))]
        {
            Ok(Self {})
        }
    }

    /// Wait for the next shutdown signal.
    pub async fn recv(&mut self) -> io::Result<ShutdownSignal> {
        #[cfg(unix)]
        {
            tokio::select! {
                _ = self.sigterm.recv() => Ok(ShutdownSignal::Terminate),
                _ = self.sigint.recv() => Ok(ShutdownSignal::Interrupt),
            }
        }

        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c().await?;
            Ok(ShutdownSignal::Interrupt)
        }
    }
}

/// Forward every shutdown signal to `core`.
///
/// Each signal starts `ServerCore::shutdown` on its own task, so a repeated
/// signal during a drain reaches the server's duplicate-trigger guard instead
/// of queueing behind the drain.
pub async fn trigger_on_signals(core: Arc<ServerCore>, mut signals: SignalListener) -> io::Result<()> {
    loop {
        let signal = signals.recv().await?;
        tracing::info!(signal = %signal, "Shutdown signal received");

        let core = Arc::clone(&core);
        tokio::spawn(async move {
            core.shutdown().await;
        });
    }
}
