//! The server core: accept loop and shutdown sequence.
//!
//! # Responsibilities
//! - Own the listener, drain gate and connection tracker
//! - Run the accept loop and dispatch each connection to the handler
//! - Run the shutdown sequence exactly once
//!
//! # Design Decisions
//! - State transitions go through `watch::Sender::send_if_modified`, which
//!   makes the "already shutting down" check and the transition one step
//! - Handlers run on their own tasks; a panic is caught and logged and the
//!   connection is still released
//! - The core returns the shutdown outcome; exiting the process is left to
//!   the binary

use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use thiserror::Error;
use tokio::sync::watch;

use crate::config::ServerConfig;
use crate::lifecycle::shutdown::drain_connections;
use crate::lifecycle::{DrainGate, ServerState, ShutdownOutcome};
use crate::net::{Connection, ConnectionGuard, ConnectionTracker, Listener, ListenerError};
use crate::observability::metrics;
use crate::resilience::Backoff;
use crate::server::handler::ConnectionHandler;
use crate::server::settings::ServerSettings;

/// Initial delay after a transient accept failure.
const ACCEPT_BACKOFF_BASE_MS: u64 = 5;
/// Ceiling for the accept backoff.
const ACCEPT_BACKOFF_MAX_MS: u64 = 1000;

/// Errors surfaced by the server core.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The listener could not be bound. Fatal at startup.
    #[error("Startup failed: {0}")]
    Bind(#[source] ListenerError),

    /// The listener became unusable while serving.
    #[error("Accept loop failed: {0}")]
    Accept(#[source] ListenerError),

    #[error("Listener is not bound")]
    NotBound,

    #[error("Listener is already bound")]
    AlreadyBound,

    #[error("Cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: ServerState,
    },
}

/// Lifecycle coordinator for one listening server.
///
/// Share it behind an `Arc`: one task runs [`serve`](Self::serve) while the
/// shutdown trigger calls [`shutdown`](Self::shutdown).
#[derive(Debug)]
pub struct ServerCore {
    settings: ServerSettings,
    version: String,
    listener: OnceLock<Listener>,
    drain: DrainGate,
    tracker: ConnectionTracker,
    state: watch::Sender<ServerState>,
    outcome: OnceLock<ShutdownOutcome>,
}

impl ServerCore {
    pub fn new(settings: ServerSettings, version: impl Into<String>) -> Self {
        let (state, _) = watch::channel(ServerState::Created);
        Self {
            settings,
            version: version.into(),
            listener: OnceLock::new(),
            drain: DrainGate::new(),
            tracker: ConnectionTracker::new(),
            state,
            outcome: OnceLock::new(),
        }
    }

    pub fn from_config(config: &ServerConfig, version: impl Into<String>) -> Self {
        Self::new(ServerSettings::from_config(config), version)
    }

    /// Bind the listener to the configured address.
    pub async fn bind(&self) -> Result<SocketAddr, ServerError> {
        let state = self.state();
        if state != ServerState::Created {
            return Err(ServerError::InvalidState {
                operation: "bind",
                state,
            });
        }
        if self.listener.get().is_some() {
            return Err(ServerError::AlreadyBound);
        }

        let listener = match Listener::bind(&self.settings.address).await {
            Ok(listener) => listener,
            Err(e) => {
                tracing::error!(address = %self.settings.address, error = %e, "Failed to bind listener");
                return Err(ServerError::Bind(e));
            }
        };

        let addr = listener.local_addr();
        self.listener
            .set(listener)
            .map_err(|_| ServerError::AlreadyBound)?;
        Ok(addr)
    }

    /// Run the accept loop until the listener is closed.
    ///
    /// Returns `Ok(())` when shutdown closes the listener (or had already
    /// been triggered), and [`ServerError::Accept`] if the listener becomes
    /// unusable.
    pub async fn serve<H>(&self, handler: H) -> Result<(), ServerError>
    where
        H: ConnectionHandler,
    {
        let listener = self.listener.get().ok_or(ServerError::NotBound)?;

        let mut previous = ServerState::Created;
        self.state.send_if_modified(|state| {
            previous = *state;
            if *state == ServerState::Created {
                *state = ServerState::Serving;
                true
            } else {
                false
            }
        });

        match previous {
            ServerState::Created => {}
            ServerState::Draining | ServerState::Stopped => {
                tracing::info!(state = %previous, "Shutdown triggered before serving; not accepting");
                return Ok(());
            }
            ServerState::Serving => {
                return Err(ServerError::InvalidState {
                    operation: "serve",
                    state: previous,
                });
            }
        }

        tracing::info!(
            address = %listener.local_addr(),
            version = %self.version,
            read_timeout = ?self.settings.read_timeout,
            write_timeout = ?self.settings.write_timeout,
            shutdown_timeout = ?self.settings.shutdown_timeout,
            "Serving started"
        );

        let handler = Arc::new(handler);
        let mut backoff = Backoff::new(ACCEPT_BACKOFF_BASE_MS, ACCEPT_BACKOFF_MAX_MS);

        loop {
            match listener.accept(&self.tracker).await {
                Ok((stream, peer_addr, guard)) => {
                    backoff.reset();
                    metrics::record_connection_accepted();

                    if self.drain.is_draining() {
                        // Accepted before the listener closed; it still gets to run.
                        tracing::debug!(connection_id = %guard.id(), "Connection accepted while draining");
                    }

                    let conn = Connection::new(
                        stream,
                        peer_addr,
                        guard.id(),
                        self.settings.connection_timeouts(),
                        self.drain.clone(),
                    );
                    tokio::spawn(run_handler(Arc::clone(&handler), conn, guard));
                }
                Err(e) => match on_accept_error(&e) {
                    AcceptAction::Stop => {
                        tracing::info!("Accept loop stopped");
                        return Ok(());
                    }
                    AcceptAction::Fail => {
                        tracing::error!(error = %e, "Listener unusable, stopping accept loop");
                        metrics::record_accept_error("fatal");
                        return Err(ServerError::Accept(e));
                    }
                    AcceptAction::Retry => {
                        let delay = backoff.next_delay();
                        tracing::warn!(
                            error = %e,
                            consecutive_failures = backoff.attempts(),
                            retry_in = ?delay,
                            "Transient accept error"
                        );
                        metrics::record_accept_error("transient");

                        if pause_before_retry(delay, &self.drain).await {
                            tracing::debug!("Drain started during accept backoff");
                        }
                    }
                },
            }
        }
    }

    /// Run the shutdown sequence.
    ///
    /// Signals the drain gate, closes the listener, then waits for in-flight
    /// connections up to the shutdown timeout. Only the first call does
    /// anything; later calls return `None` right away.
    pub async fn shutdown(&self) -> Option<ShutdownOutcome> {
        let mut previous = ServerState::Created;
        let began = self.state.send_if_modified(|state| {
            previous = *state;
            if state.is_shutting_down() {
                false
            } else {
                *state = ServerState::Draining;
                true
            }
        });

        if !began {
            tracing::info!(state = %previous, "Shutdown already in progress, ignoring trigger");
            return None;
        }

        let started = Instant::now();
        tracing::info!(
            active_connections = self.tracker.active_count(),
            shutdown_timeout = ?self.settings.shutdown_timeout,
            "Drain initiated"
        );

        self.drain.signal();
        if let Some(listener) = self.listener.get() {
            listener.close().await;
        }

        let outcome = drain_connections(&self.tracker, self.settings.shutdown_timeout).await;
        let elapsed = started.elapsed();

        match outcome {
            ShutdownOutcome::Graceful => {
                tracing::info!(elapsed = ?elapsed, "Drain completed gracefully");
            }
            ShutdownOutcome::TimedOut { remaining } => {
                tracing::warn!(
                    elapsed = ?elapsed,
                    remaining_connections = remaining,
                    "Drain timed out, abandoning remaining connections"
                );
            }
        }
        metrics::record_shutdown(outcome.as_str(), elapsed);

        let _ = self.outcome.set(outcome);
        self.state.send_replace(ServerState::Stopped);
        Some(outcome)
    }

    /// Wait until the shutdown sequence has finished.
    pub async fn stopped(&self) {
        let mut rx = self.state.subscribe();
        // The sender is owned by `self`, so the channel outlives this wait.
        let _ = rx.wait_for(|state| *state == ServerState::Stopped).await;
    }

    pub fn state(&self) -> ServerState {
        *self.state.borrow()
    }

    /// Subscribe to state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ServerState> {
        self.state.subscribe()
    }

    /// Outcome of the shutdown sequence, once it has finished.
    pub fn outcome(&self) -> Option<ShutdownOutcome> {
        self.outcome.get().copied()
    }

    /// Bound address, once [`bind`](Self::bind) succeeded.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.get().map(Listener::local_addr)
    }

    pub fn drain_gate(&self) -> &DrainGate {
        &self.drain
    }

    pub fn tracker(&self) -> &ConnectionTracker {
        &self.tracker
    }

    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }

    pub fn version(&self) -> &str {
        &self.version
    }
}

/// What the accept loop does after a failed accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AcceptAction {
    /// The listener was closed by shutdown.
    Stop,
    /// The listener is unusable.
    Fail,
    /// Back off and accept again.
    Retry,
}

fn on_accept_error(err: &ListenerError) -> AcceptAction {
    if err.is_closed() {
        AcceptAction::Stop
    } else if err.is_fatal() {
        AcceptAction::Fail
    } else {
        AcceptAction::Retry
    }
}

/// Sleep for `delay`, cut short if the drain gate fires first.
///
/// Returns `true` if the drain gate ended the pause.
async fn pause_before_retry(delay: Duration, drain: &DrainGate) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = drain.drained() => true,
    }
}

/// Drive one handler to completion and release its tracker slot.
async fn run_handler<H>(handler: Arc<H>, conn: Connection, guard: ConnectionGuard)
where
    H: ConnectionHandler,
{
    let peer_addr = conn.peer_addr();
    tracing::trace!(connection_id = %guard.id(), peer_addr = %peer_addr, "Handler started");

    if AssertUnwindSafe(handler.handle(conn))
        .catch_unwind()
        .await
        .is_err()
    {
        tracing::error!(connection_id = %guard.id(), peer_addr = %peer_addr, "Connection handler panicked");
        metrics::record_handler_panic();
    }

    drop(guard);
}
