//! TCP listener that can be closed from another task.
//!
//! # Responsibilities
//! - Bind to the configured address
//! - Accept incoming TCP connections
//! - Unblock a pending accept when closed, and refuse all later accepts
//!
//! # Design Decisions
//! - `close()` flips a watch flag first, then takes the socket out under the
//!   same lock `accept()` holds, so nothing is accepted after it returns
//! - An accepted connection is registered with the tracker before that lock is
//!   released, so once `close()` returns every accepted connection is counted
//! - "Closed" is a distinct error variant, not an I/O error

use std::io;
use std::net::SocketAddr;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};

use super::connection::{ConnectionGuard, ConnectionTracker};

/// Error type for listener operations.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// Failed to bind to address.
    #[error("Failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },

    /// Failed to accept connection.
    #[error("Failed to accept: {0}")]
    Accept(#[source] io::Error),

    /// The listener has been closed.
    #[error("Listener closed")]
    Closed,
}

impl ListenerError {
    /// Whether this is the expected result of [`Listener::close`].
    pub fn is_closed(&self) -> bool {
        matches!(self, ListenerError::Closed)
    }

    /// Whether the listener can no longer accept, as opposed to a transient
    /// per-connection failure (aborted handshake, fd exhaustion, ...).
    pub fn is_fatal(&self) -> bool {
        match self {
            ListenerError::Bind { .. } => true,
            ListenerError::Accept(e) => matches!(
                e.kind(),
                io::ErrorKind::InvalidInput
                    | io::ErrorKind::NotFound
                    | io::ErrorKind::Unsupported
            ),
            ListenerError::Closed => false,
        }
    }
}

/// A bound TCP listener owned by the server core.
#[derive(Debug)]
pub struct Listener {
    /// `None` once closed; dropping the socket releases the port.
    inner: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    closed_tx: watch::Sender<bool>,
}

impl Listener {
    /// Bind to `address` (e.g. "0.0.0.0:8080").
    pub async fn bind(address: &str) -> Result<Self, ListenerError> {
        let bind_err = |source| ListenerError::Bind {
            address: address.to_string(),
            source,
        };

        let listener = TcpListener::bind(address).await.map_err(bind_err)?;
        let local_addr = listener.local_addr().map_err(bind_err)?;

        tracing::info!(address = %local_addr, "Listener bound");

        let (closed_tx, _) = watch::channel(false);
        Ok(Self {
            inner: Mutex::new(Some(listener)),
            local_addr,
            closed_tx,
        })
    }

    /// Accept the next connection and register it with `tracker`.
    ///
    /// Returns [`ListenerError::Closed`] if the listener is closed before or
    /// while waiting.
    pub async fn accept(
        &self,
        tracker: &ConnectionTracker,
    ) -> Result<(TcpStream, SocketAddr, ConnectionGuard), ListenerError> {
        let mut closed_rx = self.closed_tx.subscribe();
        if *closed_rx.borrow() {
            return Err(ListenerError::Closed);
        }

        let guard = self.inner.lock().await;
        let listener = guard.as_ref().ok_or(ListenerError::Closed)?;

        tokio::select! {
            biased;
            _ = wait_closed(&mut closed_rx) => Err(ListenerError::Closed),
            res = listener.accept() => {
                let (stream, addr) = res.map_err(ListenerError::Accept)?;
                // Still under the lock: close() cannot finish until this is counted.
                let tracked = tracker.track();
                tracing::debug!(peer_addr = %addr, connection_id = %tracked.id(), "Connection accepted");
                Ok((stream, addr, tracked))
            }
        }
    }

    /// Close the listener and release the bound socket.
    ///
    /// Safe to call while another task is blocked in [`accept`](Self::accept).
    /// Returns `false` if the listener was already closed.
    pub async fn close(&self) -> bool {
        let first = self.closed_tx.send_if_modified(|closed| {
            if *closed {
                false
            } else {
                *closed = true;
                true
            }
        });

        if !first {
            tracing::debug!(address = %self.local_addr, "Listener already closed");
            return false;
        }

        // A pending accept observes the flag and drops the lock.
        let mut guard = self.inner.lock().await;
        guard.take();

        tracing::info!(address = %self.local_addr, "Listener closed");
        true
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

async fn wait_closed(rx: &mut watch::Receiver<bool>) {
    // The sender is owned by the listener itself, so this only ends on close.
    let _ = rx.wait_for(|closed| *closed).await;
}
