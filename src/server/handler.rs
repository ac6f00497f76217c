//! Connection handler abstraction.
//!
//! The server core treats handlers as opaque: it hands over a [`Connection`]
//! and only cares that the returned future completes.

use std::future::Future;

use crate::net::{Connection, ConnectionError};

/// Serves one accepted connection.
///
/// Implemented for any `Fn(Connection) -> impl Future<Output = ()>` closure.
pub trait ConnectionHandler: Send + Sync + 'static {
    fn handle(&self, conn: Connection) -> impl Future<Output = ()> + Send;
}

impl<F, Fut> ConnectionHandler for F
where
    F: Fn(Connection) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send,
{
    fn handle(&self, conn: Connection) -> impl Future<Output = ()> + Send {
        self(conn)
    }
}

/// Writes back whatever the client sends.
///
/// Stops at EOF, on error, or once the server is draining.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoHandler;

impl EchoHandler {
    async fn echo(conn: &mut Connection) -> Result<u64, ConnectionError> {
        let mut buf = vec![0u8; 4096];
        let mut total = 0u64;

        loop {
            if conn.is_draining() {
                tracing::debug!(connection_id = %conn.id(), "Draining, closing connection");
                return Ok(total);
            }

            let n = conn.read(&mut buf).await?;
            if n == 0 {
                return Ok(total);
            }
            conn.write_all(&buf[..n]).await?;
            total += n as u64;
        }
    }
}

impl ConnectionHandler for EchoHandler {
    fn handle(&self, mut conn: Connection) -> impl Future<Output = ()> + Send {
        async move {
            let id = conn.id();
            let peer = conn.peer_addr();

            match Self::echo(&mut conn).await {
                Ok(bytes) => {
                    tracing::debug!(connection_id = %id, peer_addr = %peer, bytes, "Connection finished")
                }
                Err(e) => {
                    tracing::debug!(connection_id = %id, peer_addr = %peer, error = %e, "Connection ended with error")
                }
            }
        }
    }
}
