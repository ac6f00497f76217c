//! Connection lifecycle tracking.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing
//! - Count in-flight connection handlers for graceful shutdown
//! - Wrap accepted streams with their per-connection timeouts
//!
//! # Design Decisions
//! - Release is tied to `Drop`, so a handler that errors or panics still
//!   decrements the count
//! - Waiting for zero uses `Notify` rather than polling

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Notify;

use crate::lifecycle::DrainGate;
use crate::observability::metrics;
use crate::resilience::{with_timeout, TimeoutError};

/// Global atomic counter for connection IDs.
/// Using relaxed ordering is sufficient since we only need uniqueness, not synchronization.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Bookkeeping misuse detected by the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TrackerError {
    /// `done()` was called with no connection registered.
    #[error("connection tracker underflow: done() called more times than add()")]
    Underflow,
}

/// Counts in-flight connection handlers.
///
/// Clones share the same counter.
#[derive(Debug, Clone, Default)]
pub struct ConnectionTracker {
    inner: Arc<TrackerInner>,
}

#[derive(Debug, Default)]
struct TrackerInner {
    active: AtomicU64,
    zero: Notify,
}

impl ConnectionTracker {
    /// Create a new connection tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one in-flight connection.
    ///
    /// Prefer [`track`](Self::track), which pairs this with a guaranteed `done()`.
    pub fn add(&self) {
        self.inner.active.fetch_add(1, Ordering::SeqCst);
        metrics::connection_opened();
    }

    /// Deregister one in-flight connection.
    pub fn done(&self) -> Result<(), TrackerError> {
        let prev = self
            .inner
            .active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .map_err(|_| {
                tracing::error!("Connection tracker underflow");
                TrackerError::Underflow
            })?;

        metrics::connection_closed();
        if prev == 1 {
            self.inner.zero.notify_waiters();
        }
        Ok(())
    }

    /// Register a connection and return a guard that deregisters it on drop.
    pub fn track(&self) -> ConnectionGuard {
        self.add();
        ConnectionGuard {
            tracker: self.clone(),
            id: ConnectionId::new(),
        }
    }

    /// Get current active connection count.
    pub fn active_count(&self) -> u64 {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Wait until no connections are in flight.
    ///
    /// Returns immediately if the count is already zero.
    pub async fn wait(&self) {
        loop {
            let notified = self.inner.zero.notified();
            tokio::pin!(notified);
            // Register interest before checking so a concurrent final `done()`
            // cannot slip between the check and the await.
            notified.as_mut().enable();

            if self.active_count() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Guard that tracks a connection's lifetime.
/// Decrements active count when dropped.
#[derive(Debug)]
pub struct ConnectionGuard {
    tracker: ConnectionTracker,
    id: ConnectionId,
}

impl ConnectionGuard {
    /// Get this connection's ID.
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if let Err(e) = self.tracker.done() {
            tracing::error!(connection_id = %self.id, error = %e, "Connection release failed");
        }
        tracing::trace!(connection_id = %self.id, "Connection closed");
    }
}

/// Deadlines applied to individual operations on one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionTimeouts {
    pub read: Duration,
    pub write: Duration,
    pub handshake: Duration,
}

/// Failure of a bounded connection operation.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Timeout(#[from] TimeoutError),
}

/// An accepted client connection handed to a [`ConnectionHandler`](crate::server::ConnectionHandler).
///
/// Carries the shared drain gate so handlers can exit early once the server
/// starts draining.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    peer_addr: SocketAddr,
    id: ConnectionId,
    timeouts: ConnectionTimeouts,
    drain: DrainGate,
}

impl Connection {
    pub fn new(
        stream: TcpStream,
        peer_addr: SocketAddr,
        id: ConnectionId,
        timeouts: ConnectionTimeouts,
        drain: DrainGate,
    ) -> Self {
        Self {
            stream,
            peer_addr,
            id,
            timeouts,
            drain,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn timeouts(&self) -> ConnectionTimeouts {
        self.timeouts
    }

    /// The server-wide drain gate.
    pub fn drain(&self) -> &DrainGate {
        &self.drain
    }

    /// Whether the server is in graceful shutdown.
    pub fn is_draining(&self) -> bool {
        self.drain.is_draining()
    }

    /// Read into `buf`, bounded by the read timeout. Returns 0 on EOF.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, ConnectionError> {
        let n = with_timeout("read", self.timeouts.read, self.stream.read(buf)).await??;
        Ok(n)
    }

    /// Write all of `buf`, bounded by the write timeout.
    pub async fn write_all(&mut self, buf: &[u8]) -> Result<(), ConnectionError> {
        with_timeout("write", self.timeouts.write, self.stream.write_all(buf)).await??;
        Ok(())
    }

    /// Run a protocol handshake over the stream, bounded by the handshake timeout.
    pub async fn handshake<F, T>(&mut self, f: F) -> Result<T, TimeoutError>
    where
        F: for<'a> FnOnce(&'a mut TcpStream) -> BoxFuture<'a, T>,
    {
        let limit = self.timeouts.handshake;
        with_timeout("handshake", limit, f(&mut self.stream)).await
    }

    /// Direct access to the stream for protocol code that manages its own deadlines.
    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    pub fn into_stream(self) -> TcpStream {
        self.stream
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_id_unique() {
        let id1 = ConnectionId::new();
        let id2 = ConnectionId::new();
        assert_ne!(id1, id2);
        assert!(id2.as_u64() > id1.as_u64());
        assert_eq!(id1.to_string(), format!("conn-{}", id1.as_u64()));
    }

    #[test]
    fn connection_tracker_counts() {
        let tracker = ConnectionTracker::new();
        assert_eq!(tracker.active_count(), 0);

        let guard1 = tracker.track();
        assert_eq!(tracker.active_count(), 1);

        let guard2 = tracker.track();
        assert_eq!(tracker.active_count(), 2);
        assert_ne!(guard1.id(), guard2.id());

        drop(guard1);
        assert_eq!(tracker.active_count(), 1);

        drop(guard2);
        assert_eq!(tracker.active_count(), 0);
    }

    #[test]
    fn done_without_add_is_detected() {
        let tracker = ConnectionTracker::new();
        assert_eq!(tracker.done(), Err(TrackerError::Underflow));
        assert_eq!(tracker.active_count(), 0);

        tracker.add();
        assert_eq!(tracker.done(), Ok(()));
        assert_eq!(tracker.done(), Err(TrackerError::Underflow));
        assert_eq!(tracker.active_count(), 0);
    }

    #[test]
    fn guard_released_on_panic() {
        let tracker = ConnectionTracker::new();
        let inner = tracker.clone();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _guard = inner.track();
            panic!("handler failed");
        }));

        assert!(result.is_err());
        assert_eq!(tracker.active_count(), 0);
    }

    #[tokio::test]
    async fn wait_immediate_with_no_connections() {
        let tracker = ConnectionTracker::new();
        tokio::time::timeout(Duration::from_millis(10), tracker.wait())
            .await
            .expect("wait should complete immediately");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn wait_immediate_after_concurrent_balanced_use() {
        let tracker = ConnectionTracker::new();

        let tasks: Vec<_> = (0..64)
            .map(|i| {
                let tracker = tracker.clone();
                tokio::spawn(async move {
                    let guard = tracker.track();
                    if i % 3 == 0 {
                        tokio::task::yield_now().await;
                    }
                    drop(guard);
                })
            })
            .collect();

        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(tracker.active_count(), 0);
        tokio::time::timeout(Duration::from_millis(10), tracker.wait())
            .await
            .expect("wait should complete immediately");
    }

    #[tokio::test]
    async fn wait_completes_when_last_guard_drops() {
        let tracker = ConnectionTracker::new();
        let first = tracker.track();
        let second = tracker.track();

        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.wait().await })
        };

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            drop(first);
            tokio::time::sleep(Duration::from_millis(10)).await;
            drop(second);
        });

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("wait should complete")
            .expect("task should not panic");
    }

    #[tokio::test(start_paused = true)]
    async fn wait_blocks_while_connections_remain() {
        let tracker = ConnectionTracker::new();
        let _guard = tracker.track();

        let result = tokio::time::timeout(Duration::from_secs(5), tracker.wait()).await;
        assert!(result.is_err());
    }

    fn timeouts(limit: Duration) -> ConnectionTimeouts {
        ConnectionTimeouts {
            read: limit,
            write: limit,
            handshake: limit,
        }
    }

    /// An accepted connection plus the client end of the same socket.
    async fn loopback_pair(limit: Duration) -> (Connection, TcpStream) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let (stream, peer_addr) = accepted.unwrap();
        let conn = Connection::new(
            stream,
            peer_addr,
            ConnectionId::new(),
            timeouts(limit),
            DrainGate::new(),
        );
        (conn, client.unwrap())
    }

    #[tokio::test]
    async fn read_and_write_round_trip() {
        let (mut conn, mut peer) = loopback_pair(Duration::from_secs(1)).await;
        assert_eq!(conn.peer_addr(), peer.local_addr().unwrap());
        assert_eq!(
            conn.stream_mut().peer_addr().unwrap(),
            peer.local_addr().unwrap()
        );

        peer.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        let n = conn.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");

        conn.write_all(b"pong").await.unwrap();
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        drop(peer);
        assert_eq!(conn.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn read_times_out_on_silent_peer() {
        let limit = Duration::from_millis(50);
        let (mut conn, _peer) = loopback_pair(limit).await;

        let mut buf = [0u8; 16];
        let err = tokio::time::timeout(Duration::from_secs(2), conn.read(&mut buf))
            .await
            .expect("read deadline should fire first")
            .unwrap_err();

        match err {
            ConnectionError::Timeout(e) => {
                assert_eq!(e.operation, "read");
                assert_eq!(e.limit, limit);
            }
            other => panic!("expected read timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn write_times_out_when_peer_stops_reading() {
        let limit = Duration::from_millis(50);
        let (mut conn, _peer) = loopback_pair(limit).await;

        // Far more than the loopback socket buffers hold.
        let payload = vec![0u8; 64 * 1024 * 1024];
        let err = tokio::time::timeout(Duration::from_secs(5), conn.write_all(&payload))
            .await
            .expect("write deadline should fire first")
            .unwrap_err();

        match err {
            ConnectionError::Timeout(e) => assert_eq!(e.operation, "write"),
            other => panic!("expected write timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn handshake_times_out() {
        use futures_util::FutureExt;

        let limit = Duration::from_millis(50);
        let (mut conn, _peer) = loopback_pair(limit).await;

        let err = conn
            .handshake(|_stream| std::future::pending::<()>().boxed())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            TimeoutError {
                operation: "handshake",
                limit,
            }
        );
    }

    #[tokio::test]
    async fn handshake_runs_over_the_stream() {
        use futures_util::FutureExt;

        let (mut conn, mut peer) = loopback_pair(Duration::from_secs(1)).await;

        let greeter = tokio::spawn(async move {
            let mut hello = [0u8; 5];
            peer.read_exact(&mut hello).await.unwrap();
            peer.write_all(b"OK").await.unwrap();
            (hello, peer)
        });

        let reply = conn
            .handshake(|stream| {
                async move {
                    stream.write_all(b"HELLO").await?;
                    let mut reply = [0u8; 2];
                    stream.read_exact(&mut reply).await?;
                    Ok::<_, std::io::Error>(reply)
                }
                .boxed()
            })
            .await
            .expect("within deadline")
            .unwrap();
        assert_eq!(&reply, b"OK");

        let (hello, peer) = greeter.await.unwrap();
        assert_eq!(&hello, b"HELLO");

        let stream = conn.into_stream();
        assert_eq!(stream.peer_addr().unwrap(), peer.local_addr().unwrap());
    }

    /// Records every update made to the active connections gauge.
    #[derive(Default)]
    struct GaugeLog {
        updates: std::sync::Mutex<Vec<GaugeUpdate>>,
    }

    #[derive(Debug, Clone, Copy, PartialEq)]
    enum GaugeUpdate {
        Increment(f64),
        Decrement(f64),
        Set(f64),
    }

    impl ::metrics::GaugeFn for GaugeLog {
        fn increment(&self, value: f64) {
            self.updates.lock().unwrap().push(GaugeUpdate::Increment(value));
        }

        fn decrement(&self, value: f64) {
            self.updates.lock().unwrap().push(GaugeUpdate::Decrement(value));
        }

        fn set(&self, value: f64) {
            self.updates.lock().unwrap().push(GaugeUpdate::Set(value));
        }
    }

    struct ActiveGaugeRecorder(Arc<GaugeLog>);

    impl ::metrics::Recorder for ActiveGaugeRecorder {
        fn describe_counter(&self, _: ::metrics::KeyName, _: Option<::metrics::Unit>, _: ::metrics::SharedString) {}
        fn describe_gauge(&self, _: ::metrics::KeyName, _: Option<::metrics::Unit>, _: ::metrics::SharedString) {}
        fn describe_histogram(&self, _: ::metrics::KeyName, _: Option<::metrics::Unit>, _: ::metrics::SharedString) {}

        fn register_counter(&self, _: &::metrics::Key, _: &::metrics::Metadata<'_>) -> ::metrics::Counter {
            ::metrics::Counter::noop()
        }

        fn register_gauge(&self, key: &::metrics::Key, _: &::metrics::Metadata<'_>) -> ::metrics::Gauge {
            if key.name() == "miniproxy_active_connections" {
                ::metrics::Gauge::from_arc(Arc::clone(&self.0))
            } else {
                ::metrics::Gauge::noop()
            }
        }

        fn register_histogram(&self, _: &::metrics::Key, _: &::metrics::Metadata<'_>) -> ::metrics::Histogram {
            ::metrics::Histogram::noop()
        }
    }

    #[test]
    fn active_gauge_moves_by_relative_updates() {
        let log = Arc::new(GaugeLog::default());
        let recorder = ActiveGaugeRecorder(Arc::clone(&log));

        ::metrics::with_local_recorder(&recorder, || {
            let tracker = ConnectionTracker::new();
            let first = tracker.track();
            let second = tracker.track();
            drop(first);
            drop(second);
            // Underflow must not touch the gauge.
            assert_eq!(tracker.done(), Err(TrackerError::Underflow));
        });

        let updates = log.updates.lock().unwrap().clone();
        assert_eq!(
            updates,
            vec![
                GaugeUpdate::Increment(1.0),
                GaugeUpdate::Increment(1.0),
                GaugeUpdate::Decrement(1.0),
                GaugeUpdate::Decrement(1.0),
            ]
        );
        assert!(!updates.iter().any(|u| matches!(u, GaugeUpdate::Set(_))));
    }
}
