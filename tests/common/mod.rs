//! Shared utilities for integration tests.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use miniproxy::server::{ConnectionHandler, ServerCore, ServerError, ServerSettings};
use miniproxy::ServerState;
use tokio::task::JoinHandle;

/// A bound and serving core on an ephemeral loopback port.
pub struct TestServer {
    pub core: Arc<ServerCore>,
    pub addr: SocketAddr,
    pub serve: JoinHandle<Result<(), ServerError>>,
}

/// Bind to 127.0.0.1:0 and run the accept loop with `handler`.
pub async fn start_server<H>(shutdown_timeout: Duration, handler: H) -> TestServer
where
    H: ConnectionHandler,
{
    let settings = ServerSettings::with_address("127.0.0.1:0").shutdown_timeout(shutdown_timeout);
    let core = Arc::new(ServerCore::new(settings, "test"));
    let addr = core.bind().await.expect("bind ephemeral port");

    let serve = {
        let core = Arc::clone(&core);
        tokio::spawn(async move { core.serve(handler).await })
    };

    let mut state = core.subscribe_state();
    tokio::time::timeout(Duration::from_secs(2), state.wait_for(|s| *s == ServerState::Serving))
        .await
        .expect("server should start serving")
        .expect("state channel open");

    TestServer { core, addr, serve }
}

/// Wait until the tracker reports `count` in-flight connections.
pub async fn wait_for_active(core: &ServerCore, count: u64) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while core.tracker().active_count() != count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("connections should be registered");
}
