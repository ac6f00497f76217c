//! Startup orchestration.
//!
//! # Responsibilities
//! - Initialize metrics export
//! - Construct the server core from validated configuration
//! - Bind the listener before any traffic is accepted
//!
//! # Design Decisions
//! - Fail fast: a bind error is fatal and the server never reaches `Serving`
//! - Metrics export failure is logged, not fatal

use std::net::SocketAddr;
use std::sync::Arc;

use crate::config::ServerConfig;
use crate::observability::metrics;
use crate::server::{ServerCore, ServerError};

/// Build and bind the server described by `config`.
pub async fn start(config: &ServerConfig, version: &str) -> Result<Arc<ServerCore>, ServerError> {
    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse::<SocketAddr>() {
            Ok(addr) => {
                if let Err(e) = metrics::init_metrics(addr) {
                    tracing::error!(metrics_address = %addr, error = %e, "Failed to start metrics exporter");
                }
            }
            Err(e) => {
                tracing::error!(
                    metrics_address = %config.observability.metrics_address,
                    error = %e,
                    "Failed to parse metrics address"
                );
            }
        }
    }

    let core = Arc::new(ServerCore::from_config(config, version));
    core.bind().await?;
    Ok(core)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::ServerState;

    #[tokio::test]
    async fn start_binds_listener() {
        let mut config = ServerConfig::default();
        config.listener.bind_address = "127.0.0.1:0".to_string();

        let core = start(&config, "test").await.unwrap();
        assert!(core.local_addr().is_some());
        assert_eq!(core.state(), ServerState::Created);
    }

    #[tokio::test]
    async fn start_fails_on_address_in_use() {
        let occupied = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();

        let mut config = ServerConfig::default();
        config.listener.bind_address = occupied.local_addr().unwrap().to_string();

        let err = start(&config, "test").await.unwrap_err();
        assert!(matches!(err, ServerError::Bind(_)));
    }
}
