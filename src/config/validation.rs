//! Configuration validation.
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ServerConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use thiserror::Error;

use crate::config::schema::ServerConfig;

/// Sanity ceiling for any configured timeout.
pub const MAX_TIMEOUT_SECS: u64 = 24 * 60 * 60;

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// A semantic problem in an otherwise well-formed config.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("listener.bind_address '{0}' is not a socket address")]
    InvalidBindAddress(String),

    #[error("observability.log_level '{0}' is not one of trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("observability.metrics_address '{0}' is not a socket address")]
    InvalidMetricsAddress(String),

    #[error("timeouts.{field} = {secs}s exceeds the {max}s limit")]
    TimeoutTooLarge {
        field: &'static str,
        secs: u64,
        max: u64,
    },
}

/// Check `config` for semantic errors.
pub fn validate_config(config: &ServerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::InvalidBindAddress(
            config.listener.bind_address.clone(),
        ));
    }

    let level = config.observability.log_level.to_ascii_lowercase();
    if !LOG_LEVELS.contains(&level.as_str()) {
        errors.push(ValidationError::InvalidLogLevel(
            config.observability.log_level.clone(),
        ));
    }

    if config.observability.metrics_enabled
        && config
            .observability
            .metrics_address
            .parse::<SocketAddr>()
            .is_err()
    {
        errors.push(ValidationError::InvalidMetricsAddress(
            config.observability.metrics_address.clone(),
        ));
    }

    let t = &config.timeouts;
    for (field, secs) in [
        ("read_secs", t.read_secs),
        ("write_secs", t.write_secs),
        ("handshake_secs", t.handshake_secs),
        ("graceful_shutdown_secs", t.graceful_shutdown_secs),
    ] {
        if secs > MAX_TIMEOUT_SECS {
            errors.push(ValidationError::TimeoutTooLarge {
                field,
                secs,
                max: MAX_TIMEOUT_SECS,
            });
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
