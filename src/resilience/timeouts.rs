//! Timeout enforcement for per-connection operations.
//!
//! # Responsibilities
//! - Bound handshake, read and write operations with their configured deadline
//! - Report which operation timed out and after how long
//!
//! # Design Decisions
//! - Uses Tokio's timeout facilities
//! - Timeout errors are distinct from I/O errors
//! - Independent of the shutdown timeout

use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// An operation did not finish within its deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{operation} timed out after {limit:?}")]
pub struct TimeoutError {
    /// Name of the bounded operation (e.g. "read").
    pub operation: &'static str,
    /// The deadline that elapsed.
    pub limit: Duration,
}

/// Run `fut` with a deadline of `limit`.
pub async fn with_timeout<F>(
    operation: &'static str,
    limit: Duration,
    fut: F,
) -> Result<F::Output, TimeoutError>
where
    F: Future,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| TimeoutError { operation, limit })
}
