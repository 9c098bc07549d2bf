//! Balancer error types.

use thiserror::Error;

/// Errors from server registration and updates.
///
/// A failed call leaves the balancer unchanged.
#[derive(Debug, Error)]
pub enum BalancerError {
    #[error("server already registered: {0}")]
    DuplicateServer(String),

    #[error("server not registered: {0}")]
    UnknownServer(String),

    #[error("server {server} is registered at priority {actual}, not {expected}")]
    PriorityMismatch {
        server: String,
        expected: u8,
        actual: u8,
    },
}

pub type BalancerResult<T> = Result<T, BalancerError>;
