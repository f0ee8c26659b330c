//! Error types for persistence collaborators.

use thiserror::Error;

/// Errors raised by `UserStore` and `MessageStore` implementations.
#[derive(Debug, Error, Clone)]
pub enum StoreError {
    /// The requested record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The backing store is unavailable (I/O failure, connection loss, etc).
    #[error("store unavailable: {0}")]
    Unavailable(String),
}
