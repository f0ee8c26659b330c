//! Error taxonomy for the connection lifecycle and dispatch engine.
//!
//! Nested per concern, composed into [`MeshError`] at task boundaries, the
//! same shape as the teacher's top-level `Error`/`FrameError`/`SessionError`
//! split.

use thiserror::Error;

/// Frame-level parsing/framing errors (§4.1).
#[derive(Debug, Error, Clone)]
pub enum FrameError {
    /// A single frame exceeded the 8192-byte cap, including the terminator.
    #[error("frame too long: max {max}, actual {actual}")]
    TooLong {
        /// Maximum allowed frame length.
        max: usize,
        /// Observed frame length.
        actual: usize,
    },

    /// A frame was not valid UTF-8.
    #[error("frame is not valid utf-8")]
    InvalidUtf8,

    /// A frame was valid UTF-8 but not valid JSON, or did not match the
    /// envelope schema.
    #[error("invalid envelope json: {0}")]
    InvalidJson(String),
}

/// Protocol-state errors: wrong message type for the connection's state,
/// or an envelope whose `type` is not one the server recognizes.
#[derive(Debug, Error, Clone)]
pub enum ProtocolError {
    /// A lower-level framing error.
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// The envelope's `type` field did not match any known `NetworkMessageType`.
    #[error("unsupported message type: {0}")]
    UnsupportedType(String),

    /// The envelope type is not valid for the connection's current state.
    #[error("message type {message_type} not valid in state {state}")]
    WrongStateForType {
        /// The connection's current state.
        state: &'static str,
        /// The message type that was rejected.
        message_type: String,
    },
}

/// Resource-exhaustion errors.
#[derive(Debug, Error, Clone, Copy)]
pub enum ResourceError {
    /// The server is at `maxConnections` capacity.
    #[error("max connections reached")]
    MaxConnections,

    /// A connection's outbound queue was full at enqueue time.
    #[error("slow consumer")]
    SlowConsumer,
}

/// Rate-limiting policy errors.
#[derive(Debug, Error, Clone, Copy)]
pub enum PolicyError {
    /// The caller's token bucket (by IP or user) was empty or blocked.
    #[error("rate limited")]
    RateLimited,
}

/// Transport-level errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer closed the connection (clean or unclean EOF).
    #[error("connection closed")]
    Eof,

    /// An underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The reader-idle timer elapsed with no successful read.
    #[error("read timeout")]
    ReadTimeout,
}

/// Top-level error type, composing every concern via `#[from]`.
#[derive(Debug, Error)]
pub enum MeshError {
    /// A protocol/framing error.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A cryptographic failure.
    #[error(transparent)]
    Crypto(#[from] mesh_crypto::CryptoError),

    /// A resource-exhaustion condition.
    #[error(transparent)]
    Resource(#[from] ResourceError),

    /// A rate-limit policy violation.
    #[error(transparent)]
    Policy(#[from] PolicyError),

    /// A transport-level failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A persistence failure from `UserStore` or `MessageStore`.
    #[error(transparent)]
    Store(#[from] mesh_store::StoreError),
}

/// Result alias for fallible connection/dispatch operations.
pub type Result<T> = std::result::Result<T, MeshError>;
