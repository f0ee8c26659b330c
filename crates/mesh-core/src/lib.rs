//! Connection lifecycle and message-dispatch engine for the
//! end-to-end-encrypted group chat mesh server.
//!
//! ```text
//!          accept()                 Framing              ConnectionHandler
//! clients ──────────▶ Acceptor ──▶ EnvelopeCodec ──▶ state machine (§4.3) ──┐
//!                         │                                                │
//!                         ▼                                                ▼
//!                   RateLimiter                                      Dispatcher
//!                   (token bucket)                              (registry + fan-out)
//!                                                                        │
//!                                                        UserStore ◀─────┼─────▶ MessageStore
//! ```
//!
//! One read task and one write task per connection; a bounded per-connection
//! outbound queue gives the Dispatcher non-blocking, per-recipient
//! broadcast. Cryptographic state (session key, registered peer key) is
//! owned by each connection's own [`connection::ConnectionHandle`] and
//! erased on close.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod acceptor;
pub mod connection;
pub mod dispatcher;
pub mod envelope;
pub mod error;
pub mod frame;
pub mod handler;
pub mod metrics;
pub mod rate_limiter;

pub use acceptor::{graceful_shutdown, run, AcceptorConfig};
pub use connection::{CloseReason, ConnectionHandle, ConnectionState};
pub use dispatcher::Dispatcher;
pub use envelope::{
    EncryptedMessageData, Envelope, ErrorCode, ErrorData, HandshakeData, HandshakeResponseData,
    NetworkMessageType, UserListData, UserListEntry, MAX_FRAME_BYTES, MAX_MESSAGE_SIZE,
};
pub use error::{FrameError, MeshError, PolicyError, ProtocolError, ResourceError, Result, TransportError};
pub use frame::EnvelopeCodec;
pub use handler::{handle_connection, SharedState};
pub use metrics::{CountingMetrics, Metrics, MetricsSnapshot};
pub use rate_limiter::{ip_key, user_key, RateLimitConfig, RateLimitMetrics, RateLimiter};
