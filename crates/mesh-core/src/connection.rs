//! Per-connection state: the [`ConnectionHandle`] shared between a
//! connection's own read/write tasks and the [`crate::dispatcher::Dispatcher`]
//! registry (§3 Connection, §4.3).

use std::net::SocketAddr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use mesh_crypto::SessionKey;
use rsa::RsaPublicKey;
use tokio::sync::{mpsc, Notify, RwLock};

/// Recommended bound for a connection's outbound queue (§4.4 back-pressure).
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// The connection lifecycle state (§4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Just accepted; only `HANDSHAKE` is valid.
    New,
    /// Processing a received `HANDSHAKE`, before the response is sent.
    Authenticating,
    /// Handshake complete; accepts `ENCRYPTED_MESSAGE`/`HEARTBEAT`/`DISCONNECT`.
    Authenticated,
    /// Terminal. Socket closed, state erased.
    Closed,
}

impl ConnectionState {
    /// Name used in `ProtocolError::WrongStateForType` messages.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Authenticating => "AUTHENTICATING",
            Self::Authenticated => "AUTHENTICATED",
            Self::Closed => "CLOSED",
        }
    }
}

/// Why a connection's terminal sequence ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The reader-idle timer elapsed.
    ReadTimeout,
    /// The outbound queue was full at enqueue time.
    SlowConsumer,
    /// A non-`HANDSHAKE` message arrived in `NEW`.
    NotAuthenticated,
    /// Handshake processing failed (bad key, rate limit, etc).
    HandshakeFailed,
    /// A framing violation (oversize/malformed frame).
    ProtocolViolation,
    /// The peer closed the socket (clean or unclean EOF).
    Eof,
    /// The peer sent a graceful `DISCONNECT`.
    ClientDisconnect,
    /// The server is shutting down.
    Shutdown,
    /// The Acceptor's idle-sweep task closed this connection for staleness.
    IdleSweep,
}

/// Shared per-connection record: the piece of state the Dispatcher's
/// registry holds and the connection's own tasks mutate.
///
/// Session key and peer public key are owned here — destroyed on close —
/// and are read by the Dispatcher only to re-encrypt for *this* connection
/// as a broadcast recipient; they are never copied to or read by any other
/// connection's state.
pub struct ConnectionHandle {
    /// Server-assigned, monotonically increasing identifier.
    pub connection_id: u64,
    /// Peer socket address.
    pub peer_addr: SocketAddr,
    /// Milliseconds since epoch this connection was accepted.
    pub connected_at_ms: u64,
    state: RwLock<ConnectionState>,
    user_id: RwLock<Option<String>>,
    username: RwLock<Option<String>>,
    session_key: Mutex<Option<SessionKey>>,
    peer_public_key: Mutex<Option<RsaPublicKey>>,
    last_activity_ms: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    authenticated: AtomicBool,
    outbound_tx: mpsc::Sender<String>,
    close_notify: Notify,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

impl ConnectionHandle {
    /// Create a new handle in the `NEW` state, returning the handle and the
    /// receiving half of its outbound queue (drained by the write task).
    #[must_use]
    pub fn new(connection_id: u64, peer_addr: SocketAddr) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let handle = Self {
            connection_id,
            peer_addr,
            connected_at_ms: now_ms(),
            state: RwLock::new(ConnectionState::New),
            user_id: RwLock::new(None),
            username: RwLock::new(None),
            session_key: Mutex::new(None),
            peer_public_key: Mutex::new(None),
            last_activity_ms: AtomicU64::new(now_ms()),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            authenticated: AtomicBool::new(false),
            outbound_tx: tx,
            close_notify: Notify::new(),
        };
        (handle, rx)
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Transition to a new state.
    pub async fn set_state(&self, new_state: ConnectionState) {
        if new_state == ConnectionState::Authenticated {
            self.authenticated.store(true, Ordering::Release);
        }
        if new_state == ConnectionState::Closed {
            self.authenticated.store(false, Ordering::Release);
        }
        *self.state.write().await = new_state;
    }

    /// Fast, lock-free authenticated check for the dispatcher's hot path.
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Acquire)
    }

    /// The bound `userId`, if handshake has completed.
    pub async fn user_id(&self) -> Option<String> {
        self.user_id.read().await.clone()
    }

    /// The bound display name, if handshake has completed.
    pub async fn username(&self) -> Option<String> {
        self.username.read().await.clone()
    }

    /// Bind identity after a successful handshake.
    pub async fn bind_identity(&self, user_id: String, username: String) {
        *self.user_id.write().await = Some(user_id);
        *self.username.write().await = Some(username);
    }

    /// Install this connection's session key, replacing any previous one.
    pub fn set_session_key(&self, key: SessionKey) {
        *self.session_key.lock().expect("session key lock poisoned") = Some(key);
    }

    /// Run `f` with a reference to the session key, if one is installed.
    ///
    /// Used both by this connection's own read task (to decrypt its
    /// incoming frames) and by the Dispatcher (to re-encrypt outbound
    /// broadcasts for this connection as a recipient).
    pub fn with_session_key<R>(&self, f: impl FnOnce(&SessionKey) -> R) -> Option<R> {
        let guard = self.session_key.lock().expect("session key lock poisoned");
        guard.as_ref().map(f)
    }

    /// Install this connection's registered peer public key.
    pub fn set_peer_public_key(&self, key: RsaPublicKey) {
        *self.peer_public_key.lock().expect("peer key lock poisoned") = Some(key);
    }

    /// Run `f` with a reference to the registered peer public key, if any.
    pub fn with_peer_public_key<R>(&self, f: impl FnOnce(&RsaPublicKey) -> R) -> Option<R> {
        let guard = self.peer_public_key.lock().expect("peer key lock poisoned");
        guard.as_ref().map(f)
    }

    /// Erase cryptographic state. Called as part of the terminal sequence;
    /// `SessionKey`'s `ZeroizeOnDrop` takes care of scrubbing memory.
    pub fn clear_crypto_state(&self) {
        *self.session_key.lock().expect("session key lock poisoned") = None;
        *self.peer_public_key.lock().expect("peer key lock poisoned") = None;
    }

    /// Record a successful read; resets the reader-idle timer.
    pub fn touch(&self) {
        self.last_activity_ms.store(now_ms(), Ordering::Relaxed);
    }

    /// Milliseconds since epoch of the last successful read.
    #[must_use]
    pub fn last_activity_ms(&self) -> u64 {
        self.last_activity_ms.load(Ordering::Relaxed)
    }

    /// Milliseconds elapsed since the last successful read.
    #[must_use]
    pub fn idle_ms(&self) -> u64 {
        now_ms().saturating_sub(self.last_activity_ms())
    }

    /// Signal this connection's read loop to close immediately, e.g. from
    /// the Acceptor's idle-sweep task. A permit is buffered if no task is
    /// currently awaiting `wait_for_close_request`, so the signal is never
    /// missed regardless of timing.
    pub fn request_close(&self) {
        self.close_notify.notify_one();
    }

    /// Resolves once `request_close` has been called.
    pub async fn wait_for_close_request(&self) {
        self.close_notify.notified().await;
    }

    /// Non-blocking enqueue onto the outbound queue.
    ///
    /// # Errors
    ///
    /// Returns `Err(())` if the queue is full; the caller must treat this as
    /// `SLOW_CONSUMER` and close the connection.
    pub fn try_enqueue(&self, line: String) -> Result<(), ()> {
        self.outbound_tx.try_send(line).map_err(|_| ())
    }

    /// Record outbound accounting after a successful write.
    pub fn record_sent(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Record inbound accounting after a successful read.
    pub fn record_received(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }
}
