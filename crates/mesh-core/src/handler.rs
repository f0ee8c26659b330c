//! Per-connection read/write task loop: the §4.3 `ConnectionHandler` state
//! machine, wired to its collaborators.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{info, warn};

use mesh_crypto::{decrypt_message, verify, wrap_session_key, Ciphertext, KeyPair, SessionKey};
use mesh_store::{Message, MessageStore, MessageType, User, UserStore};

use crate::connection::{CloseReason, ConnectionHandle, ConnectionState};
use crate::dispatcher::Dispatcher;
use crate::envelope::{
    EncryptedMessageData, Envelope, ErrorCode, ErrorData, HandshakeData, HandshakeResponseData,
    NetworkMessageType, MAX_MESSAGE_SIZE,
};
use crate::frame::EnvelopeCodec;
use crate::metrics::Metrics;
use crate::rate_limiter::{ip_key, user_key, RateLimiter};

/// Collaborators shared by every connection handler.
pub struct SharedState {
    /// Registry and broadcast fan-out point.
    pub dispatcher: Arc<Dispatcher>,
    /// Durable (in-memory) user roster.
    pub user_store: Arc<dyn UserStore>,
    /// Durable (in-memory) message log.
    pub message_store: Arc<dyn MessageStore>,
    /// Token-bucket rate limiter, shared across all connections.
    pub rate_limiter: Arc<RateLimiter>,
    /// Counter sink.
    pub metrics: Arc<dyn Metrics>,
    /// The server's own RSA identity.
    pub server_keys: Arc<KeyPair>,
    /// Advertised in `HandshakeResponseData`.
    pub server_version: String,
    /// Writer-idle interval: how often an idle connection is sent a heartbeat.
    pub heartbeat_interval: Duration,
    /// Base for the reader-idle timeout, which is `2 * connection_timeout`.
    pub connection_timeout: Duration,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Drive one accepted TCP connection to completion: handshake, message
/// loop, and the terminal close sequence. Returns once the socket is closed.
pub async fn handle_connection(stream: TcpStream, connection_id: u64, shared: Arc<SharedState>) {
    let peer_addr = match stream.peer_addr() {
        Ok(addr) => addr,
        Err(err) => {
            warn!(connection_id, error = %err, "failed to read peer address");
            return;
        }
    };

    let (handle, outbound_rx) = ConnectionHandle::new(connection_id, peer_addr);
    let handle = Arc::new(handle);
    shared.dispatcher.register(handle.clone());
    shared.metrics.connection_accepted();

    let (read_half, write_half) = stream.into_split();
    let mut framed_read = FramedRead::new(read_half, EnvelopeCodec);
    let framed_write = FramedWrite::new(write_half, EnvelopeCodec);

    let (writer_shutdown_tx, writer_shutdown_rx) = oneshot::channel();
    let writer_task = tokio::spawn(run_writer(
        framed_write,
        outbound_rx,
        writer_shutdown_rx,
        shared.heartbeat_interval,
    ));

    let reader_idle = shared.connection_timeout * 2;
    let close_reason = read_loop(&mut framed_read, &handle, &shared, reader_idle).await;

    run_close_sequence(&handle, &shared, close_reason).await;
    let _ = writer_shutdown_tx.send(());
    let _ = writer_task.await;

    shared.dispatcher.unregister(connection_id);
    shared.metrics.connection_closed();
    info!(connection_id, ?close_reason, "connection closed");
}

async fn run_writer(
    mut framed_write: FramedWrite<tokio::net::tcp::OwnedWriteHalf, EnvelopeCodec>,
    mut outbound_rx: mpsc::Receiver<String>,
    mut shutdown_rx: oneshot::Receiver<()>,
    heartbeat_interval: Duration,
) {
    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown_rx => break,
            received = tokio::time::timeout(heartbeat_interval, outbound_rx.recv()) => {
                match received {
                    Ok(Some(line)) => {
                        if framed_write.send(line).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(_elapsed) => {
                        let heartbeat = heartbeat_envelope();
                        if let Ok(line) = serde_json::to_string(&heartbeat) {
                            if framed_write.send(line).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        }
    }
}

fn heartbeat_envelope() -> Envelope {
    Envelope {
        message_type: "HEARTBEAT".to_string(),
        sender_id: "server".to_string(),
        data: String::new(),
        timestamp: i64::try_from(now_ms()).unwrap_or(i64::MAX),
        message_id: None,
    }
}

async fn read_loop(
    framed_read: &mut FramedRead<tokio::net::tcp::OwnedReadHalf, EnvelopeCodec>,
    handle: &Arc<ConnectionHandle>,
    shared: &Arc<SharedState>,
    reader_idle: Duration,
) -> CloseReason {
    loop {
        tokio::select! {
            biased;
            () = handle.wait_for_close_request() => {
                send_error(handle, ErrorCode::ReadTimeout, "closed by idle sweep").await;
                return CloseReason::IdleSweep;
            }
            next = tokio::time::timeout(reader_idle, framed_read.next()) => {
                match next {
                    Err(_elapsed) => {
                        send_error(handle, ErrorCode::ReadTimeout, "no data received in time").await;
                        return CloseReason::ReadTimeout;
                    }
                    Ok(None) => return CloseReason::Eof,
                    Ok(Some(Err(_frame_err))) => {
                        send_error(handle, ErrorCode::InvalidMessage, "malformed frame").await;
                        return CloseReason::ProtocolViolation;
                    }
                    Ok(Some(Ok(line))) => {
                        handle.touch();
                        handle.record_received(line.len());
                        if let Some(reason) = process_line(&line, handle, shared).await {
                            return reason;
                        }
                    }
                }
            }
        }
    }
}

async fn process_line(
    line: &str,
    handle: &Arc<ConnectionHandle>,
    shared: &Arc<SharedState>,
) -> Option<CloseReason> {
    let envelope: Envelope = match serde_json::from_str(line) {
        Ok(e) => e,
        Err(_) => {
            send_error(handle, ErrorCode::InvalidMessage, "invalid envelope json").await;
            return Some(CloseReason::ProtocolViolation);
        }
    };

    let state = handle.state().await;
    let parsed_type = envelope.parsed_type();

    match state {
        ConnectionState::New => match parsed_type {
            Some(NetworkMessageType::Handshake) => handle_handshake(&envelope, handle, shared).await,
            _ => {
                send_error(handle, ErrorCode::NotAuthenticated, "handshake required").await;
                Some(CloseReason::NotAuthenticated)
            }
        },
        ConnectionState::Authenticated => match parsed_type {
            Some(NetworkMessageType::EncryptedMessage) => {
                handle_encrypted_message(&envelope, handle, shared).await;
                None
            }
            Some(NetworkMessageType::Heartbeat) => {
                let hb = heartbeat_envelope();
                if let Ok(line) = serde_json::to_string(&hb) {
                    let _ = handle.try_enqueue(line);
                }
                None
            }
            Some(NetworkMessageType::Disconnect) => Some(CloseReason::ClientDisconnect),
            Some(NetworkMessageType::Handshake) => {
                send_error(handle, ErrorCode::AlreadyAuthenticated, "already authenticated").await;
                None
            }
            _ => {
                send_error(handle, ErrorCode::Unsupported, "unsupported message type").await;
                None
            }
        },
        ConnectionState::Authenticating | ConnectionState::Closed => None,
    }
}

async fn handle_handshake(
    envelope: &Envelope,
    handle: &Arc<ConnectionHandle>,
    shared: &Arc<SharedState>,
) -> Option<CloseReason> {
    handle.set_state(ConnectionState::Authenticating).await;

    if !shared.rate_limiter.try_consume(&ip_key(handle.peer_addr.ip())) {
        send_error(handle, ErrorCode::RateLimited, "handshake rate limit exceeded").await;
        return Some(CloseReason::HandshakeFailed);
    }

    let payload: HandshakeData = match envelope.payload() {
        Ok(p) => p,
        Err(_) => {
            send_error(handle, ErrorCode::HandshakeFailed, "malformed handshake payload").await;
            return Some(CloseReason::HandshakeFailed);
        }
    };

    let peer_public_key = match mesh_crypto::register_peer_key(&payload.public_key) {
        Ok(key) => key,
        Err(_) => {
            send_error(handle, ErrorCode::HandshakeFailed, "invalid public key").await;
            return Some(CloseReason::HandshakeFailed);
        }
    };

    let session_key = match SessionKey::generate() {
        Ok(key) => key,
        Err(_) => {
            send_error(handle, ErrorCode::HandshakeFailed, "key generation failed").await;
            return Some(CloseReason::HandshakeFailed);
        }
    };

    let encrypted_session_key = match wrap_session_key(&session_key, &peer_public_key) {
        Ok(wrapped) => wrapped,
        Err(_) => {
            send_error(handle, ErrorCode::HandshakeFailed, "session key wrap failed").await;
            return Some(CloseReason::HandshakeFailed);
        }
    };

    let user = User {
        user_id: payload.user_id.clone(),
        username: payload.username.clone(),
        public_key: payload.public_key.clone(),
        is_online: true,
        last_seen: now_ms(),
        connection_id: Some(handle.connection_id),
        ip_address: Some(handle.peer_addr.ip().to_string()),
    };
    if shared.user_store.upsert(user).await.is_err() {
        send_error(handle, ErrorCode::HandshakeFailed, "user store unavailable").await;
        return Some(CloseReason::HandshakeFailed);
    }

    let server_public_key_base64 = match shared.server_keys.public_key_base64() {
        Ok(key) => key,
        Err(_) => {
            send_error(handle, ErrorCode::HandshakeFailed, "server key encoding failed").await;
            return Some(CloseReason::HandshakeFailed);
        }
    };

    let response = HandshakeResponseData {
        user_id: "server".to_string(),
        username: "MeshServer".to_string(),
        public_key: server_public_key_base64.clone(),
        encrypted_session_key,
        server_version: shared.server_version.clone(),
        max_message_size: MAX_MESSAGE_SIZE,
    };
    let Ok(response_envelope) = Envelope::new(
        NetworkMessageType::HandshakeResponse,
        "server",
        &response,
        i64::try_from(now_ms()).unwrap_or(i64::MAX),
        None,
    ) else {
        return Some(CloseReason::HandshakeFailed);
    };
    if let Ok(line) = serde_json::to_string(&response_envelope) {
        let _ = handle.try_enqueue(line);
    }

    handle.bind_identity(payload.user_id.clone(), payload.username.clone()).await;
    handle.set_session_key(session_key);
    handle.set_peer_public_key(peer_public_key);
    handle.set_state(ConnectionState::Authenticated).await;

    broadcast_system_notice(
        shared,
        &format!("{} joined the chat", payload.username),
        handle.connection_id,
    )
    .await;

    if let Ok(users) = shared.user_store.list_all().await {
        let snapshot = shared.dispatcher.snapshot(&users).await;
        if let Ok(envelope) = Envelope::new(
            NetworkMessageType::UserList,
            "server",
            &snapshot,
            i64::try_from(now_ms()).unwrap_or(i64::MAX),
            None,
        ) {
            if let Ok(line) = serde_json::to_string(&envelope) {
                let _ = handle.try_enqueue(line);
            }
        }
    }

    None
}

async fn handle_encrypted_message(envelope: &Envelope, handle: &Arc<ConnectionHandle>, shared: &Arc<SharedState>) {
    let start = std::time::Instant::now();

    let Some(user_id) = handle.user_id().await else {
        send_error(handle, ErrorCode::NoSessionKey, "not authenticated").await;
        return;
    };

    if !shared.rate_limiter.try_consume(&user_key(&user_id)) {
        send_error(handle, ErrorCode::RateLimited, "message rate limit exceeded").await;
        shared.metrics.rate_limited();
        return;
    }

    let payload: EncryptedMessageData = match envelope.payload() {
        Ok(p) => p,
        Err(_) => {
            send_error(handle, ErrorCode::InvalidMessage, "malformed encrypted message").await;
            shared.metrics.message_failed();
            return;
        }
    };

    let ciphertext = Ciphertext {
        ciphertext: payload.encrypted_content.clone(),
        iv: payload.iv.clone(),
    };
    let plaintext = match handle.with_session_key(|key| decrypt_message(&ciphertext, key)) {
        Some(Ok(plaintext)) => plaintext,
        _ => {
            send_error(handle, ErrorCode::MessageFailed, "decryption failed").await;
            shared.metrics.message_failed();
            return;
        }
    };

    let verified = handle.with_peer_public_key(|key| verify(&plaintext, &payload.signature, key));
    if !matches!(verified, Some(Ok(true))) {
        send_error(handle, ErrorCode::InvalidSignature, "signature verification failed").await;
        shared.metrics.message_failed();
        return;
    }

    let username = handle.username().await.unwrap_or_default();
    let message_type = parse_message_type(&payload.message_type);
    let message = Message {
        id: payload.message_id.clone(),
        content: plaintext.clone(),
        sender_id: user_id.clone(),
        sender_name: username.clone(),
        timestamp: u64::try_from(payload.timestamp).unwrap_or(0),
        message_type,
        room_id: None,
        is_encrypted: true,
    };
    if shared.message_store.append(message).await.is_err() {
        send_error(handle, ErrorCode::MessageFailed, "message store unavailable").await;
        shared.metrics.message_failed();
        return;
    }

    let server_public_key_base64 = shared.server_keys.public_key_base64().unwrap_or_default();
    let message_id = payload.message_id.clone();
    let sender_name = username;
    let message_type_wire = payload.message_type.clone();
    let timestamp = payload.timestamp;

    shared
        .dispatcher
        .broadcast(
            &plaintext,
            move |ct, iv, sig| {
                let data = EncryptedMessageData {
                    message_id: message_id.clone(),
                    encrypted_content: ct.to_string(),
                    iv: iv.to_string(),
                    signature: sig.to_string(),
                    sender_public_key: server_public_key_base64.clone(),
                    sender_name: sender_name.clone(),
                    timestamp,
                    message_type: message_type_wire.clone(),
                };
                Envelope::new(NetworkMessageType::EncryptedMessage, user_id.clone(), &data, timestamp, None)
                    .expect("encrypted message payload always serializes")
            },
            shared.server_keys.private_key(),
            handle.connection_id,
        )
        .await;

    shared.metrics.message_processed(start.elapsed());
}

fn parse_message_type(wire: &str) -> MessageType {
    match wire {
        "SYSTEM" => MessageType::System,
        "IMAGE" => MessageType::Image,
        "FILE" => MessageType::File,
        "HEARTBEAT" => MessageType::Heartbeat,
        "HANDSHAKE" => MessageType::Handshake,
        _ => MessageType::Text,
    }
}

async fn broadcast_system_notice(shared: &Arc<SharedState>, text: &str, exclude_connection_id: u64) {
    let message_id = shared.dispatcher.next_system_message_id();
    let timestamp = i64::try_from(now_ms()).unwrap_or(i64::MAX);
    let server_public_key_base64 = shared.server_keys.public_key_base64().unwrap_or_default();

    shared
        .dispatcher
        .broadcast(
            text,
            move |ct, iv, sig| {
                let data = EncryptedMessageData {
                    message_id: message_id.clone(),
                    encrypted_content: ct.to_string(),
                    iv: iv.to_string(),
                    signature: sig.to_string(),
                    sender_public_key: server_public_key_base64.clone(),
                    sender_name: "System".to_string(),
                    timestamp,
                    message_type: "SYSTEM".to_string(),
                };
                Envelope::new(NetworkMessageType::EncryptedMessage, "system", &data, timestamp, None)
                    .expect("system notice payload always serializes")
            },
            shared.server_keys.private_key(),
            exclude_connection_id,
        )
        .await;
}

async fn send_error(handle: &Arc<ConnectionHandle>, code: ErrorCode, message: &str) {
    let data = ErrorData {
        code: code.as_str().to_string(),
        message: message.to_string(),
        details: None,
    };
    if let Ok(envelope) = Envelope::new(
        NetworkMessageType::Error,
        "server",
        &data,
        i64::try_from(now_ms()).unwrap_or(i64::MAX),
        None,
    ) {
        if let Ok(line) = serde_json::to_string(&envelope) {
            let _ = handle.try_enqueue(line);
        }
    }
}

/// Run the terminal sequence (§4.3): mark offline, erase crypto state, and
/// broadcast a leave notice if the connection had completed its handshake.
async fn run_close_sequence(handle: &Arc<ConnectionHandle>, shared: &Arc<SharedState>, reason: CloseReason) {
    let was_authenticated = handle.is_authenticated();
    let username = handle.username().await;
    let user_id = handle.user_id().await;

    handle.set_state(ConnectionState::Closed).await;
    handle.clear_crypto_state();

    if let Some(user_id) = &user_id {
        let _ = shared.user_store.set_offline(user_id).await;
    }

    if was_authenticated {
        if let Some(username) = username {
            broadcast_system_notice(
                shared,
                &format!("{username} left the chat"),
                handle.connection_id,
            )
            .await;
        }
    }

    warn!(connection_id = handle.connection_id, ?reason, "connection terminal sequence complete");
}
