//! Shared harness for the end-to-end mesh server tests: a real `TcpListener`
//! plus a minimal hand-rolled client that speaks the wire protocol directly,
//! without going through any server-side code.

use std::sync::Arc;
use std::time::Duration;

use mesh_core::dispatcher::Dispatcher;
use mesh_core::envelope::{
    EncryptedMessageData, Envelope, HandshakeData, HandshakeResponseData, NetworkMessageType,
    UserListData,
};
use mesh_core::handler::SharedState;
use mesh_core::metrics::CountingMetrics;
use mesh_core::rate_limiter::{RateLimitConfig, RateLimiter};
use mesh_core::{acceptor, AcceptorConfig};
use mesh_crypto::{decrypt_message, encrypt_message, register_peer_key, sign, unwrap_session_key};
use mesh_crypto::{Ciphertext, KeyPair, SessionKey};
use mesh_store::{InMemoryMessageStore, InMemoryUserStore};
use rsa::{RsaPrivateKey, RsaPublicKey};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};

/// A running server instance, bound to an ephemeral localhost port.
pub struct TestServer {
    pub addr: std::net::SocketAddr,
    pub shared: Arc<SharedState>,
    shutdown_tx: tokio::sync::watch::Sender<bool>,
}

impl TestServer {
    /// Stop accepting new connections and wait for existing ones to drain.
    pub async fn shutdown(self) {
        acceptor::graceful_shutdown(&self.shutdown_tx, &self.shared.dispatcher, Duration::from_secs(5)).await;
    }
}

/// Test-tunable knobs; defaults favor fast tests over realistic timings.
pub struct TestServerConfig {
    pub max_connections: usize,
    pub rate_limit_per_minute: u32,
    pub heartbeat_interval: Duration,
    pub connection_timeout: Duration,
}

impl Default for TestServerConfig {
    fn default() -> Self {
        Self {
            max_connections: 1000,
            rate_limit_per_minute: 600,
            heartbeat_interval: Duration::from_secs(30),
            connection_timeout: Duration::from_secs(30),
        }
    }
}

/// Spawn a full mesh server (acceptor + background tasks) on a loopback
/// ephemeral port, returning once it is ready to accept connections.
pub async fn spawn_server(config: TestServerConfig) -> TestServer {
    // Reserve a free port, then hand it to the acceptor's own listener.
    // A small window exists between drop and rebind; harmless on loopback
    // in a single-process test run.
    let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = probe.local_addr().unwrap();
    drop(probe);

    let server_keys = Arc::new(KeyPair::generate().unwrap());
    let dispatcher = Arc::new(Dispatcher::new());
    let rate_limiter = Arc::new(RateLimiter::new(RateLimitConfig {
        max_requests: config.rate_limit_per_minute,
        window: Duration::from_secs(60),
    }));

    let shared = Arc::new(SharedState {
        dispatcher: dispatcher.clone(),
        user_store: InMemoryUserStore::new(),
        message_store: InMemoryMessageStore::new(),
        rate_limiter: rate_limiter.clone(),
        metrics: Arc::new(CountingMetrics::default()),
        server_keys,
        server_version: "test".to_string(),
        heartbeat_interval: config.heartbeat_interval,
        connection_timeout: config.connection_timeout,
    });

    let acceptor_config = AcceptorConfig {
        host: addr.ip().to_string(),
        port: addr.port(),
        max_connections: config.max_connections,
        idle_sweep_interval: Duration::from_millis(50),
        stats_tick_interval: Duration::from_secs(60),
    };

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let run_shared = shared.clone();
    let run_rate_limiter = rate_limiter;
    tokio::spawn(async move {
        let _ = acceptor::run(acceptor_config, run_shared, run_rate_limiter, shutdown_rx).await;
    });

    // Give the listener a moment to bind before the first client connects.
    tokio::time::sleep(Duration::from_millis(20)).await;

    TestServer {
        addr,
        shared,
        shutdown_tx,
    }
}

/// Convenience accessor used by tests that need to read the registry size
/// directly (e.g. the max-connections scenario).
#[allow(dead_code)]
pub fn connection_count(server: &TestServer) -> usize {
    server.shared.dispatcher.len()
}

/// A simulated client identity: an RSA key pair plus the userId/username it
/// presents at handshake.
pub struct ClientIdentity {
    pub user_id: String,
    pub username: String,
    pub private_key: RsaPrivateKey,
    pub public_key: RsaPublicKey,
    pub public_key_base64: String,
}

/// Generate a client identity. 2048 bits is enough headroom for RSA-OAEP
/// wrapping a 32-byte session key and keeps test runtime reasonable; the
/// server's own identity still uses the wire-mandated 4096 bits.
pub fn generate_identity(user_id: &str, username: &str) -> ClientIdentity {
    let mut rng = rand::rngs::OsRng;
    let private_key = RsaPrivateKey::new(&mut rng, 2048).unwrap();
    let public_key = RsaPublicKey::from(&private_key);
    let public_key_base64 = mesh_crypto::keys::encode_public_key(&public_key).unwrap();

    ClientIdentity {
        user_id: user_id.to_string(),
        username: username.to_string(),
        private_key,
        public_key,
        public_key_base64,
    }
}

/// A raw TCP client speaking the envelope protocol directly.
pub struct TestClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl TestClient {
    pub async fn connect(addr: std::net::SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, write_half) = stream.into_split();
        Self {
            reader: BufReader::new(read_half),
            writer: write_half,
        }
    }

    pub async fn send(&mut self, envelope: &Envelope) {
        let mut line = serde_json::to_string(envelope).unwrap();
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await.unwrap();
    }

    /// Read one line and parse it as an `Envelope`, or `None` on EOF.
    pub async fn try_read(&mut self) -> Option<Envelope> {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line).await.unwrap();
        if n == 0 {
            return None;
        }
        Some(serde_json::from_str(line.trim_end()).unwrap())
    }

    /// Read one envelope, failing the test if none arrives within `timeout`.
    pub async fn read(&mut self, timeout: Duration) -> Envelope {
        tokio::time::timeout(timeout, self.try_read())
            .await
            .expect("timed out waiting for an envelope")
            .expect("connection closed before an envelope arrived")
    }

    /// Read envelopes until one matches `predicate` or `max_tries` is hit,
    /// skipping interleaved heartbeats and other broadcasts (e.g. a join
    /// notice arriving ahead of the message under test).
    pub async fn read_until(&mut self, timeout: Duration, max_tries: usize, predicate: impl Fn(&Envelope) -> bool) -> Envelope {
        for _ in 0..max_tries {
            let envelope = self.read(timeout).await;
            if predicate(&envelope) {
                return envelope;
            }
        }
        panic!("no matching envelope arrived within {max_tries} reads");
    }

    /// Assert no envelope arrives within `timeout` (used to prove a
    /// signature-invalid message was never broadcast).
    pub async fn expect_silence(&mut self, timeout: Duration) {
        if let Ok(result) = tokio::time::timeout(timeout, self.try_read()).await {
            panic!("expected silence, got {result:?}");
        }
    }
}

/// Result of a successful handshake: the material needed to send and
/// receive further envelopes on this connection.
pub struct HandshakeOutcome {
    pub session_key: SessionKey,
    pub server_public_key: RsaPublicKey,
    pub response: HandshakeResponseData,
}

/// Perform the full handshake sequence and drain the `USER_LIST` snapshot
/// that immediately follows it.
pub async fn handshake(client: &mut TestClient, identity: &ClientIdentity) -> HandshakeOutcome {
    let payload = HandshakeData {
        user_id: identity.user_id.clone(),
        username: identity.username.clone(),
        public_key: identity.public_key_base64.clone(),
        client_version: None,
    };
    let envelope = Envelope::new(NetworkMessageType::Handshake, &identity.user_id, &payload, 0, None).unwrap();
    client.send(&envelope).await;

    let response_envelope = client.read(Duration::from_secs(5)).await;
    assert_eq!(response_envelope.message_type, "HANDSHAKE_RESPONSE");
    let response: HandshakeResponseData = response_envelope.payload().unwrap();

    let server_public_key = register_peer_key(&response.public_key).unwrap();
    let session_key = unwrap_session_key(&response.encrypted_session_key, &identity.private_key).unwrap();

    let user_list_envelope = client.read(Duration::from_secs(5)).await;
    assert_eq!(user_list_envelope.message_type, "USER_LIST");
    let _: UserListData = user_list_envelope.payload().unwrap();

    HandshakeOutcome {
        session_key,
        server_public_key,
        response,
    }
}

/// Build and send a chat `ENCRYPTED_MESSAGE`, signed with the sender's own
/// key (the key it registered at handshake).
pub async fn send_chat(client: &mut TestClient, identity: &ClientIdentity, session_key: &SessionKey, content: &str, message_id: &str) {
    send_chat_signed_by(client, identity, session_key, content, message_id, &identity.private_key.clone()).await;
}

/// Same as [`send_chat`] but lets the caller supply a different signing key,
/// to exercise the invalid-signature path.
pub async fn send_chat_signed_by(
    client: &mut TestClient,
    identity: &ClientIdentity,
    session_key: &SessionKey,
    content: &str,
    message_id: &str,
    signing_key: &RsaPrivateKey,
) {
    let ciphertext: Ciphertext = encrypt_message(content, session_key).unwrap();
    let signature = sign(content, signing_key).unwrap();
    let payload = EncryptedMessageData {
        message_id: message_id.to_string(),
        encrypted_content: ciphertext.ciphertext,
        iv: ciphertext.iv,
        signature,
        sender_public_key: identity.public_key_base64.clone(),
        sender_name: identity.username.clone(),
        timestamp: 0,
        message_type: "CHAT".to_string(),
    };
    let envelope = Envelope::new(NetworkMessageType::EncryptedMessage, &identity.user_id, &payload, 0, Some(message_id.to_string())).unwrap();
    client.send(&envelope).await;
}

/// Decrypt and return the plaintext of a received `ENCRYPTED_MESSAGE`
/// envelope, verifying its signature against the server's public key (every
/// broadcast is server-signed, regardless of original sender).
pub fn open_broadcast(envelope: &Envelope, session_key: &SessionKey, server_public_key: &RsaPublicKey) -> String {
    assert_eq!(envelope.message_type, "ENCRYPTED_MESSAGE");
    let payload: EncryptedMessageData = envelope.payload().unwrap();
    let ciphertext = Ciphertext {
        ciphertext: payload.encrypted_content,
        iv: payload.iv,
    };
    let plaintext = decrypt_message(&ciphertext, session_key).unwrap();
    assert!(mesh_crypto::verify(&plaintext, &payload.signature, server_public_key).unwrap());
    plaintext
}
