//! Wire protocol types (§6.1): the outer `Envelope` and the inner payload
//! schemas carried stringified in its `data` field.

use serde::{Deserialize, Serialize};

/// Maximum bytes permitted in a single frame, including the `\n` terminator.
pub const MAX_FRAME_BYTES: usize = 8192;

/// Maximum plaintext content length the server advertises to clients,
/// sent verbatim in `HandshakeResponseData::max_message_size`.
pub const MAX_MESSAGE_SIZE: u64 = 8192;

/// The discriminant of every envelope on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NetworkMessageType {
    /// Client-initiated handshake.
    Handshake,
    /// Server's reply to a handshake.
    HandshakeResponse,
    /// Reserved for future rekeying; not processed by the core today.
    KeyExchange,
    /// A chat message, encrypted under a session key.
    EncryptedMessage,
    /// A roster snapshot.
    UserList,
    /// Liveness probe.
    Heartbeat,
    /// Reserved for future file attachments; not processed by the core today.
    FileTransfer,
    /// An error notice.
    Error,
    /// Graceful client-initiated disconnect.
    Disconnect,
}

impl NetworkMessageType {
    /// Parse a message type from its wire string, returning `None` for any
    /// value outside the known set (callers respond with `UNSUPPORTED`).
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        serde_json::from_value(serde_json::Value::String(raw.to_string())).ok()
    }
}

/// The outer frame: every line on the wire is exactly one of these.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Discriminant. Kept as a raw string on this struct so an unknown type
    /// can be reported as `UNSUPPORTED` instead of failing to parse at all.
    #[serde(rename = "type")]
    pub message_type: String,
    /// The id of the connection's claimed `userId` (or `"server"`/`"system"`).
    pub sender_id: String,
    /// Inner JSON document, stringified.
    pub data: String,
    /// Milliseconds since epoch.
    pub timestamp: i64,
    /// Optional correlation id.
    pub message_id: Option<String>,
}

impl Envelope {
    /// Build an envelope with `data` pre-serialized from `payload`.
    ///
    /// # Errors
    ///
    /// Returns a `serde_json::Error` if `payload` cannot be serialized.
    pub fn new<T: Serialize>(
        message_type: NetworkMessageType,
        sender_id: impl Into<String>,
        payload: &T,
        timestamp: i64,
        message_id: Option<String>,
    ) -> serde_json::Result<Self> {
        Ok(Self {
            message_type: wire_name(message_type),
            sender_id: sender_id.into(),
            data: serde_json::to_string(payload)?,
            timestamp,
            message_id,
        })
    }

    /// Parse `self.data` as `T`.
    ///
    /// # Errors
    ///
    /// Returns a `serde_json::Error` if `data` does not match `T`'s schema.
    pub fn payload<T: for<'de> Deserialize<'de>>(&self) -> serde_json::Result<T> {
        serde_json::from_str(&self.data)
    }

    /// The envelope's type, or `None` if it is not one of the known variants.
    #[must_use]
    pub fn parsed_type(&self) -> Option<NetworkMessageType> {
        NetworkMessageType::parse(&self.message_type)
    }
}

fn wire_name(t: NetworkMessageType) -> String {
    serde_json::to_value(t)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default()
}

/// `HandshakeData`, client → server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeData {
    /// Client-chosen opaque identity.
    pub user_id: String,
    /// Display name.
    pub username: String,
    /// Base64 X.509 SPKI-encoded RSA-4096 public key.
    pub public_key: String,
    /// Optional client version string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_version: Option<String>,
}

/// `HandshakeResponseData`, server → client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeResponseData {
    /// Always `"server"`.
    pub user_id: String,
    /// Always `"MeshServer"`.
    pub username: String,
    /// Base64 X.509 SPKI-encoded server public key.
    pub public_key: String,
    /// Base64 RSA-OAEP(session key).
    pub encrypted_session_key: String,
    /// Server version string.
    pub server_version: String,
    /// Always 8192.
    pub max_message_size: u64,
}

/// `EncryptedMessageData`, carried in both directions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedMessageData {
    /// Opaque message id.
    pub message_id: String,
    /// Base64 AES-256-GCM ciphertext (tag included).
    pub encrypted_content: String,
    /// Base64 96-bit IV.
    pub iv: String,
    /// Base64 signature over the plaintext.
    pub signature: String,
    /// Base64 public key of the signer (server's key on server → client
    /// frames). Parsed for schema completeness; never used for
    /// verification — the server always verifies against the registered key.
    pub sender_public_key: String,
    /// Display name of the original author.
    pub sender_name: String,
    /// Sender-supplied timestamp.
    pub timestamp: i64,
    /// `Message` type of the payload.
    pub message_type: String,
}

/// A single roster entry in `UserListData`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserListEntry {
    /// `userId`.
    pub id: String,
    /// Display name.
    pub username: String,
    /// Base64 SPKI public key.
    pub public_key: String,
    /// Online flag.
    pub is_online: bool,
    /// Milliseconds since epoch.
    pub last_seen: u64,
}

/// `UserListData`, sent to a connection right after its own handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserListData {
    /// Roster snapshot.
    pub users: Vec<UserListEntry>,
    /// Total known users (online and offline).
    pub total_users: usize,
    /// Currently online users.
    pub online_users: usize,
}

/// `ErrorData`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorData {
    /// One of the defined error codes (see [`ErrorCode`]).
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Optional machine-readable detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// The closed set of `ErrorData.code` values the core ever emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Connection count at or above `maxConnections`.
    MaxConnections,
    /// A non-`HANDSHAKE` message arrived on a `NEW` connection.
    NotAuthenticated,
    /// A second `HANDSHAKE` arrived on an already-authenticated connection.
    AlreadyAuthenticated,
    /// A frame violated the framing or schema rules.
    InvalidMessage,
    /// Peer key registration or handshake processing failed.
    HandshakeFailed,
    /// Reserved for callers that require a session key but find none.
    NoSessionKey,
    /// Signature verification against the sender's registered key failed.
    InvalidSignature,
    /// Decryption (tag check) or store append failed.
    MessageFailed,
    /// A rate-limit bucket was empty or administratively blocked.
    RateLimited,
    /// An envelope type unrecognized or invalid for the current state.
    Unsupported,
    /// A connection's outbound queue was full.
    SlowConsumer,
    /// The reader-idle timer elapsed.
    ReadTimeout,
}

impl ErrorCode {
    /// The wire string for this code.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MaxConnections => "MAX_CONNECTIONS",
            Self::NotAuthenticated => "NOT_AUTHENTICATED",
            Self::AlreadyAuthenticated => "ALREADY_AUTHENTICATED",
            Self::InvalidMessage => "INVALID_MESSAGE",
            Self::HandshakeFailed => "HANDSHAKE_FAILED",
            Self::NoSessionKey => "NO_SESSION_KEY",
            Self::InvalidSignature => "INVALID_SIGNATURE",
            Self::MessageFailed => "MESSAGE_FAILED",
            Self::RateLimited => "RATE_LIMITED",
            Self::Unsupported => "UNSUPPORTED",
            Self::SlowConsumer => "SLOW_CONSUMER",
            Self::ReadTimeout => "READ_TIMEOUT",
        }
    }
}
