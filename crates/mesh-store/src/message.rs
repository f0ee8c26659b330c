//! `Message` record and the `MessageStore` collaborator interface.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Wire and persisted message types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageType {
    /// Ordinary chat text.
    Text,
    /// Server-originated notice (join/leave).
    System,
    /// Inline image payload.
    Image,
    /// File attachment reference.
    File,
    /// Liveness probe; not normally persisted by a sender.
    Heartbeat,
    /// Handshake payload; not normally persisted.
    Handshake,
}

/// A chat message, persisted as received after decryption.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    /// Opaque message id, supplied by the sender.
    pub id: String,
    /// Plaintext UTF-8 content.
    pub content: String,
    /// Sender's `userId`.
    pub sender_id: String,
    /// Sender's display name at the time of sending.
    pub sender_name: String,
    /// Sender-supplied timestamp, milliseconds since epoch; the server may clamp.
    pub timestamp: u64,
    /// Message type.
    #[serde(rename = "type")]
    pub message_type: MessageType,
    /// Optional room id; the core always broadcasts globally regardless.
    pub room_id: Option<String>,
    /// Always true at the wire; reflects transport state, not a persistence choice.
    pub is_encrypted: bool,
}

/// Persistence interface for the message log.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Append a message to the log. Must not be called for messages that
    /// failed signature verification.
    async fn append(&self, message: Message) -> Result<(), StoreError>;

    /// Total number of messages ever appended.
    async fn count(&self) -> Result<usize, StoreError>;

    /// Fetch messages by sender, in append order.
    async fn by_sender(&self, sender_id: &str) -> Result<Vec<Message>, StoreError>;
}

/// In-memory `MessageStore`, backed by an append-only `DashMap` plus an
/// atomic counter for O(1) `count()`.
#[derive(Default)]
pub struct InMemoryMessageStore {
    messages: DashMap<String, Message>,
    order: DashMap<usize, String>,
    count: AtomicUsize,
}

impl InMemoryMessageStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn append(&self, message: Message) -> Result<(), StoreError> {
        let idx = self.count.fetch_add(1, Ordering::SeqCst);
        self.order.insert(idx, message.id.clone());
        self.messages.insert(message.id.clone(), message);
        Ok(())
    }

    async fn count(&self) -> Result<usize, StoreError> {
        Ok(self.count.load(Ordering::SeqCst))
    }

    async fn by_sender(&self, sender_id: &str) -> Result<Vec<Message>, StoreError> {
        let total = self.count.load(Ordering::SeqCst);
        let mut out = Vec::new();
        for idx in 0..total {
            if let Some(id) = self.order.get(&idx) {
                if let Some(msg) = self.messages.get(id.value()) {
                    if msg.sender_id == sender_id {
                        out.push(msg.value().clone());
                    }
                }
            }
        }
        Ok(out)
    }
}
