//! Connection registry and broadcast fan-out (§3 Dispatcher, §4.4).

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::connection::ConnectionHandle;
use crate::envelope::{Envelope, NetworkMessageType, UserListData, UserListEntry};
use mesh_crypto::{encrypt_message, sign};
use mesh_store::User;
use rsa::RsaPrivateKey;

/// In-process registry of every `AUTHENTICATED` connection, and the single
/// fan-out point for broadcast messages.
///
/// Holds no locks of its own on the hot path: membership lives in a
/// `DashMap` keyed by `connection_id`, and each recipient's session key is
/// read directly off its own `ConnectionHandle` to re-encrypt for that
/// recipient — never copied out or shared with any other connection.
pub struct Dispatcher {
    connections: DashMap<u64, Arc<ConnectionHandle>>,
    next_connection_id: AtomicUsize,
    next_message_id: AtomicUsize,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            next_connection_id: AtomicUsize::new(1),
            next_message_id: AtomicUsize::new(1),
        }
    }

    /// Allocate the next monotonically increasing connection id.
    pub fn next_connection_id(&self) -> u64 {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed) as u64
    }

    /// Allocate an id for a server-originated message (system notices).
    #[must_use]
    pub fn next_system_message_id(&self) -> String {
        format!("sys-{}", self.next_message_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Current number of registered connections (authenticated or not).
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether the registry holds no connections.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Register a connection. Called once, right after accept, before the
    /// handshake completes — so `maxConnections` accounting includes
    /// in-flight handshakes.
    pub fn register(&self, handle: Arc<ConnectionHandle>) {
        debug!(connection_id = handle.connection_id, "registering connection");
        self.connections.insert(handle.connection_id, handle);
    }

    /// Remove a connection. Idempotent.
    pub fn unregister(&self, connection_id: u64) {
        if self.connections.remove(&connection_id).is_some() {
            debug!(connection_id, "unregistered connection");
        }
    }

    /// Snapshot the roster of currently `AUTHENTICATED` connections as a
    /// `UserListData`, cross-referenced against the durable user store for
    /// `lastSeen`/`isOnline` of users not currently connected.
    pub async fn snapshot(&self, known_users: &[User]) -> UserListData {
        let mut by_id: std::collections::HashMap<String, UserListEntry> =
            std::collections::HashMap::new();

        for user in known_users {
            by_id.insert(
                user.user_id.clone(),
                UserListEntry {
                    id: user.user_id.clone(),
                    username: user.username.clone(),
                    public_key: user.public_key.clone(),
                    is_online: user.is_online,
                    last_seen: user.last_seen,
                },
            );
        }

        for entry in self.connections.iter() {
            if !entry.value().is_authenticated() {
                continue;
            }
            if let Some(user_id) = entry.value().user_id().await {
                if let Some(existing) = by_id.get_mut(&user_id) {
                    existing.is_online = true;
                }
            }
        }

        let mut users: Vec<UserListEntry> = by_id.into_values().collect();
        users.sort_by(|a, b| a.id.cmp(&b.id));
        let online_users = users.iter().filter(|u| u.is_online).count();
        let total_users = users.len();

        UserListData {
            users,
            total_users,
            online_users,
        }
    }

    /// Fan an already-encrypted-for-nobody chat message out to every other
    /// `AUTHENTICATED` connection, re-encrypting and re-signing per
    /// recipient with the server's own key so each recipient verifies
    /// against the registered server public key (§4.4 step 3).
    ///
    /// `exclude_connection_id` is the sender's own connection: senders never
    /// receive their own broadcast back.
    pub async fn broadcast(
        &self,
        plaintext: &str,
        envelope_builder: impl Fn(&str, &str, &str) -> Envelope,
        server_key: &RsaPrivateKey,
        exclude_connection_id: u64,
    ) {
        let signature = match sign(plaintext, server_key) {
            Ok(sig) => sig,
            Err(err) => {
                warn!(error = %err, "failed to sign broadcast payload");
                return;
            }
        };

        // Stable snapshot: iterating `DashMap` directly would observe
        // concurrent register/unregister calls mid-broadcast. Cloning the
        // `Arc`s first makes this fan-out atomic with respect to roster
        // membership, at the cost of one extra refcount bump per recipient.
        let recipients: Vec<Arc<ConnectionHandle>> = self
            .connections
            .iter()
            .filter(|e| *e.key() != exclude_connection_id)
            .filter(|e| e.value().is_authenticated())
            .map(|e| e.value().clone())
            .collect();

        for recipient in recipients {
            let encrypted = recipient.with_session_key(|key| encrypt_message(plaintext, key));
            let Some(Ok(ciphertext)) = encrypted else {
                continue;
            };

            let envelope = envelope_builder(&ciphertext.ciphertext, &ciphertext.iv, &signature);
            let Ok(line) = serde_json::to_string(&envelope) else {
                continue;
            };

            if recipient.try_enqueue(line).is_err() {
                warn!(
                    connection_id = recipient.connection_id,
                    "outbound queue full, closing slow consumer"
                );
                recipient.set_state(crate::connection::ConnectionState::Closed).await;
            }
        }
    }

    /// Signal every registered connection whose `idle_ms()` exceeds
    /// `max_idle` to close (§4.6 idle sweep). Each matching connection's own
    /// read loop observes the signal and runs its normal terminal sequence;
    /// this only requests the close, it doesn't wait for it.
    ///
    /// Returns the number of connections signaled, for the sweep's log line.
    pub fn close_idle_connections(&self, max_idle: Duration) -> usize {
        let max_idle_ms = u64::try_from(max_idle.as_millis()).unwrap_or(u64::MAX);
        let stale: Vec<Arc<ConnectionHandle>> = self
            .connections
            .iter()
            .filter(|e| e.value().idle_ms() > max_idle_ms)
            .map(|e| e.value().clone())
            .collect();
        for handle in &stale {
            handle.request_close();
        }
        stale.len()
    }

    /// Enqueue a single already-serialized line to one connection, by id.
    ///
    /// Returns `false` if the connection is not registered or its queue is
    /// full (the caller is responsible for closing on `false`).
    pub fn send_to(&self, connection_id: u64, line: String) -> bool {
        match self.connections.get(&connection_id) {
            Some(handle) => handle.try_enqueue(line).is_ok(),
            None => false,
        }
    }
}

/// The message type tag used by `Dispatcher::broadcast`'s envelope builder
/// when the payload is an `EncryptedMessageData`.
pub const BROADCAST_MESSAGE_TYPE: NetworkMessageType = NetworkMessageType::EncryptedMessage;

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    fn addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9000)
    }

    #[tokio::test]
    async fn register_and_unregister_track_length() {
        let dispatcher = Dispatcher::new();
        let (handle, _rx) = ConnectionHandle::new(dispatcher.next_connection_id(), addr());
        let handle = Arc::new(handle);
        dispatcher.register(handle.clone());
        assert_eq!(dispatcher.len(), 1);
        dispatcher.unregister(handle.connection_id);
        assert!(dispatcher.is_empty());
    }

    #[tokio::test]
    async fn snapshot_marks_connected_users_online() {
        let dispatcher = Dispatcher::new();
        let (handle, _rx) = ConnectionHandle::new(dispatcher.next_connection_id(), addr());
        handle.set_state(crate::connection::ConnectionState::Authenticated).await;
        handle.bind_identity("u1".to_string(), "Alice".to_string()).await;
        dispatcher.register(Arc::new(handle));

        let known = vec![User {
            user_id: "u1".to_string(),
            username: "Alice".to_string(),
            public_key: "base64".to_string(),
            is_online: false,
            last_seen: 0,
            connection_id: None,
            ip_address: None,
        }];

        let snapshot = dispatcher.snapshot(&known).await;
        assert_eq!(snapshot.total_users, 1);
        assert_eq!(snapshot.online_users, 1);
        assert!(snapshot.users[0].is_online);
    }

    #[tokio::test]
    async fn broadcast_skips_the_sender_and_unauthenticated_peers() {
        let dispatcher = Dispatcher::new();

        let (sender, mut sender_rx) = ConnectionHandle::new(dispatcher.next_connection_id(), addr());
        sender.set_state(crate::connection::ConnectionState::Authenticated).await;
        sender.set_session_key(mesh_crypto::SessionKey::generate().unwrap());
        let sender = Arc::new(sender);
        dispatcher.register(sender.clone());

        let (recipient, mut recipient_rx) =
            ConnectionHandle::new(dispatcher.next_connection_id(), addr());
        recipient.set_state(crate::connection::ConnectionState::Authenticated).await;
        recipient.set_session_key(mesh_crypto::SessionKey::generate().unwrap());
        let recipient = Arc::new(recipient);
        dispatcher.register(recipient.clone());

        let (unauth, mut unauth_rx) = ConnectionHandle::new(dispatcher.next_connection_id(), addr());
        let unauth = Arc::new(unauth);
        dispatcher.register(unauth.clone());

        let server_key = rsa::RsaPrivateKey::new(&mut rand::thread_rng(), 512).unwrap();
        dispatcher
            .broadcast(
                "hello room",
                |ciphertext, iv, signature| {
                    let payload = crate::envelope::EncryptedMessageData {
                        message_id: "m1".to_string(),
                        encrypted_content: ciphertext.to_string(),
                        iv: iv.to_string(),
                        signature: signature.to_string(),
                        sender_public_key: "server".to_string(),
                        sender_name: "Alice".to_string(),
                        timestamp: 0,
                        message_type: "TEXT".to_string(),
                    };
                    Envelope::new(
                        NetworkMessageType::EncryptedMessage,
                        "server",
                        &payload,
                        0,
                        None,
                    )
                    .unwrap()
                },
                &server_key,
                sender.connection_id,
            )
            .await;

        assert!(sender_rx.try_recv().is_err());
        assert!(recipient_rx.try_recv().is_ok());
        assert!(unauth_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn close_idle_connections_signals_only_stale_ones() {
        let dispatcher = Dispatcher::new();

        let (fresh, _fresh_rx) = ConnectionHandle::new(dispatcher.next_connection_id(), addr());
        let fresh = Arc::new(fresh);
        dispatcher.register(fresh.clone());

        let (stale, _stale_rx) = ConnectionHandle::new(dispatcher.next_connection_id(), addr());
        let stale = Arc::new(stale);
        dispatcher.register(stale.clone());

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        fresh.touch();

        let closed = dispatcher.close_idle_connections(std::time::Duration::from_millis(10));
        assert_eq!(closed, 1);

        assert!(
            tokio::time::timeout(std::time::Duration::from_millis(50), stale.wait_for_close_request())
                .await
                .is_ok()
        );
        assert!(
            tokio::time::timeout(std::time::Duration::from_millis(20), fresh.wait_for_close_request())
                .await
                .is_err()
        );
    }
}
