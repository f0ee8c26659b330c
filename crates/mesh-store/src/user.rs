//! `User` record and the `UserStore` collaborator interface.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// A registered chat participant.
///
/// Created on first successful handshake; mutated by handshake (rebind
/// connection) and by disconnect (set offline); destroyed only by
/// administrative cleanup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    /// Opaque, client-chosen identity, unique per active connection.
    pub user_id: String,
    /// Display name.
    pub username: String,
    /// Base64 of a `SubjectPublicKeyInfo`-encoded RSA-4096 key.
    pub public_key: String,
    /// Whether this user currently has an authenticated connection.
    pub is_online: bool,
    /// Milliseconds since epoch of last activity.
    pub last_seen: u64,
    /// The connection currently bound to this user, if online.
    pub connection_id: Option<u64>,
    /// Peer IP address, if known.
    pub ip_address: Option<String>,
}

/// Persistence interface for the user roster.
///
/// Out of scope for the core dispatch engine per the specification; this
/// crate ships an in-memory implementation so the server can run end to end.
#[async_trait]
pub trait UserStore: Send + Sync {
    /// Insert or update a user record, rebinding `connection_id` to the
    /// newest handshake. Online-state mutations must be idempotent.
    async fn upsert(&self, user: User) -> Result<(), StoreError>;

    /// Look up a user by id.
    async fn get(&self, user_id: &str) -> Result<Option<User>, StoreError>;

    /// Mark a user offline, clearing its bound connection.
    async fn set_offline(&self, user_id: &str) -> Result<(), StoreError>;

    /// List every known user (online and offline).
    async fn list_all(&self) -> Result<Vec<User>, StoreError>;
}

/// In-memory `UserStore`, backed by a `DashMap` keyed by `userId`.
#[derive(Default)]
pub struct InMemoryUserStore {
    users: DashMap<String, User>,
}

impl InMemoryUserStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

#[async_trait]
impl UserStore for InMemoryUserStore {
    async fn upsert(&self, mut user: User) -> Result<(), StoreError> {
        user.last_seen = now_ms();
        self.users.insert(user.user_id.clone(), user);
        Ok(())
    }

    async fn get(&self, user_id: &str) -> Result<Option<User>, StoreError> {
        Ok(self.users.get(user_id).map(|r| r.value().clone()))
    }

    async fn set_offline(&self, user_id: &str) -> Result<(), StoreError> {
        if let Some(mut entry) = self.users.get_mut(user_id) {
            entry.is_online = false;
            entry.connection_id = None;
            entry.last_seen = now_ms();
        }
        Ok(())
    }

    async fn list_all(&self) -> Result<Vec<User>, StoreError> {
        Ok(self.users.iter().map(|r| r.value().clone()).collect())
    }
}
