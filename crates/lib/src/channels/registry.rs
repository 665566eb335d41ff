//! Connection registry: identity → live connection, at most one per id.

use crate::channels::handle::{ChannelError, ChannelHandle};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// What kind of endpoint sits behind a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Device,
    Viewer,
    ProxyClient,
}

impl Role {
    pub const ALL: [Role; 3] = [Role::Device, Role::Viewer, Role::ProxyClient];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Device => "device",
            Role::Viewer => "viewer",
            Role::ProxyClient => "proxy_client",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    /// Accepts the wire names plus the URL aliases `browser` and `proxy` (case-insensitive).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "device" => Ok(Role::Device),
            "viewer" | "browser" => Ok(Role::Viewer),
            "proxy" | "proxy_client" | "proxyclient" => Ok(Role::ProxyClient),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

/// Distinguishes successive registrations of the same id.
pub type ConnectionToken = u64;

/// Names one specific connection instance; cleanup is always keyed by this, never by id alone.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionTag {
    pub id: String,
    pub token: ConnectionToken,
}

/// A registered endpoint. Owns the send side of its channel.
pub struct Connection {
    id: String,
    role: Role,
    token: ConnectionToken,
    registered_at: DateTime<Utc>,
    channel: Arc<dyn ChannelHandle>,
}

impl Connection {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn token(&self) -> ConnectionToken {
        self.token
    }

    pub fn registered_at(&self) -> DateTime<Utc> {
        self.registered_at
    }

    pub fn tag(&self) -> ConnectionTag {
        ConnectionTag {
            id: self.id.clone(),
            token: self.token,
        }
    }

    pub fn is(&self, tag: &ConnectionTag) -> bool {
        self.token == tag.token && self.id == tag.id
    }

    pub async fn send(&self, text: &str) -> Result<(), ChannelError> {
        self.channel.send(text).await
    }

    /// Send, giving up after `timeout` so a peer that stopped reading cannot hold the caller.
    pub async fn send_within(&self, text: &str, timeout: Duration) -> Result<(), ChannelError> {
        tokio::time::timeout(timeout, self.channel.send(text))
            .await
            .map_err(|_| ChannelError::TimedOut(timeout))?
    }

    pub fn close(&self) {
        self.channel.close();
    }

    pub fn is_closed(&self) -> bool {
        self.channel.is_closed()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("token", &self.token)
            .field("registered_at", &self.registered_at)
            .finish()
    }
}

/// Registry of live connections. Shared across every connection task.
pub struct ConnectionRegistry {
    inner: Arc<RwLock<HashMap<String, Arc<Connection>>>>,
    next_token: AtomicU64,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            next_token: AtomicU64::new(1),
        }
    }

    /// Register `channel` under `id`. A connection already holding the id is closed and evicted.
    pub async fn register(
        &self,
        id: impl Into<String>,
        role: Role,
        channel: Arc<dyn ChannelHandle>,
    ) -> Arc<Connection> {
        let id = id.into();
        let conn = Arc::new(Connection {
            id: id.clone(),
            role,
            token: self.next_token.fetch_add(1, Ordering::Relaxed),
            registered_at: Utc::now(),
            channel,
        });
        let mut g = self.inner.write().await;
        if let Some(old) = g.insert(id, conn.clone()) {
            log::info!(
                "registry: {} re-registered as {}, closing previous {} connection",
                old.id,
                conn.role,
                old.role
            );
            old.close();
        }
        conn
    }

    pub async fn lookup(&self, id: &str) -> Option<Arc<Connection>> {
        self.inner.read().await.get(id).cloned()
    }

    /// Remove `id` only while it still maps to the connection named by `token`.
    pub async fn unregister(&self, id: &str, token: ConnectionToken) -> Option<Arc<Connection>> {
        let mut g = self.inner.write().await;
        match g.get(id) {
            Some(current) if current.token == token => g.remove(id),
            _ => None,
        }
    }

    /// Unregister (if still current) and close. Returns whether the entry was removed.
    pub async fn evict(&self, conn: &Connection) -> bool {
        let removed = self.unregister(&conn.id, conn.token).await.is_some();
        conn.close();
        removed
    }

    /// Batch form of [`evict`](Self::evict) under a single lock acquisition. Returns removed ids.
    pub async fn evict_all(&self, conns: &[Arc<Connection>]) -> Vec<String> {
        if conns.is_empty() {
            return Vec::new();
        }
        let mut removed = Vec::new();
        let mut g = self.inner.write().await;
        for conn in conns {
            if g.get(&conn.id).map(|c| c.token) == Some(conn.token) {
                g.remove(&conn.id);
                removed.push(conn.id.clone());
            }
            conn.close();
        }
        removed
    }

    /// Registered ids, sorted, optionally restricted to one role.
    pub async fn list_ids(&self, role: Option<Role>) -> Vec<String> {
        let g = self.inner.read().await;
        let mut ids: Vec<String> = g
            .values()
            .filter(|c| role.map_or(true, |r| c.role == r))
            .map(|c| c.id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Current connections, sorted by id, optionally restricted to one role.
    pub async fn snapshot(&self, role: Option<Role>) -> Vec<Arc<Connection>> {
        let g = self.inner.read().await;
        let mut conns: Vec<Arc<Connection>> = g
            .values()
            .filter(|c| role.map_or(true, |r| c.role == r))
            .cloned()
            .collect();
        conns.sort_by(|a, b| a.id.cmp(&b.id));
        conns
    }

    /// Number of live connections per role; every role is present, possibly with zero.
    pub async fn counts(&self) -> HashMap<Role, usize> {
        let g = self.inner.read().await;
        let mut counts: HashMap<Role, usize> = Role::ALL.iter().map(|r| (*r, 0)).collect();
        for conn in g.values() {
            *counts.entry(conn.role).or_insert(0) += 1;
        }
        counts
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}
