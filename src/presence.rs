//! Presence directory
//!
//! Shared {user -> pod} view used for cross-pod routing. Entries persist
//! until an explicit unregister; there is no TTL. All operations are
//! best-effort: callers log failures and keep the socket alive.

use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::debug;

/// Redis key for a user's presence entry
fn presence_key(user_id: &str) -> String {
    format!("presence:{user_id}")
}

/// Shared presence directory backend
///
/// Implementations answer "is user U connected, and to which pod?" for every
/// pod in the deployment.
#[async_trait]
pub trait PresenceDirectory: Send + Sync {
    /// Record that `user_id` is attached to `pod`
    async fn register(&self, user_id: &str, pod: &str) -> anyhow::Result<()>;

    /// Remove the user's entry
    async fn unregister(&self, user_id: &str) -> anyhow::Result<()>;

    /// Pod currently holding the user's socket, if any
    async fn lookup(&self, user_id: &str) -> anyhow::Result<Option<String>>;

    /// True when any pod holds a socket for the user
    async fn contains(&self, user_id: &str) -> anyhow::Result<bool>;

    /// Re-assert the entry. Entries are persistent, so this is effectively a
    /// no-op; it exists so the heartbeat sweep and ping path stay safe to call.
    async fn refresh(&self, user_id: &str, pod: &str) -> anyhow::Result<()>;
}

/// Redis-backed presence directory shared by all pods
pub struct RedisPresence {
    conn: ConnectionManager,
}

impl RedisPresence {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl PresenceDirectory for RedisPresence {
    async fn register(&self, user_id: &str, pod: &str) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.set(presence_key(user_id), pod).await?;
        debug!(user_id, pod, "presence registered");
        Ok(())
    }

    async fn unregister(&self, user_id: &str) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(presence_key(user_id)).await?;
        debug!(user_id, "presence unregistered");
        Ok(())
    }

    async fn lookup(&self, user_id: &str) -> anyhow::Result<Option<String>> {
        let mut conn = self.conn.clone();
        let pod: Option<String> = conn.get(presence_key(user_id)).await?;
        Ok(pod.filter(|p| !p.is_empty()))
    }

    async fn contains(&self, user_id: &str) -> anyhow::Result<bool> {
        let mut conn = self.conn.clone();
        let exists: bool = conn.exists(presence_key(user_id)).await?;
        Ok(exists)
    }

    async fn refresh(&self, user_id: &str, pod: &str) -> anyhow::Result<()> {
        // Persistent entries have nothing to extend; re-assert the mapping so
        // a lost key heals on the next sweep.
        self.register(user_id, pod).await
    }
}

/// In-memory presence directory
///
/// Single-process only; lets tests run several logical pods against one
/// shared directory. Clones share the same map.
#[derive(Clone, Default)]
pub struct MemoryPresence {
    entries: std::sync::Arc<DashMap<String, String>>,
}

impl MemoryPresence {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PresenceDirectory for MemoryPresence {
    async fn register(&self, user_id: &str, pod: &str) -> anyhow::Result<()> {
        self.entries.insert(user_id.to_string(), pod.to_string());
        Ok(())
    }

    async fn unregister(&self, user_id: &str) -> anyhow::Result<()> {
        self.entries.remove(user_id);
        Ok(())
    }

    async fn lookup(&self, user_id: &str) -> anyhow::Result<Option<String>> {
        Ok(self.entries.get(user_id).map(|e| e.value().clone()))
    }

    async fn contains(&self, user_id: &str) -> anyhow::Result<bool> {
        Ok(self.entries.contains_key(user_id))
    }

    async fn refresh(&self, user_id: &str, pod: &str) -> anyhow::Result<()> {
        self.register(user_id, pod).await
    }
}
