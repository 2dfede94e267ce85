//! Undelivered message store
//!
//! Per-receiver hash of serialized envelopes with a retention TTL. Retrieval
//! via the REST surface is at-most-once: the fetch endpoint deletes right
//! after reading.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::{debug, warn};

use crate::message::MessageEnvelope;

/// Redis key for a receiver's undelivered hash
fn undelivered_key(receiver_id: &str) -> String {
    format!("undelivered:{receiver_id}")
}

/// Durable store for messages that could not be delivered
#[async_trait]
pub trait UndeliveredStore: Send + Sync {
    /// Persist one envelope under the receiver's hash, keyed by message ID.
    /// The retention TTL is applied on every store, so activity refreshes the
    /// window. Requires a non-empty receiver and message ID.
    async fn store(&self, receiver_id: &str, envelope: &MessageEnvelope) -> anyhow::Result<()>;

    /// All stored envelopes for the receiver, oldest first. A record that no
    /// longer parses is skipped, not fatal.
    async fn fetch(&self, receiver_id: &str) -> anyhow::Result<Vec<MessageEnvelope>>;

    /// Remove every stored message for the receiver
    async fn delete_all(&self, receiver_id: &str) -> anyhow::Result<()>;

    /// Remove a single message
    async fn delete_one(&self, receiver_id: &str, message_id: &str) -> anyhow::Result<()>;

    /// True when anything is stored for the receiver
    async fn has(&self, receiver_id: &str) -> anyhow::Result<bool>;
}

fn validate(receiver_id: &str, envelope: &MessageEnvelope) -> anyhow::Result<()> {
    if receiver_id.is_empty() {
        anyhow::bail!("receiver id is empty");
    }
    if envelope.message_id.is_empty() {
        anyhow::bail!("message id is empty");
    }
    Ok(())
}

/// Redis hash store: `undelivered:{receiverId}` -> {messageId -> JSON}
pub struct RedisUndeliveredStore {
    conn: ConnectionManager,
    retention: Duration,
}

impl RedisUndeliveredStore {
    pub fn new(conn: ConnectionManager, retention: Duration) -> Self {
        Self { conn, retention }
    }
}

#[async_trait]
impl UndeliveredStore for RedisUndeliveredStore {
    async fn store(&self, receiver_id: &str, envelope: &MessageEnvelope) -> anyhow::Result<()> {
        validate(receiver_id, envelope)?;

        let key = undelivered_key(receiver_id);
        let json = envelope.to_json()?;

        let mut conn = self.conn.clone();
        let _: () = conn.hset(&key, &envelope.message_id, json).await?;
        let _: () = conn.expire(&key, self.retention.as_secs() as i64).await?;

        debug!(
            receiver_id,
            message_id = %envelope.message_id,
            ttl_secs = self.retention.as_secs(),
            "undelivered message stored"
        );
        Ok(())
    }

    async fn fetch(&self, receiver_id: &str) -> anyhow::Result<Vec<MessageEnvelope>> {
        let mut conn = self.conn.clone();
        let entries: HashMap<String, String> = conn.hgetall(undelivered_key(receiver_id)).await?;

        let mut messages: Vec<MessageEnvelope> = Vec::with_capacity(entries.len());
        for (message_id, json) in entries {
            match serde_json::from_str(&json) {
                Ok(envelope) => messages.push(envelope),
                Err(e) => {
                    warn!(receiver_id, message_id = %message_id, error = %e,
                        "skipping undeliverable stored record");
                }
            }
        }
        // hash fields carry no order; fall back to the envelope timestamp
        messages.sort_by_key(|m| m.timestamp.unwrap_or(0));
        Ok(messages)
    }

    async fn delete_all(&self, receiver_id: &str) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(undelivered_key(receiver_id)).await?;
        debug!(receiver_id, "undelivered messages deleted");
        Ok(())
    }

    async fn delete_one(&self, receiver_id: &str, message_id: &str) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.hdel(undelivered_key(receiver_id), message_id).await?;
        Ok(())
    }

    async fn has(&self, receiver_id: &str) -> anyhow::Result<bool> {
        let mut conn = self.conn.clone();
        let exists: bool = conn.exists(undelivered_key(receiver_id)).await?;
        Ok(exists)
    }
}

/// In-memory store preserving insertion order. Single-process only.
#[derive(Default)]
pub struct MemoryUndeliveredStore {
    // receiver -> ordered (message_id, json)
    hashes: Mutex<HashMap<String, Vec<(String, String)>>>,
}

impl MemoryUndeliveredStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UndeliveredStore for MemoryUndeliveredStore {
    async fn store(&self, receiver_id: &str, envelope: &MessageEnvelope) -> anyhow::Result<()> {
        validate(receiver_id, envelope)?;
        let json = envelope.to_json()?;

        let mut hashes = self.hashes.lock().expect("store lock");
        let entries = hashes.entry(receiver_id.to_string()).or_default();
        match entries.iter_mut().find(|(id, _)| *id == envelope.message_id) {
            // one record per (receiver, messageId): re-store replaces in place
            Some(entry) => entry.1 = json,
            None => entries.push((envelope.message_id.clone(), json)),
        }
        Ok(())
    }

    async fn fetch(&self, receiver_id: &str) -> anyhow::Result<Vec<MessageEnvelope>> {
        let hashes = self.hashes.lock().expect("store lock");
        let Some(entries) = hashes.get(receiver_id) else {
            return Ok(Vec::new());
        };

        let mut messages = Vec::with_capacity(entries.len());
        for (message_id, json) in entries {
            match serde_json::from_str(json) {
                Ok(envelope) => messages.push(envelope),
                Err(e) => {
                    warn!(receiver_id, message_id = %message_id, error = %e,
                        "skipping undeliverable stored record");
                }
            }
        }
        Ok(messages)
    }

    async fn delete_all(&self, receiver_id: &str) -> anyhow::Result<()> {
        self.hashes.lock().expect("store lock").remove(receiver_id);
        Ok(())
    }

    async fn delete_one(&self, receiver_id: &str, message_id: &str) -> anyhow::Result<()> {
        if let Some(entries) = self.hashes.lock().expect("store lock").get_mut(receiver_id) {
            entries.retain(|(id, _)| id != message_id);
        }
        Ok(())
    }

    async fn has(&self, receiver_id: &str) -> anyhow::Result<bool> {
        Ok(self
            .hashes
            .lock()
            .expect("store lock")
            .get(receiver_id)
            .map(|entries| !entries.is_empty())
            .unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MESSAGE_TYPE_CHAT;

    fn envelope(message_id: &str, timestamp: i64) -> MessageEnvelope {
        MessageEnvelope {
            sender_id: "1".into(),
            receiver_id: "2".into(),
            message_id: message_id.into(),
            actual_message: format!("msg {message_id}"),
            message_type: MESSAGE_TYPE_CHAT.into(),
            timestamp: Some(timestamp),
            ..MessageEnvelope::default()
        }
    }

    #[tokio::test]
    async fn test_store_fetch_delete_cycle() {
        let store = MemoryUndeliveredStore::new();

        store.store("2", &envelope("m1", 1000)).await.unwrap();
        store.store("2", &envelope("m2", 2000)).await.unwrap();

        assert!(store.has("2").await.unwrap());
        let fetched = store.fetch("2").await.unwrap();
        assert_eq!(fetched.len(), 2);
        assert_eq!(fetched[0].message_id, "m1");
        assert_eq!(fetched[1].message_id, "m2");

        store.delete_all("2").await.unwrap();
        assert!(!store.has("2").await.unwrap());
        assert!(store.fetch("2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_one_record_per_message_id() {
        let store = MemoryUndeliveredStore::new();

        store.store("2", &envelope("m1", 1000)).await.unwrap();
        let mut updated = envelope("m1", 1000);
        updated.actual_message = "edited".into();
        store.store("2", &updated).await.unwrap();

        let fetched = store.fetch("2").await.unwrap();
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].actual_message, "edited");
    }

    #[tokio::test]
    async fn test_delete_one_leaves_rest() {
        let store = MemoryUndeliveredStore::new();
        store.store("2", &envelope("m1", 1000)).await.unwrap();
        store.store("2", &envelope("m2", 2000)).await.unwrap();

        store.delete_one("2", "m1").await.unwrap();
        let fetched = store.fetch("2").await.unwrap();
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].message_id, "m2");
    }

    #[tokio::test]
    async fn test_missing_message_id_rejected() {
        let store = MemoryUndeliveredStore::new();
        assert!(store.store("2", &envelope("", 1000)).await.is_err());
        assert!(store.store("", &envelope("m1", 0)).await.is_err());
    }

    #[tokio::test]
    async fn test_bad_record_does_not_lose_the_rest() {
        let store = MemoryUndeliveredStore::new();
        store.store("2", &envelope("m1", 1000)).await.unwrap();
        store
            .hashes
            .lock()
            .unwrap()
            .get_mut("2")
            .unwrap()
            .push(("m2".to_string(), "{not json".to_string()));

        let fetched = store.fetch("2").await.unwrap();
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].message_id, "m1");
    }
}
