//! Cross-pod relay bus
//!
//! One shared logical channel carries serialized envelopes between pods. The
//! pod holding the receiver's socket delivers; everyone else ignores the
//! payload. There is no cross-pod coordination and no deduplication.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::broadcast;
use tracing::{debug, error, warn};

use crate::message::RelayPayload;

/// Delay before re-subscribing after a lost pub/sub connection
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(2);

/// Callback invoked for every payload received on the relay channel
pub type RelayCallback = Arc<dyn Fn(RelayPayload) + Send + Sync>;

/// Relay bus backend
///
/// `publish` is called by the delivery router and the call engine whenever
/// the receiver is not local; `listen` runs once per pod on a dedicated task.
#[async_trait]
pub trait RelayBus: Send + Sync {
    /// Publish a serialized message for `target_user_id` on the shared channel
    async fn publish(&self, from_user_id: &str, target_user_id: &str, message: &str)
        -> anyhow::Result<()>;

    /// Consume the shared channel, invoking `callback` per payload.
    /// Runs until the process shuts down; transient failures reconnect.
    async fn listen(&self, callback: RelayCallback) -> anyhow::Result<()>;
}

/// Redis pub/sub relay shared by all pods
pub struct RedisRelay {
    client: redis::Client,
    conn: ConnectionManager,
    channel: String,
}

impl RedisRelay {
    pub fn new(client: redis::Client, conn: ConnectionManager, channel: &str) -> Self {
        Self {
            client,
            conn,
            channel: channel.to_string(),
        }
    }
}

#[async_trait]
impl RelayBus for RedisRelay {
    async fn publish(
        &self,
        from_user_id: &str,
        target_user_id: &str,
        message: &str,
    ) -> anyhow::Result<()> {
        let payload = RelayPayload {
            from_user_id: from_user_id.to_string(),
            target_user_id: target_user_id.to_string(),
            message: message.to_string(),
        };
        let encoded = serde_json::to_string(&payload)?;

        let mut conn = self.conn.clone();
        let _: () = conn.publish(&self.channel, encoded).await?;
        debug!(from = from_user_id, target = target_user_id, "relay published");
        Ok(())
    }

    async fn listen(&self, callback: RelayCallback) -> anyhow::Result<()> {
        loop {
            let mut pubsub = match self.client.get_async_pubsub().await {
                Ok(pubsub) => pubsub,
                Err(e) => {
                    error!(error = %e, "relay subscriber connect failed, retrying");
                    tokio::time::sleep(RESUBSCRIBE_DELAY).await;
                    continue;
                }
            };

            if let Err(e) = pubsub.subscribe(&self.channel).await {
                error!(error = %e, channel = %self.channel, "relay subscribe failed, retrying");
                tokio::time::sleep(RESUBSCRIBE_DELAY).await;
                continue;
            }
            debug!(channel = %self.channel, "relay subscriber attached");

            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let raw: String = match msg.get_payload() {
                    Ok(raw) => raw,
                    Err(e) => {
                        warn!(error = %e, "relay payload was not a string");
                        continue;
                    }
                };
                match serde_json::from_str::<RelayPayload>(&raw) {
                    Ok(payload) => callback(payload),
                    Err(e) => warn!(error = %e, "unparseable relay payload dropped"),
                }
            }

            warn!(channel = %self.channel, "relay subscription ended, reconnecting");
            tokio::time::sleep(RESUBSCRIBE_DELAY).await;
        }
    }
}

/// In-memory relay using a broadcast channel
///
/// Single-process only. Clones share the channel, so several logical pods in
/// one process see each other's publishes.
#[derive(Clone)]
pub struct MemoryRelay {
    tx: broadcast::Sender<RelayPayload>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self { tx }
    }
}

impl Default for MemoryRelay {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RelayBus for MemoryRelay {
    async fn publish(
        &self,
        from_user_id: &str,
        target_user_id: &str,
        message: &str,
    ) -> anyhow::Result<()> {
        let payload = RelayPayload {
            from_user_id: from_user_id.to_string(),
            target_user_id: target_user_id.to_string(),
            message: message.to_string(),
        };
        // send() errs only when nobody listens; fire and forget
        let _ = self.tx.send(payload);
        Ok(())
    }

    async fn listen(&self, callback: RelayCallback) -> anyhow::Result<()> {
        let mut rx = self.tx.subscribe();
        loop {
            match rx.recv().await {
                Ok(payload) => callback(payload),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(lagged = n, "relay receiver lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[tokio::test]
    async fn test_publish_reaches_listener() {
        let relay = MemoryRelay::new();
        let seen: Arc<Mutex<Vec<RelayPayload>>> = Arc::new(Mutex::new(Vec::new()));

        let listener = relay.clone();
        let sink = seen.clone();
        let handle = tokio::spawn(async move {
            let _ = listener
                .listen(Arc::new(move |payload| {
                    sink.lock().unwrap().push(payload);
                }))
                .await;
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        relay.publish("1", "2", "{\"x\":1}").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].from_user_id, "1");
        assert_eq!(seen[0].target_user_id, "2");
        assert_eq!(seen[0].message, "{\"x\":1}");

        handle.abort();
    }

    #[tokio::test]
    async fn test_clones_share_one_channel() {
        let pod_a = MemoryRelay::new();
        let pod_b = pod_a.clone();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        let handle = tokio::spawn(async move {
            let _ = pod_b
                .listen(Arc::new(move |payload| {
                    sink.lock().unwrap().push(payload.target_user_id);
                }))
                .await;
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        pod_a.publish("1", "2", "hello").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(seen.lock().unwrap().as_slice(), ["2".to_string()]);
        handle.abort();
    }
}
