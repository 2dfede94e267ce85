//! Notification publisher
//!
//! Producer side of the downstream push-notification bus. Two logical topics:
//! the legacy in-app topic for sample messages, and the offline topic keyed
//! by receiver so all events for one receiver share a partition. Publish
//! failures are logged and never propagated; storing a message must succeed
//! even when the bus is down.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::message::{MessageEnvelope, GENERIC_FILE_MESSAGE};

/// Legacy in-app/OTP topic
pub const SAMPLE_MESSAGE_TOPIC: &str = "sample-message-topic";

/// Offline push-notification topic
pub const UNDELIVERED_NOTIFICATION_TOPIC: &str = "undelivered.notification.message";

/// Partition-key prefix for the offline topic
pub const UNDELIVERED_KEY_PREFIX: &str = "undelivered:";

/// Notification-kind identifier for offline messages
const OFFLINE_MESSAGE_NOTIFICATION_ID: i64 = 2001;

/// Downstream delivery channel discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationChannel {
    #[serde(rename = "SMS")]
    Sms,
    #[serde(rename = "EMAIL")]
    Email,
    #[serde(rename = "INAPP")]
    InApp,
}

impl FromStr for NotificationChannel {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SMS" => Ok(NotificationChannel::Sms),
            "EMAIL" => Ok(NotificationChannel::Email),
            "INAPP" => Ok(NotificationChannel::InApp),
            _ => Err(()),
        }
    }
}

/// Event published to the notification bus
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<i64>,
    pub notification_id: i64,
    pub channel: NotificationChannel,
    pub map: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mobile: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// Durable notification bus producer
#[async_trait]
pub trait NotificationBus: Send + Sync {
    /// Append an event to `topic`. `key` is the partition key; events sharing
    /// a key keep their relative order downstream.
    async fn publish(
        &self,
        topic: &str,
        key: Option<&str>,
        event: &NotificationEvent,
    ) -> anyhow::Result<()>;
}

/// Redis Streams producer: one stream per topic, partition key carried as an
/// entry field for the downstream consumer
pub struct RedisStreamBus {
    conn: ConnectionManager,
}

impl RedisStreamBus {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl NotificationBus for RedisStreamBus {
    async fn publish(
        &self,
        topic: &str,
        key: Option<&str>,
        event: &NotificationEvent,
    ) -> anyhow::Result<()> {
        let payload = serde_json::to_string(event)?;
        let mut items: Vec<(&str, String)> = Vec::with_capacity(2);
        if let Some(key) = key {
            items.push(("key", key.to_string()));
        }
        items.push(("payload", payload));

        let mut conn = self.conn.clone();
        let _: String = conn.xadd(topic, "*", &items).await?;
        debug!(topic, key = key.unwrap_or(""), "notification appended");
        Ok(())
    }
}

/// In-memory bus that records events. Single-process/dev and tests.
#[derive(Default)]
pub struct MemoryNotificationBus {
    events: Mutex<Vec<(String, Option<String>, NotificationEvent)>>,
}

impl MemoryNotificationBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded (topic, key, event) triples, oldest first
    pub fn drain(&self) -> Vec<(String, Option<String>, NotificationEvent)> {
        std::mem::take(&mut self.events.lock().expect("bus lock"))
    }
}

#[async_trait]
impl NotificationBus for MemoryNotificationBus {
    async fn publish(
        &self,
        topic: &str,
        key: Option<&str>,
        event: &NotificationEvent,
    ) -> anyhow::Result<()> {
        self.events.lock().expect("bus lock").push((
            topic.to_string(),
            key.map(str::to_string),
            event.clone(),
        ));
        Ok(())
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Numeric customer ID; non-numeric IDs fall back to zero
fn numeric_customer_id(raw: &str) -> i64 {
    match raw.parse() {
        Ok(id) => id,
        Err(_) => {
            warn!(customer_id = raw, "non-numeric customer id, falling back to 0");
            0
        }
    }
}

/// Builds and publishes the gateway's notification events
pub struct NotificationPublisher {
    bus: std::sync::Arc<dyn NotificationBus>,
    channel: NotificationChannel,
}

impl NotificationPublisher {
    pub fn new(bus: std::sync::Arc<dyn NotificationBus>, channel: NotificationChannel) -> Self {
        Self { bus, channel }
    }

    /// Legacy in-app notification carrying only the sample message.
    /// Failures are logged, never surfaced.
    pub async fn publish_sample(&self, receiver_id: &str, sample_message: &str) {
        let mut map = HashMap::new();
        map.insert("sampleMessage".to_string(), sample_message.to_string());

        let event = NotificationEvent {
            customer_id: None,
            notification_id: numeric_customer_id(receiver_id) + now_millis(),
            channel: NotificationChannel::InApp,
            map,
            mobile: None,
            email: None,
        };

        if let Err(e) = self
            .bus
            .publish(SAMPLE_MESSAGE_TOPIC, None, &event)
            .await
        {
            error!(receiver_id, error = %e, "sample notification publish failed");
        }
    }

    /// Offline push notification for a stored message, keyed by receiver so
    /// per-receiver order survives downstream. Failures are logged, never
    /// surfaced: storage must not roll back on a dead bus.
    pub async fn publish_offline(
        &self,
        receiver_id: &str,
        envelope: &MessageEnvelope,
        sample_message: &str,
    ) {
        let mut map = HashMap::new();
        map.insert("sampleMessage".to_string(), sample_message.to_string());
        let message_id = if envelope.message_id.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            envelope.message_id.clone()
        };
        map.insert("messageId".to_string(), message_id);
        map.insert("senderId".to_string(), envelope.sender_id.clone());
        map.insert("senderCustomerId".to_string(), envelope.sender_id.clone());
        if let Some(mobile) = envelope.sender_mobile.as_deref() {
            map.insert("senderMobile".to_string(), mobile.to_string());
        }
        let text = if envelope.is_chat() && !envelope.actual_message.is_empty() {
            envelope.actual_message.clone()
        } else {
            GENERIC_FILE_MESSAGE.to_string()
        };
        map.insert("message".to_string(), text);

        let event = NotificationEvent {
            customer_id: Some(numeric_customer_id(receiver_id)),
            notification_id: OFFLINE_MESSAGE_NOTIFICATION_ID,
            channel: self.channel,
            map,
            mobile: None,
            email: None,
        };

        let key = format!("{UNDELIVERED_KEY_PREFIX}{receiver_id}");
        if let Err(e) = self
            .bus
            .publish(UNDELIVERED_NOTIFICATION_TOPIC, Some(&key), &event)
            .await
        {
            error!(receiver_id, error = %e, "offline notification publish failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MESSAGE_TYPE_CHAT;
    use std::sync::Arc;

    fn envelope() -> MessageEnvelope {
        MessageEnvelope {
            sender_id: "1".into(),
            sender_mobile: Some("919905663451".into()),
            receiver_id: "2".into(),
            message_id: "m1".into(),
            actual_message: "hello there".into(),
            message_type: MESSAGE_TYPE_CHAT.into(),
            timestamp: Some(1000),
            ..MessageEnvelope::default()
        }
    }

    #[tokio::test]
    async fn test_offline_event_shape() {
        let bus = Arc::new(MemoryNotificationBus::new());
        let publisher = NotificationPublisher::new(bus.clone(), NotificationChannel::Sms);

        publisher
            .publish_offline("2", &envelope(), "you have a message")
            .await;

        let events = bus.drain();
        assert_eq!(events.len(), 1);
        let (topic, key, event) = &events[0];
        assert_eq!(topic, UNDELIVERED_NOTIFICATION_TOPIC);
        assert_eq!(key.as_deref(), Some("undelivered:2"));
        assert_eq!(event.customer_id, Some(2));
        assert_eq!(event.notification_id, OFFLINE_MESSAGE_NOTIFICATION_ID);
        assert_eq!(event.channel, NotificationChannel::Sms);
        assert_eq!(event.map.get("sampleMessage").unwrap(), "you have a message");
        assert_eq!(event.map.get("messageId").unwrap(), "m1");
        assert_eq!(event.map.get("senderId").unwrap(), "1");
        assert_eq!(event.map.get("message").unwrap(), "hello there");
        assert_eq!(event.map.get("senderMobile").unwrap(), "919905663451");
    }

    #[tokio::test]
    async fn test_non_chat_uses_file_sentinel() {
        let bus = Arc::new(MemoryNotificationBus::new());
        let publisher = NotificationPublisher::new(bus.clone(), NotificationChannel::Sms);

        let mut file_envelope = envelope();
        file_envelope.message_type = "FILE_UPLOAD_NOTIFICATION".into();
        publisher.publish_offline("2", &file_envelope, "files").await;

        let events = bus.drain();
        assert_eq!(events[0].2.map.get("message").unwrap(), GENERIC_FILE_MESSAGE);
    }

    #[tokio::test]
    async fn test_non_numeric_receiver_falls_back_to_zero() {
        let bus = Arc::new(MemoryNotificationBus::new());
        let publisher = NotificationPublisher::new(bus.clone(), NotificationChannel::Sms);

        publisher
            .publish_offline("customer26", &envelope(), "hi")
            .await;

        let events = bus.drain();
        assert_eq!(events[0].2.customer_id, Some(0));
        assert_eq!(events[0].1.as_deref(), Some("undelivered:customer26"));
    }

    #[tokio::test]
    async fn test_sample_goes_to_legacy_topic() {
        let bus = Arc::new(MemoryNotificationBus::new());
        let publisher = NotificationPublisher::new(bus.clone(), NotificationChannel::Sms);

        publisher.publish_sample("2", "ping!").await;

        let events = bus.drain();
        assert_eq!(events.len(), 1);
        let (topic, key, event) = &events[0];
        assert_eq!(topic, SAMPLE_MESSAGE_TOPIC);
        assert!(key.is_none());
        assert_eq!(event.channel, NotificationChannel::InApp);
        assert_eq!(event.map.get("sampleMessage").unwrap(), "ping!");
        // id derives from the numeric receiver plus the clock
        assert!(event.notification_id >= 2);
    }

    #[test]
    fn test_channel_parse() {
        assert_eq!("sms".parse::<NotificationChannel>(), Ok(NotificationChannel::Sms));
        assert_eq!("EMAIL".parse::<NotificationChannel>(), Ok(NotificationChannel::Email));
        assert_eq!("InApp".parse::<NotificationChannel>(), Ok(NotificationChannel::InApp));
        assert!("push".parse::<NotificationChannel>().is_err());
    }
}
