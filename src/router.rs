//! Delivery router
//!
//! Decides, for every outbound message, between local-socket send, cross-pod
//! relay, and offline store-and-notify. Also the `OutboundSink` the call
//! engine forwards through, and the landing point for relay-bus payloads.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::message::{ChatRequest, MessageEnvelope, MESSAGE_TYPE_CHAT};
use crate::notify::NotificationPublisher;
use crate::presence::PresenceDirectory;
use crate::profile::ProfileCache;
use crate::registry::SessionRegistry;
use crate::relay::RelayBus;
use crate::store::UndeliveredStore;

/// Result of routing one message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Written to a local socket
    Delivered,
    /// Relayed to another pod or stored for later retrieval
    Queued,
    /// Nothing happened; reason is in the log
    Dropped,
}

/// Result of an outbound sink forward
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkOutcome {
    Local,
    Relayed,
    Failed,
}

/// Narrow capability for pushing a serialized payload toward a user, local
/// socket or relay. The call engine depends on this, not on the router type.
#[async_trait]
pub trait OutboundSink: Send + Sync {
    async fn forward(&self, sender_id: &str, receiver_id: &str, payload: String) -> SinkOutcome;
}

/// The fan-out decision engine
pub struct DeliveryRouter {
    pod_name: String,
    sessions: Arc<SessionRegistry>,
    presence: Arc<dyn PresenceDirectory>,
    relay: Arc<dyn RelayBus>,
    profiles: Arc<ProfileCache>,
    store: Arc<dyn UndeliveredStore>,
    notifications: Arc<NotificationPublisher>,
    offline_messaging_enabled: bool,
    offline_storage_enabled: bool,
    offline_notifications_enabled: bool,
}

impl DeliveryRouter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &Config,
        sessions: Arc<SessionRegistry>,
        presence: Arc<dyn PresenceDirectory>,
        relay: Arc<dyn RelayBus>,
        profiles: Arc<ProfileCache>,
        store: Arc<dyn UndeliveredStore>,
        notifications: Arc<NotificationPublisher>,
    ) -> Self {
        Self {
            pod_name: config.pod_name.clone(),
            sessions,
            presence,
            relay,
            profiles,
            store,
            notifications,
            offline_messaging_enabled: config.offline_messaging_enabled,
            offline_storage_enabled: config.offline_storage_enabled,
            offline_notifications_enabled: config.offline_notifications_enabled,
        }
    }

    /// Route a chat frame received on a WebSocket.
    ///
    /// Enriches with the sender profile, publishes the legacy sample
    /// notification when present, then picks local send, relay, or the
    /// offline flow.
    pub async fn route(&self, request: ChatRequest) -> RouteOutcome {
        let sender_id = request.sender_id.clone();
        let receiver_id = request.receiver_id.clone();
        if sender_id.is_empty() || receiver_id.is_empty() {
            warn!("missing senderId or receiverId in chat frame");
            return RouteOutcome::Dropped;
        }

        let Some(sender) = self.profiles.get_or_load(&sender_id).await else {
            warn!(sender_id, receiver_id, "sender profile unavailable, dropping message");
            return RouteOutcome::Dropped;
        };

        let sample_message = request.sample_message_trimmed().to_string();
        if !sample_message.is_empty() {
            self.notifications
                .publish_sample(&receiver_id, &sample_message)
                .await;
        }

        if !request.has_content() {
            warn!(sender_id, receiver_id, "message without text or files dropped");
            return RouteOutcome::Dropped;
        }

        let local = self
            .sessions
            .get(&receiver_id)
            .filter(|handle| handle.is_open());

        let display_name = sender.display_name();
        let envelope = MessageEnvelope {
            sender_id: sender_id.clone(),
            sender_mobile: sender.mobile.clone(),
            sender_name: (!display_name.is_empty()).then_some(display_name),
            receiver_id: receiver_id.clone(),
            message_id: request.message_id.clone(),
            actual_message: request.actual_message_trimmed().to_string(),
            files: request.files.clone(),
            message_type: MESSAGE_TYPE_CHAT.to_string(),
            delivered: local.is_some(),
            delivery_timestamp: request.timestamp,
            is_read: false,
            timestamp: request.timestamp,
        };

        let json = match envelope.to_json() {
            Ok(json) => json,
            Err(e) => {
                error!(sender_id, receiver_id, error = %e, "envelope serialization failed");
                return RouteOutcome::Dropped;
            }
        };

        debug!(
            sender_id,
            receiver_id,
            files = envelope.files.len(),
            bytes = json.len(),
            "outbound message built"
        );

        if let Some(handle) = local {
            return match handle.send_text(json).await {
                Ok(()) => {
                    info!(sender_id, receiver_id, "message delivered locally");
                    RouteOutcome::Delivered
                }
                Err(e) => {
                    warn!(sender_id, receiver_id, error = %e, "local socket write failed");
                    RouteOutcome::Dropped
                }
            };
        }

        // presence absence (or a failing directory) means offline
        let remote = self.presence.contains(&receiver_id).await.unwrap_or_else(|e| {
            error!(receiver_id, error = %e, "presence lookup failed, treating as offline");
            false
        });

        if remote {
            match self.relay.publish(&sender_id, &receiver_id, &json).await {
                Ok(()) => {
                    info!(sender_id, receiver_id, "message relayed to another pod");
                    RouteOutcome::Queued
                }
                Err(e) => {
                    error!(sender_id, receiver_id, error = %e, "relay publish failed");
                    RouteOutcome::Dropped
                }
            }
        } else {
            self.handle_offline(&receiver_id, &envelope, &sample_message)
                .await
        }
    }

    /// Offline branch: store for later pickup, then notify downstream.
    /// Each side effect has its own enable flag; a notification failure never
    /// rolls the stored message back.
    async fn handle_offline(
        &self,
        receiver_id: &str,
        envelope: &MessageEnvelope,
        sample_message: &str,
    ) -> RouteOutcome {
        if !self.offline_messaging_enabled {
            debug!(receiver_id, "offline messaging disabled, dropping");
            return RouteOutcome::Dropped;
        }

        info!(
            receiver_id,
            message_id = %envelope.message_id,
            "receiver offline, running offline flow"
        );

        if self.offline_storage_enabled {
            if let Err(e) = self.store.store(receiver_id, envelope).await {
                error!(receiver_id, error = %e, "undelivered store failed");
            }
        } else {
            debug!(receiver_id, "offline message storage disabled");
        }

        if self.offline_notifications_enabled {
            if !sample_message.is_empty() {
                self.notifications
                    .publish_offline(receiver_id, envelope, sample_message)
                    .await;
            } else {
                warn!(receiver_id, "no sample message, skipping offline notification");
            }
        } else {
            debug!(receiver_id, "offline notifications disabled");
        }

        RouteOutcome::Queued
    }

    /// HTTP-originated delivery: the caller supplies a pre-formed body and
    /// treats offline as its own problem, so there is no offline flow here.
    pub async fn deliver_http(&self, from_user_id: &str, target_user_id: &str, body: &str) -> bool {
        let pod = match self.presence.lookup(target_user_id).await {
            Ok(Some(pod)) => pod,
            Ok(None) => {
                info!(target_user_id, "target offline for http delivery");
                return false;
            }
            Err(e) => {
                error!(target_user_id, error = %e, "presence lookup failed for http delivery");
                return false;
            }
        };

        if pod == self.pod_name {
            match self.sessions.get(target_user_id).filter(|h| h.is_open()) {
                Some(handle) => match handle.send_text(body.to_string()).await {
                    Ok(()) => {
                        info!(from_user_id, target_user_id, "http message delivered locally");
                        true
                    }
                    Err(e) => {
                        warn!(target_user_id, error = %e, "http local delivery failed");
                        false
                    }
                },
                None => {
                    warn!(
                        target_user_id,
                        pod, "presence lists this pod but the session is gone, treating as offline"
                    );
                    false
                }
            }
        } else {
            match self.relay.publish(from_user_id, target_user_id, body).await {
                Ok(()) => {
                    info!(from_user_id, target_user_id, pod, "http message relayed");
                    true
                }
                Err(e) => {
                    error!(target_user_id, error = %e, "http relay publish failed");
                    false
                }
            }
        }
    }

    /// Landing point for relay-bus payloads: deliver to a local socket or
    /// drop silently; another pod may hold the receiver now.
    pub async fn deliver_remote(&self, target_user_id: &str, message: &str) {
        match self.sessions.get(target_user_id).filter(|h| h.is_open()) {
            Some(handle) => match handle.send_text(message.to_string()).await {
                Ok(()) => info!(target_user_id, "cross-pod message delivered"),
                Err(e) => error!(target_user_id, error = %e, "cross-pod delivery failed"),
            },
            None => debug!(target_user_id, "target not connected on this pod"),
        }
    }
}

#[async_trait]
impl OutboundSink for DeliveryRouter {
    async fn forward(&self, sender_id: &str, receiver_id: &str, payload: String) -> SinkOutcome {
        if let Some(handle) = self.sessions.get(receiver_id).filter(|h| h.is_open()) {
            return match handle.send_text(payload).await {
                Ok(()) => SinkOutcome::Local,
                Err(e) => {
                    warn!(receiver_id, error = %e, "sink local write failed");
                    SinkOutcome::Failed
                }
            };
        }
        match self.relay.publish(sender_id, receiver_id, &payload).await {
            Ok(()) => SinkOutcome::Relayed,
            Err(e) => {
                error!(receiver_id, error = %e, "sink relay publish failed");
                SinkOutcome::Failed
            }
        }
    }
}
