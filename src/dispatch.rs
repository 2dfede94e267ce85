//! Inbound frame dispatcher
//!
//! Every non-heartbeat text frame lands here: call-signal frames go to the
//! signaling engine, everything else is parsed as a chat request for the
//! delivery router. Bad frames are logged and dropped; the socket stays open.

use std::sync::Arc;

use serde_json::Value;
use tracing::warn;

use crate::calls::CallEngine;
use crate::message::{ChatRequest, SignalFrame};
use crate::router::{DeliveryRouter, RouteOutcome};

pub struct InboundDispatcher {
    router: Arc<DeliveryRouter>,
    calls: Arc<CallEngine>,
}

impl InboundDispatcher {
    pub fn new(router: Arc<DeliveryRouter>, calls: Arc<CallEngine>) -> Self {
        Self { router, calls }
    }

    /// Parse and route one inbound text frame
    pub async fn dispatch(&self, user_id: &str, raw: &str) {
        let root: Value = match serde_json::from_str(raw) {
            Ok(root) => root,
            Err(e) => {
                warn!(user_id, error = %e, "unparseable frame dropped");
                return;
            }
        };

        if root.get("signal").is_some() {
            match serde_json::from_value::<SignalFrame>(root) {
                Ok(frame) => self.calls.handle(frame).await,
                Err(e) => warn!(user_id, error = %e, "frame with unrecognized signal dropped"),
            }
            return;
        }

        let request: ChatRequest = match serde_json::from_value(root) {
            Ok(request) => request,
            Err(e) => {
                warn!(user_id, error = %e, "malformed chat frame dropped");
                return;
            }
        };

        if request.sender_id.is_empty() || request.receiver_id.is_empty() {
            warn!(user_id, "chat frame missing senderId or receiverId dropped");
            return;
        }

        let outcome = self.router.route(request).await;
        if outcome == RouteOutcome::Dropped {
            warn!(user_id, "chat frame dropped by the delivery router");
        }
    }
}
