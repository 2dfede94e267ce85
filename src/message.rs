//! Wire types
//!
//! Everything that crosses a socket or the relay bus: inbound chat requests,
//! call-signal frames, and the outbound envelope handed to client sockets.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message type for plain chat envelopes
pub const MESSAGE_TYPE_CHAT: &str = "chat";

/// Message type for file-ready push notifications
pub const MESSAGE_TYPE_FILE_UPLOAD: &str = "FILE_UPLOAD_NOTIFICATION";

/// Notification text used for non-chat message types
pub const GENERIC_FILE_MESSAGE: &str = "Sent a file";

/// Inbound chat frame, as sent by clients and the HTTP send endpoint
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    #[serde(default)]
    pub sender_id: String,
    #[serde(default)]
    pub receiver_id: String,
    #[serde(default)]
    pub message_id: String,
    #[serde(default)]
    pub actual_message: String,
    #[serde(default)]
    pub sample_message: String,
    /// filename -> base64 content
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub files: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl ChatRequest {
    /// Trimmed message text; empty when absent
    pub fn actual_message_trimmed(&self) -> &str {
        self.actual_message.trim()
    }

    /// Trimmed notification preview; empty when absent
    pub fn sample_message_trimmed(&self) -> &str {
        self.sample_message.trim()
    }

    /// A frame with neither text nor files carries nothing to deliver
    pub fn has_content(&self) -> bool {
        !self.actual_message_trimmed().is_empty() || !self.files.is_empty()
    }
}

/// Outbound envelope serialized to client sockets, the relay bus and the
/// undelivered store
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEnvelope {
    pub sender_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_mobile: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    pub receiver_id: String,
    pub message_id: String,
    #[serde(default)]
    pub actual_message: String,
    /// filename -> base64 content (or a notification map for file pushes)
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub files: HashMap<String, String>,
    pub message_type: String,
    pub delivered: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_timestamp: Option<i64>,
    #[serde(rename = "read")]
    pub is_read: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl MessageEnvelope {
    /// Serialize for a socket write, relay publish or store insert
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// True for plain chat; file pushes and future types are non-chat
    pub fn is_chat(&self) -> bool {
        self.message_type.eq_ignore_ascii_case(MESSAGE_TYPE_CHAT)
    }
}

/// Call-signal discriminators recognized by the inbound dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallSignal {
    #[serde(rename = "CALL_OFFER")]
    Offer,
    #[serde(rename = "CALL_RINGING")]
    Ringing,
    #[serde(rename = "CALL_ANSWER")]
    Answer,
    #[serde(rename = "CALL_CONNECTED")]
    Connected,
    #[serde(rename = "CALL_RENEGOTIATE")]
    Renegotiate,
    #[serde(rename = "CALL_REJECT")]
    Reject,
    #[serde(rename = "CALL_END")]
    End,
    #[serde(rename = "CALL_BUSY")]
    Busy,
    #[serde(rename = "CALL_TIMEOUT")]
    Timeout,
    #[serde(rename = "CALL_PARTICIPANT_ADD")]
    ParticipantAdd,
    #[serde(rename = "CALL_PARTICIPANT_REMOVE")]
    ParticipantRemove,
    #[serde(rename = "ICE_CANDIDATE")]
    IceCandidate,
}

impl CallSignal {
    /// Wire name of this signal
    pub fn as_str(&self) -> &'static str {
        match self {
            CallSignal::Offer => "CALL_OFFER",
            CallSignal::Ringing => "CALL_RINGING",
            CallSignal::Answer => "CALL_ANSWER",
            CallSignal::Connected => "CALL_CONNECTED",
            CallSignal::Renegotiate => "CALL_RENEGOTIATE",
            CallSignal::Reject => "CALL_REJECT",
            CallSignal::End => "CALL_END",
            CallSignal::Busy => "CALL_BUSY",
            CallSignal::Timeout => "CALL_TIMEOUT",
            CallSignal::ParticipantAdd => "CALL_PARTICIPANT_ADD",
            CallSignal::ParticipantRemove => "CALL_PARTICIPANT_REMOVE",
            CallSignal::IceCandidate => "ICE_CANDIDATE",
        }
    }
}

/// Parsed call-signaling frame
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalFrame {
    pub signal: CallSignal,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    /// "audio" | "video"
    #[serde(default)]
    pub call_type: Option<String>,
    #[serde(default)]
    pub payload: Option<Value>,
    #[serde(default)]
    pub new_participant: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
}

/// Payload carried on the relay channel between pods
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayPayload {
    pub from_user_id: String,
    pub target_user_id: String,
    /// Serialized envelope or raw body
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_round_trip() {
        let mut files = HashMap::new();
        files.insert("report.pdf".to_string(), "JVBERi0xLjQK".to_string());

        let envelope = MessageEnvelope {
            sender_id: "1".into(),
            sender_mobile: Some("919905663451".into()),
            sender_name: Some("John Doe".into()),
            receiver_id: "2".into(),
            message_id: "m1".into(),
            actual_message: "hi".into(),
            files,
            message_type: MESSAGE_TYPE_CHAT.into(),
            delivered: true,
            delivery_timestamp: Some(1000),
            is_read: false,
            timestamp: Some(1000),
        };

        let json = envelope.to_json().unwrap();
        let back: MessageEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back, envelope);
    }

    #[test]
    fn test_envelope_field_names_match_wire_format() {
        let envelope = MessageEnvelope {
            sender_id: "1".into(),
            receiver_id: "2".into(),
            message_id: "m1".into(),
            message_type: MESSAGE_TYPE_CHAT.into(),
            ..MessageEnvelope::default()
        };

        let value: Value = serde_json::from_str(&envelope.to_json().unwrap()).unwrap();
        assert!(value.get("senderId").is_some());
        assert!(value.get("receiverId").is_some());
        assert!(value.get("messageId").is_some());
        assert!(value.get("messageType").is_some());
        assert!(value.get("read").is_some());
        // empty files map stays off the wire
        assert!(value.get("files").is_none());
    }

    #[test]
    fn test_chat_request_content_check() {
        let empty = ChatRequest {
            sender_id: "1".into(),
            receiver_id: "2".into(),
            actual_message: "   ".into(),
            ..ChatRequest::default()
        };
        assert!(!empty.has_content());

        let mut with_file = empty.clone();
        with_file
            .files
            .insert("a.png".to_string(), "aGk=".to_string());
        assert!(with_file.has_content());
    }

    #[test]
    fn test_signal_frame_parses_wire_names() {
        let raw = r#"{
            "signal": "ICE_CANDIDATE",
            "from": "1",
            "to": "2",
            "sessionId": "s1",
            "payload": {"candidate": "a=candidate"}
        }"#;
        let frame: SignalFrame = serde_json::from_str(raw).unwrap();
        assert_eq!(frame.signal, CallSignal::IceCandidate);
        assert_eq!(frame.session_id.as_deref(), Some("s1"));
        assert_eq!(frame.signal.as_str(), "ICE_CANDIDATE");
    }

    #[test]
    fn test_unknown_signal_rejected() {
        let raw = r#"{"signal": "CALL_HOLD", "from": "1", "to": "2"}"#;
        assert!(serde_json::from_str::<SignalFrame>(raw).is_err());
    }
}
