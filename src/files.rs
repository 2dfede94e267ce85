//! File-ready push notifications
//!
//! The file subsystem tells the gateway when an upload batch is ready for a
//! receiver; if that receiver is online on this pod, a push envelope goes out
//! over their socket. Offline and remote receivers get nothing here; they
//! discover pending files on their next login.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::message::{MessageEnvelope, MESSAGE_TYPE_FILE_UPLOAD};
use crate::presence::PresenceDirectory;
use crate::profile::ProfileCache;
use crate::registry::SessionRegistry;

/// Description of an upload batch ready for download
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileBatch {
    pub sender_customer_id: String,
    pub receiver_customer_id: String,
    pub folder_name: String,
    pub file_count: usize,
    pub total_size: u64,
    pub message_id: String,
    /// Optional caption accompanying the upload
    #[serde(default)]
    pub message: Option<String>,
    pub creation_timestamp: i64,
}

/// What happened to a file-ready push
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyOutcome {
    /// Written to the receiver's local socket
    Sent,
    /// Receiver has no presence entry anywhere
    Offline,
    /// Presence lists a pod but no usable socket exists here
    StaleConnection,
    /// Socket write failed
    Failed,
}

/// Pushes "files ready" envelopes to locally connected receivers
pub struct FileNotifier {
    sessions: Arc<SessionRegistry>,
    presence: Arc<dyn PresenceDirectory>,
    profiles: Arc<ProfileCache>,
}

impl FileNotifier {
    pub fn new(
        sessions: Arc<SessionRegistry>,
        presence: Arc<dyn PresenceDirectory>,
        profiles: Arc<ProfileCache>,
    ) -> Self {
        Self {
            sessions,
            presence,
            profiles,
        }
    }

    /// Notify the receiver of one ready batch
    pub async fn notify(&self, batch: &FileBatch) -> NotifyOutcome {
        let receiver_id = &batch.receiver_customer_id;

        let online = self.presence.contains(receiver_id).await.unwrap_or(false);
        if !online {
            info!(
                receiver_id = %receiver_id,
                folder = %batch.folder_name,
                "receiver offline, files wait for next login"
            );
            return NotifyOutcome::Offline;
        }

        let Some(handle) = self.sessions.get(receiver_id).filter(|h| h.is_open()) else {
            warn!(receiver_id = %receiver_id, "presence says online but no local socket");
            return NotifyOutcome::StaleConnection;
        };

        let envelope = self.build_envelope(batch).await;
        let json = match envelope.to_json() {
            Ok(json) => json,
            Err(e) => {
                warn!(receiver_id = %receiver_id, error = %e, "file notification serialization failed");
                return NotifyOutcome::Failed;
            }
        };

        match handle.send_text(json).await {
            Ok(()) => {
                info!(
                    receiver_id = %receiver_id,
                    folder = %batch.folder_name,
                    files = batch.file_count,
                    "file notification pushed"
                );
                NotifyOutcome::Sent
            }
            Err(e) => {
                warn!(receiver_id = %receiver_id, error = %e, "file notification write failed");
                NotifyOutcome::Failed
            }
        }
    }

    /// Notify the receiver of several batches in order
    pub async fn notify_all(&self, batches: &[FileBatch]) -> Vec<NotifyOutcome> {
        let mut outcomes = Vec::with_capacity(batches.len());
        for batch in batches {
            outcomes.push(self.notify(batch).await);
        }
        outcomes
    }

    /// File pushes reuse the chat envelope so clients parse them with the
    /// same code path; actual bytes travel over the download API.
    async fn build_envelope(&self, batch: &FileBatch) -> MessageEnvelope {
        let mut files = HashMap::new();
        files.insert("notification".to_string(), "FILES_AVAILABLE".to_string());
        files.insert("folderName".to_string(), batch.folder_name.clone());
        files.insert("fileCount".to_string(), batch.file_count.to_string());
        files.insert("totalSize".to_string(), batch.total_size.to_string());

        let sender = self.profiles.get_or_load(&batch.sender_customer_id).await;

        MessageEnvelope {
            sender_id: batch.sender_customer_id.clone(),
            sender_mobile: sender.as_ref().and_then(|p| p.mobile.clone()),
            sender_name: sender
                .map(|p| p.display_name())
                .filter(|name| !name.is_empty()),
            receiver_id: batch.receiver_customer_id.clone(),
            message_id: batch.message_id.clone(),
            actual_message: batch.message.clone().unwrap_or_default(),
            files,
            message_type: MESSAGE_TYPE_FILE_UPLOAD.to_string(),
            delivered: false, // marked delivered only after a successful download
            delivery_timestamp: None,
            is_read: false,
            timestamp: Some(batch.creation_timestamp),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::MemoryPresence;
    use crate::profile::tests::StubLoader;
    use crate::registry::SocketCommand;

    fn notifier() -> (Arc<SessionRegistry>, Arc<MemoryPresence>, FileNotifier) {
        let sessions = Arc::new(SessionRegistry::new());
        let presence = Arc::new(MemoryPresence::new());
        let profiles = Arc::new(ProfileCache::new(Arc::new(StubLoader::single(
            "1",
            "John",
            "Doe",
            "919905663451",
        ))));
        let notifier = FileNotifier::new(sessions.clone(), presence.clone(), profiles);
        (sessions, presence, notifier)
    }

    fn batch() -> FileBatch {
        FileBatch {
            sender_customer_id: "1".into(),
            receiver_customer_id: "2".into(),
            folder_name: "uploads-42".into(),
            file_count: 3,
            total_size: 9000,
            message_id: "m1".into(),
            message: Some("photos".into()),
            creation_timestamp: 1000,
        }
    }

    #[tokio::test]
    async fn test_push_to_local_receiver() {
        let (sessions, presence, notifier) = notifier();
        presence.register("2", "p1").await.unwrap();
        let (handle, mut rx) = sessions.open_session("2");
        sessions.register(handle);

        assert_eq!(notifier.notify(&batch()).await, NotifyOutcome::Sent);

        let SocketCommand::Text(json) = rx.recv().await.unwrap() else {
            panic!("expected text");
        };
        let envelope: MessageEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(envelope.message_type, MESSAGE_TYPE_FILE_UPLOAD);
        assert_eq!(envelope.files.get("notification").unwrap(), "FILES_AVAILABLE");
        assert_eq!(envelope.files.get("folderName").unwrap(), "uploads-42");
        assert_eq!(envelope.files.get("fileCount").unwrap(), "3");
        assert_eq!(envelope.sender_mobile.as_deref(), Some("919905663451"));
        assert!(!envelope.delivered);
    }

    #[tokio::test]
    async fn test_offline_receiver_gets_nothing() {
        let (_sessions, _presence, notifier) = notifier();
        assert_eq!(notifier.notify(&batch()).await, NotifyOutcome::Offline);
    }

    #[tokio::test]
    async fn test_stale_presence_without_socket() {
        let (_sessions, presence, notifier) = notifier();
        presence.register("2", "p1").await.unwrap();
        assert_eq!(notifier.notify(&batch()).await, NotifyOutcome::StaleConnection);
    }
}
