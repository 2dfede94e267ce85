//! Local session table
//!
//! One entry per connected user on this pod. A second handshake for the same
//! user atomically replaces the older session; the replaced socket is closed
//! by the caller.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Per-session writer channel capacity
const OUTBOUND_CAPACITY: usize = 256;

/// Bound on a single socket write; an elapsed timeout counts as a failed send
const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Command sent to a session's writer task
#[derive(Debug, Clone, PartialEq)]
pub enum SocketCommand {
    /// Text frame to the client
    Text(String),
    /// Close the socket with a code and reason; the writer task stops after
    Close { code: u16, reason: String },
}

/// Failed socket send
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("session closed")]
    Closed,
    #[error("socket write timed out")]
    Timeout,
}

/// Handle to one open WebSocket, shared between the reader task and anything
/// that wants to push frames to this user
#[derive(Debug)]
pub struct SessionHandle {
    pub user_id: String,
    /// Monotonic per-pod sequence; guards against removing a successor session
    pub sequence: u64,
    pub opened_at: Instant,
    outbound: mpsc::Sender<SocketCommand>,
}

impl SessionHandle {
    /// True while the writer task is still draining the channel
    pub fn is_open(&self) -> bool {
        !self.outbound.is_closed()
    }

    /// Queue a text frame for the client, bounded by the send timeout
    pub async fn send_text(&self, payload: String) -> Result<(), SendError> {
        match tokio::time::timeout(SEND_TIMEOUT, self.outbound.send(SocketCommand::Text(payload)))
            .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(SendError::Closed),
            Err(_) => Err(SendError::Timeout),
        }
    }

    /// Ask the writer task to close the socket
    pub async fn close(&self, code: u16, reason: &str) {
        let command = SocketCommand::Close {
            code,
            reason: reason.to_string(),
        };
        if self.outbound.send(command).await.is_err() {
            debug!(user_id = %self.user_id, "close requested on already-closed session");
        }
    }
}

/// Concurrent map of {user ID -> open session} for this pod
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<SessionHandle>>,
    next_sequence: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            next_sequence: AtomicU64::new(1),
        }
    }

    /// Create a handle and its writer-channel receiver for a new socket
    pub fn open_session(&self, user_id: &str) -> (Arc<SessionHandle>, mpsc::Receiver<SocketCommand>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let handle = Arc::new(SessionHandle {
            user_id: user_id.to_string(),
            sequence: self.next_sequence.fetch_add(1, Ordering::Relaxed),
            opened_at: Instant::now(),
            outbound: tx,
        });
        (handle, rx)
    }

    /// Insert a session, returning the replaced older session if one existed
    pub fn register(&self, handle: Arc<SessionHandle>) -> Option<Arc<SessionHandle>> {
        let user_id = handle.user_id.clone();
        let replaced = self.sessions.insert(user_id.clone(), handle);
        if replaced.is_some() {
            warn!(user_id = %user_id, "replacing existing session for user");
        } else {
            debug!(user_id = %user_id, "session registered");
        }
        replaced
    }

    /// Remove the session for `user_id` only if it still is the given
    /// sequence; a successor session registered in the meantime stays put
    pub fn deregister(&self, user_id: &str, sequence: u64) -> bool {
        let removed = self
            .sessions
            .remove_if(user_id, |_, handle| handle.sequence == sequence)
            .is_some();
        if removed {
            debug!(user_id, "session deregistered");
        }
        removed
    }

    pub fn get(&self, user_id: &str) -> Option<Arc<SessionHandle>> {
        self.sessions.get(user_id).map(|entry| entry.value().clone())
    }

    /// True when the user has an open socket on this pod
    pub fn is_online(&self, user_id: &str) -> bool {
        self.get(user_id).map(|h| h.is_open()).unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Snapshot of connected user IDs, used by the presence sweep
    pub fn user_ids(&self) -> Vec<String> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_and_send() {
        let registry = SessionRegistry::new();
        let (handle, mut rx) = registry.open_session("u1");
        registry.register(handle.clone());

        assert!(registry.is_online("u1"));
        handle.send_text("hello".to_string()).await.unwrap();
        assert_eq!(rx.recv().await, Some(SocketCommand::Text("hello".into())));
    }

    #[tokio::test]
    async fn test_second_session_replaces_older() {
        let registry = SessionRegistry::new();
        let (first, _rx1) = registry.open_session("u1");
        let (second, _rx2) = registry.open_session("u1");

        assert!(registry.register(first.clone()).is_none());
        let replaced = registry.register(second.clone()).expect("older session returned");
        assert_eq!(replaced.sequence, first.sequence);

        assert_eq!(registry.len(), 1);
        assert_eq!(
            registry.get("u1").unwrap().sequence,
            second.sequence,
            "newer session wins"
        );
    }

    #[tokio::test]
    async fn test_deregister_is_sequence_guarded() {
        let registry = SessionRegistry::new();
        let (first, _rx1) = registry.open_session("u1");
        let (second, _rx2) = registry.open_session("u1");
        registry.register(first.clone());
        registry.register(second.clone());

        // the old reader task disconnecting must not evict the replacement
        assert!(!registry.deregister("u1", first.sequence));
        assert!(registry.is_online("u1"));

        assert!(registry.deregister("u1", second.sequence));
        assert!(!registry.is_online("u1"));
    }

    #[tokio::test]
    async fn test_send_to_dropped_session_fails() {
        let registry = SessionRegistry::new();
        let (handle, rx) = registry.open_session("u1");
        drop(rx);

        assert!(!handle.is_open());
        assert!(matches!(
            handle.send_text("x".to_string()).await,
            Err(SendError::Closed)
        ));
    }
}
