//! WebSocket connection lifecycle
//!
//! Handshake authentication, session and presence registration, the
//! per-socket read loop with application-level ping/pong, and disconnect
//! cleanup. Inbound message work belongs to the dispatcher, not here.

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use tracing::{debug, error, info, warn};

use crate::http::AppState;
use crate::registry::SocketCommand;

/// Close codes used by the server
pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_PROTOCOL_ERROR: u16 = 1002;
/// Handshake authentication failure
pub const CLOSE_BAD_DATA: u16 = 1007;
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
pub const CLOSE_FRAME_TOO_LARGE: u16 = 1009;
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// Application-level heartbeat frame
fn is_heartbeat(text: &str) -> bool {
    text.contains("\"type\":\"ping\"")
}

const PONG_FRAME: &str = "{\"type\":\"pong\"}";

/// Upgrade handler for the root WebSocket endpoint.
/// The signed token rides in the `token` query parameter.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<AppState>,
) -> Response {
    let token = params.get("token").cloned();
    ws.on_upgrade(move |socket| handle_socket(socket, state, token))
}

async fn handle_socket(mut socket: WebSocket, state: AppState, token: Option<String>) {
    let user_id = match token.as_deref().map(|t| state.verifier.verify(t)) {
        Some(Ok(user_id)) => user_id,
        Some(Err(e)) => {
            warn!(error = %e, "rejecting socket with invalid token");
            close_now(&mut socket, CLOSE_BAD_DATA, "invalid token").await;
            return;
        }
        None => {
            warn!("rejecting socket without a token");
            close_now(&mut socket, CLOSE_BAD_DATA, "missing token").await;
            return;
        }
    };

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (handle, mut outbound) = state.sessions.open_session(&user_id);
    let sequence = handle.sequence;

    // Writer task: drains the session channel onto the socket. A Close
    // command (or a failed write) ends it, which also cancels any queued
    // frames for this socket.
    let writer = tokio::spawn(async move {
        while let Some(command) = outbound.recv().await {
            match command {
                SocketCommand::Text(text) => {
                    if ws_tx.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                SocketCommand::Close { code, reason } => {
                    let _ = ws_tx
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    if let Some(older) = state.sessions.register(handle.clone()) {
        older
            .close(CLOSE_POLICY_VIOLATION, "session superseded")
            .await;
    }
    // best-effort: a flaky directory must never cost the client its socket
    if let Err(e) = state
        .presence
        .register(&user_id, &state.config.pod_name)
        .await
    {
        error!(user_id = %user_id, error = %e, "presence registration failed");
    }
    info!(user_id = %user_id, pod = %state.config.pod_name, "user connected");

    while let Some(message) = ws_rx.next().await {
        match message {
            Ok(Message::Text(text)) => {
                if text.len() > state.config.max_frame_bytes {
                    warn!(
                        user_id = %user_id,
                        bytes = text.len(),
                        limit = state.config.max_frame_bytes,
                        "oversize frame, closing"
                    );
                    handle
                        .close(CLOSE_FRAME_TOO_LARGE, "frame exceeds limit")
                        .await;
                    break;
                }
                if is_heartbeat(&text) {
                    if let Err(e) = state
                        .presence
                        .refresh(&user_id, &state.config.pod_name)
                        .await
                    {
                        debug!(user_id = %user_id, error = %e, "presence refresh failed");
                    }
                    let _ = handle.send_text(PONG_FRAME.to_string()).await;
                    continue;
                }
                state.dispatcher.dispatch(&user_id, &text).await;
            }
            Ok(Message::Binary(_)) => {
                warn!(user_id = %user_id, "binary frame not supported, closing");
                handle
                    .close(CLOSE_PROTOCOL_ERROR, "binary frames not supported")
                    .await;
                break;
            }
            // transport-level ping/pong is handled by the WebSocket layer
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Ok(Message::Close(_)) => {
                debug!(user_id = %user_id, "client closed the socket");
                break;
            }
            Err(e) => {
                error!(user_id = %user_id, error = %e, "transport error");
                handle.close(CLOSE_INTERNAL_ERROR, "transport error").await;
                break;
            }
        }
    }

    // Only the current session may tear down presence; a superseded reader
    // must not unregister its replacement.
    if state.sessions.deregister(&user_id, sequence) {
        if let Err(e) = state.presence.unregister(&user_id).await {
            error!(user_id = %user_id, error = %e, "presence unregister failed");
        }
        info!(user_id = %user_id, "user disconnected");
    } else {
        debug!(user_id = %user_id, "stale reader finished after replacement");
    }
    writer.abort();
}

async fn close_now(socket: &mut WebSocket, code: u16, reason: &str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        })))
        .await;
}

/// Periodically re-assert presence for every local session. With persistent
/// presence entries this is a no-op that heals lost keys.
pub fn spawn_presence_sweep(state: AppState) {
    let interval = std::time::Duration::from_secs(state.config.presence_sweep_secs.max(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // immediate first tick carries no work
        loop {
            ticker.tick().await;
            let users = state.sessions.user_ids();
            debug!(sessions = users.len(), "presence sweep");
            for user_id in users {
                if let Err(e) = state
                    .presence
                    .refresh(&user_id, &state.config.pod_name)
                    .await
                {
                    warn!(user_id = %user_id, error = %e, "presence sweep refresh failed");
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_detection() {
        assert!(is_heartbeat(r#"{"type":"ping"}"#));
        assert!(is_heartbeat(r#"{ "a": 1, "type":"ping" }"#));
        assert!(!is_heartbeat(r#"{"type":"pong"}"#));
        assert!(!is_heartbeat(r#"{"senderId":"1","receiverId":"2"}"#));
    }
}
